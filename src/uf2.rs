//! Splitting a UF2 image into its 512-byte blocks.

use serde::Deserialize;

use crate::cmd::{PicobootError, Result};
use crate::{
    UF2_BLOCK_SIZE, UF2_FLAG_NOT_MAIN_FLASH, UF2_MAGIC_END, UF2_MAGIC_START0, UF2_MAGIC_START1,
};

const UF2_MAX_PAYLOAD: usize = 476;
const UF2_MAGIC_END_OFFSET: usize = UF2_BLOCK_SIZE - 4;

/// The 32-byte header at the start of every UF2 block.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Uf2BlockHeader {
    pub magic_start0: u32,
    pub magic_start1: u32,
    pub flags: u32,
    pub target_addr: u32,
    pub payload_size: u32,
    pub block_no: u32,
    pub num_blocks: u32,
    pub family_id: u32, // or file size
}
impl Uf2BlockHeader {
    pub const SIZE: usize = 32;
}

fn de<'a, T: Deserialize<'a>>(index: usize, bytes: &'a [u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| PicobootError::ImageFormat(format!("block {}: {}", index, e)))
}

/// One UF2 block, borrowing its payload from the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uf2Block<'a> {
    pub header: Uf2BlockHeader,
    pub payload: &'a [u8],
}

impl<'a> Uf2Block<'a> {
    /// Parses a 512-byte block. `strict` additionally checks the magic numbers.
    pub fn parse(index: usize, block: &'a [u8], strict: bool) -> Result<Self> {
        if block.len() != UF2_BLOCK_SIZE {
            return Err(PicobootError::ImageFormat(format!(
                "block {} is {} bytes, expected {}",
                index,
                block.len(),
                UF2_BLOCK_SIZE
            )));
        }

        let header: Uf2BlockHeader = de(index, &block[..Uf2BlockHeader::SIZE])?;

        if strict {
            let magic_end: u32 = de(index, &block[UF2_MAGIC_END_OFFSET..])?;
            if (header.magic_start0, header.magic_start1, magic_end)
                != (UF2_MAGIC_START0, UF2_MAGIC_START1, UF2_MAGIC_END)
            {
                return Err(PicobootError::ImageFormat(format!(
                    "block {} has bad magic {:08x} {:08x} {:08x}",
                    index, header.magic_start0, header.magic_start1, magic_end
                )));
            }
        }

        let payload_size = header.payload_size as usize;
        if payload_size > UF2_MAX_PAYLOAD {
            return Err(PicobootError::ImageFormat(format!(
                "block {} payload of {} bytes overruns the block",
                index, payload_size
            )));
        }

        let data = Uf2BlockHeader::SIZE;
        Ok(Uf2Block {
            header,
            payload: &block[data..data + payload_size],
        })
    }

    pub fn target_addr(&self) -> u32 {
        self.header.target_addr
    }

    /// Blocks flagged as not main flash carry metadata, not firmware.
    pub fn is_main_flash(&self) -> bool {
        self.header.flags & UF2_FLAG_NOT_MAIN_FLASH == 0
    }
}

/// Number of blocks in `image`, which must be a whole number of blocks.
pub fn block_count(image: &[u8]) -> Result<usize> {
    if image.len() % UF2_BLOCK_SIZE != 0 {
        return Err(PicobootError::ImageFormat(format!(
            "length {} is not a multiple of {}",
            image.len(),
            UF2_BLOCK_SIZE
        )));
    }
    Ok(image.len() / UF2_BLOCK_SIZE)
}

/// Parses every block of `image` in file order, failing on the first bad one.
pub fn parse_image(image: &[u8], strict: bool) -> Result<Vec<Uf2Block<'_>>> {
    block_count(image)?;
    image
        .chunks_exact(UF2_BLOCK_SIZE)
        .enumerate()
        .map(|(i, block)| Uf2Block::parse(i, block, strict))
        .collect()
}

/// Builds a UF2 block for tests.
#[cfg(test)]
pub(crate) fn make_block(addr: u32, payload: &[u8]) -> Vec<u8> {
    let mut block = vec![0u8; UF2_BLOCK_SIZE];
    block[0..4].copy_from_slice(&UF2_MAGIC_START0.to_le_bytes());
    block[4..8].copy_from_slice(&UF2_MAGIC_START1.to_le_bytes());
    block[12..16].copy_from_slice(&addr.to_le_bytes());
    block[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    block[32..32 + payload.len()].copy_from_slice(payload);
    block[508..512].copy_from_slice(&UF2_MAGIC_END.to_le_bytes());
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block() {
        let raw = make_block(0x1000_0000, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let block = Uf2Block::parse(0, &raw, true).unwrap();
        assert_eq!(block.target_addr(), 0x1000_0000);
        assert_eq!(block.payload, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(block.is_main_flash());
        assert_eq!(block.header.magic_start0, UF2_MAGIC_START0);
        assert_eq!(block.header.payload_size, 4);
    }

    #[test]
    fn test_header_fields_decode_little_endian() {
        let mut raw = make_block(0x1000_0100, &[0; 256]);
        raw[20..24].copy_from_slice(&7u32.to_le_bytes());
        raw[24..28].copy_from_slice(&9u32.to_le_bytes());
        raw[28..32].copy_from_slice(&crate::UF2_RP2040_FAMILY_ID.to_le_bytes());
        let header = Uf2Block::parse(0, &raw, true).unwrap().header;
        assert_eq!(header.target_addr, 0x1000_0100);
        assert_eq!(header.block_no, 7);
        assert_eq!(header.num_blocks, 9);
        assert_eq!(header.family_id, crate::UF2_RP2040_FAMILY_ID);
    }

    #[test]
    fn test_bad_late_block_fails_whole_image() {
        let mut image = make_block(0x1000_0000, &[1; 256]);
        let mut bad = make_block(0x1000_1000, &[]);
        bad[16..20].copy_from_slice(&477u32.to_le_bytes());
        image.extend(bad);
        assert!(matches!(
            parse_image(&image, false),
            Err(PicobootError::ImageFormat(_))
        ));
    }

    #[test]
    fn test_length_must_be_block_multiple() {
        assert_eq!(block_count(&[]).unwrap(), 0);
        assert_eq!(block_count(&[0u8; 1024]).unwrap(), 2);
        assert!(matches!(
            block_count(&[0u8; 513]),
            Err(PicobootError::ImageFormat(_))
        ));
        assert!(parse_image(&[0u8; 100], false).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut raw = make_block(0x1000_0000, &[]);
        raw[16..20].copy_from_slice(&477u32.to_le_bytes());
        assert!(matches!(
            Uf2Block::parse(3, &raw, false),
            Err(PicobootError::ImageFormat(_))
        ));

        raw[16..20].copy_from_slice(&476u32.to_le_bytes());
        assert_eq!(Uf2Block::parse(3, &raw, false).unwrap().payload.len(), 476);
    }

    #[test]
    fn test_magic_only_checked_when_strict() {
        let mut raw = make_block(0x1000_0000, &[1]);
        raw[0] ^= 0xFF;
        assert!(Uf2Block::parse(0, &raw, false).is_ok());
        assert!(matches!(
            Uf2Block::parse(0, &raw, true),
            Err(PicobootError::ImageFormat(_))
        ));
    }

    #[test]
    fn test_not_main_flash_flag() {
        let mut raw = make_block(0x1000_0000, &[1]);
        raw[8..12].copy_from_slice(&UF2_FLAG_NOT_MAIN_FLASH.to_le_bytes());
        assert!(!Uf2Block::parse(0, &raw, true).unwrap().is_main_flash());
    }

    #[test]
    fn test_blocks_in_file_order() {
        let mut image = make_block(0x1000_1000, &[2]);
        image.extend(make_block(0x1000_0000, &[1]));
        let addrs: Vec<u32> = parse_image(&image, true)
            .unwrap()
            .iter()
            .map(|b| b.target_addr())
            .collect();
        assert_eq!(addrs, vec![0x1000_1000, 0x1000_0000]);
    }
}
