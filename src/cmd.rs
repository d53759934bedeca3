use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{PICOBOOT_MAGIC, STACK_POINTER_RP2040};

/// Errors raised by the PICOBOOT driver and the firmware loader.
#[derive(Error, Debug)]
pub enum PicobootError {
    /// Device selection, open, or interface claim failed. No session exists.
    #[error("failed to connect to PICOBOOT device: {0}")]
    Connection(String),
    /// A command's bulk transfer failed.
    #[error("{cmd:?} command failed: {source}")]
    Protocol {
        cmd: PicobootCmdId,
        #[source]
        source: rusb::Error,
    },
    /// A command's bulk transfer moved fewer bytes than it was given.
    #[error("{cmd:?} command transferred {actual} of {expected} bytes")]
    ShortTransfer {
        cmd: PicobootCmdId,
        expected: usize,
        actual: usize,
    },
    /// A vendor control request on the PICOBOOT interface failed.
    #[error("{request} control request failed: {source}")]
    Control {
        request: &'static str,
        #[source]
        source: rusb::Error,
    },
    #[error("invalid UF2 image: {0}")]
    ImageFormat(String),
    /// The product name did not identify a known device family.
    #[error("unrecognized device {0:?}, refusing to pick a reboot command")]
    UnknownDevice(String),
    #[error("{what} {value:#x} is not a multiple of {align:#x}")]
    Misaligned {
        what: &'static str,
        value: u32,
        align: u32,
    },
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("failed to encode command: {0}")]
    Encode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, PicobootError>;

/// PICOBOOT command IDs. Bit 7 set marks a device-to-host data phase.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicobootCmdId {
    ExclusiveAccess = 0x1,
    Reboot = 0x2,
    FlashErase = 0x3,
    Write = 0x5, // either RAM or FLASH (does no erase)
    ExitXip = 0x6,
    // RP2350 only below here
    Reboot2 = 0xA,
}
impl TryFrom<u8> for PicobootCmdId {
    type Error = ();

    fn try_from(x: u8) -> std::result::Result<Self, Self::Error> {
        match x {
            x if x == Self::ExclusiveAccess as u8 => Ok(Self::ExclusiveAccess),
            x if x == Self::Reboot as u8 => Ok(Self::Reboot),
            x if x == Self::FlashErase as u8 => Ok(Self::FlashErase),
            x if x == Self::Write as u8 => Ok(Self::Write),
            x if x == Self::ExitXip as u8 => Ok(Self::ExitXip),
            x if x == Self::Reboot2 as u8 => Ok(Self::Reboot2),
            _ => Err(()),
        }
    }
}
impl Serialize for PicobootCmdId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

/// Exclusive access modes for [`PicobootCmdId::ExclusiveAccess`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusiveMode {
    /// Release exclusive access, the mass storage interface may touch flash again.
    NotExclusive = 0,
    /// Lock out the mass storage interface while commands run.
    Exclusive = 1,
    /// Like `Exclusive`, and also eject the mass storage drive from the host.
    ExclusiveEject = 2,
}

/// Status codes reported by the device's get-command-status request.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicobootStatus {
    Ok = 0,
    UnknownCmd = 1,
    InvalidCmdLength = 2,
    InvalidTransferLength = 3,
    InvalidAddress = 4,
    BadAlignment = 5,
    InterleavedWrite = 6,
    Rebooting = 7,
    UnknownError = 8,
    InvalidState = 9,
    NotPermitted = 10,
    InvalidArg = 11,
    BufferTooSmall = 12,
    PreconditionNotMet = 13,
    ModifiedData = 14,
    InvalidData = 15,
    NotFound = 16,
    UnsupportedModification = 17,
}
impl TryFrom<u32> for PicobootStatus {
    type Error = ();

    fn try_from(x: u32) -> std::result::Result<Self, Self::Error> {
        const ALL: [PicobootStatus; 18] = [
            PicobootStatus::Ok,
            PicobootStatus::UnknownCmd,
            PicobootStatus::InvalidCmdLength,
            PicobootStatus::InvalidTransferLength,
            PicobootStatus::InvalidAddress,
            PicobootStatus::BadAlignment,
            PicobootStatus::InterleavedWrite,
            PicobootStatus::Rebooting,
            PicobootStatus::UnknownError,
            PicobootStatus::InvalidState,
            PicobootStatus::NotPermitted,
            PicobootStatus::InvalidArg,
            PicobootStatus::BufferTooSmall,
            PicobootStatus::PreconditionNotMet,
            PicobootStatus::ModifiedData,
            PicobootStatus::InvalidData,
            PicobootStatus::NotFound,
            PicobootStatus::UnsupportedModification,
        ];
        ALL.into_iter().find(|s| *s as u32 == x).ok_or(())
    }
}

/// Raspberry Pi microcontroller families with a PICOBOOT interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetID {
    Rp2040,
    Rp2350,
}

// Checked in order, so a more specific name must come before any prefix of it.
const PRODUCT_NAME_MATCHES: &[(&str, TargetID)] =
    &[("RP2350", TargetID::Rp2350), ("RP2", TargetID::Rp2040)];

impl TargetID {
    /// Identifies the device family from a USB product string such as
    /// `"RP2 Boot"` or `"RP2350 Boot"`.
    pub fn from_product_name(name: &str) -> Option<Self> {
        PRODUCT_NAME_MATCHES
            .iter()
            .find(|(needle, _)| name.contains(needle))
            .map(|&(_, target)| target)
    }
}

fn ser_fixed<S: Serialize, const N: usize>(value: &S) -> Result<[u8; N]> {
    bincode::serialize(value)?
        .try_into()
        .map_err(|v: Vec<u8>| {
            PicobootError::Encode(Box::new(bincode::ErrorKind::Custom(format!(
                "expected {} bytes, encoded {}",
                N,
                v.len()
            ))))
        })
}

#[derive(Serialize)]
#[repr(C)]
pub(crate) struct PicobootExclusiveCmd {
    exclusive: u8,
    _unused: [u8; 15],
}
impl PicobootExclusiveCmd {
    pub const SIZE: u8 = 1;

    pub fn ser(mode: ExclusiveMode) -> Result<[u8; 16]> {
        ser_fixed(&PicobootExclusiveCmd {
            exclusive: mode as u8,
            _unused: [0; 15],
        })
    }
}

#[derive(Serialize)]
#[repr(C)]
pub(crate) struct PicobootRangeCmd {
    addr: u32,
    size: u32,
    _unused: u64,
}
impl PicobootRangeCmd {
    pub const SIZE: u8 = 8;

    pub fn ser(addr: u32, size: u32) -> Result<[u8; 16]> {
        ser_fixed(&PicobootRangeCmd {
            addr,
            size,
            _unused: 0,
        })
    }
}

#[derive(Serialize)]
#[repr(C)]
pub(crate) struct PicobootRebootCmd {
    pc: u32,
    sp: u32,
    delay: u32,
    _unused: u32,
}
impl PicobootRebootCmd {
    pub const SIZE: u8 = 12;

    /// Reboot into the flashed image; a zero `pc` means a normal boot.
    pub fn ser(delay: u32) -> Result<[u8; 16]> {
        ser_fixed(&PicobootRebootCmd {
            pc: 0,
            sp: STACK_POINTER_RP2040,
            delay,
            _unused: 0,
        })
    }
}

#[derive(Serialize)]
#[repr(C)]
pub(crate) struct PicobootReboot2Cmd {
    flags: u32,
    delay: u32,
    p0: u32,
    p1: u32,
}
impl PicobootReboot2Cmd {
    pub const SIZE: u8 = 16;

    pub fn ser(delay: u32) -> Result<[u8; 16]> {
        ser_fixed(&PicobootReboot2Cmd {
            flags: 0x0, // normal boot
            delay,
            p0: 0,
            p1: 0,
        })
    }
}

/// Reply to the PICOBOOT get-command-status control request.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PicobootStatusCmd {
    pub token: u32,
    pub status_code: u32,
    pub cmd_id: u8,
    pub in_progress: u8,
    _unused: [u8; 6],
}
impl PicobootStatusCmd {
    pub const SIZE: usize = 16;

    pub fn de(buf: &[u8; Self::SIZE]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }

    pub fn status(&self) -> Option<PicobootStatus> {
        PicobootStatus::try_from(self.status_code).ok()
    }

    pub fn cmd(&self) -> Option<PicobootCmdId> {
        PicobootCmdId::try_from(self.cmd_id).ok()
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress != 0
    }
}

/// A 32-byte PICOBOOT command packet.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct PicobootCmd {
    magic: u32,
    token: u32,
    cmd_id: PicobootCmdId,
    cmd_size: u8,
    _unused: u16,
    transfer_len: u32,
    args: [u8; 16],
}
impl PicobootCmd {
    pub const SIZE: usize = 32;

    pub fn new(cmd_id: PicobootCmdId, cmd_size: u8, transfer_len: u32, args: [u8; 16]) -> Self {
        PicobootCmd {
            magic: PICOBOOT_MAGIC,
            token: 0,
            cmd_id,
            cmd_size,
            _unused: 0,
            transfer_len,
            args,
        }
    }

    pub fn with_token(mut self, token: u32) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn transfer_len(&self) -> u32 {
        self.transfer_len
    }

    pub fn cmd_id(&self) -> PicobootCmdId {
        self.cmd_id
    }

    pub fn to_bytes(&self) -> Result<[u8; Self::SIZE]> {
        ser_fixed(self)
    }
}
