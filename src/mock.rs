//! In-memory PICOBOOT device that records every transfer.

use std::cell::RefCell;
use std::rc::Rc;

use crate::usb::{DeviceFilter, DeviceInfo, Transport, UsbHost};
use crate::{PICOBOOT_PID_RP2040, PICOBOOT_PID_RP2350, PICOBOOT_VID};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    BulkOut(u8, Vec<u8>),
    BulkIn(u8, usize),
    ControlOut(u8, u8),
    ControlIn(u8, u8),
}

pub type Log = Rc<RefCell<Vec<Transfer>>>;

pub struct MockDevice {
    info: DeviceInfo,
    log: Log,
    fail_after: Option<usize>,
    short_writes: bool,
    status: [u8; 16],
}

impl MockDevice {
    pub fn new(vendor_id: u16, product_id: u16, product_name: &str) -> Self {
        MockDevice {
            info: DeviceInfo {
                vendor_id,
                product_id,
                manufacturer: Some("Raspberry Pi".into()),
                product_name: product_name.into(),
                serial_number: Some("E0C9125B0D9B".into()),
            },
            log: Log::default(),
            fail_after: None,
            short_writes: false,
            status: [0; 16],
        }
    }

    pub fn rp2040() -> Self {
        Self::new(PICOBOOT_VID, PICOBOOT_PID_RP2040, "RP2 Boot")
    }

    pub fn rp2350() -> Self {
        Self::new(PICOBOOT_VID, PICOBOOT_PID_RP2350, "RP2350 Boot")
    }

    /// Bulk transfers after the first `transfers` fail with `NoDevice`.
    pub fn fail_after(mut self, transfers: usize) -> Self {
        self.fail_after = Some(transfers);
        self
    }

    /// Every bulk OUT transfer moves one byte less than requested.
    pub fn short_writes(mut self) -> Self {
        self.short_writes = true;
        self
    }

    pub fn with_status(mut self, status: [u8; 16]) -> Self {
        self.status = status;
        self
    }

    pub fn log(&self) -> Log {
        self.log.clone()
    }

    fn check_unplugged(&mut self) -> rusb::Result<()> {
        match self.fail_after {
            Some(0) => Err(rusb::Error::NoDevice),
            Some(ref mut n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Transport for MockDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn write_bulk(&mut self, endpoint: u8, buf: &[u8]) -> rusb::Result<usize> {
        self.check_unplugged()?;
        self.log
            .borrow_mut()
            .push(Transfer::BulkOut(endpoint, buf.to_vec()));
        if self.short_writes {
            Ok(buf.len().saturating_sub(1))
        } else {
            Ok(buf.len())
        }
    }

    fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8]) -> rusb::Result<usize> {
        self.check_unplugged()?;
        self.log
            .borrow_mut()
            .push(Transfer::BulkIn(endpoint, buf.len()));
        Ok(0)
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        _value: u16,
        _buf: &[u8],
    ) -> rusb::Result<usize> {
        self.log
            .borrow_mut()
            .push(Transfer::ControlOut(request_type, request));
        Ok(0)
    }

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        _value: u16,
        buf: &mut [u8],
    ) -> rusb::Result<usize> {
        self.log
            .borrow_mut()
            .push(Transfer::ControlIn(request_type, request));
        let len = buf.len().min(self.status.len());
        buf[..len].copy_from_slice(&self.status[..len]);
        Ok(len)
    }
}

/// Hands out its devices in order to whichever `open` matches them.
pub struct MockHost {
    devices: Vec<MockDevice>,
    open_error: Option<rusb::Error>,
}

impl MockHost {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        MockHost {
            devices,
            open_error: None,
        }
    }

    pub fn fail_open(mut self, error: rusb::Error) -> Self {
        self.open_error = Some(error);
        self
    }
}

impl UsbHost for MockHost {
    type Device = MockDevice;

    fn open(&mut self, filters: &[DeviceFilter]) -> rusb::Result<Option<MockDevice>> {
        if let Some(e) = self.open_error {
            return Err(e);
        }
        let found = self.devices.iter().position(|d| {
            filters
                .iter()
                .any(|f| f.matches(d.info.vendor_id, d.info.product_id))
        });
        Ok(found.map(|i| self.devices.remove(i)))
    }
}

/// A decoded command packet and the payload that followed it.
#[derive(Debug, Clone)]
pub struct Sent {
    pub magic: u32,
    pub token: u32,
    pub cmd_id: u8,
    pub cmd_size: u8,
    pub transfer_len: u32,
    pub args: [u8; 16],
    pub payload: Vec<u8>,
}

impl Sent {
    /// The `n`th little-endian word of the command args.
    pub fn arg_u32(&self, n: usize) -> u32 {
        u32::from_le_bytes(self.args[n * 4..n * 4 + 4].try_into().unwrap())
    }
}

/// Reassembles the commands in a transfer log.
pub fn sent(log: &[Transfer]) -> Vec<Sent> {
    let mut out: Vec<Sent> = vec![];
    for transfer in log {
        let bytes = match transfer {
            Transfer::BulkOut(_, bytes) => bytes,
            _ => continue,
        };

        if let Some(last) = out.last_mut() {
            if last.payload.len() < last.transfer_len as usize {
                last.payload.extend_from_slice(bytes);
                continue;
            }
        }

        assert_eq!(bytes.len(), 32, "command packets are 32 bytes");
        let word = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        out.push(Sent {
            magic: word(0),
            token: word(4),
            cmd_id: bytes[8],
            cmd_size: bytes[9],
            transfer_len: word(12),
            args: bytes[16..32].try_into().unwrap(),
            payload: vec![],
        });
    }
    out
}
