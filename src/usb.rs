use std::num::NonZeroU32;
use std::time::Duration;

use log::{debug, info, trace, warn};
use rusb::{Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};
use serde::Deserialize;

use crate::cmd::{
    ExclusiveMode, PicobootCmd, PicobootCmdId, PicobootError, PicobootExclusiveCmd,
    PicobootRangeCmd, PicobootReboot2Cmd, PicobootRebootCmd, PicobootStatusCmd, Result,
};
use crate::{
    PAGE_SIZE, PICOBOOT_EP_IN, PICOBOOT_EP_OUT, PICOBOOT_PID_RP2040, PICOBOOT_PID_RP2350,
    PICOBOOT_STATUS_LEN, PICOBOOT_VID, SECTOR_SIZE,
};

/// A USB vendor/product ID pair used to select a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceFilter {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        DeviceFilter {
            vendor_id,
            product_id,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

/// Every VID/PID pair a device in BOOTSEL mode enumerates with.
pub const PICOBOOT_FILTERS: [DeviceFilter; 2] = [
    DeviceFilter::new(PICOBOOT_VID, PICOBOOT_PID_RP2040),
    DeviceFilter::new(PICOBOOT_VID, PICOBOOT_PID_RP2350),
];

/// Identification read from the device descriptor when a session opens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    /// Product string, e.g. `"RP2 Boot"`. Empty when the device has none.
    pub product_name: String,
    pub serial_number: Option<String>,
}

/// An opened and claimed PICOBOOT interface.
pub trait Transport {
    fn info(&self) -> &DeviceInfo;

    fn write_bulk(&mut self, endpoint: u8, buf: &[u8]) -> rusb::Result<usize>;

    fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8]) -> rusb::Result<usize>;

    /// Vendor control request addressed to the claimed interface.
    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        buf: &[u8],
    ) -> rusb::Result<usize>;

    /// Vendor control request addressed to the claimed interface.
    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        buf: &mut [u8],
    ) -> rusb::Result<usize>;
}

/// Host USB stack that can select and open a device.
///
/// Finding no matching device is a normal outcome and yields `Ok(None)`.
pub trait UsbHost {
    type Device: Transport;

    fn open(&mut self, filters: &[DeviceFilter]) -> rusb::Result<Option<Self::Device>>;
}

/// [`UsbHost`] backed by libusb through `rusb`.
pub struct RusbHost<T: UsbContext> {
    context: T,
    timeout: Duration,
}

impl<T: UsbContext> RusbHost<T> {
    /// Transfers wait without a deadline; libusb treats a zero timeout as unlimited.
    pub fn new(context: T) -> Self {
        RusbHost {
            context,
            timeout: Duration::ZERO,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    // Locates the vendor-class interface that carries the PICOBOOT endpoints.
    fn get_interface(device: &Device<T>, desc: &DeviceDescriptor) -> Option<(u8, u8, u8)> {
        for n in 0..desc.num_configurations() {
            let config_desc = match device.config_descriptor(n) {
                Ok(c) => c,
                Err(_) => continue,
            };

            for iface in config_desc.interfaces() {
                for iface_desc in iface.descriptors() {
                    if iface_desc.class_code() != 0xFF {
                        continue;
                    }

                    let has_bulk = |dir: Direction, addr: u8| {
                        iface_desc.endpoint_descriptors().any(|ep| {
                            ep.direction() == dir
                                && ep.transfer_type() == TransferType::Bulk
                                && ep.address() == addr
                        })
                    };
                    if has_bulk(Direction::Out, PICOBOOT_EP_OUT)
                        && has_bulk(Direction::In, PICOBOOT_EP_IN)
                    {
                        return Some((
                            config_desc.number(),
                            iface_desc.interface_number(),
                            iface_desc.setting_number(),
                        ));
                    }
                }
            }
        }

        None
    }
}

impl<T: UsbContext> UsbHost for RusbHost<T> {
    type Device = RusbTransport<T>;

    fn open(&mut self, filters: &[DeviceFilter]) -> rusb::Result<Option<Self::Device>> {
        for device in self.context.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if !filters
                .iter()
                .any(|f| f.matches(desc.vendor_id(), desc.product_id()))
            {
                continue;
            }

            let (cfg, iface, setting) = match Self::get_interface(&device, &desc) {
                Some(found) => found,
                None => {
                    debug!(
                        "{:04x}:{:04x} has no PICOBOOT interface, skipping",
                        desc.vendor_id(),
                        desc.product_id()
                    );
                    continue;
                }
            };

            let handle = device.open()?;

            if handle.active_configuration()? == 0 {
                handle.set_active_configuration(cfg)?;
            }

            let has_kernel_driver = match handle.kernel_driver_active(iface) {
                Ok(true) => {
                    handle.detach_kernel_driver(iface)?;
                    true
                }
                _ => false,
            };

            handle.claim_interface(iface)?;
            handle.set_alternate_setting(iface, setting)?;

            let info = DeviceInfo {
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                manufacturer: handle.read_manufacturer_string_ascii(&desc).ok(),
                product_name: handle.read_product_string_ascii(&desc).unwrap_or_default(),
                serial_number: handle.read_serial_number_string_ascii(&desc).ok(),
            };

            return Ok(Some(RusbTransport {
                handle,
                iface,
                has_kernel_driver,
                timeout: self.timeout,
                info,
            }));
        }

        Ok(None)
    }
}

/// A claimed PICOBOOT interface on a libusb device handle.
pub struct RusbTransport<T: UsbContext> {
    handle: DeviceHandle<T>,
    iface: u8,
    has_kernel_driver: bool,
    timeout: Duration,
    info: DeviceInfo,
}

impl<T: UsbContext> Drop for RusbTransport<T> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.iface) {
            warn!("could not release interface {}: {}", self.iface, e);
        }

        if self.has_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(self.iface) {
                warn!("could not reattach kernel driver: {}", e);
            }
        }
    }
}

impl<T: UsbContext> Transport for RusbTransport<T> {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn write_bulk(&mut self, endpoint: u8, buf: &[u8]) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, buf, self.timeout)
    }

    fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8]) -> rusb::Result<usize> {
        self.handle.read_bulk(endpoint, buf, self.timeout)
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        buf: &[u8],
    ) -> rusb::Result<usize> {
        self.handle.write_control(
            request_type,
            request,
            value,
            self.iface.into(),
            buf,
            self.timeout,
        )
    }

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        buf: &mut [u8],
    ) -> rusb::Result<usize> {
        self.handle.read_control(
            request_type,
            request,
            value,
            self.iface.into(),
            buf,
            self.timeout,
        )
    }
}

// Vendor | Interface recipient, host-to-device and device-to-host.
const REQUEST_TYPE_OUT: u8 = 0b01000001;
const REQUEST_TYPE_IN: u8 = 0b11000001;
const REQUEST_INTERFACE_RESET: u8 = 0b01000001;
const REQUEST_GET_COMMAND_STATUS: u8 = 0b01000010;

struct Session<D> {
    device: D,
    cmd_token: u32,
}

impl<D: Transport> Session<D> {
    fn bulk_write(&mut self, cmd: PicobootCmdId, buf: &[u8]) -> Result<()> {
        trace!("OUT {:?} {} bytes", cmd, buf.len());
        let len = self
            .device
            .write_bulk(PICOBOOT_EP_OUT, buf)
            .map_err(|source| PicobootError::Protocol { cmd, source })?;

        if len != buf.len() {
            return Err(PicobootError::ShortTransfer {
                cmd,
                expected: buf.len(),
                actual: len,
            });
        }

        Ok(())
    }

    fn read_status(&mut self, cmd: PicobootCmdId) -> Result<()> {
        let mut buf = [0u8; PICOBOOT_STATUS_LEN];
        let len = self
            .device
            .read_bulk(PICOBOOT_EP_IN, &mut buf)
            .map_err(|source| PicobootError::Protocol { cmd, source })?;
        trace!("IN {:?} status {} bytes", cmd, len);
        Ok(())
    }

    fn cmd(&mut self, cmd: PicobootCmd, payload: &[u8]) -> Result<()> {
        let id = cmd.cmd_id();
        let cmd = cmd.with_token(self.cmd_token);
        let bytes = cmd.to_bytes()?;
        self.cmd_token = self.cmd_token.wrapping_add(1);
        debug!(
            "cmd {:?} token={} transfer_len={}",
            id,
            cmd.token(),
            cmd.transfer_len()
        );

        self.bulk_write(id, &bytes)?;
        if !payload.is_empty() {
            self.bulk_write(id, payload)?;
        }
        self.read_status(id)
    }
}

fn check_aligned(what: &'static str, value: u32, align: u32) -> Result<()> {
    if value % align != 0 {
        return Err(PicobootError::Misaligned { what, value, align });
    }
    Ok(())
}

/// A PICOBOOT driver holding at most one open device session.
///
/// Without a session every command is a no-op that returns `Ok(())`; only
/// [`PicobootConnection::connect`] can fail for lack of a device. A failed
/// transfer closes the session.
pub struct PicobootConnection<H: UsbHost> {
    host: H,
    session: Option<Session<H::Device>>,
}

impl<H: UsbHost> PicobootConnection<H> {
    pub fn new(host: H) -> Self {
        PicobootConnection {
            host,
            session: None,
        }
    }

    /// Opens the first device matching `filters` and claims its PICOBOOT
    /// interface. Any previous session is closed first.
    pub fn connect(&mut self, filters: &[DeviceFilter]) -> Result<()> {
        self.disconnect();

        let device = self
            .host
            .open(filters)
            .map_err(|e| PicobootError::Connection(e.to_string()))?
            .ok_or_else(|| {
                PicobootError::Connection(format!("no device matching {:04x?}", filters))
            })?;

        let info = device.info();
        info!(
            "connected to {:04x}:{:04x} {:?}",
            info.vendor_id, info.product_id, info.product_name
        );

        self.session = Some(Session {
            device,
            cmd_token: 0,
        });
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.session.take().is_some() {
            info!("disconnected");
        }
    }

    pub fn connected(&self) -> bool {
        self.session.is_some()
    }

    /// Identification of the connected device, if any.
    pub fn info(&self) -> Option<&DeviceInfo> {
        self.session.as_ref().map(|s| s.device.info())
    }

    fn cmd(&mut self, cmd: PicobootCmd, payload: &[u8]) -> Result<()> {
        let session = match self.session.as_mut() {
            Some(s) => s,
            None => {
                debug!("not connected, skipping {:?}", cmd.cmd_id());
                return Ok(());
            }
        };

        let res = session.cmd(cmd, payload);
        if let Err(e @ (PicobootError::Protocol { .. } | PicobootError::ShortTransfer { .. })) = &res
        {
            warn!("{}, closing session", e);
            self.session = None;
        }
        res
    }

    pub fn exclusive(&mut self, mode: ExclusiveMode) -> Result<()> {
        let args = PicobootExclusiveCmd::ser(mode)?;
        let cmd = PicobootCmd::new(
            PicobootCmdId::ExclusiveAccess,
            PicobootExclusiveCmd::SIZE,
            0,
            args,
        );
        self.cmd(cmd, &[])
    }

    /// Leaves execute-in-place mode so the flash can be erased and written.
    pub fn exit_xip(&mut self) -> Result<()> {
        let cmd = PicobootCmd::new(PicobootCmdId::ExitXip, 0, 0, [0; 16]);
        self.cmd(cmd, &[])
    }

    /// Erases `size` bytes at `addr`. Both must be sector aligned.
    pub fn flash_erase(&mut self, addr: u32, size: u32) -> Result<()> {
        if !self.connected() {
            return Ok(());
        }
        check_aligned("erase address", addr, SECTOR_SIZE)?;
        check_aligned("erase size", size, SECTOR_SIZE)?;

        let args = PicobootRangeCmd::ser(addr, size)?;
        let cmd = PicobootCmd::new(PicobootCmdId::FlashErase, PicobootRangeCmd::SIZE, 0, args);
        self.cmd(cmd, &[])
    }

    /// Erases the single sector containing `addr`.
    pub fn flash_erase_sector(&mut self, addr: u32) -> Result<()> {
        self.flash_erase(addr - (addr % SECTOR_SIZE), SECTOR_SIZE)
    }

    /// Writes `buf` at the page-aligned `addr`. The device zero-fills a
    /// trailing partial page.
    pub fn flash_write(&mut self, addr: u32, buf: &[u8]) -> Result<()> {
        if !self.connected() {
            return Ok(());
        }
        check_aligned("write address", addr, PAGE_SIZE)?;

        let size = buf.len() as u32;
        let args = PicobootRangeCmd::ser(addr, size)?;
        let cmd = PicobootCmd::new(PicobootCmdId::Write, PicobootRangeCmd::SIZE, size, args);
        self.cmd(cmd, buf)
    }

    pub fn reboot_rp2040(&mut self, delay_ms: NonZeroU32) -> Result<()> {
        let args = PicobootRebootCmd::ser(delay_ms.get())?;
        let cmd = PicobootCmd::new(PicobootCmdId::Reboot, PicobootRebootCmd::SIZE, 0, args);
        self.cmd(cmd, &[])
    }

    pub fn reboot_rp2350(&mut self, delay_ms: NonZeroU32) -> Result<()> {
        let args = PicobootReboot2Cmd::ser(delay_ms.get())?;
        let cmd = PicobootCmd::new(PicobootCmdId::Reboot2, PicobootReboot2Cmd::SIZE, 0, args);
        self.cmd(cmd, &[])
    }

    /// Clears a stalled command state on the device. Consumes no token.
    pub fn reset_interface(&mut self) -> Result<()> {
        let session = match self.session.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };

        let res = session
            .device
            .write_control(REQUEST_TYPE_OUT, REQUEST_INTERFACE_RESET, 0, &[])
            .map(|_| ())
            .map_err(|source| PicobootError::Control {
                request: "interface reset",
                source,
            });
        if res.is_err() {
            self.session = None;
        }
        res
    }

    /// Status of the most recent command, `None` without a session.
    pub fn command_status(&mut self) -> Result<Option<PicobootStatusCmd>> {
        let session = match self.session.as_mut() {
            Some(s) => s,
            None => return Ok(None),
        };

        let mut buf = [0u8; PicobootStatusCmd::SIZE];
        if let Err(source) = session.device.read_control(
            REQUEST_TYPE_IN,
            REQUEST_GET_COMMAND_STATUS,
            0,
            &mut buf,
        ) {
            self.session = None;
            return Err(PicobootError::Control {
                request: "get command status",
                source,
            });
        }

        let stat = PicobootStatusCmd::de(&buf)?;
        debug!(
            "cmdstat => tkn={}, stat={:?}, cmdid={:?}, wip={}",
            stat.token,
            stat.status(),
            stat.cmd(),
            stat.is_in_progress()
        );
        Ok(Some(stat))
    }
}
