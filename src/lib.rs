//! Flashing UF2 firmware onto a Raspberry Pi microcontroller in BOOTSEL mode over USB.
//!
//! <br>
//!
//! PICOBOOT is a USB interface provided by Raspberry Pi microcontrollers when
//! in BOOTSEL mode. Normally, firmware for a Raspberry Pi microcontroller is
//! loaded over a USB Mass Storage Device interface, appearing as a 128MB flash
//! drive to the computer. The PICOBOOT USB interface is (usually) also active
//! during this time, and can be used to erase and write flash directly.
//!
//! This crate provides a driver for that interface, [`PicobootConnection`],
//! and a [`FirmwareLoader`] that writes a whole UF2 image with it, erasing
//! every touched sector exactly once and rebooting the device afterwards.
//!
//! # Example
//!
//! ```no_run
//! use picoboot_flash::{FirmwareLoader, LoadConfig, LoadMode, PicobootConnection, RusbHost};
//!
//! let ctx = rusb::Context::new().expect("could not initialize libusb");
//! let mut conn = PicobootConnection::new(RusbHost::new(ctx));
//!
//! let config = LoadConfig::new().with_mode(LoadMode::ConnectInternally);
//! let loader = FirmwareLoader::new(config).expect("invalid config");
//!
//! let fw = std::fs::read("blink.uf2").expect("failed to read firmware");
//! let target = loader.load(&mut conn, &fw).expect("failed to flash");
//! println!("flashed and rebooted {:?}", target);
//! ```

/// RP MCU memory address for the start of flash storage
pub const FLASH_START: u32 = 0x10000000;

/// RP MCU flash page size (for writing)
pub const PAGE_SIZE: u32 = 0x100;
/// RP MCU flash sector size (for erasing)
pub const SECTOR_SIZE: u32 = 0x1000;
/// RP2040 memory address for the initial stack pointer
pub const STACK_POINTER_RP2040: u32 = 0x20042000; // same as SRAM_END_RP2040

/// RP USB Vendor ID
pub const PICOBOOT_VID: u16 = 0x2E8A;
/// RP2040 USB Product ID
pub const PICOBOOT_PID_RP2040: u16 = 0x0003;
/// RP2350 USB Product ID
pub const PICOBOOT_PID_RP2350: u16 = 0x000f;

/// RP MCU magic number for USB interfacing
pub const PICOBOOT_MAGIC: u32 = 0x431FD10B;
/// PICOBOOT bulk OUT endpoint address
pub const PICOBOOT_EP_OUT: u8 = 0x03;
/// PICOBOOT bulk IN endpoint address
pub const PICOBOOT_EP_IN: u8 = 0x84;
/// Size of the status read that completes every command
pub const PICOBOOT_STATUS_LEN: usize = 64;

/// Size of one UF2 block
pub const UF2_BLOCK_SIZE: usize = 512;
pub const UF2_MAGIC_START0: u32 = 0x0A324655;
pub const UF2_MAGIC_START1: u32 = 0x9E5D5157;
pub const UF2_MAGIC_END: u32 = 0x0AB16F30;
/// UF2 block flag marking data that is not meant for main flash
pub const UF2_FLAG_NOT_MAIN_FLASH: u32 = 0x00000001;

/// UF2 Family ID for RP2040
pub const UF2_RP2040_FAMILY_ID: u32 = 0xE48BFF56;
/// UF2 Family ID for RP2350 (ARM, Secure TrustZone)
pub const UF2_RP2350_ARM_S_FAMILY_ID: u32 = 0xE48BFF59;

/// Command Module
pub mod cmd;
pub use cmd::{
    ExclusiveMode, PicobootCmd, PicobootCmdId, PicobootError, PicobootStatus, PicobootStatusCmd,
    Result, TargetID,
};

/// USB Connection Module
pub mod usb;
pub use usb::{
    DeviceFilter, DeviceInfo, PicobootConnection, RusbHost, RusbTransport, Transport, UsbHost,
    PICOBOOT_FILTERS,
};

/// UF2 Parsing Module
pub mod uf2;
pub use uf2::{Uf2Block, Uf2BlockHeader};

/// Firmware Loading Module
pub mod loader;
pub use loader::{FirmwareLoader, LoadConfig, LoadMode};

#[cfg(test)]
mod mock;
