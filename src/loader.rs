//! Flashing a UF2 image through a [`PicobootConnection`].

use std::collections::HashSet;
use std::num::NonZeroU32;

use log::{debug, info};
use serde::Deserialize;

use crate::cmd::{ExclusiveMode, PicobootError, Result, TargetID};
use crate::uf2;
use crate::usb::{DeviceFilter, PicobootConnection, UsbHost, PICOBOOT_FILTERS};
use crate::SECTOR_SIZE;

/// How the loader obtains its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Use the caller's session as is. The caller claims exclusive access
    /// and exits XIP beforehand.
    Attached,
    /// Connect using the configured filters, claim exclusive access with
    /// eject, and exit XIP before flashing.
    ConnectInternally,
}

const DEFAULT_REBOOT_DELAY_MS: NonZeroU32 = match NonZeroU32::new(500) {
    Some(delay) => delay,
    None => panic!("reboot delay must be non-zero"),
};

/// Settings for [`FirmwareLoader`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub mode: LoadMode,
    pub filters: Vec<DeviceFilter>,
    pub reboot_delay_ms: NonZeroU32,
    /// Check UF2 magic numbers and skip blocks not destined for main flash.
    pub strict_uf2: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            mode: LoadMode::Attached,
            filters: PICOBOOT_FILTERS.to_vec(),
            reboot_delay_ms: DEFAULT_REBOOT_DELAY_MS,
            strict_uf2: false,
        }
    }
}

impl LoadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: LoadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_filters(mut self, filters: impl Into<Vec<DeviceFilter>>) -> Self {
        self.filters = filters.into();
        self
    }

    pub fn with_reboot_delay(mut self, delay_ms: NonZeroU32) -> Self {
        self.reboot_delay_ms = delay_ms;
        self
    }

    pub fn with_strict_uf2(mut self, strict: bool) -> Self {
        self.strict_uf2 = strict;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == LoadMode::ConnectInternally && self.filters.is_empty() {
            return Err(PicobootError::Configuration(
                "connecting internally needs at least one device filter".into(),
            ));
        }
        Ok(())
    }
}

/// Sectors erased so far during one load.
#[derive(Debug, Default)]
struct ErasedSectors(HashSet<u32>);

impl ErasedSectors {
    /// Records the sector holding `addr`; true if it was not erased yet.
    fn mark(&mut self, addr: u32) -> bool {
        self.0.insert(addr / SECTOR_SIZE)
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Writes UF2 images to flash, erasing each touched sector exactly once,
/// then reboots the device with the command its family understands.
#[derive(Debug, Clone)]
pub struct FirmwareLoader {
    config: LoadConfig,
}

impl FirmwareLoader {
    pub fn new(config: LoadConfig) -> Result<Self> {
        config.validate()?;
        Ok(FirmwareLoader { config })
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    pub fn load<H: UsbHost>(
        &self,
        conn: &mut PicobootConnection<H>,
        image: &[u8],
    ) -> Result<TargetID> {
        self.load_with_progress(conn, image, |_| {})
    }

    /// Flashes `image` and reboots the device, returning the family it was
    /// rebooted as. `progress` receives a fraction after every block, ending
    /// at exactly 1.0.
    ///
    /// A failure leaves the flash partially written; the only recovery is a
    /// fresh load of the whole image.
    pub fn load_with_progress<H, F>(
        &self,
        conn: &mut PicobootConnection<H>,
        image: &[u8],
        mut progress: F,
    ) -> Result<TargetID>
    where
        H: UsbHost,
        F: FnMut(f32),
    {
        // reject a bad image before anything on the device changes
        let blocks = uf2::parse_image(image, self.config.strict_uf2)?;
        let count = blocks.len();
        if count == 0 {
            return Err(PicobootError::ImageFormat("image contains no blocks".into()));
        }

        match self.config.mode {
            LoadMode::ConnectInternally => {
                conn.connect(&self.config.filters)?;
                conn.exclusive(ExclusiveMode::ExclusiveEject)?;
                conn.exit_xip()?;
            }
            LoadMode::Attached if !conn.connected() => {
                return Err(PicobootError::Connection("no device connected".into()));
            }
            LoadMode::Attached => {}
        }

        info!("flashing {} UF2 blocks", count);
        let mut erased = ErasedSectors::default();
        for (i, block) in blocks.iter().enumerate() {
            if self.config.strict_uf2 && !block.is_main_flash() {
                debug!("block {} is not main flash, skipping", i);
            } else {
                let addr = block.target_addr();
                if erased.mark(addr) {
                    conn.flash_erase_sector(addr)?;
                }
                conn.flash_write(addr, block.payload)?;
            }

            progress((i + 1) as f32 / count as f32);
        }
        info!("wrote {} blocks across {} sectors", count, erased.len());

        let name = match conn.info() {
            Some(info) => info.product_name.clone(),
            None => return Err(PicobootError::Connection("device went away".into())),
        };
        let target =
            TargetID::from_product_name(&name).ok_or(PicobootError::UnknownDevice(name))?;

        info!("rebooting {:?}", target);
        match target {
            TargetID::Rp2040 => conn.reboot_rp2040(self.config.reboot_delay_ms)?,
            TargetID::Rp2350 => conn.reboot_rp2350(self.config.reboot_delay_ms)?,
        }

        Ok(target)
    }
}
