//! Persistent machine configuration.
//!
//! One fixed-size flash image: a 4-byte magic followed by the postcard
//! encoding of [`ConfigData`]. A missing or unrecognized image falls
//! back to defaults, so a factory-fresh (or factory-reset) machine
//! starts with everything unknown and the wizard armed.
//!
//! [`Store`] also implements [`fabrik_selftest::hal::Config`] with
//! write-through: every setter rewrites the image, so a run interrupted
//! by a power cycle keeps the verdicts recorded up to that point.

#![no_std]

use core::fmt;

use embedded_storage::Storage;
use fabrik_selftest::hal::{AxisId, Config, HeaterId};
use fabrik_selftest::SelftestRecord;
use serde::{Deserialize, Serialize};

const MAGIC: &[u8; 4] = b"fbrk";

/// Whole image size, magic included. One flash page on every target we
/// care about.
pub const IMAGE_SIZE: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigData {
    pub selftest: SelftestRecord,
    pub axis_length_mm: [f32; 3],
    pub heater_gain_c_per_s: [f32; 2],
    pub run_wizard: bool,
}

impl Default for ConfigData {
    fn default() -> Self {
        ConfigData {
            selftest: SelftestRecord::default(),
            axis_length_mm: [0.0; 3],
            heater_gain_c_per_s: [0.0; 2],
            run_wizard: true,
        }
    }
}

#[derive(Debug)]
pub enum Error<E> {
    Flash(E),
    Encoding(postcard::Error),
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Flash(e) => write!(f, "flash access failed: {:?}", e),
            Error::Encoding(e) => write!(f, "config image encoding failed: {}", e),
        }
    }
}

/// Configuration store bound to one flash region.
pub struct Store<S> {
    flash: S,
    addr: u32,
    data: ConfigData,
}

impl<S: Storage> Store<S>
where
    S::Error: fmt::Debug,
{
    /// Reads the image at `addr`, falling back to defaults when the
    /// magic is missing or the payload does not decode.
    pub fn load(mut flash: S, addr: u32) -> Result<Store<S>, Error<S::Error>> {
        let mut buf = [0u8; IMAGE_SIZE];
        flash.read(addr, &mut buf).map_err(Error::Flash)?;
        let data = if &buf[..4] == MAGIC {
            match postcard::from_bytes(&buf[4..]) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!("store: unreadable config image ({}), using defaults", e);
                    ConfigData::default()
                }
            }
        } else {
            log::info!("store: no config image, using defaults");
            ConfigData::default()
        };
        Ok(Store { flash, addr, data })
    }

    pub fn data(&self) -> &ConfigData {
        &self.data
    }

    pub fn save(&mut self) -> Result<(), Error<S::Error>> {
        let mut buf = [0u8; IMAGE_SIZE];
        buf[..4].copy_from_slice(MAGIC);
        postcard::to_slice(&self.data, &mut buf[4..]).map_err(Error::Encoding)?;
        self.flash.write(self.addr, &buf).map_err(Error::Flash)
    }

    /// Rewrites the image as an empty one, then resets to defaults.
    pub fn factory_reset(&mut self) -> Result<(), Error<S::Error>> {
        self.data = ConfigData::default();
        let buf = [0u8; IMAGE_SIZE];
        self.flash.write(self.addr, &buf).map_err(Error::Flash)
    }

    fn update(&mut self, mutate: impl FnOnce(&mut ConfigData)) {
        mutate(&mut self.data);
        // the in-memory copy stays authoritative even if flash is dying
        if let Err(e) = self.save() {
            log::error!("store: {}", e);
        }
    }
}

impl<S: Storage> Config for Store<S>
where
    S::Error: fmt::Debug,
{
    fn selftest_record(&self) -> SelftestRecord {
        self.data.selftest
    }

    fn set_selftest_record(&mut self, record: SelftestRecord) {
        self.update(|d| d.selftest = record);
    }

    fn set_axis_length(&mut self, axis: AxisId, length_mm: f32) {
        self.update(|d| d.axis_length_mm[axis.index()] = length_mm);
    }

    fn set_heater_gain(&mut self, heater: HeaterId, rise_c_per_s: f32) {
        self.update(|d| d.heater_gain_c_per_s[heater as usize] = rise_c_per_s);
    }

    fn run_wizard(&self) -> bool {
        self.data.run_wizard
    }

    fn set_run_wizard(&mut self, run: bool) {
        self.update(|d| d.run_wizard = run);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_storage::ReadStorage;
    use fabrik_selftest::TestResult;

    struct MemFlash {
        bytes: [u8; 512],
    }

    impl MemFlash {
        fn new() -> MemFlash {
            MemFlash { bytes: [0xff; 512] }
        }
    }

    impl ReadStorage for MemFlash {
        type Error = core::convert::Infallible;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            bytes.copy_from_slice(&self.bytes[offset..offset + bytes.len()]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.bytes.len()
        }
    }

    impl Storage for MemFlash {
        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn fresh_flash_yields_defaults() {
        let store = Store::load(MemFlash::new(), 0).unwrap();
        assert_eq!(*store.data(), ConfigData::default());
        assert!(store.run_wizard());
    }

    #[test]
    fn setters_survive_a_reload() {
        let mut store = Store::load(MemFlash::new(), 128).unwrap();
        let mut record = SelftestRecord::default();
        record.fans = TestResult::Passed;
        store.set_selftest_record(record);
        store.set_axis_length(AxisId::Y, 181.5);
        store.set_heater_gain(HeaterId::Nozzle, 3.75);
        store.set_run_wizard(false);

        let Store { flash, .. } = store;
        let store = Store::load(flash, 128).unwrap();
        assert_eq!(store.selftest_record().fans, TestResult::Passed);
        assert_eq!(store.data().axis_length_mm[1], 181.5);
        assert_eq!(store.data().heater_gain_c_per_s[0], 3.75);
        assert!(!store.run_wizard());
    }

    /// Flash that reads blank and refuses every write, standing in for a
    /// worn-out chip.
    struct DeadFlash;

    impl ReadStorage for DeadFlash {
        type Error = &'static str;

        fn read(&mut self, _offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            bytes.fill(0xff);
            Ok(())
        }

        fn capacity(&self) -> usize {
            IMAGE_SIZE
        }
    }

    impl Storage for DeadFlash {
        fn write(&mut self, _offset: u32, _bytes: &[u8]) -> Result<(), Self::Error> {
            Err("write failed")
        }
    }

    #[test]
    fn failed_write_keeps_the_memory_copy() {
        let mut store = Store::load(DeadFlash, 0).unwrap();
        store.set_run_wizard(false);
        assert!(!store.run_wizard());
    }

    #[test]
    fn factory_reset_clears_the_image() {
        let mut store = Store::load(MemFlash::new(), 0).unwrap();
        store.set_run_wizard(false);
        store.factory_reset().unwrap();

        let Store { flash, .. } = store;
        let store = Store::load(flash, 0).unwrap();
        assert_eq!(*store.data(), ConfigData::default());
    }
}
