//! Common utilities for tests.
#![allow(unused)]

use std::sync::Mutex;

use exfat::{BlockDevice, Error};

pub const ORANGE: &str = "\x1b[38;5;214m";
pub const RESET: &str = "\x1b[0m";

/// Provides a macro for logging messages during tests.
/// e.g. log!("placeholder") -> println!("[test] placeholder");
#[macro_export]
macro_rules! log {
    ($msg:expr) => {
        println!("{}[test] {}{}", crate::common::ORANGE, $msg, crate::common::RESET)
    };
    ($msg:expr, $($arg:tt)*) => {
        println!("{}[test] {}{}", crate::common::ORANGE, format!($msg, $($arg)*), crate::common::RESET)
    };
}

/// An in-memory sector store.
pub struct RamDisk {
    inner: Mutex<Vec<u8>>,
    num_sectors: u64,
    sector_size: usize,
}

impl RamDisk {
    /// Creates a RamDisk of 512-byte sectors.
    pub fn new(num_sectors: u64) -> Self {
        Self::with_sector_size(num_sectors, 512)
    }

    pub fn with_sector_size(num_sectors: u64, sector_size: usize) -> Self {
        RamDisk {
            inner: Mutex::new(vec![0u8; num_sectors as usize * sector_size]),
            num_sectors,
            sector_size,
        }
    }
}

impl BlockDevice for RamDisk {
    fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn read_sector(&self, sector_id: u64, buf: &mut [u8]) -> Result<(), Error> {
        if sector_id >= self.num_sectors {
            return Err(Error::Io);
        }
        if buf.len() != self.sector_size {
            return Err(Error::Io);
        }
        let start = sector_id as usize * self.sector_size;
        let data = self.inner.lock().unwrap();
        buf.copy_from_slice(&data[start..start + self.sector_size]);
        Ok(())
    }

    fn write_sector(&self, sector_id: u64, buf: &[u8]) -> Result<(), Error> {
        if sector_id >= self.num_sectors {
            return Err(Error::Io);
        }
        if buf.len() != self.sector_size {
            return Err(Error::Io);
        }
        let start = sector_id as usize * self.sector_size;
        let mut data = self.inner.lock().unwrap();
        data[start..start + self.sector_size].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<(), Error> {
        // Data already lives in memory.
        Ok(())
    }
}
