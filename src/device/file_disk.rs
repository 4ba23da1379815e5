//! File-backed block device (hosted builds)

extern crate std;

use alloc::string::ToString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use spin::Mutex;

use super::{check_range, BlockDevice};
use crate::error::DeviceError;

/// Raw device image stored in a host file
#[derive(Debug)]
pub struct FileDisk {
    file: Mutex<File>,
    size: u64,
}

impl FileDisk {
    /// Open or create the image at `path`, sized to exactly `size` bytes
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_error)?;
        file.set_len(size).map_err(io_error)?;
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }

    /// Open an existing image, taking its current length as the device size
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_error)?;
        let size = file.metadata().map_err(io_error)?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

fn io_error(err: std::io::Error) -> DeviceError {
    DeviceError::Io(err.to_string())
}

impl BlockDevice for FileDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        check_range(self.size, offset, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).map_err(io_error)?;
        file.read_exact(buf).map_err(io_error)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        check_range(self.size, offset, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).map_err(io_error)?;
        file.write_all(buf).map_err(io_error)
    }

    fn size(&self) -> u64 {
        self.size
    }
}
