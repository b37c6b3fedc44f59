//! File-backed block device
//!
//! Positional I/O through `FileExt`, so concurrent readers and writers
//! never share a seek cursor.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{JournalError, Result};

use super::{check_io, BlockDevice};

/// Block device over a regular file or disk image
#[derive(Debug)]
pub struct FileBlockDevice {
    path: PathBuf,
    file: File,
    block_size: u32,
    block_count: u64,
}

impl FileBlockDevice {
    /// Create (or truncate) an image of `block_count` zeroed blocks
    pub fn create(path: &Path, block_size: u32, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_count * u64::from(block_size))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            block_size,
            block_count,
        })
    }

    /// Open an existing image; its length must be block aligned
    pub fn open(path: &Path, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(JournalError::Config(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let remainder = len % u64::from(block_size);
        if remainder != 0 {
            return Err(JournalError::Config(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            block_size,
            block_count: len / u64::from(block_size),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: u64) -> Result<Bytes> {
        check_io(block, self.block_size as usize, self.block_size, self.block_count)?;
        let mut buf = vec![0u8; self.block_size as usize];
        self.file
            .read_exact_at(&mut buf, block * u64::from(self.block_size))?;
        Ok(Bytes::from(buf))
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_io(block, data.len(), self.block_size, self.block_count)?;
        self.file
            .write_all_at(data, block * u64::from(self.block_size))?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}
