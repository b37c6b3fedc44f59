//! Block Device Module
//!
//! The raw read/write primitive the journal consumes. The journal never
//! caches device blocks itself: log copies, commit records, the header and
//! home-location writes all go straight through this trait.
//!
//! ## Durability
//! A write is only guaranteed durable once a later `sync()` has returned.
//! The commit path relies on this ordering:
//! ```text
//! descriptor + log copies ──▶ sync ──▶ commit record ──▶ sync
//! ```

mod file;
mod mem;

use bytes::Bytes;

use crate::error::Result;

pub use file::FileBlockDevice;
pub use mem::MemBlockDevice;

/// Fixed-size block storage addressed by block number
pub trait BlockDevice: Send + Sync {
    /// Read a whole block
    fn read_block(&self, block: u64) -> Result<Bytes>;

    /// Write a whole block; `data.len()` must equal `block_size()`
    fn write_block(&self, block: u64, data: &[u8]) -> Result<()>;

    /// Flush previously written blocks to stable storage
    fn sync(&self) -> Result<()>;

    /// Bytes per block
    fn block_size(&self) -> u32;

    /// Total number of blocks
    fn block_count(&self) -> u64;
}

pub(crate) fn check_io(block: u64, len: usize, block_size: u32, block_count: u64) -> std::io::Result<()> {
    if block >= block_count {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("block {block} past end of device ({block_count} blocks)"),
        ));
    }
    if len != block_size as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("buffer of {len} bytes for block size {block_size}"),
        ));
    }
    Ok(())
}
