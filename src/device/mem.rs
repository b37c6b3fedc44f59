//! In-memory block device
//!
//! Writes land in the image immediately; the device also remembers what
//! each block held at the last `sync`. A crash can therefore be taken two
//! ways: `snapshot()` keeps every issued write, `durable_snapshot()` keeps
//! only synced ones. The failure knobs cut power mid-commit.

use std::collections::{HashMap, HashSet};
use std::io;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Result;

use super::{check_io, BlockDevice};

/// In-memory device for tests and benchmarks
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    inner: Mutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    data: Vec<u8>,
    /// Blocks whose writes always fail
    failing: HashSet<u64>,
    /// Remaining successful writes before the device goes dark
    budget: Option<usize>,
    history: HashMap<u64, Vec<Bytes>>,
    /// Contents at the last sync of blocks written since
    unsynced: HashMap<u64, Bytes>,
    record_history: bool,
    writes: u64,
    syncs: u64,
}

impl MemBlockDevice {
    /// Create a zeroed device
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            inner: Mutex::new(MemInner {
                data: vec![0u8; (block_count * u64::from(block_size)) as usize],
                record_history: true,
                ..MemInner::default()
            }),
        }
    }

    /// Independent copy of the current image, as a crash would leave it
    pub fn snapshot(&self) -> MemBlockDevice {
        let inner = self.inner.lock();
        MemBlockDevice {
            block_size: self.block_size,
            block_count: self.block_count,
            inner: Mutex::new(MemInner {
                data: inner.data.clone(),
                record_history: inner.record_history,
                ..MemInner::default()
            }),
        }
    }

    /// Independent copy holding only what the last `sync` made durable
    pub fn durable_snapshot(&self) -> MemBlockDevice {
        let inner = self.inner.lock();
        let mut data = inner.data.clone();
        for (block, old) in &inner.unsynced {
            let start = (block * u64::from(self.block_size)) as usize;
            data[start..start + old.len()].copy_from_slice(old);
        }
        MemBlockDevice {
            block_size: self.block_size,
            block_count: self.block_count,
            inner: Mutex::new(MemInner {
                data,
                record_history: inner.record_history,
                ..MemInner::default()
            }),
        }
    }

    /// Blocks written since the last sync
    pub fn unsynced_blocks(&self) -> usize {
        self.inner.lock().unsynced.len()
    }

    /// Make every write to `block` fail
    pub fn fail_writes_to(&self, block: u64) {
        self.inner.lock().failing.insert(block);
    }

    /// Allow `budget` more writes, then fail all of them (`None` lifts the limit)
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.inner.lock().budget = budget;
    }

    /// Stop recording per-block write history (benchmarks)
    pub fn disable_history(&self) {
        let mut inner = self.inner.lock();
        inner.record_history = false;
        inner.history.clear();
    }

    /// Every buffer written to `block`, oldest first
    pub fn write_history(&self, block: u64) -> Vec<Bytes> {
        self.inner
            .lock()
            .history
            .get(&block)
            .cloned()
            .unwrap_or_default()
    }

    /// Successful writes so far
    pub fn write_count(&self) -> u64 {
        self.inner.lock().writes
    }

    pub fn sync_count(&self) -> u64 {
        self.inner.lock().syncs
    }
}

impl std::fmt::Debug for MemBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlockDevice")
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .finish_non_exhaustive()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: u64) -> Result<Bytes> {
        check_io(block, self.block_size as usize, self.block_size, self.block_count)?;
        let inner = self.inner.lock();
        let start = (block * u64::from(self.block_size)) as usize;
        let end = start + self.block_size as usize;
        Ok(Bytes::copy_from_slice(&inner.data[start..end]))
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_io(block, data.len(), self.block_size, self.block_count)?;
        let mut inner = self.inner.lock();

        if inner.failing.contains(&block) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected write failure at block {block}"),
            )
            .into());
        }
        if let Some(left) = inner.budget.as_mut() {
            if *left == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "device offline").into());
            }
            *left -= 1;
        }

        let start = (block * u64::from(self.block_size)) as usize;
        let end = start + data.len();
        if !inner.unsynced.contains_key(&block) {
            let old = Bytes::copy_from_slice(&inner.data[start..end]);
            inner.unsynced.insert(block, old);
        }
        inner.data[start..end].copy_from_slice(data);
        inner.writes += 1;
        if inner.record_history {
            inner
                .history
                .entry(block)
                .or_default()
                .push(Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.budget == Some(0) {
            return Err(io::Error::new(io::ErrorKind::Other, "device offline").into());
        }
        inner.syncs += 1;
        inner.unsynced.clear();
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}
