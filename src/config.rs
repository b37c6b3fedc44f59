//! Configuration for txjournal
//!
//! Centralized configuration with sensible defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JournalError, Result};
use crate::journal::format;

/// Main configuration for a journal instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    // -------------------------------------------------------------------------
    // Device Configuration
    // -------------------------------------------------------------------------
    /// Device id used to key the block indexes
    pub device_id: u32,

    /// Bytes per block, power of two in 512..=65536
    pub block_size: u32,

    // -------------------------------------------------------------------------
    // Log Region Layout
    // -------------------------------------------------------------------------
    /// First block of the circular log region
    /// Device layout:
    ///   [0, log_start)                      reserved area
    ///   [log_start, log_start + log_blocks) log region
    ///   log_start + log_blocks              journal header
    pub log_start: u64,

    /// Length of the log region in blocks
    pub log_blocks: u32,

    // -------------------------------------------------------------------------
    // Transaction Limits
    // -------------------------------------------------------------------------
    /// Hard ceiling on blocks per transaction
    pub trans_max: u32,

    /// Soft batch window: a transaction this large is closed at the next end
    pub max_batch: u32,

    /// Closed transactions older than this are committed by the periodic flush
    pub max_commit_age: Duration,

    /// Open transactions older than this are closed
    pub max_trans_age: Duration,

    // -------------------------------------------------------------------------
    // In-Memory Pools
    // -------------------------------------------------------------------------
    /// Slots in the journal list ring
    pub list_count: usize,

    /// Block records available to all in-memory transactions
    pub cnode_count: usize,

    /// Bitmap nodes kept on the free list
    pub bitmap_pool_max: usize,

    // -------------------------------------------------------------------------
    // Background Worker
    // -------------------------------------------------------------------------
    /// Spawn the background commit worker
    pub commit_worker: bool,

    /// Worker idle tick that triggers the periodic flush
    pub flush_interval: Duration,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            block_size: 4096,
            log_start: 18,
            log_blocks: 8192,
            trans_max: 1000,
            max_batch: 900,
            max_commit_age: Duration::from_secs(30),
            max_trans_age: Duration::from_secs(30),
            list_count: 64,
            cnode_count: 16384,
            bitmap_pool_max: 100,
            commit_worker: true,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl JournalConfig {
    /// Create a new config builder
    pub fn builder() -> JournalConfigBuilder {
        JournalConfigBuilder::default()
    }

    /// First block past the journal header
    pub fn journal_end(&self) -> u64 {
        self.log_start + u64::from(self.log_blocks) + 1
    }

    /// Check the limits against each other and against the on-disk format
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || !(512..=65536).contains(&self.block_size) {
            return Err(JournalError::Config(format!(
                "block_size {} must be a power of two in 512..=65536",
                self.block_size
            )));
        }

        let capacity = 2 * format::inline_capacity(self.block_size) as u32;
        if self.trans_max == 0 || self.trans_max > capacity {
            return Err(JournalError::Config(format!(
                "trans_max {} must be in 1..={} for block_size {}",
                self.trans_max, capacity, self.block_size
            )));
        }

        if 2 * (u64::from(self.trans_max) + 2) > u64::from(self.log_blocks) {
            return Err(JournalError::Config(format!(
                "log_blocks {} too small for trans_max {}",
                self.log_blocks, self.trans_max
            )));
        }

        if self.max_batch == 0 || self.max_batch > self.trans_max {
            return Err(JournalError::Config(format!(
                "max_batch {} must be in 1..={}",
                self.max_batch, self.trans_max
            )));
        }

        if self.list_count < 2 {
            return Err(JournalError::Config("list_count must be at least 2".into()));
        }

        if self.cnode_count < 4 * self.trans_max as usize {
            return Err(JournalError::Config(format!(
                "cnode_count {} must be at least 4 * trans_max",
                self.cnode_count
            )));
        }

        if self.max_commit_age.is_zero() || self.max_trans_age.is_zero() {
            return Err(JournalError::Config("transaction ages must be non-zero".into()));
        }

        Ok(())
    }
}

/// Builder for JournalConfig
#[derive(Default)]
pub struct JournalConfigBuilder {
    config: JournalConfig,
}

impl JournalConfigBuilder {
    /// Set the device id used in block keys
    pub fn device_id(mut self, id: u32) -> Self {
        self.config.device_id = id;
        self
    }

    /// Set the block size (in bytes)
    pub fn block_size(mut self, size: u32) -> Self {
        self.config.block_size = size;
        self
    }

    /// Set the first block of the log region
    pub fn log_start(mut self, block: u64) -> Self {
        self.config.log_start = block;
        self
    }

    /// Set the log region length (in blocks)
    pub fn log_blocks(mut self, blocks: u32) -> Self {
        self.config.log_blocks = blocks;
        self
    }

    /// Set the hard per-transaction block ceiling
    pub fn trans_max(mut self, blocks: u32) -> Self {
        self.config.trans_max = blocks;
        self
    }

    /// Set the batch window (in blocks)
    pub fn max_batch(mut self, blocks: u32) -> Self {
        self.config.max_batch = blocks;
        self
    }

    pub fn max_commit_age(mut self, age: Duration) -> Self {
        self.config.max_commit_age = age;
        self
    }

    pub fn max_trans_age(mut self, age: Duration) -> Self {
        self.config.max_trans_age = age;
        self
    }

    /// Set the journal list ring size
    pub fn list_count(mut self, count: usize) -> Self {
        self.config.list_count = count;
        self
    }

    /// Set the block record pool size
    pub fn cnode_count(mut self, count: usize) -> Self {
        self.config.cnode_count = count;
        self
    }

    pub fn bitmap_pool_max(mut self, count: usize) -> Self {
        self.config.bitmap_pool_max = count;
        self
    }

    /// Enable or disable the background commit worker
    pub fn commit_worker(mut self, enabled: bool) -> Self {
        self.config.commit_worker = enabled;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn build(self) -> JournalConfig {
        self.config
    }
}
