//! Journal list table entries
//!
//! A ring of fixed slots, one per closed transaction that has not been
//! checkpointed yet. The slot of the open transaction is reserved ahead of
//! time so frees in the open transaction have a bitmap to land in.

use std::time::Instant;

use bytes::Bytes;
use parking_lot::Condvar;

use super::bitmap::ListBitmap;
use super::cnode::CnodeChain;

/// One closed transaction awaiting commit and checkpoint
#[derive(Debug, Default)]
pub(crate) struct JournalList {
    pub trans_id: u64,
    /// Log offset of the descriptor
    pub start: u32,
    /// Logged blocks; 0 marks a free slot
    pub len: u32,
    pub chain: CnodeChain,
    /// Log blocks (descriptor, copies, commit) not yet durable
    pub commit_left: u32,
    /// Block records still holding a live copy
    pub nonzerolen: u32,
    pub commit_flushing: bool,
    pub flushing: bool,
    /// This list and every older one are durable
    pub older_commits_done: bool,
    pub timestamp: Option<Instant>,
    pub bitmap: ListBitmap,
    /// Descriptor followed by the block copies, dropped once committed
    pub log_copies: Vec<Bytes>,
    pub commit_record: Option<Bytes>,
}

impl JournalList {
    pub fn new(bitmap: ListBitmap) -> Self {
        Self {
            bitmap,
            ..Self::default()
        }
    }

    pub fn in_use(&self) -> bool {
        self.len > 0
    }

    pub fn holds(&self, trans_id: u64) -> bool {
        self.in_use() && self.trans_id == trans_id
    }

    pub fn is_committed(&self) -> bool {
        self.commit_left == 0
    }

    /// Forget the transaction; the bitmap must already be released
    pub fn reset(&mut self) {
        self.trans_id = 0;
        self.start = 0;
        self.len = 0;
        self.chain = CnodeChain::default();
        self.commit_left = 0;
        self.nonzerolen = 0;
        self.commit_flushing = false;
        self.flushing = false;
        self.older_commits_done = false;
        self.timestamp = None;
        self.log_copies.clear();
        self.commit_record = None;
    }
}

/// Wakeups for one slot
#[derive(Debug, Default)]
pub(crate) struct ListSignals {
    pub commit_done: Condvar,
    pub flush_done: Condvar,
}
