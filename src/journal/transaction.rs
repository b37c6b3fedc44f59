//! Transaction accumulator
//!
//! Handles join the single open transaction with [`Journal::begin`],
//! register blocks, and leave with [`Transaction::end`]. The last handle
//! out decides whether the transaction keeps batching or closes.

use std::ops::BitOr;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::error::{JournalError, Result};

use super::{Journal, QUOTA_STEP};

/// How hard `end` pushes the transaction toward disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndFlags(u8);

impl EndFlags {
    /// Batch if the window allows
    pub const NONE: EndFlags = EndFlags(0);
    /// Close, commit and checkpoint every list
    pub const FLUSH_ALL: EndFlags = EndFlags(1);
    /// Close and commit, without checkpointing
    pub const COMMIT_NOW: EndFlags = EndFlags(1 << 1);
    /// With `COMMIT_NOW`, return only once the commit record is durable
    pub const WAIT: EndFlags = EndFlags(1 << 2);

    pub fn contains(self, other: EndFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EndFlags {
    type Output = EndFlags;

    fn bitor(self, rhs: EndFlags) -> EndFlags {
        EndFlags(self.0 | rhs.0)
    }
}

/// A handle joined to the open transaction
///
/// Dropping a handle without calling [`end`](Self::end) ends it with
/// [`EndFlags::NONE`].
pub struct Transaction<'a> {
    journal: &'a Journal,
    trans_id: u64,
    blocks_allocated: u32,
    blocks_logged: u32,
    ended: bool,
}

impl<'a> Transaction<'a> {
    /// Id of the transaction this handle joined
    pub fn trans_id(&self) -> u64 {
        self.trans_id
    }

    /// Blocks this handle added to the transaction
    pub fn blocks_logged(&self) -> u32 {
        self.blocks_logged
    }

    /// Log `data` as the new content of `block`
    pub fn register(&mut self, block: u64, data: Bytes) -> Result<()> {
        self.journal.register(self, block, data, false)
    }

    /// Log a block the allocator just handed out. If it is freed again
    /// before the transaction closes, it leaves no trace.
    pub fn register_new(&mut self, block: u64, data: Bytes) -> Result<()> {
        self.journal.register(self, block, data, true)
    }

    /// Record that `block` was freed by this transaction
    pub fn mark_freed(&mut self, block: u64) -> Result<()> {
        self.journal.mark_freed(self, block)
    }

    /// True when the caller should end this handle before adding
    /// `new_blocks` more
    pub fn should_end(&self, new_blocks: u32) -> bool {
        self.journal.should_end(new_blocks)
    }

    /// Leave the transaction
    pub fn end(mut self, flags: EndFlags) -> Result<()> {
        self.ended = true;
        let journal = self.journal;
        journal.end(&mut self, flags)
    }

    /// `end(COMMIT_NOW | WAIT)`
    pub fn end_sync(self) -> Result<()> {
        self.end(EndFlags::COMMIT_NOW | EndFlags::WAIT)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.ended {
            self.ended = true;
            let journal = self.journal;
            if let Err(e) = journal.end(self, EndFlags::NONE) {
                warn!(target: "txjournal::transaction", trans_id = self.trans_id, error = %e, "implicit end failed");
            }
        }
    }
}

impl Journal {
    /// Join the open transaction, reserving `min_blocks`
    ///
    /// Waits while a close is running or writers are blocked. When the
    /// transaction is full, too old, short on block records or asked to
    /// close, a lone caller closes it itself; otherwise it waits for the
    /// last writer to do so. `join` skips those limits and writer gating.
    pub(crate) fn begin(&self, min_blocks: u32, join: bool) -> Result<Transaction<'_>> {
        if min_blocks > self.config.trans_max {
            return Err(JournalError::InvalidArgument(format!(
                "begin({min_blocks}) exceeds trans_max {}",
                self.config.trans_max
            )));
        }
        let trans_max = self.config.trans_max as usize;

        let mut state = self.state.lock();
        loop {
            self.check_halted()?;

            if state.txn.closing || (state.writers_blocked && !join) {
                self.join_wait.wait(&mut state);
                continue;
            }

            let now = Instant::now();
            let too_old = state
                .txn
                .start_time
                .is_some_and(|t| now.duration_since(t) > self.config.max_trans_age);
            let must_close = state.txn.close_requested
                || (state.txn.len_alloc > 0
                    && state.txn.len_alloc + min_blocks + 2 >= self.config.max_batch)
                || (state.txn.writers > 0 && too_old)
                || state.cnodes.available() < trans_max * 3;

            if !join && must_close {
                state.stats.relocks += 1;
                if state.txn.writers > 0 {
                    // Let the last writer close it
                    let trans_id = state.txn.trans_id;
                    state.txn.close_requested = true;
                    while !self.is_halted()
                        && ((state.txn.trans_id == trans_id && state.txn.close_requested)
                            || state.txn.closing)
                    {
                        self.join_wait.wait(&mut state);
                    }
                    continue;
                }

                drop(state);
                self.force_close()?;
                state = self.state.lock();
                continue;
            }

            if state.txn.start_time.is_none() {
                state.txn.start_time = Some(now);
            }
            state.txn.writers += 1;
            state.txn.len_alloc += min_blocks;
            state.stats.begins += 1;

            trace!(target: "txjournal::transaction", trans_id = state.txn.trans_id, writers = state.txn.writers, "joined");
            return Ok(Transaction {
                journal: self,
                trans_id: state.txn.trans_id,
                blocks_allocated: min_blocks,
                blocks_logged: 0,
                ended: false,
            });
        }
    }

    /// Close the open transaction with no other writers, or free block
    /// records by checkpointing when there is nothing to close
    fn force_close(&self) -> Result<()> {
        let th = self.begin(1, true)?;
        th.end(EndFlags::COMMIT_NOW)?;

        let short = {
            let state = self.state.lock();
            state.cnodes.available() < self.config.trans_max as usize * 3
        };
        if short {
            debug!(target: "txjournal::transaction", "block records low, checkpointing oldest list");
            self.checkpoint_oldest()?;
        }
        Ok(())
    }

    fn check_handle(&self, state: &mut parking_lot::MutexGuard<'_, super::JournalState>, th: &Transaction<'_>) -> Result<()> {
        self.check_halted()?;
        if th.trans_id != state.txn.trans_id {
            let reason = format!(
                "handle for transaction {} used while {} is open",
                th.trans_id, state.txn.trans_id
            );
            return Err(self.halt_locked(state, reason));
        }
        Ok(())
    }

    pub(crate) fn register(&self, th: &mut Transaction<'_>, block: u64, data: Bytes, fresh: bool) -> Result<()> {
        self.check_block(block)?;
        if data.len() != self.config.block_size as usize {
            return Err(JournalError::InvalidBlock {
                block,
                reason: format!("buffer of {} bytes for block size {}", data.len(), self.config.block_size),
            });
        }

        let key = self.key(block);
        let mut state = self.state.lock();
        self.check_handle(&mut state, th)?;
        let st = &mut *state;

        if let Some(id) = st.txn_index.find(&st.cnodes, &key) {
            // Already dirty here: refresh the copy, keep its position
            let node = &mut st.cnodes[id];
            node.data = Some(data);
            node.fresh &= fresh;
            return Ok(());
        }

        if st.txn.len >= self.config.trans_max {
            let reason = format!(
                "transaction {} exceeds {} blocks",
                st.txn.trans_id, self.config.trans_max
            );
            return Err(self.halt_locked(&mut state, reason));
        }

        let Some(id) = st.cnodes.alloc(key) else {
            let reason = format!("no block record left for block {block}");
            return Err(self.halt_locked(&mut state, reason));
        };
        let logged_before = st.list_index.find(&st.cnodes, &key).is_some();
        {
            let node = &mut st.cnodes[id];
            node.data = Some(data);
            node.fresh = fresh && !logged_before;
        }
        st.txn.chain.push_back(&mut st.cnodes, id);
        st.txn_index.insert(&mut st.cnodes, id);
        st.txn.len += 1;

        th.blocks_logged += 1;
        if th.blocks_logged >= th.blocks_allocated {
            th.blocks_allocated += QUOTA_STEP;
            st.txn.len_alloc += QUOTA_STEP;
        }

        trace!(target: "txjournal::transaction", trans_id = th.trans_id, block, fresh, "registered");
        Ok(())
    }

    pub(crate) fn mark_freed(&self, th: &mut Transaction<'_>, block: u64) -> Result<()> {
        self.check_block(block)?;
        let key = self.key(block);
        let mut state = self.state.lock();
        self.check_handle(&mut state, th)?;
        let st = &mut *state;

        let in_txn = st.txn_index.find(&st.cnodes, &key);
        let logged_before = st.list_index.find(&st.cnodes, &key).is_some();

        if let Some(id) = in_txn {
            if st.cnodes[id].fresh && !logged_before {
                self.remove_from_transaction(st, id);
                st.stats.fresh_frees += 1;
                trace!(target: "txjournal::transaction", trans_id = th.trans_id, block, "fresh block dropped");
                return Ok(());
            }
        }

        let current = st.current;
        if !st.lists[current].bitmap.set(&mut st.bitmaps, block) {
            let reason = format!("no quarantine bit for block {block}");
            return Err(self.halt_locked(&mut state, reason));
        }

        if let Some(id) = in_txn {
            self.remove_from_transaction(st, id);
        }

        // Older records become tombstones; their copies stay until this
        // transaction is durable
        for old in st.list_index.all(&st.cnodes, &key) {
            st.cnodes[old].freed_by.get_or_insert(th.trans_id);
        }

        st.stats.quarantined_frees += 1;
        trace!(target: "txjournal::transaction", trans_id = th.trans_id, block, "block quarantined");
        Ok(())
    }

    fn remove_from_transaction(&self, st: &mut super::JournalState, id: super::cnode::CnodeId) {
        st.txn.chain.remove(&mut st.cnodes, id);
        st.txn_index.remove(&mut st.cnodes, id);
        st.cnodes.release(id);
        st.txn.len -= 1;
        st.txn.len_alloc = st.txn.len_alloc.saturating_sub(1);
    }

    pub(crate) fn should_end(&self, new_blocks: u32) -> bool {
        let state = self.state.lock();
        let too_old = state
            .txn
            .start_time
            .is_some_and(|t| t.elapsed() > self.config.max_trans_age);

        state.txn.close_requested
            || state.writers_blocked
            || state.cnodes.available() < self.config.trans_max as usize * 3
            || state.txn.len_alloc + new_blocks >= self.config.max_batch
            || too_old
    }

    /// Drop a handle from the transaction, closing it when this was the
    /// last writer and the batch window is spent or a flush was asked for
    pub(crate) fn end(&self, th: &mut Transaction<'_>, flags: EndFlags) -> Result<()> {
        let mut state = self.state.lock();
        self.check_handle(&mut state, th)?;

        let mut flush = flags.contains(EndFlags::FLUSH_ALL);
        let mut commit_now = flags.contains(EndFlags::COMMIT_NOW);
        let wait = flags.contains(EndFlags::WAIT);
        if state.txn.next_full_flush {
            flush = true;
        }
        if state.txn.next_async_flush {
            commit_now = true;
        }

        let unused = th.blocks_allocated.saturating_sub(th.blocks_logged);
        state.txn.len_alloc = state.txn.len_alloc.saturating_sub(unused);
        state.txn.writers = state.txn.writers.saturating_sub(1);

        if state.txn.len == 0 {
            if state.txn.writers == 0 {
                // Nothing to close; the next writer starts a fresh window
                state.txn.len_alloc = 0;
                state.txn.start_time = None;
                if state.txn.close_requested {
                    state.txn.close_requested = false;
                    self.join_wait.notify_all();
                }
            }
            return Ok(());
        }

        if state.txn.writers > 0 {
            if flush || commit_now {
                let trans_id = state.txn.trans_id;
                state.txn.close_requested = true;
                if flush {
                    state.txn.next_full_flush = true;
                }
                // Wait for the last writer to close it, or to leave it empty
                while !self.is_halted()
                    && ((state.txn.trans_id == trans_id && state.txn.close_requested)
                        || (state.txn.trans_id != trans_id && state.closed_through < trans_id))
                {
                    self.join_wait.wait(&mut state);
                }
                self.check_halted()?;

                if commit_now && !flush {
                    if let Some(slot) = state.find_list(trans_id) {
                        drop(state);
                        if wait {
                            return self.flush_commit(slot, trans_id);
                        }
                        self.queue_commit(slot, trans_id);
                    }
                }
            }
            return Ok(());
        }

        if state
            .txn
            .start_time
            .is_some_and(|t| t.elapsed() > self.config.max_trans_age)
        {
            commit_now = true;
            state.txn.next_async_flush = true;
        }

        let batch = !state.txn.close_requested
            && !flush
            && !commit_now
            && state.txn.len < self.config.max_batch
            && state.txn.len_alloc < self.config.max_batch
            && state.cnodes.available() > self.config.trans_max as usize * 3;
        if batch {
            state.stats.batched_ends += 1;
            return Ok(());
        }

        self.close_transaction(state, flush, commit_now, wait)
    }
}
