//! Commit builder
//!
//! Turns the open transaction into a journal list slot and makes it
//! durable. A slot is committed only after every older slot is, so replay
//! never finds transaction N without N-1.

use std::time::Instant;

use bytes::Bytes;
use parking_lot::MutexGuard;
use tracing::{debug, trace, warn};

use crate::error::{JournalError, Result};

use super::format::{self, build_records};
use super::worker::WorkItem;
use super::{Journal, JournalState};

impl Journal {
    /// Close the open transaction. Entered by its last writer with the
    /// state guard held; new writers wait until the close finishes.
    pub(crate) fn close_transaction(
        &self,
        mut state: MutexGuard<'_, JournalState>,
        flush: bool,
        commit_now: bool,
        wait: bool,
    ) -> Result<()> {
        state.txn.closing = true;
        let slot = state.current;
        let trans_id = state.txn.trans_id;
        let start = state.txn.start;

        if let Err(e) = self.build_list(&mut state, slot) {
            state.txn.closing = false;
            self.join_wait.notify_all();
            return Err(e);
        }
        let len = state.lists[slot].len;

        // Re-arm the next transaction in the following slot
        let next_start = self.geometry.advance(start, len + 2);
        let next_slot = (slot + 1) % self.config.list_count;
        state.txn.rearm(trans_id + 1, next_start);
        state.current = next_slot;
        state.stats.transactions_closed += 1;
        state.stats.blocks_logged += u64::from(len);
        drop(state);

        debug!(target: "txjournal::commit", trans_id, slot, start, len, flush, commit_now, "transaction closed");

        let result = (|| -> Result<()> {
            if flush {
                self.checkpoint_list(slot, trans_id)?;
            } else if commit_now {
                if wait {
                    self.flush_commit(slot, trans_id)?;
                } else {
                    self.queue_commit(slot, trans_id);
                }
            }
            self.relieve_log_pressure(next_slot, next_start, trans_id + 1)
        })();

        let mut state = self.state.lock();
        state.txn.closing = false;
        state.closed_through = state.closed_through.max(trans_id);
        self.join_wait.notify_all();
        result
    }

    /// Move the open transaction's records into `slot` and render its
    /// descriptor, log copies and commit record
    fn build_list(&self, state: &mut MutexGuard<'_, JournalState>, slot: usize) -> Result<()> {
        let st = &mut **state;
        if st.lists[slot].in_use() {
            let reason = format!("slot {slot} still holds transaction {}", st.lists[slot].trans_id);
            return Err(self.halt_locked(state, reason));
        }

        let trans_id = st.txn.trans_id;
        let ids = st.txn.chain.ids(&st.cnodes);
        let mut blocks = Vec::with_capacity(ids.len());
        let mut copies: Vec<Bytes> = Vec::with_capacity(ids.len() + 1);
        copies.push(Bytes::new());

        for id in ids {
            let key = st.cnodes[id].key;
            let Some(data) = st.cnodes[id].data.clone() else {
                let reason = format!("block {} registered without content", key.block);
                return Err(self.halt_locked(state, reason));
            };
            st.txn.chain.remove(&mut st.cnodes, id);
            st.txn_index.remove(&mut st.cnodes, id);
            st.cnodes.release(id);

            let Some(jl_id) = st.cnodes.alloc(key) else {
                let reason = format!("no block record left while closing transaction {trans_id}");
                return Err(self.halt_locked(state, reason));
            };
            st.cnodes[jl_id].data = Some(data.clone());
            st.cnodes[jl_id].list = Some(slot);
            st.list_index.insert(&mut st.cnodes, jl_id);
            st.lists[slot].chain.push_back(&mut st.cnodes, jl_id);

            // Older lists lose their live copy; the newest holder writes it home
            for old in st.list_index.older(&st.cnodes, jl_id) {
                if st.cnodes[old].data.take().is_some() {
                    if let Some(owner) = st.cnodes[old].list {
                        st.lists[owner].nonzerolen = st.lists[owner].nonzerolen.saturating_sub(1);
                    }
                    st.stats.blocks_superseded += 1;
                }
            }

            blocks.push(key.block);
            copies.push(data);
        }

        let crc = format::data_crc(copies[1..].iter().map(|c| c.as_ref()));
        let (desc, commit) = build_records(trans_id, st.mount_id, &blocks, crc, self.config.block_size);
        copies[0] = desc.encode(self.config.block_size);

        let len = blocks.len() as u32;
        let list = &mut st.lists[slot];
        list.trans_id = trans_id;
        list.start = st.txn.start;
        list.len = len;
        list.commit_left = len + 2;
        list.nonzerolen = len;
        list.commit_flushing = false;
        list.flushing = false;
        list.older_commits_done = false;
        list.timestamp = Some(Instant::now());
        list.log_copies = copies;
        list.commit_record = Some(commit.encode(self.config.block_size));
        Ok(())
    }

    /// Make `trans_id` (in `slot`) and every older list durable in the log
    pub(crate) fn flush_commit(&self, slot: usize, trans_id: u64) -> Result<()> {
        let older = {
            let state = self.state.lock();
            let list = &state.lists[slot];
            if list.holds(trans_id) && list.older_commits_done {
                self.check_halted()?;
                return Ok(());
            }
            state.older_lists(trans_id)
        };
        for (older_slot, older_id) in older {
            self.commit_one(older_slot, older_id)?;
        }
        self.commit_one(slot, trans_id)?;

        let mut state = self.state.lock();
        if state.lists[slot].holds(trans_id) {
            state.lists[slot].older_commits_done = true;
        }
        Ok(())
    }

    /// Write one slot's descriptor and copies, sync, then its commit record
    fn commit_one(&self, slot: usize, trans_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            self.check_halted()?;
            let list = &state.lists[slot];
            if !list.holds(trans_id) || list.is_committed() {
                return Ok(());
            }
            if list.commit_flushing {
                self.signals[slot].commit_done.wait(&mut state);
                continue;
            }
            break;
        }

        let list = &mut state.lists[slot];
        list.commit_flushing = true;
        let start = list.start;
        let len = list.len;
        let copies = list.log_copies.clone();
        let commit = list.commit_record.clone();
        drop(state);

        let result = (|| -> Result<()> {
            let Some(commit) = commit else {
                return Err(JournalError::InvariantViolation(format!(
                    "transaction {trans_id} has no commit record"
                )));
            };
            for (i, copy) in copies.iter().enumerate() {
                let block = self.geometry.log_block(self.geometry.advance(start, i as u32));
                self.device.write_block(block, copy)?;
            }
            self.device.sync()?;
            let commit_block = self.geometry.log_block(self.geometry.advance(start, len + 1));
            self.device.write_block(commit_block, &commit)?;
            self.device.sync()
        })();

        let mut state = self.state.lock();
        let st = &mut *state;
        let list = &mut st.lists[slot];
        list.commit_flushing = false;
        let outcome = match result {
            Ok(()) => {
                list.commit_left = 0;
                list.log_copies.clear();
                list.commit_record = None;
                st.stats.commits_flushed += 1;
                trace!(target: "txjournal::commit", trans_id, slot, start, len, "commit durable");
                Ok(())
            }
            Err(e) => {
                let reason = format!("commit of transaction {trans_id} failed: {e}");
                Err(self.halt_locked(&mut state, reason))
            }
        };
        self.signals[slot].commit_done.notify_all();
        outcome
    }

    /// Hand a commit to the background worker, or do it inline without one
    pub(crate) fn queue_commit(&self, slot: usize, trans_id: u64) {
        let sent = match self.worker_tx.lock().as_ref() {
            Some(tx) => tx.send(WorkItem::Commit { slot, trans_id }).is_ok(),
            None => false,
        };
        if !sent {
            if let Err(e) = self.flush_commit(slot, trans_id) {
                warn!(target: "txjournal::commit", trans_id, error = %e, "inline commit failed");
            }
        }
    }
}
