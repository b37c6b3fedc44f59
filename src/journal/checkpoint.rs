//! Checkpoint engine
//!
//! Writes committed blocks to their home locations and advances the
//! on-disk header past them. Only the newest in-memory copy of a block is
//! ever written home; older holders defer to it.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::error::Result;

use super::cnode::CnodeId;
use super::format::JournalHeader;
use super::{EndFlags, Journal, JournalState};

impl Journal {
    /// Checkpoint `trans_id` and every older list, then advance the header
    pub(crate) fn checkpoint_list(&self, slot: usize, trans_id: u64) -> Result<()> {
        let _checkpoint = self.checkpoint_lock.lock();
        self.flush_list(slot, trans_id, true)
    }

    /// Checkpoint the oldest list still in memory
    pub(crate) fn checkpoint_oldest(&self) -> Result<bool> {
        let oldest = self.state.lock().oldest_list();
        match oldest {
            Some((slot, trans_id)) => {
                self.checkpoint_list(slot, trans_id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Checkpoint every list in memory
    pub(crate) fn checkpoint_all(&self) -> Result<()> {
        let newest = {
            let state = self.state.lock();
            state
                .lists
                .iter()
                .enumerate()
                .filter(|(_, l)| l.in_use())
                .max_by_key(|(_, l)| l.trans_id)
                .map(|(i, l)| (i, l.trans_id))
        };
        if let Some((slot, trans_id)) = newest {
            self.checkpoint_list(slot, trans_id)?;
        }
        Ok(())
    }

    /// Quiesce the slot, flush it, release it. Caller holds `checkpoint_lock`.
    fn flush_list(&self, slot: usize, trans_id: u64, flushall: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            loop {
                self.check_halted()?;
                if !state.lists[slot].holds(trans_id) {
                    return Ok(());
                }
                if state.lists[slot].flushing {
                    self.signals[slot].flush_done.wait(&mut state);
                    continue;
                }
                break;
            }
            state.lists[slot].flushing = true;
        }

        let result = self.flush_list_blocks(slot, trans_id, flushall);

        let mut state = self.state.lock();
        if state.lists[slot].holds(trans_id) {
            state.lists[slot].flushing = false;
        }
        self.signals[slot].flush_done.notify_all();
        result
    }

    fn flush_list_blocks(&self, slot: usize, trans_id: u64, flushall: bool) -> Result<()> {
        self.flush_commit(slot, trans_id)?;

        // Decide per record: write home, or defer to a newer holder
        let (writes, newer) = {
            let state = self.state.lock();
            let mut writes = Vec::new();
            let mut newer: Vec<(usize, u64)> = Vec::new();
            for id in state.lists[slot].chain.ids(&state.cnodes) {
                let node = &state.cnodes[id];
                if let Some(holder) = newest_holder(&state, id) {
                    trace!(target: "txjournal::checkpoint", trans_id, block = node.key.block, newer = holder.1, "deferring to newer transaction");
                    if !newer.contains(&holder) {
                        newer.push(holder);
                    }
                    continue;
                }
                if let Some(freer) = node.freed_by {
                    match free_state(&state, freer) {
                        FreeState::Durable => continue,
                        FreeState::Uncommitted(holder) => {
                            trace!(target: "txjournal::checkpoint", trans_id, block = node.key.block, freed_by = freer, "committing the free first");
                            if !newer.contains(&holder) {
                                newer.push(holder);
                            }
                            continue;
                        }
                        // The free may still be lost in a crash; keep the committed copy
                        FreeState::Open => {}
                    }
                }
                if let Some(data) = &node.data {
                    writes.push((id, node.key.block, data.clone()));
                }
            }
            (writes, newer)
        };

        for (newer_slot, newer_id) in newer {
            self.flush_commit(newer_slot, newer_id)?;
        }

        self.write_home(slot, &writes)?;

        if flushall {
            let older = self.state.lock().older_lists(trans_id);
            for (older_slot, older_id) in older {
                self.flush_list(older_slot, older_id, false)?;
            }

            let end = {
                let state = self.state.lock();
                let list = &state.lists[slot];
                self.geometry.advance(list.start, list.len + 2)
            };
            self.update_header(trans_id, end)?;
        }

        let mut state = self.state.lock();
        self.release_list(&mut state, slot);
        state.stats.checkpoints += 1;
        debug!(target: "txjournal::checkpoint", trans_id, slot, written = writes.len(), "list checkpointed");
        Ok(())
    }

    /// Write live copies home, sync, then drop the copies
    fn write_home(&self, slot: usize, writes: &[(CnodeId, u64, Bytes)]) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let io = (|| -> Result<()> {
            for (_, block, data) in writes {
                self.device.write_block(*block, data)?;
            }
            self.device.sync()
        })();
        if let Err(e) = io {
            return Err(self.halt(format!("home write for slot {slot} failed: {e}")));
        }

        let mut state = self.state.lock();
        let st = &mut *state;
        for (id, _, _) in writes {
            if st.cnodes[*id].data.take().is_some() {
                st.lists[slot].nonzerolen = st.lists[slot].nonzerolen.saturating_sub(1);
                st.stats.blocks_written_home += 1;
            }
        }
        Ok(())
    }

    /// Drop every record of the slot from the index and recycle the slot
    fn release_list(&self, state: &mut JournalState, slot: usize) {
        for id in state.lists[slot].chain.ids(&state.cnodes) {
            state.list_index.remove(&mut state.cnodes, id);
            state.cnodes.release(id);
        }
        let list = &mut state.lists[slot];
        list.bitmap.release(&mut state.bitmaps);
        list.reset();
    }

    /// Persist the new replay start point
    fn update_header(&self, trans_id: u64, offset: u32) -> Result<()> {
        let header = {
            let state = self.state.lock();
            if trans_id < state.last_flush_trans_id {
                return Ok(());
            }
            JournalHeader {
                last_flush_trans_id: trans_id,
                first_unflushed_offset: offset,
                mount_id: state.mount_id,
                params: self.params(),
            }
        };

        let io = (|| -> Result<()> {
            let block = header.encode(self.config.block_size)?;
            self.device.write_block(self.geometry.header_block(), &block)?;
            self.device.sync()
        })();
        if let Err(e) = io {
            return Err(self.halt(format!("header update failed: {e}")));
        }

        let mut state = self.state.lock();
        state.last_flush_trans_id = trans_id;
        state.first_unflushed_offset = offset;
        trace!(target: "txjournal::checkpoint", trans_id, offset, "header advanced");
        Ok(())
    }

    /// Write a committed list's blocks home without freeing the slot, so a
    /// later checkpoint only has to move the header
    pub(crate) fn write_back(&self, slot: usize, trans_id: u64) -> Result<()> {
        let _checkpoint = self.checkpoint_lock.lock();
        let writes = {
            let mut state = self.state.lock();
            self.check_halted()?;
            let list = &state.lists[slot];
            if !list.holds(trans_id) || !list.is_committed() || list.flushing || list.nonzerolen == 0 {
                return Ok(());
            }
            state.lists[slot].flushing = true;

            let mut writes = Vec::new();
            let mut dead = Vec::new();
            for id in state.lists[slot].chain.ids(&state.cnodes) {
                let node = &state.cnodes[id];
                if newest_holder(&state, id).is_some() {
                    continue;
                }
                if let Some(freer) = node.freed_by {
                    if matches!(free_state(&state, freer), FreeState::Durable) && node.data.is_some() {
                        dead.push(id);
                    }
                    continue;
                }
                if let Some(data) = &node.data {
                    writes.push((id, node.key.block, data.clone()));
                }
            }

            // Durably freed: the copies are dead
            for id in dead {
                if state.cnodes[id].data.take().is_some() {
                    state.lists[slot].nonzerolen = state.lists[slot].nonzerolen.saturating_sub(1);
                }
            }
            writes
        };

        let result = self.write_home(slot, &writes);

        let mut state = self.state.lock();
        if state.lists[slot].holds(trans_id) {
            state.lists[slot].flushing = false;
        }
        self.signals[slot].flush_done.notify_all();
        if result.is_ok() {
            trace!(target: "txjournal::checkpoint", trans_id, slot, written = writes.len(), "written back");
        }
        result
    }

    /// Keep the next transaction from overwriting live log space: checkpoint
    /// lists whose start lies in its worst-case window, lists that are far
    /// too old, and whatever still occupies the next slot
    pub(crate) fn relieve_log_pressure(&self, next_slot: usize, next_start: u32, next_id: u64) -> Result<()> {
        let window = self.config.trans_max + 2;
        let stale_after = self.config.max_trans_age * 4;
        let now = Instant::now();

        let victims: Vec<(usize, u64)> = {
            let state = self.state.lock();
            state
                .older_lists(next_id)
                .into_iter()
                .filter(|(slot, _)| {
                    let list = &state.lists[*slot];
                    *slot == next_slot
                        || self.geometry.in_window(next_start, window, list.start)
                        || list
                            .timestamp
                            .is_some_and(|t| now.duration_since(t) > stale_after)
                })
                .collect()
        };

        for (slot, trans_id) in victims {
            self.checkpoint_list(slot, trans_id)?;
        }
        Ok(())
    }

    /// Commit lists older than `max_commit_age` and write them back; close
    /// an idle open transaction older than `max_trans_age`. `immediate`
    /// ignores the ages. Returns the number of lists committed.
    pub(crate) fn flush_old_commits(&self, immediate: bool) -> Result<usize> {
        self.check_halted()?;
        let now = Instant::now();
        let (aged, close_open) = {
            let state = self.state.lock();
            let aged: Vec<(usize, u64, bool)> = state
                .older_lists(u64::MAX)
                .into_iter()
                .filter(|(slot, _)| {
                    let list = &state.lists[*slot];
                    immediate
                        || list
                            .timestamp
                            .is_some_and(|t| now.duration_since(t) > self.config.max_commit_age)
                })
                .map(|(slot, id)| (slot, id, state.lists[slot].is_committed()))
                .collect();
            let close_open = state.txn.len > 0
                && state.txn.writers == 0
                && !state.txn.closing
                && (immediate
                    || state
                        .txn
                        .start_time
                        .is_some_and(|t| now.duration_since(t) > self.config.max_trans_age));
            (aged, close_open)
        };

        let mut committed = 0;
        for (slot, trans_id, was_committed) in aged {
            if !was_committed {
                self.flush_commit(slot, trans_id)?;
                committed += 1;
            }
            self.write_back(slot, trans_id)?;
        }

        if close_open {
            let th = self.begin(1, true)?;
            th.end(EndFlags::COMMIT_NOW | EndFlags::WAIT)?;
            committed += 1;
        }

        if committed > 0 {
            info!(target: "txjournal::checkpoint", committed, immediate, "flushed old commits");
        }
        Ok(committed)
    }
}

/// Where the transaction that freed a block stands
enum FreeState {
    /// Committed or already checkpointed
    Durable,
    /// Closed but not committed, as (slot, trans_id)
    Uncommitted((usize, u64)),
    /// Still the open transaction
    Open,
}

fn free_state(state: &JournalState, freer: u64) -> FreeState {
    match state.find_list(freer) {
        Some(slot) if state.lists[slot].is_committed() => FreeState::Durable,
        Some(slot) => FreeState::Uncommitted((slot, freer)),
        None if freer >= state.txn.trans_id => FreeState::Open,
        None => FreeState::Durable,
    }
}

/// Nearest newer list holding the same block, as (slot, trans_id)
fn newest_holder(state: &JournalState, id: CnodeId) -> Option<(usize, u64)> {
    state
        .list_index
        .newer(&state.cnodes, id)
        .into_iter()
        .find_map(|other| state.cnodes[other].list)
        .map(|slot| (slot, state.lists[slot].trans_id))
}
