//! Recovery engine
//!
//! Run once at mount, before any transaction can begin:
//!
//! ```text
//! Locate-Header ─▶ Validate-Known-Offset ─┬─▶ Replay-Loop ─▶ Rewrite-Header
//!        │                                │
//!        └── no valid header ─▶ Scan-For-Oldest
//! ```
//!
//! A transaction is replayed only if its descriptor and commit agree, its
//! log copies match the commit checksum, every member address lies
//! outside the journal, and it belongs to the expected mount. The first
//! transaction failing any check ends replay: everything after it was
//! never durable.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::JournalConfig;
use crate::device::BlockDevice;
use crate::error::{JournalError, Result};

use super::format::{self, CommitRecord, Descriptor, JournalHeader, JournalParams, LogGeometry};

/// Outcome of a recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// The header block decoded and matched the configured geometry
    pub header_valid: bool,

    /// The whole log was scanned for the oldest transaction
    pub scanned: bool,

    pub transactions_replayed: u64,
    pub blocks_replayed: u64,
    pub first_replayed: Option<u64>,
    pub last_replayed: Option<u64>,

    /// Newest transaction known to be home after recovery
    pub last_flush_trans_id: u64,

    /// Log offset the next transaction starts at
    pub start_offset: u32,

    /// Mount epoch written to the header for this mount
    pub mount_id: u32,
}

/// A fully validated transaction found in the log
#[derive(Debug, Clone)]
pub struct LoggedTransaction {
    pub offset: u32,
    pub trans_id: u64,
    pub mount_id: u32,
    /// Home addresses in log order
    pub blocks: Vec<u64>,
    /// Log copies matching `blocks`
    pub copies: Vec<Bytes>,
}

impl LoggedTransaction {
    pub fn len(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Reads transactions out of the log region
pub struct LogReader<'a> {
    device: &'a dyn BlockDevice,
    geometry: LogGeometry,
}

impl<'a> LogReader<'a> {
    pub fn new(device: &'a dyn BlockDevice, geometry: LogGeometry) -> Self {
        Self { device, geometry }
    }

    pub fn read_header(&self) -> Result<Option<JournalHeader>> {
        let raw = self.device.read_block(self.geometry.header_block())?;
        Ok(JournalHeader::decode(&raw)
            .filter(|h| h.first_unflushed_offset < self.geometry.log_blocks))
    }

    /// The transaction whose descriptor sits at `offset`, if it is intact
    pub fn load(&self, offset: u32) -> Result<Option<LoggedTransaction>> {
        let raw = self.device.read_block(self.geometry.log_block(offset))?;
        let Some(desc) = Descriptor::decode(&raw) else {
            return Ok(None);
        };
        if desc.len > self.geometry.max_trans_len() {
            return Ok(None);
        }

        let commit_offset = self.geometry.advance(offset, desc.len + 1);
        let raw = self.device.read_block(self.geometry.log_block(commit_offset))?;
        let Some(commit) = CommitRecord::decode(&raw) else {
            debug!(target: "txjournal::recovery", offset, trans_id = desc.trans_id, "no commit record");
            return Ok(None);
        };
        if !commit.matches(&desc) {
            debug!(target: "txjournal::recovery", offset, trans_id = desc.trans_id, commit_id = commit.trans_id, "commit record does not match");
            return Ok(None);
        }

        let blocks = format::member_blocks(&desc, &commit);
        if let Some(bad) = blocks
            .iter()
            .find(|b| self.geometry.is_journal_block(**b) || **b >= self.device.block_count())
        {
            warn!(target: "txjournal::recovery", offset, trans_id = desc.trans_id, block = *bad, "member address outside the filesystem");
            return Ok(None);
        }

        let mut copies = Vec::with_capacity(blocks.len());
        for i in 0..desc.len {
            let at = self.geometry.advance(offset, i + 1);
            copies.push(self.device.read_block(self.geometry.log_block(at))?);
        }
        if format::data_crc(copies.iter().map(|c| c.as_ref())) != commit.data_crc {
            warn!(target: "txjournal::recovery", offset, trans_id = desc.trans_id, "log copies do not match commit checksum");
            return Ok(None);
        }

        Ok(Some(LoggedTransaction {
            offset,
            trans_id: desc.trans_id,
            mount_id: desc.mount_id,
            blocks,
            copies,
        }))
    }

    /// Every intact transaction in the log, by offset
    pub fn scan(&self) -> Result<Vec<LoggedTransaction>> {
        let mut found = Vec::new();
        for offset in 0..self.geometry.log_blocks {
            if let Some(t) = self.load(offset)? {
                found.push(t);
            }
        }
        Ok(found)
    }
}

/// Where replay starts and what it accepts
struct ReplayPlan {
    offset: u32,
    min_trans_id: u64,
    mount_id: u32,
}

/// Run recovery against `device` and rewrite the header.
///
/// Returns the header now on disk and a report of what was replayed.
pub fn recover(device: &dyn BlockDevice, config: &JournalConfig) -> Result<(JournalHeader, RecoveryReport)> {
    let geometry = LogGeometry::from_config(config);
    let reader = LogReader::new(device, geometry);
    let mut report = RecoveryReport::default();

    // Step 1: Locate the header
    let header = reader.read_header()?;
    if let Some(h) = &header {
        if !h.params.same_geometry(&geometry) {
            return Err(JournalError::Corruption(format!(
                "journal header describes block_size={} log_start={} log_blocks={}, configured {}/{}/{}",
                h.params.block_size,
                h.params.log_start,
                h.params.log_blocks,
                geometry.block_size,
                geometry.log_start,
                geometry.log_blocks
            )));
        }
    }
    report.header_valid = header.is_some();

    let mut last_flush = header.as_ref().map_or(0, |h| h.last_flush_trans_id);
    let mut offset = header.as_ref().map_or(0, |h| h.first_unflushed_offset);
    let mut mount_id = header.as_ref().map_or(0, |h| h.mount_id);

    // Step 2 / 3: Decide where replay begins
    let plan = match &header {
        Some(h) => match reader.load(h.first_unflushed_offset)? {
            Some(t) if t.trans_id > h.last_flush_trans_id && t.mount_id == h.mount_id => {
                Some(ReplayPlan {
                    offset: h.first_unflushed_offset,
                    min_trans_id: h.last_flush_trans_id + 1,
                    mount_id: h.mount_id,
                })
            }
            _ => None,
        },
        None => {
            warn!(target: "txjournal::recovery", "no valid journal header, scanning the log");
            report.scanned = true;
            let found = reader.scan()?;
            let newest_mount = found.iter().map(|t| t.mount_id).max();
            let oldest = found
                .iter()
                .filter(|t| Some(t.mount_id) == newest_mount)
                .min_by_key(|t| t.trans_id);
            match oldest {
                Some(t) => {
                    last_flush = t.trans_id.saturating_sub(1);
                    offset = t.offset;
                    mount_id = t.mount_id;
                    Some(ReplayPlan {
                        offset: t.offset,
                        min_trans_id: t.trans_id,
                        mount_id: t.mount_id,
                    })
                }
                None => {
                    mount_id = newest_mount.unwrap_or(0);
                    None
                }
            }
        }
    };

    // Step 4: Replay in order until the first invalid transaction
    if let Some(plan) = plan {
        let mut cursor = plan.offset;
        let mut expected_min = plan.min_trans_id;
        loop {
            let Some(t) = reader.load(cursor)? else {
                debug!(target: "txjournal::recovery", offset = cursor, "replay stops at invalid transaction");
                break;
            };
            if t.trans_id < expected_min || t.mount_id != plan.mount_id {
                debug!(target: "txjournal::recovery", offset = cursor, trans_id = t.trans_id, "replay stops at stale transaction");
                break;
            }

            replay_one(device, &t)?;
            report.transactions_replayed += 1;
            report.blocks_replayed += u64::from(t.len());
            report.first_replayed.get_or_insert(t.trans_id);
            report.last_replayed = Some(t.trans_id);
            debug!(target: "txjournal::recovery", offset = cursor, trans_id = t.trans_id, len = t.len(), "replayed");

            last_flush = t.trans_id;
            expected_min = t.trans_id + 1;
            cursor = geometry.advance(cursor, t.len() + 2);
            if cursor == plan.offset {
                break;
            }
        }
        offset = cursor;
    }

    // Step 5: Rewrite the header for this mount
    let rewritten = JournalHeader {
        last_flush_trans_id: last_flush,
        first_unflushed_offset: offset,
        mount_id: mount_id.wrapping_add(1),
        params: JournalParams::from_config(config),
    };
    write_header(device, &geometry, &rewritten)?;

    report.last_flush_trans_id = last_flush;
    report.start_offset = offset;
    report.mount_id = rewritten.mount_id;

    info!(
        target: "txjournal::recovery",
        replayed = report.transactions_replayed,
        blocks = report.blocks_replayed,
        start_offset = offset,
        mount_id = rewritten.mount_id,
        "journal recovery complete"
    );
    Ok((rewritten, report))
}

fn replay_one(device: &dyn BlockDevice, t: &LoggedTransaction) -> Result<()> {
    for (block, copy) in t.blocks.iter().zip(&t.copies) {
        device.write_block(*block, copy)?;
    }
    device.sync()
}

pub(crate) fn write_header(device: &dyn BlockDevice, geometry: &LogGeometry, header: &JournalHeader) -> Result<()> {
    let block = header.encode(geometry.block_size)?;
    device.write_block(geometry.header_block(), &block)?;
    device.sync()
}

/// Zero the log region and write a fresh header
pub fn format_log(device: &dyn BlockDevice, config: &JournalConfig) -> Result<JournalHeader> {
    let geometry = LogGeometry::from_config(config);
    let zero = vec![0u8; config.block_size as usize];
    for offset in 0..geometry.log_blocks {
        device.write_block(geometry.log_block(offset), &zero)?;
    }

    let header = JournalHeader {
        last_flush_trans_id: 0,
        first_unflushed_offset: 0,
        mount_id: 0,
        params: JournalParams::from_config(config),
    };
    write_header(device, &geometry, &header)?;
    info!(target: "txjournal::recovery", log_start = geometry.log_start, log_blocks = geometry.log_blocks, "journal formatted");
    Ok(header)
}
