//! On-disk records
//!
//! ## Transaction Layout (offsets are relative to the log region, mod size)
//! ```text
//!   O            O+1 .. O+L          O+L+1
//! ┌────────────┬──────────────────┬────────────┐
//! │ Descriptor │ L block copies   │   Commit   │
//! └────────────┴──────────────────┴────────────┘
//! ```
//!
//! ## Descriptor / Commit Block
//! ```text
//! ┌───────────┬───────────────┬─────────┬──────────────────┬──────────┬──────────────────┐
//! │ Magic (8) │ TransId (8)   │ Len (4) │ MountId/CRC (4)  │ Rsvd (8) │ Addresses (8 ea) │
//! └───────────┴───────────────┴─────────┴──────────────────┴──────────┴──────────────────┘
//! ```
//! The descriptor holds the first `inline_capacity` member addresses and
//! the mount id. The commit record holds the rest plus a CRC32 over the
//! block copies in registration order.
//!
//! ## Header Block (one block past the log region)
//! ```text
//! ┌───────────┬──────────────────┬──────────────┬─────────────┬─────────────┬─────────┐
//! │ Magic (8) │ LastFlushId (8)  │ Offset (4)   │ MountId (4) │ Params (32) │ CRC (4) │
//! └───────────┴──────────────────┴──────────────┴─────────────┴─────────────┴─────────┘
//! ```
//! All integers are little-endian.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::JournalConfig;
use crate::error::Result;

pub const DESC_MAGIC: &[u8; 8] = b"TxJnDesc";
pub const COMMIT_MAGIC: &[u8; 8] = b"TxJnCmit";
pub const HEADER_MAGIC: &[u8; 8] = b"TxJnHead";

/// Fixed prefix of descriptor and commit blocks
pub const RECORD_HEADER_LEN: usize = 32;

const PARAMS_OFFSET: usize = 24;
const PARAMS_LEN: usize = 32;
const HEADER_CRC_OFFSET: usize = PARAMS_OFFSET + PARAMS_LEN;

/// Member addresses that fit in one descriptor (or one commit) block
pub fn inline_capacity(block_size: u32) -> usize {
    (block_size as usize).saturating_sub(RECORD_HEADER_LEN) / 8
}

/// CRC32 over block copies in registration order
pub fn data_crc<'a>(blocks: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for block in blocks {
        hasher.update(block);
    }
    hasher.finalize()
}

// =============================================================================
// Log Geometry
// =============================================================================

/// Position of the log region and header on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogGeometry {
    pub log_start: u64,
    pub log_blocks: u32,
    pub block_size: u32,
}

impl LogGeometry {
    pub fn from_config(config: &JournalConfig) -> Self {
        Self {
            log_start: config.log_start,
            log_blocks: config.log_blocks,
            block_size: config.block_size,
        }
    }

    /// Device block holding log offset `offset`
    pub fn log_block(&self, offset: u32) -> u64 {
        self.log_start + u64::from(offset % self.log_blocks)
    }

    /// Offset `by` blocks after `offset`, wrapping
    pub fn advance(&self, offset: u32, by: u32) -> u32 {
        ((u64::from(offset) + u64::from(by)) % u64::from(self.log_blocks)) as u32
    }

    pub fn header_block(&self) -> u64 {
        self.log_start + u64::from(self.log_blocks)
    }

    /// True for log region and header blocks, which may never be logged
    pub fn is_journal_block(&self, block: u64) -> bool {
        block >= self.log_start && block <= self.header_block()
    }

    pub fn inline_capacity(&self) -> usize {
        inline_capacity(self.block_size)
    }

    /// Largest length a well-formed transaction can claim
    pub fn max_trans_len(&self) -> u32 {
        let by_records = 2 * self.inline_capacity() as u32;
        by_records.min(self.log_blocks.saturating_sub(2))
    }

    /// True when `offset` lies in the `len` blocks starting at `from`, wrapping
    pub fn in_window(&self, from: u32, len: u32, offset: u32) -> bool {
        let distance = (u64::from(offset) + u64::from(self.log_blocks) - u64::from(from))
            % u64::from(self.log_blocks);
        distance < u64::from(len)
    }
}

// =============================================================================
// Descriptor & Commit Records
// =============================================================================

/// Block 0 of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub trans_id: u64,
    pub len: u32,
    pub mount_id: u32,
    /// Inline member addresses (at most `inline_capacity`)
    pub blocks: Vec<u64>,
}

/// Block L+1 of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub trans_id: u64,
    pub len: u32,
    pub data_crc: u32,
    /// Member addresses past the descriptor's inline capacity
    pub blocks: Vec<u64>,
}

fn encode_record(
    magic: &[u8; 8],
    trans_id: u64,
    len: u32,
    word: u32,
    blocks: &[u64],
    block_size: u32,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(block_size as usize);
    buf.put_slice(magic);
    buf.put_u64_le(trans_id);
    buf.put_u32_le(len);
    buf.put_u32_le(word);
    buf.put_bytes(0, 8);
    for block in blocks {
        buf.put_u64_le(*block);
    }
    buf.resize(block_size as usize, 0);
    buf.freeze()
}

/// Returns (trans_id, len, word) when the magic matches
fn decode_prefix(magic: &[u8; 8], buf: &[u8]) -> Option<(u64, u32, u32)> {
    if buf.len() < RECORD_HEADER_LEN || &buf[0..8] != magic {
        return None;
    }
    let trans_id = u64::from_le_bytes(buf[8..16].try_into().ok()?);
    let len = u32::from_le_bytes(buf[16..20].try_into().ok()?);
    let word = u32::from_le_bytes(buf[20..24].try_into().ok()?);
    Some((trans_id, len, word))
}

fn decode_addresses(buf: &[u8], count: usize) -> Option<Vec<u64>> {
    let end = RECORD_HEADER_LEN + count * 8;
    if end > buf.len() {
        return None;
    }
    Some(
        buf[RECORD_HEADER_LEN..end]
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                u64::from_le_bytes(raw)
            })
            .collect(),
    )
}

impl Descriptor {
    pub fn encode(&self, block_size: u32) -> Bytes {
        encode_record(
            DESC_MAGIC,
            self.trans_id,
            self.len,
            self.mount_id,
            &self.blocks,
            block_size,
        )
    }

    /// `None` unless the magic matches and the length fits the two records
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (trans_id, len, mount_id) = decode_prefix(DESC_MAGIC, buf)?;
        let half = inline_capacity(buf.len() as u32);
        if len == 0 || len as usize > 2 * half {
            return None;
        }
        let blocks = decode_addresses(buf, (len as usize).min(half))?;
        Some(Self {
            trans_id,
            len,
            mount_id,
            blocks,
        })
    }
}

impl CommitRecord {
    pub fn encode(&self, block_size: u32) -> Bytes {
        encode_record(
            COMMIT_MAGIC,
            self.trans_id,
            self.len,
            self.data_crc,
            &self.blocks,
            block_size,
        )
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (trans_id, len, data_crc) = decode_prefix(COMMIT_MAGIC, buf)?;
        let half = inline_capacity(buf.len() as u32);
        if len as usize > 2 * half {
            return None;
        }
        let blocks = decode_addresses(buf, (len as usize).saturating_sub(half))?;
        Some(Self {
            trans_id,
            len,
            data_crc,
            blocks,
        })
    }

    /// Same transaction as `desc`
    pub fn matches(&self, desc: &Descriptor) -> bool {
        self.trans_id == desc.trans_id && self.len == desc.len
    }
}

/// Split member addresses across a descriptor/commit pair
pub fn build_records(
    trans_id: u64,
    mount_id: u32,
    blocks: &[u64],
    data_crc: u32,
    block_size: u32,
) -> (Descriptor, CommitRecord) {
    let half = inline_capacity(block_size).min(blocks.len());
    let len = blocks.len() as u32;
    (
        Descriptor {
            trans_id,
            len,
            mount_id,
            blocks: blocks[..half].to_vec(),
        },
        CommitRecord {
            trans_id,
            len,
            data_crc,
            blocks: blocks[half..].to_vec(),
        },
    )
}

/// All member addresses of a validated pair, in log order
pub fn member_blocks(desc: &Descriptor, commit: &CommitRecord) -> Vec<u64> {
    desc.blocks
        .iter()
        .chain(commit.blocks.iter())
        .copied()
        .collect()
}

// =============================================================================
// Journal Header
// =============================================================================

/// Journal parameters recorded in the header at format time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalParams {
    pub block_size: u32,
    pub log_start: u64,
    pub log_blocks: u32,
    pub trans_max: u32,
    pub max_batch: u32,
    pub max_commit_age_secs: u32,
    pub max_trans_age_secs: u32,
}

impl JournalParams {
    pub fn from_config(config: &JournalConfig) -> Self {
        Self {
            block_size: config.block_size,
            log_start: config.log_start,
            log_blocks: config.log_blocks,
            trans_max: config.trans_max,
            max_batch: config.max_batch,
            max_commit_age_secs: config.max_commit_age.as_secs() as u32,
            max_trans_age_secs: config.max_trans_age.as_secs() as u32,
        }
    }

    /// Block size and log placement agree
    pub fn same_geometry(&self, geometry: &LogGeometry) -> bool {
        self.block_size == geometry.block_size
            && self.log_start == geometry.log_start
            && self.log_blocks == geometry.log_blocks
    }
}

/// Contents of the header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalHeader {
    /// Newest transaction whose blocks are all home
    pub last_flush_trans_id: u64,
    /// Log offset where replay starts
    pub first_unflushed_offset: u32,
    pub mount_id: u32,
    pub params: JournalParams,
}

impl JournalHeader {
    pub fn encode(&self, block_size: u32) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(block_size as usize);
        buf.put_slice(HEADER_MAGIC);
        buf.put_u64_le(self.last_flush_trans_id);
        buf.put_u32_le(self.first_unflushed_offset);
        buf.put_u32_le(self.mount_id);

        let params = bincode::serialize(&self.params)?;
        debug_assert_eq!(params.len(), PARAMS_LEN);
        buf.put_slice(&params);

        let crc = crc32fast::hash(&buf[..HEADER_CRC_OFFSET]);
        buf.put_u32_le(crc);
        buf.resize(block_size as usize, 0);
        Ok(buf.freeze())
    }

    /// `None` for a blank, foreign or torn header
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_CRC_OFFSET + 4 || &buf[0..8] != HEADER_MAGIC {
            return None;
        }
        let stored = u32::from_le_bytes(buf[HEADER_CRC_OFFSET..HEADER_CRC_OFFSET + 4].try_into().ok()?);
        if crc32fast::hash(&buf[..HEADER_CRC_OFFSET]) != stored {
            return None;
        }

        let params: JournalParams =
            bincode::deserialize(&buf[PARAMS_OFFSET..HEADER_CRC_OFFSET]).ok()?;
        Some(Self {
            last_flush_trans_id: u64::from_le_bytes(buf[8..16].try_into().ok()?),
            first_unflushed_offset: u32::from_le_bytes(buf[16..20].try_into().ok()?),
            mount_id: u32::from_le_bytes(buf[20..24].try_into().ok()?),
            params,
        })
    }
}
