//! Tests for the on-disk journal format
//!
//! These tests verify:
//! - Log geometry arithmetic (wrapping, windows, journal block checks)
//! - Descriptor / commit record encoding and validation
//! - Splitting member addresses across descriptor and commit
//! - Header encoding, checksum and parameter block

use txjournal::journal::format::{
    self, build_records, member_blocks, CommitRecord, Descriptor, JournalHeader, JournalParams,
    LogGeometry, RECORD_HEADER_LEN,
};
use txjournal::JournalConfig;

// =============================================================================
// Helper Functions
// =============================================================================

fn geometry() -> LogGeometry {
    LogGeometry {
        log_start: 64,
        log_blocks: 256,
        block_size: 512,
    }
}

fn params() -> JournalParams {
    let config = JournalConfig::builder()
        .block_size(512)
        .log_start(64)
        .log_blocks(256)
        .trans_max(32)
        .max_batch(24)
        .build();
    JournalParams::from_config(&config)
}

// =============================================================================
// Geometry Tests
// =============================================================================

#[test]
fn test_inline_capacity() {
    assert_eq!(format::inline_capacity(512), (512 - RECORD_HEADER_LEN) / 8);
    assert_eq!(format::inline_capacity(4096), 508);
}

#[test]
fn test_log_block_and_advance_wrap() {
    let g = geometry();

    assert_eq!(g.log_block(0), 64);
    assert_eq!(g.log_block(255), 319);
    assert_eq!(g.advance(250, 10), 4);
    assert_eq!(g.advance(0, 256), 0);
    assert_eq!(g.header_block(), 320);
}

#[test]
fn test_is_journal_block() {
    let g = geometry();

    assert!(!g.is_journal_block(63));
    assert!(g.is_journal_block(64));
    assert!(g.is_journal_block(319));
    assert!(g.is_journal_block(320));
    assert!(!g.is_journal_block(321));
}

#[test]
fn test_in_window_wraps() {
    let g = geometry();

    assert!(g.in_window(250, 10, 250));
    assert!(g.in_window(250, 10, 255));
    assert!(g.in_window(250, 10, 3));
    assert!(!g.in_window(250, 10, 4));
    assert!(!g.in_window(250, 10, 249));
}

#[test]
fn test_max_trans_len_bounded_by_log() {
    let small = LogGeometry {
        log_start: 1,
        log_blocks: 20,
        block_size: 512,
    };
    assert_eq!(small.max_trans_len(), 18);
    assert_eq!(geometry().max_trans_len(), 2 * 60);
}

// =============================================================================
// Descriptor & Commit Tests
// =============================================================================

#[test]
fn test_descriptor_encode_decode() {
    let desc = Descriptor {
        trans_id: 42,
        len: 3,
        mount_id: 7,
        blocks: vec![10, 11, 12],
    };
    let raw = desc.encode(512);

    assert_eq!(raw.len(), 512);
    assert_eq!(&raw[0..8], format::DESC_MAGIC);
    assert_eq!(Descriptor::decode(&raw), Some(desc));
}

#[test]
fn test_descriptor_rejects_zero_and_oversized_len() {
    let mut desc = Descriptor {
        trans_id: 1,
        len: 0,
        mount_id: 0,
        blocks: vec![],
    };
    assert!(Descriptor::decode(&desc.encode(512)).is_none());

    desc.len = 121;
    assert!(Descriptor::decode(&desc.encode(512)).is_none());
}

#[test]
fn test_decode_rejects_wrong_magic() {
    let commit = CommitRecord {
        trans_id: 1,
        len: 1,
        data_crc: 0,
        blocks: vec![],
    };
    let raw = commit.encode(512);

    assert!(Descriptor::decode(&raw).is_none());
    assert!(Descriptor::decode(&[0u8; 512]).is_none());
    assert!(CommitRecord::decode(&raw).is_some());
}

#[test]
fn test_build_records_splits_addresses() {
    let blocks: Vec<u64> = (1000..1070).collect();
    let (desc, commit) = build_records(9, 2, &blocks, 0xDEAD_BEEF, 512);

    assert_eq!(desc.len, 70);
    assert_eq!(desc.blocks.len(), 60);
    assert_eq!(commit.blocks.len(), 10);
    assert!(commit.matches(&desc));

    let desc = Descriptor::decode(&desc.encode(512)).unwrap();
    let commit = CommitRecord::decode(&commit.encode(512)).unwrap();
    assert_eq!(commit.data_crc, 0xDEAD_BEEF);
    assert_eq!(member_blocks(&desc, &commit), blocks);
}

#[test]
fn test_commit_mismatch_detected() {
    let (desc, mut commit) = build_records(5, 1, &[400, 401], 0, 512);
    commit.trans_id = 6;
    assert!(!commit.matches(&desc));
}

#[test]
fn test_data_crc_depends_on_order() {
    let a = vec![1u8; 512];
    let b = vec![2u8; 512];

    let ab = format::data_crc([a.as_slice(), b.as_slice()]);
    let ba = format::data_crc([b.as_slice(), a.as_slice()]);
    assert_ne!(ab, ba);
}

// =============================================================================
// Header Tests
// =============================================================================

#[test]
fn test_header_encode_decode() {
    let header = JournalHeader {
        last_flush_trans_id: 77,
        first_unflushed_offset: 93,
        mount_id: 4,
        params: params(),
    };
    let raw = header.encode(512).unwrap();

    assert_eq!(raw.len(), 512);
    assert_eq!(JournalHeader::decode(&raw), Some(header));
}

#[test]
fn test_header_checksum_catches_torn_write() {
    let header = JournalHeader {
        last_flush_trans_id: 77,
        first_unflushed_offset: 93,
        mount_id: 4,
        params: params(),
    };
    let mut raw = header.encode(512).unwrap().to_vec();
    raw[10] ^= 0xFF;

    assert!(JournalHeader::decode(&raw).is_none());
    assert!(JournalHeader::decode(&[0u8; 512]).is_none());
}

#[test]
fn test_params_geometry_check() {
    let p = params();
    assert!(p.same_geometry(&geometry()));

    let moved = LogGeometry {
        log_start: 65,
        ..geometry()
    };
    assert!(!p.same_geometry(&moved));
}
