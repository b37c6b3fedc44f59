//! Tests for log replay at mount
//!
//! These tests verify:
//! - A blank or freshly formatted journal mounts without replay
//! - Committed transactions are replayed, uncommitted ones are not
//! - Replay stops at the first torn, mismatched or stale transaction
//! - Checksum and address validation reject damaged transactions
//! - Header rewrite (offset, last flush id, mount epoch)
//! - Scanning for the oldest transaction when the header is unusable

use std::sync::Arc;

use bytes::Bytes;
use txjournal::journal::format::{
    self, build_records, JournalHeader, JournalParams, LogGeometry,
};
use txjournal::journal::recovery::{self, LogReader};
use txjournal::{BlockDevice, JournalConfig, JournalEngine, JournalError, MemBlockDevice};

// =============================================================================
// Helper Functions
// =============================================================================

const BS: u32 = 512;
const LOG_START: u64 = 64;
const HOME: u64 = 400;

fn test_config() -> JournalConfig {
    JournalConfig::builder()
        .block_size(BS)
        .log_start(LOG_START)
        .log_blocks(256)
        .trans_max(32)
        .max_batch(24)
        .list_count(8)
        .cnode_count(256)
        .commit_worker(false)
        .build()
}

fn geometry() -> LogGeometry {
    LogGeometry::from_config(&test_config())
}

fn data(fill: u8) -> Bytes {
    Bytes::from(vec![fill; BS as usize])
}

fn formatted() -> MemBlockDevice {
    let dev = MemBlockDevice::new(BS, 1024);
    JournalEngine::format(&dev, &test_config()).unwrap();
    dev
}

fn write_header(dev: &MemBlockDevice, last_flush: u64, offset: u32, mount_id: u32) {
    let header = JournalHeader {
        last_flush_trans_id: last_flush,
        first_unflushed_offset: offset,
        mount_id,
        params: JournalParams::from_config(&test_config()),
    };
    dev.write_block(geometry().header_block(), &header.encode(BS).unwrap())
        .unwrap();
}

fn write_header_at(dev: &MemBlockDevice, block: u64) {
    let header = JournalHeader {
        last_flush_trans_id: 0,
        first_unflushed_offset: 0,
        mount_id: 0,
        params: JournalParams::from_config(&test_config()),
    };
    dev.write_block(block, &header.encode(BS).unwrap()).unwrap();
}

/// Lay a transaction into the log by hand; `commit` false leaves it torn
fn write_transaction(
    dev: &MemBlockDevice,
    offset: u32,
    trans_id: u64,
    mount_id: u32,
    members: &[(u64, u8)],
    commit: bool,
) {
    let g = geometry();
    let blocks: Vec<u64> = members.iter().map(|(b, _)| *b).collect();
    let copies: Vec<Bytes> = members.iter().map(|(_, fill)| data(*fill)).collect();
    let crc = format::data_crc(copies.iter().map(|c| c.as_ref()));
    let (desc, rec) = build_records(trans_id, mount_id, &blocks, crc, BS);

    dev.write_block(g.log_block(offset), &desc.encode(BS)).unwrap();
    for (i, copy) in copies.iter().enumerate() {
        dev.write_block(g.log_block(g.advance(offset, i as u32 + 1)), copy)
            .unwrap();
    }
    let commit_block = g.log_block(g.advance(offset, blocks.len() as u32 + 1));
    if commit {
        dev.write_block(commit_block, &rec.encode(BS)).unwrap();
    } else {
        dev.write_block(commit_block, &vec![0u8; BS as usize]).unwrap();
    }
}

/// `count` consecutive blocks from `first`, all filled with `fill`
fn run(first: u64, count: u64, fill: u8) -> Vec<(u64, u8)> {
    (first..first + count).map(|b| (b, fill)).collect()
}

fn read_header(dev: &MemBlockDevice) -> JournalHeader {
    LogReader::new(dev, geometry()).read_header().unwrap().unwrap()
}

// =============================================================================
// Clean Mounts
// =============================================================================

#[test]
fn test_recover_formatted_journal() {
    let dev = formatted();
    let (header, report) = recovery::recover(&dev, &test_config()).unwrap();

    assert!(report.header_valid);
    assert!(!report.scanned);
    assert_eq!(report.transactions_replayed, 0);
    assert_eq!(header.last_flush_trans_id, 0);
    assert_eq!(header.first_unflushed_offset, 0);
    assert_eq!(header.mount_id, 1);
}

#[test]
fn test_recover_blank_device_scans() {
    let dev = MemBlockDevice::new(BS, 1024);
    let (header, report) = recovery::recover(&dev, &test_config()).unwrap();

    assert!(!report.header_valid);
    assert!(report.scanned);
    assert_eq!(report.transactions_replayed, 0);
    assert_eq!(header.first_unflushed_offset, 0);

    // The rewritten header is valid from now on
    assert_eq!(read_header(&dev), header);
}

#[test]
fn test_each_mount_bumps_epoch() {
    let dev = formatted();
    for expected in 1..=3 {
        let (header, _) = recovery::recover(&dev, &test_config()).unwrap();
        assert_eq!(header.mount_id, expected);
    }
}

#[test]
fn test_geometry_mismatch_fails_mount() {
    let dev = formatted();
    let shrunk = JournalConfig {
        log_blocks: 128,
        ..test_config()
    };

    // A valid header where the shrunk layout expects one, naming the old layout
    write_header_at(&dev, LogGeometry::from_config(&shrunk).header_block());

    assert!(matches!(
        recovery::recover(&dev, &shrunk),
        Err(JournalError::Corruption(_))
    ));
}

// =============================================================================
// Replay
// =============================================================================

#[test]
fn test_replay_committed_transaction() {
    let dev = formatted();
    write_transaction(&dev, 0, 1, 0, &[(HOME, 0xA1), (HOME + 1, 0xA2)], true);

    let (header, report) = recovery::recover(&dev, &test_config()).unwrap();

    assert_eq!(report.transactions_replayed, 1);
    assert_eq!(report.blocks_replayed, 2);
    assert_eq!(report.first_replayed, Some(1));
    assert_eq!(dev.read_block(HOME).unwrap(), data(0xA1));
    assert_eq!(dev.read_block(HOME + 1).unwrap(), data(0xA2));
    assert_eq!(header.last_flush_trans_id, 1);
    assert_eq!(header.first_unflushed_offset, 4);
}

#[test]
fn test_uncommitted_transaction_not_replayed() {
    let dev = formatted();
    write_transaction(&dev, 0, 1, 0, &[(HOME, 0xA1)], false);

    let (header, report) = recovery::recover(&dev, &test_config()).unwrap();

    assert_eq!(report.transactions_replayed, 0);
    assert_eq!(dev.read_block(HOME).unwrap(), data(0));
    assert_eq!(header.first_unflushed_offset, 0);
}

#[test]
fn test_replay_stops_at_torn_transaction() {
    let dev = formatted();
    write_header(&dev, 0, 93, 0);
    write_transaction(&dev, 93, 1, 0, &run(HOME, 5, 1), true);
    write_transaction(&dev, 100, 2, 0, &run(HOME + 10, 5, 2), false);

    let (header, report) = recovery::recover(&dev, &test_config()).unwrap();

    assert_eq!(report.transactions_replayed, 1);
    assert_eq!(report.last_replayed, Some(1));
    assert_eq!(header.first_unflushed_offset, 100);
    assert_eq!(header.last_flush_trans_id, 1);
    assert_eq!(dev.read_block(HOME).unwrap(), data(1));
    assert_eq!(dev.read_block(HOME + 10).unwrap(), data(0));
}

#[test]
fn test_replay_in_id_order_until_stale() {
    let dev = formatted();
    write_transaction(&dev, 0, 1, 0, &[(HOME, 1)], true);
    write_transaction(&dev, 3, 2, 0, &[(HOME, 2)], true);
    // Leftover from an earlier lap: lower id, must stop replay
    write_transaction(&dev, 6, 1, 0, &[(HOME, 9)], true);

    let (header, report) = recovery::recover(&dev, &test_config()).unwrap();

    assert_eq!(report.transactions_replayed, 2);
    assert_eq!(dev.read_block(HOME).unwrap(), data(2));
    assert_eq!(header.first_unflushed_offset, 6);
    assert_eq!(header.last_flush_trans_id, 2);
}

#[test]
fn test_flushed_transaction_not_replayed() {
    let dev = formatted();
    write_transaction(&dev, 0, 1, 0, &[(HOME, 1)], true);
    write_header(&dev, 1, 0, 0);

    let (_, report) = recovery::recover(&dev, &test_config()).unwrap();
    assert_eq!(report.transactions_replayed, 0);
    assert_eq!(dev.read_block(HOME).unwrap(), data(0));
}

#[test]
fn test_other_mount_epoch_not_replayed() {
    let dev = formatted();
    write_transaction(&dev, 0, 1, 5, &[(HOME, 1)], true);

    let (_, report) = recovery::recover(&dev, &test_config()).unwrap();
    assert_eq!(report.transactions_replayed, 0);
}

#[test]
fn test_replay_wraps_around_log_end() {
    let dev = formatted();
    write_header(&dev, 0, 253, 0);
    write_transaction(&dev, 253, 1, 0, &[(HOME, 1), (HOME + 1, 1), (HOME + 2, 1)], true);

    let (header, report) = recovery::recover(&dev, &test_config()).unwrap();

    assert_eq!(report.transactions_replayed, 1);
    assert_eq!(dev.read_block(HOME + 2).unwrap(), data(1));
    assert_eq!(header.first_unflushed_offset, 2);
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_checksum_mismatch_rejected() {
    let dev = formatted();
    write_transaction(&dev, 0, 1, 0, &[(HOME, 1), (HOME + 1, 1)], true);
    // Damage one log copy after the commit record was written
    dev.write_block(LOG_START + 2, &data(0xEE)).unwrap();

    let (_, report) = recovery::recover(&dev, &test_config()).unwrap();
    assert_eq!(report.transactions_replayed, 0);
    assert_eq!(dev.read_block(HOME).unwrap(), data(0));
}

#[test]
fn test_member_inside_journal_rejected() {
    let dev = formatted();
    write_transaction(&dev, 0, 1, 0, &[(HOME, 1), (LOG_START + 100, 1)], true);

    let reader = LogReader::new(&dev, geometry());
    assert!(reader.load(0).unwrap().is_none());

    let (_, report) = recovery::recover(&dev, &test_config()).unwrap();
    assert_eq!(report.transactions_replayed, 0);
}

#[test]
fn test_commit_for_other_transaction_rejected() {
    let dev = formatted();
    write_transaction(&dev, 0, 1, 0, &[(HOME, 1)], true);
    // Overwrite the commit with one belonging to id 2
    let (_, other) = build_records(2, 0, &[HOME], 0, BS);
    dev.write_block(LOG_START + 2, &other.encode(BS)).unwrap();

    let reader = LogReader::new(&dev, geometry());
    assert!(reader.load(0).unwrap().is_none());
}

#[test]
fn test_large_transaction_spills_into_commit_record() {
    let dev = formatted();
    let members: Vec<(u64, u8)> = (0..70).map(|i| (HOME + i, i as u8)).collect();
    write_transaction(&dev, 0, 1, 0, &members, true);

    let reader = LogReader::new(&dev, geometry());
    let t = reader.load(0).unwrap().unwrap();
    assert_eq!(t.len(), 70);

    recovery::recover(&dev, &test_config()).unwrap();
    assert_eq!(dev.read_block(HOME + 69).unwrap(), data(69));
}

// =============================================================================
// Scanning Without A Header
// =============================================================================

#[test]
fn test_scan_finds_oldest_of_newest_mount() {
    let dev = formatted();
    write_transaction(&dev, 0, 7, 3, &[(HOME, 7)], true);
    write_transaction(&dev, 3, 8, 3, &[(HOME, 8)], true);
    write_transaction(&dev, 6, 2, 1, &[(HOME, 2)], true);
    // Destroy the header
    dev.write_block(geometry().header_block(), &vec![0u8; BS as usize])
        .unwrap();

    let reader = LogReader::new(&dev, geometry());
    assert_eq!(reader.scan().unwrap().len(), 3);

    let (header, report) = recovery::recover(&dev, &test_config()).unwrap();
    assert!(report.scanned);
    assert_eq!(report.first_replayed, Some(7));
    assert_eq!(report.last_replayed, Some(8));
    assert_eq!(dev.read_block(HOME).unwrap(), data(8));
    assert_eq!(header.last_flush_trans_id, 8);
    assert_eq!(header.mount_id, 4);
}

// =============================================================================
// Mount Through The Engine
// =============================================================================

#[test]
fn test_engine_continues_after_replayed_ids() {
    let dev = Arc::new(formatted());
    write_transaction(&dev, 0, 1, 0, &[(HOME, 1)], true);
    write_transaction(&dev, 3, 2, 0, &[(HOME + 1, 2)], true);

    let engine = JournalEngine::open(dev.clone(), test_config()).unwrap();
    assert_eq!(engine.recovery_report().transactions_replayed, 2);
    assert_eq!(engine.current_trans_id(), 3);
    assert_eq!(engine.last_flush_trans_id(), 2);

    let th = engine.begin(1).unwrap();
    assert_eq!(th.trans_id(), 3);
    th.end(txjournal::EndFlags::NONE).unwrap();
}
