//! Tests for the transaction accumulator
//!
//! These tests verify:
//! - Handles join the same open transaction and batch across ends
//! - Registering a block twice keeps one record with the newest copy
//! - Flags and limits (batch window, trans_max, age) decide when to close
//! - Caller errors are rejected without closing anything
//! - Writer gating with block_writes / allow_writes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use txjournal::{BlockDevice, EndFlags, JournalConfig, JournalEngine, JournalError, MemBlockDevice};

// =============================================================================
// Helper Functions
// =============================================================================

const BS: u32 = 512;
const HOME: u64 = 400;

fn test_config() -> JournalConfig {
    JournalConfig::builder()
        .block_size(BS)
        .log_start(64)
        .log_blocks(256)
        .trans_max(32)
        .max_batch(24)
        .list_count(8)
        .cnode_count(256)
        .commit_worker(false)
        .build()
}

fn mount_with(config: JournalConfig) -> (Arc<MemBlockDevice>, JournalEngine) {
    let dev = Arc::new(MemBlockDevice::new(BS, 1024));
    JournalEngine::format(dev.as_ref(), &config).unwrap();
    let engine = JournalEngine::open(dev.clone(), config).unwrap();
    (dev, engine)
}

fn mount() -> (Arc<MemBlockDevice>, JournalEngine) {
    mount_with(test_config())
}

fn data(fill: u8) -> Bytes {
    Bytes::from(vec![fill; BS as usize])
}

// =============================================================================
// Joining & Batching
// =============================================================================

#[test]
fn test_first_transaction_id_is_one() {
    let (_dev, engine) = mount();
    assert_eq!(engine.current_trans_id(), 1);

    let th = engine.begin(1).unwrap();
    assert_eq!(th.trans_id(), 1);
    th.end(EndFlags::NONE).unwrap();
}

#[test]
fn test_handles_share_open_transaction() {
    let (_dev, engine) = mount();

    let mut a = engine.begin(2).unwrap();
    let mut b = engine.begin(2).unwrap();
    assert_eq!(a.trans_id(), b.trans_id());

    a.register(HOME, data(1)).unwrap();
    b.register(HOME + 1, data(2)).unwrap();
    assert_eq!(a.blocks_logged(), 1);

    a.end(EndFlags::NONE).unwrap();
    b.end(EndFlags::NONE).unwrap();

    assert_eq!(engine.current_trans_id(), 1);
    assert_eq!(engine.pending_lists(), 0);
    assert_eq!(engine.cnodes_in_use(), 2);
}

#[test]
fn test_small_ends_batch_into_one_transaction() {
    let (_dev, engine) = mount();

    for i in 0..3 {
        let mut th = engine.begin(2).unwrap();
        assert_eq!(th.trans_id(), 1);
        th.register(HOME + i, data(i as u8)).unwrap();
        th.end(EndFlags::NONE).unwrap();
    }

    let stats = engine.stats();
    assert_eq!(stats.begins, 3);
    assert_eq!(stats.batched_ends, 3);
    assert_eq!(stats.transactions_closed, 0);
}

#[test]
fn test_register_twice_keeps_one_record() {
    let (dev, engine) = mount();

    let mut th = engine.begin(2).unwrap();
    th.register(HOME, data(1)).unwrap();
    th.register(HOME, data(2)).unwrap();
    assert_eq!(engine.cnodes_in_use(), 1);
    th.end(EndFlags::FLUSH_ALL).unwrap();

    assert_eq!(dev.write_history(HOME), vec![data(2)]);
}

#[test]
fn test_dropped_handle_ends_implicitly() {
    let (_dev, engine) = mount();

    {
        let mut th = engine.begin(1).unwrap();
        th.register(HOME, data(1)).unwrap();
    }

    let th = engine.begin(1).unwrap();
    assert_eq!(th.trans_id(), 1);
    th.end(EndFlags::NONE).unwrap();
    assert_eq!(engine.stats().batched_ends, 2);
}

// =============================================================================
// Closing
// =============================================================================

#[test]
fn test_commit_now_wait_closes_and_commits() {
    let (_dev, engine) = mount();

    let mut th = engine.begin(2).unwrap();
    th.register(HOME, data(1)).unwrap();
    th.register(HOME + 1, data(1)).unwrap();
    th.end(EndFlags::COMMIT_NOW | EndFlags::WAIT).unwrap();

    assert_eq!(engine.current_trans_id(), 2);
    assert_eq!(engine.pending_lists(), 1);

    let stats = engine.stats();
    assert_eq!(stats.transactions_closed, 1);
    assert_eq!(stats.commits_flushed, 1);
    assert_eq!(stats.blocks_logged, 2);
}

#[test]
fn test_commit_now_without_worker_commits_inline() {
    let (_dev, engine) = mount();

    let mut th = engine.begin(1).unwrap();
    th.register(HOME, data(1)).unwrap();
    th.end(EndFlags::COMMIT_NOW).unwrap();

    assert_eq!(engine.stats().commits_flushed, 1);
}

#[test]
fn test_full_batch_window_closes_without_commit() {
    let (_dev, engine) = mount();

    let mut th = engine.begin(1).unwrap();
    for i in 0..24 {
        th.register(HOME + i, data(3)).unwrap();
    }
    th.end(EndFlags::NONE).unwrap();

    assert_eq!(engine.current_trans_id(), 2);
    assert_eq!(engine.pending_lists(), 1);
    assert_eq!(engine.stats().commits_flushed, 0);
}

#[test]
fn test_begin_closes_spent_window_for_lone_caller() {
    let (_dev, engine) = mount();

    let mut th = engine.begin(1).unwrap();
    for i in 0..20 {
        th.register(HOME + i, data(4)).unwrap();
    }
    th.end(EndFlags::NONE).unwrap();
    assert_eq!(engine.current_trans_id(), 1);

    // 20 logged + 4 requested + 2 reaches the window
    let th = engine.begin(4).unwrap();
    assert_eq!(th.trans_id(), 2);
    th.end(EndFlags::NONE).unwrap();
    assert_eq!(engine.stats().relocks, 1);
}

#[test]
fn test_join_ignores_batch_window() {
    let (_dev, engine) = mount();

    let mut th = engine.begin(1).unwrap();
    for i in 0..20 {
        th.register(HOME + i, data(4)).unwrap();
    }
    th.end(EndFlags::NONE).unwrap();

    let th = engine.join(4).unwrap();
    assert_eq!(th.trans_id(), 1);
    th.end(EndFlags::NONE).unwrap();
}

#[test]
fn test_old_transaction_closes_at_end() {
    let config = JournalConfig {
        max_trans_age: Duration::from_millis(30),
        ..test_config()
    };
    let (_dev, engine) = mount_with(config);

    let mut th = engine.begin(1).unwrap();
    th.register(HOME, data(1)).unwrap();
    th.end(EndFlags::NONE).unwrap();
    assert_eq!(engine.current_trans_id(), 1);

    thread::sleep(Duration::from_millis(60));

    let mut th = engine.begin(1).unwrap();
    th.register(HOME + 1, data(1)).unwrap();
    th.end(EndFlags::NONE).unwrap();

    assert_eq!(engine.current_trans_id(), 2);
    assert_eq!(engine.stats().commits_flushed, 1);
}

#[test]
fn test_empty_transaction_never_closes() {
    let (_dev, engine) = mount();

    let th = engine.begin(1).unwrap();
    th.end(EndFlags::COMMIT_NOW | EndFlags::WAIT).unwrap();

    assert_eq!(engine.current_trans_id(), 1);
    assert_eq!(engine.stats().transactions_closed, 0);
}

#[test]
fn test_should_end_tracks_batch_window() {
    let (_dev, engine) = mount();

    let mut th = engine.begin(1).unwrap();
    assert!(!th.should_end(1));

    for i in 0..20 {
        th.register(HOME + i, data(5)).unwrap();
    }
    assert!(th.should_end(1));
    th.end(EndFlags::NONE).unwrap();
}

// =============================================================================
// Caller Errors
// =============================================================================

#[test]
fn test_begin_larger_than_trans_max_rejected() {
    let (_dev, engine) = mount();

    assert!(matches!(engine.begin(33), Err(JournalError::InvalidArgument(_))));
    assert!(!engine.is_halted());
}

#[test]
fn test_register_rejects_journal_and_out_of_range_blocks() {
    let (_dev, engine) = mount();
    let mut th = engine.begin(1).unwrap();

    assert!(matches!(
        th.register(64, data(1)),
        Err(JournalError::InvalidBlock { block: 64, .. })
    ));
    assert!(matches!(
        th.register(320, data(1)),
        Err(JournalError::InvalidBlock { block: 320, .. })
    ));
    assert!(matches!(
        th.register(1024, data(1)),
        Err(JournalError::InvalidBlock { .. })
    ));
    assert!(matches!(
        th.register(HOME, Bytes::from_static(b"short")),
        Err(JournalError::InvalidBlock { .. })
    ));
    assert!(matches!(
        th.mark_freed(100),
        Err(JournalError::InvalidBlock { .. })
    ));

    th.end(EndFlags::NONE).unwrap();
    assert!(!engine.is_halted());
    assert_eq!(engine.cnodes_in_use(), 0);
}

#[test]
fn test_exceeding_trans_max_halts() {
    let (_dev, engine) = mount();

    let mut th = engine.join(1).unwrap();
    for i in 0..32 {
        th.register(HOME + i, data(6)).unwrap();
    }
    let err = th.register(HOME + 32, data(6)).unwrap_err();
    assert!(matches!(err, JournalError::Halted(_)));
    assert!(engine.is_halted());
    assert!(engine.halt_reason().unwrap().contains("exceeds"));

    drop(th);
    assert!(matches!(engine.begin(1), Err(JournalError::Halted(_))));
}

// =============================================================================
// Writer Gating
// =============================================================================

#[test]
fn test_block_writes_holds_new_writers() {
    let (_dev, engine) = mount();
    engine.block_writes();

    let joined = AtomicBool::new(false);
    thread::scope(|s| {
        let handle = s.spawn(|| {
            let th = engine.begin(1).unwrap();
            joined.store(true, Ordering::SeqCst);
            th.end(EndFlags::NONE).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!joined.load(Ordering::SeqCst));

        // join still gets in while writers are blocked
        let th = engine.join(1).unwrap();
        th.end(EndFlags::NONE).unwrap();

        engine.allow_writes();
        handle.join().unwrap();
    });

    assert!(joined.load(Ordering::SeqCst));
}

#[test]
fn test_concurrent_writers_all_land() {
    let (dev, engine) = mount();

    thread::scope(|s| {
        for t in 0..4u64 {
            let engine = &engine;
            s.spawn(move || {
                for round in 0..25u64 {
                    let mut th = engine.begin(2).unwrap();
                    let base = HOME + t * 100 + (round % 10) * 2;
                    th.register(base, data(t as u8 + 1)).unwrap();
                    th.register(base + 1, data(t as u8 + 1)).unwrap();
                    let flags = if round % 7 == 0 {
                        EndFlags::COMMIT_NOW | EndFlags::WAIT
                    } else {
                        EndFlags::NONE
                    };
                    th.end(flags).unwrap();
                }
            });
        }
    });

    engine.close().unwrap();
    for t in 0..4u64 {
        for i in 0..20 {
            let got = dev.read_block(HOME + t * 100 + i).unwrap();
            assert_eq!(got, data(t as u8 + 1), "thread {t} block {i}");
        }
    }
}
