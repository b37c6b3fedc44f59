//! # txjournal
//!
//! A block-level write-ahead journal for filesystems:
//! - Batched transactions joined by many concurrent writers
//! - Strictly ordered commits in a circular on-disk log
//! - Checkpointing that writes only the newest copy of each block home
//! - Quarantine of freed blocks until their transaction is checkpointed
//! - Crash recovery with torn-transaction tolerance
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Callers (tree / inode code)                  │
//! │           begin ─ register ─ mark_freed ─ end               │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                 Transaction Accumulator                      │
//! │          (open transaction + block version index)            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ close
//!          ┌────────────▼────────────┐        ┌───────────────┐
//!          │   Journal List Table    │◀───────│ Commit Worker │
//!          │  (ring of closed txns)  │        │   (thread)    │
//!          └──────┬───────────┬──────┘        └───────────────┘
//!                 │           │
//!                 ▼           ▼
//!          ┌───────────┐ ┌─────────────┐
//!          │  Commit   │ │ Checkpoint  │
//!          │ (log I/O) │ │ (home I/O)  │
//!          └─────┬─────┘ └──────┬──────┘
//!                └──────┬───────┘
//!                       ▼
//!               ┌───────────────┐        mount: Recovery replays
//!               │ Block Device  │◀────── the log before any begin
//!               └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod device;
pub mod journal;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{JournalError, Result};
pub use config::JournalConfig;
pub use device::{BlockDevice, FileBlockDevice, MemBlockDevice};
pub use engine::JournalEngine;
pub use journal::recovery::RecoveryReport;
pub use journal::{EndFlags, JournalStats, Transaction};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of txjournal
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
