//! Tests for the file-backed block device
//!
//! These tests verify:
//! - Create, write, sync and reopen of an image file
//! - Images that are not a whole number of blocks are refused
//! - Bounds checks match the in-memory device

use tempfile::TempDir;
use txjournal::{BlockDevice, FileBlockDevice, JournalError};

// =============================================================================
// Helper Functions
// =============================================================================

fn block(fill: u8) -> Vec<u8> {
    vec![fill; 512]
}

// =============================================================================
// FileBlockDevice
// =============================================================================

#[test]
fn test_file_device_create_and_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("disk.img");

    {
        let dev = FileBlockDevice::create(&path, 512, 32).unwrap();
        assert_eq!(dev.block_count(), 32);
        dev.write_block(31, &block(0x5A)).unwrap();
        dev.sync().unwrap();
    }

    let dev = FileBlockDevice::open(&path, 512).unwrap();
    assert_eq!(dev.block_count(), 32);
    assert_eq!(dev.path(), path.as_path());
    assert_eq!(dev.read_block(31).unwrap().as_ref(), block(0x5A).as_slice());
    assert_eq!(dev.read_block(0).unwrap().as_ref(), block(0).as_slice());
}

#[test]
fn test_file_device_rejects_unaligned_image() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("odd.img");
    std::fs::write(&path, vec![0u8; 1000]).unwrap();

    assert!(matches!(
        FileBlockDevice::open(&path, 512),
        Err(JournalError::Config(_))
    ));
}

#[test]
fn test_file_device_rejects_out_of_range_block() {
    let temp = TempDir::new().unwrap();
    let dev = FileBlockDevice::create(&temp.path().join("small.img"), 512, 4).unwrap();

    assert!(matches!(dev.read_block(4), Err(JournalError::Io(_))));
    assert!(matches!(dev.write_block(4, &block(1)), Err(JournalError::Io(_))));
    assert!(dev.write_block(0, &[0u8; 100]).is_err());
}
