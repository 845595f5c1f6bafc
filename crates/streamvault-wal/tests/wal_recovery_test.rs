//! Block WAL Integration Tests
//!
//! End-to-end lifecycle, crash-recovery and capacity scenarios against a
//! preallocated temp file standing in for the block device.

use bytes::Bytes;
use std::io::Read;
use streamvault_wal::record::RECORD_MAGIC;
use streamvault_wal::{BlockWal, WalConfig, WalError};
use tempfile::NamedTempFile;

const BLOCK: u64 = 4096;
const HEADER_RESERVE: u64 = 2 * BLOCK;

fn config(path: &std::path::Path, capacity: u64) -> WalConfig {
    WalConfig::new(path, capacity)
}

async fn open_started(config: WalConfig) -> BlockWal {
    let wal = BlockWal::open(config).unwrap();
    wal.start().await.unwrap();
    wal
}

fn read_device(file: &NamedTempFile, position: u64, len: usize) -> Vec<u8> {
    use std::io::Seek;
    let mut f = file.reopen().unwrap();
    f.seek(std::io::SeekFrom::Start(position)).unwrap();
    let mut buf = vec![0u8; len];
    f.read_exact(&mut buf).unwrap();
    buf
}

#[tokio::test]
async fn test_empty_device_recovers_nothing_then_append_is_durable() {
    let device = NamedTempFile::new().unwrap();
    let capacity = 16 << 20;

    let wal = open_started(config(device.path(), capacity)).await;
    assert_eq!(wal.recover().unwrap().count(), 0);
    wal.reset().await.unwrap();

    let body = Bytes::from(vec![0u8; 1024]);
    let append = wal.append(body.clone(), 0).unwrap();
    // The first record lands one block in: reset left a deliberate gap.
    assert_eq!(append.record_offset, BLOCK);
    let confirm = append.wait().await.unwrap();
    assert!(confirm >= BLOCK + 24 + 1024);

    // The frame sits at header_reserve + offset on the device.
    let raw = read_device(&device, HEADER_RESERVE + BLOCK, 4);
    assert_eq!(raw, RECORD_MAGIC.to_be_bytes());

    // A new process sees the identical bytes.
    drop(wal);
    let wal = open_started(config(device.path(), capacity)).await;
    let recovered: Vec<_> = wal.recover().unwrap().collect();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].record_offset, BLOCK);
    assert_eq!(recovered[0].record, body);
}

#[tokio::test]
async fn test_round_trip_many_records() {
    let device = NamedTempFile::new().unwrap();
    let capacity = 16 << 20;

    let wal = open_started(config(device.path(), capacity)).await;
    wal.reset().await.unwrap();

    let mut offsets = Vec::new();
    let mut pending = Vec::new();
    for i in 0..200u32 {
        let body = Bytes::from(vec![(i % 251) as u8; 1024]);
        let append = wal.append(body, 0).unwrap();
        offsets.push(append.record_offset);
        pending.push(append);
    }
    let mut last_end = 0;
    for append in pending {
        let offset = append.record_offset;
        append.wait().await.unwrap();
        last_end = last_end.max(offset + 24 + 1024);
    }
    // Offsets are strictly increasing and the confirmed prefix covers them.
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    assert!(wal.start_offset() >= last_end);

    drop(wal);
    let wal = open_started(config(device.path(), capacity)).await;
    let recovered: Vec<_> = wal.recover().unwrap().collect();
    assert_eq!(recovered.len(), 200);
    for (i, result) in recovered.iter().enumerate() {
        assert_eq!(result.record_offset, offsets[i]);
        assert_eq!(result.record[0], (i % 251) as u8);
        assert_eq!(result.record.len(), 1024);
    }
}

#[tokio::test]
async fn test_crash_recovery_yields_acknowledged_records() {
    let device = NamedTempFile::new().unwrap();
    let capacity = 16 << 20;

    let wal = open_started(config(device.path(), capacity)).await;
    wal.reset().await.unwrap();
    let mut bodies = Vec::new();
    for i in 0..50u32 {
        let body = Bytes::from(format!("record-{i:04}"));
        wal.append(body.clone(), 0).unwrap().wait().await.unwrap();
        bodies.push(body);
    }
    // Crash: no graceful shutdown, the header still points at a stale window.
    drop(wal);

    let wal = open_started(config(device.path(), capacity)).await;
    let recovered: Vec<_> = wal.recover().unwrap().collect();
    assert_eq!(recovered.len(), 50);
    for (result, body) in recovered.iter().zip(&bodies) {
        assert_eq!(&result.record, body);
    }

    // Crash idempotence: recovering again surfaces the same records once.
    drop(wal);
    let wal = open_started(config(device.path(), capacity)).await;
    assert_eq!(wal.recover().unwrap().count(), 50);
}

#[tokio::test]
async fn test_graceful_shutdown_then_recovery() {
    let device = NamedTempFile::new().unwrap();
    let capacity = 16 << 20;

    let wal = open_started(config(device.path(), capacity)).await;
    wal.reset().await.unwrap();
    wal.append(Bytes::from_static(b"clean"), 0)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(wal.shutdown_gracefully().await);

    // After shutdown the facade rejects traffic.
    assert!(matches!(
        wal.append(Bytes::from_static(b"late"), 0),
        Err(WalError::NotReady)
    ));

    drop(wal);
    let wal = open_started(config(device.path(), capacity)).await;
    let recovered: Vec<_> = wal.recover().unwrap().collect();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].record, Bytes::from_static(b"clean"));
}

#[tokio::test]
async fn test_zeroed_header_slot_zero_recovers_from_slot_one() {
    let device = NamedTempFile::new().unwrap();
    let capacity = 16 << 20;

    let wal = open_started(config(device.path(), capacity)).await;
    wal.reset().await.unwrap();
    let body = Bytes::from(vec![0x5Au8; 512]);
    wal.append(body.clone(), 0).unwrap().wait().await.unwrap();
    assert!(wal.shutdown_gracefully().await);
    drop(wal);

    // Wipe header slot 0.
    {
        use std::io::{Seek, Write};
        let mut f = device.as_file().try_clone().unwrap();
        f.seek(std::io::SeekFrom::Start(0)).unwrap();
        f.write_all(&vec![0u8; BLOCK as usize]).unwrap();
        f.sync_all().unwrap();
    }

    let wal = open_started(config(device.path(), capacity)).await;
    let recovered: Vec<_> = wal.recover().unwrap().collect();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].record, body);

    // Starting up flushed the header again, rewriting slot 0 in round-robin
    // order.
    let raw = read_device(&device, 0, 4);
    assert_eq!(raw, 0x1234_5678u32.to_be_bytes());
}

#[tokio::test]
async fn test_trim_at_window_start_fails_without_mutating() {
    let device = NamedTempFile::new().unwrap();
    let wal = open_started(config(device.path(), 16 << 20)).await;
    wal.reset().await.unwrap();
    wal.append(Bytes::from_static(b"keep me"), 0)
        .unwrap()
        .wait()
        .await
        .unwrap();

    let trim_before = wal.trim_offset();
    let window_start = wal.start_offset();

    let result = wal.trim(window_start).await;
    assert!(matches!(result, Err(WalError::TrimBeyondWindow { .. })));
    let result = wal.trim(window_start + 100).await;
    assert!(matches!(result, Err(WalError::TrimBeyondWindow { .. })));
    assert_eq!(wal.trim_offset(), trim_before);

    // Just below the window start is legal.
    wal.trim(window_start - 1).await.unwrap();
    assert_eq!(wal.trim_offset(), window_start - 1);
}

#[tokio::test]
async fn test_reset_discards_recovered_records() {
    let device = NamedTempFile::new().unwrap();
    let capacity = 16 << 20;

    let wal = open_started(config(device.path(), capacity)).await;
    wal.reset().await.unwrap();
    wal.append(Bytes::from_static(b"first session"), 0)
        .unwrap()
        .wait()
        .await
        .unwrap();
    drop(wal);

    let wal = open_started(config(device.path(), capacity)).await;
    assert_eq!(wal.recover().unwrap().count(), 1);
    wal.reset().await.unwrap();
    let second = Bytes::from_static(b"second session");
    let append = wal.append(second.clone(), 0).unwrap();
    // The new window opens one block past the recovered next-write offset.
    assert_eq!(append.record_offset % BLOCK, 0);
    append.wait().await.unwrap();
    drop(wal);

    // Only the post-reset record survives.
    let wal = open_started(config(device.path(), capacity)).await;
    let recovered: Vec<_> = wal.recover().unwrap().collect();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].record, second);
}

#[tokio::test]
async fn test_over_capacity_then_trim_frees_the_ring() {
    let device = NamedTempFile::new().unwrap();
    // A deliberately tiny ring.
    let wal = open_started(config(device.path(), 2 << 20)).await;
    wal.reset().await.unwrap();

    let mut appended = 0u32;
    let mut hit_capacity = false;
    for i in 0..1000u32 {
        match wal.append(Bytes::from(vec![(i % 251) as u8; 1024]), 0) {
            Ok(append) => {
                append.wait().await.unwrap();
                appended += 1;
            }
            Err(WalError::OverCapacity { .. }) => {
                hit_capacity = true;
                break;
            }
            Err(e) => panic!("unexpected append error: {e}"),
        }
    }
    assert!(hit_capacity, "a never-trimmed 2 MiB ring must fill");
    assert!(appended > 100);

    // Still full on retry.
    assert!(matches!(
        wal.append(Bytes::from(vec![0u8; 1024]), 0),
        Err(WalError::OverCapacity { .. })
    ));

    // Trimming reopens the ring.
    wal.trim(wal.start_offset() - 1).await.unwrap();
    let append = wal.append(Bytes::from(vec![7u8; 1024]), 0).unwrap();
    append.wait().await.unwrap();
}

#[tokio::test]
async fn test_ring_wrap_record_never_straddles_the_seam() {
    let device = NamedTempFile::new().unwrap();
    let capacity: u64 = 1 << 20;
    let ring = capacity - HEADER_RESERVE;

    let wal = open_started(config(device.path(), capacity)).await;
    wal.reset().await.unwrap();

    // Fill until the next block has less room than the large record needs.
    while wal.next_write_offset() + 2 * BLOCK < ring {
        wal.append(Bytes::from(vec![1u8; 1024]), 0)
            .unwrap()
            .wait()
            .await
            .unwrap();
    }
    // Free the head of the ring so the wrapped record has somewhere to go.
    wal.trim(wal.start_offset() - 1).await.unwrap();

    let big = Bytes::from(vec![0xEEu8; 7976]);
    let append = wal.append(big.clone(), 0).unwrap();
    let offset = append.record_offset;
    // The committer padded past the seam instead of splitting the record.
    assert_eq!(offset % ring, 0);
    assert!(offset >= ring);
    append.wait().await.unwrap();

    // The frame physically sits at the start of the record section.
    let raw = read_device(&device, HEADER_RESERVE, 4);
    assert_eq!(raw, RECORD_MAGIC.to_be_bytes());

    // Crash and recover: the wrapped record survives intact.
    drop(wal);
    let wal = open_started(config(device.path(), capacity)).await;
    let recovered: Vec<_> = wal.recover().unwrap().collect();
    let wrapped = recovered
        .iter()
        .find(|r| r.record_offset == offset)
        .expect("wrapped record recovered");
    assert_eq!(wrapped.record, big);
}

#[tokio::test]
async fn test_window_grows_under_unacknowledged_load() {
    let device = NamedTempFile::new().unwrap();
    let wal = {
        let mut config = config(device.path(), 8 << 20);
        config.window_initial = 16 << 10;
        config.window_scale_unit = 16 << 10;
        BlockWal::open(config).unwrap()
    };
    wal.start().await.unwrap();
    wal.reset().await.unwrap();

    // Pipeline far more than the initial window without awaiting.
    let pending: Vec<_> = (0..100u32)
        .map(|i| wal.append(Bytes::from(vec![(i % 251) as u8; 1024]), 0).unwrap())
        .collect();
    for append in pending {
        append.wait().await.unwrap();
    }
    assert!(wal.start_offset() >= 100 * 1024);
}

#[tokio::test]
async fn test_append_before_start_is_rejected() {
    let device = NamedTempFile::new().unwrap();
    let wal = BlockWal::open(config(device.path(), 4 << 20)).unwrap();
    assert!(matches!(
        wal.append(Bytes::from_static(b"x"), 0),
        Err(WalError::NotReady)
    ));
    assert!(matches!(wal.recover(), Err(WalError::NotReady)));
}
