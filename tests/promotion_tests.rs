//! Integration tests for faults, bulk promotion and extent release.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hybridswap::config::Config;
use hybridswap::io::{Direction, MemDevice};
use hybridswap::{Engine, ObjectFlags, SwapError};

const PAGE: usize = 512;

fn test_config() -> Config {
    let mut config = Config::default();
    config.geometry.page_size = PAGE;
    config.geometry.extent_size = 4096;
    config.geometry.extent_count = 16;
    config.geometry.object_count = 64;
    config.geometry.owner_count = 4;
    config.io.max_batch_bytes = 64 * 1024;
    config.reclaim.min_reclaim_bytes = 0;
    config
}

fn noise_page(seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..PAGE)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn engine_with_device() -> (Arc<Engine>, Arc<MemDevice>) {
    let config = test_config();
    let device = Arc::new(MemDevice::new(config.geometry.device_bytes(), &config.io).unwrap());
    let engine = Engine::new(config, device.clone()).unwrap();
    (Arc::new(engine), device)
}

/// Store `count` pages for owner 1 and push them all to disk.
fn swapped_out(engine: &Engine, count: usize) {
    for id in 0..count {
        engine.store(1, id, &noise_page(id as u64)).unwrap();
    }
    let report = engine.reclaim_in(1, true).unwrap();
    assert_eq!(report.objects, count as u64);
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_fault_promotes_whole_extent() {
    let (engine, _device) = engine_with_device();
    swapped_out(&engine, 20);

    let report = engine.fault_out(0).unwrap();
    assert_eq!(report.extents, 1);
    assert_eq!(report.objects, 7);
    assert!(!engine.is_on_disk(0).unwrap());
    assert_eq!(engine.stats().live_extents, 2);

    // Neighbours in the same extent came back with it.
    let in_ram = (0..20).filter(|&id| !engine.is_on_disk(id).unwrap()).count();
    assert_eq!(in_ram, 7);
    engine.assert_consistent();

    // A second fault on a RAM object is a no-op.
    assert_eq!(engine.fault_out(0).unwrap().objects, 0);
}

#[test]
fn test_load_roundtrip_through_device() {
    let (engine, _device) = engine_with_device();
    swapped_out(&engine, 20);

    for id in (0..20).rev() {
        assert_eq!(engine.load(id).unwrap(), noise_page(id as u64));
    }
    let stats = engine.owner_stats(1).unwrap();
    assert_eq!(stats.ram_objects, 20);
    assert_eq!(stats.disk_objects, 0);
    assert_eq!(engine.stats().live_extents, 0);
    engine.assert_consistent();
}

#[test]
fn test_fault_waits_for_writeback() {
    let (engine, device) = engine_with_device();
    for id in 0..10 {
        engine.store(1, id, &noise_page(id as u64)).unwrap();
    }

    device.pause();
    let reclaimer = {
        let engine = engine.clone();
        thread::spawn(move || engine.reclaim_in(1, true).unwrap())
    };
    wait_until("write-back to start", || {
        engine
            .object_flags(0)
            .unwrap()
            .contains(ObjectFlags::WRITEBACK_IN_PROGRESS)
    });

    let reader = {
        let engine = engine.clone();
        thread::spawn(move || engine.load(0).unwrap())
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!reader.is_finished(), "load raced an in-flight write-back");

    device.resume();
    let report = reclaimer.join().unwrap();
    assert_eq!(report.objects, 10);
    assert_eq!(reader.join().unwrap(), noise_page(0));
    engine.assert_consistent();
}

#[test]
fn test_fault_read_failure_keeps_extent() {
    let (engine, device) = engine_with_device();
    swapped_out(&engine, 10);

    device.fail_next_reads(1);
    assert!(matches!(engine.load(0), Err(SwapError::Io(_))));
    assert!(engine.is_on_disk(0).unwrap());
    assert_eq!(engine.owner_stats(1).unwrap().disk_objects, 10);
    engine.assert_consistent();

    assert_eq!(engine.load(0).unwrap(), noise_page(0));
    engine.assert_consistent();
}

#[test]
fn test_concurrent_faults_on_one_extent() {
    let (engine, device) = engine_with_device();
    swapped_out(&engine, 7);

    let readers: Vec<_> = (0..7)
        .map(|id| {
            let engine = engine.clone();
            thread::spawn(move || engine.load(id).unwrap())
        })
        .collect();
    for (id, reader) in readers.into_iter().enumerate() {
        assert_eq!(reader.join().unwrap(), noise_page(id as u64));
    }

    let reads = device
        .transfers()
        .into_iter()
        .filter(|t| t.direction == Direction::Read)
        .count();
    assert_eq!(reads, 1, "one extent read serves every fault");
    engine.assert_consistent();
}

#[test]
fn test_emptied_extent_is_freed() {
    let (engine, _device) = engine_with_device();
    swapped_out(&engine, 7);
    assert_eq!(engine.stats().live_extents, 1);

    for id in 0..7 {
        engine.remove(id).unwrap();
    }
    engine.sync_frees();
    assert_eq!(engine.stats().live_extents, 0);
    assert_eq!(engine.owner_stats(1).unwrap().disk_objects, 0);
    engine.assert_consistent();
}

#[test]
fn test_untrack_disk_object_drops_data() {
    let (engine, _device) = engine_with_device();
    swapped_out(&engine, 3);

    engine.untrack(1, 1).unwrap();
    assert!(matches!(engine.load(1), Err(SwapError::ObjectMissing(1))));
    assert!(matches!(
        engine.untrack(2, 0),
        Err(SwapError::NotEligible { owner: 2, .. })
    ));
    assert_eq!(engine.owner_stats(1).unwrap().disk_objects, 2);
    engine.assert_consistent();
}

#[test]
fn test_batch_out_brings_back_requested_bytes() {
    let (engine, _device) = engine_with_device();
    swapped_out(&engine, 20);

    let report = engine.batch_out(1, PAGE as u64).unwrap();
    assert_eq!(report.extents, 1);
    assert!(report.objects > 0);
    assert_eq!(report.bytes, report.objects * PAGE as u64);
    assert!(report.failure.is_none());
    assert_eq!(engine.stats().live_extents, 2);
    engine.assert_consistent();

    let rest = engine.batch_out(1, u64::MAX).unwrap();
    assert_eq!(rest.extents, 2);
    assert_eq!(report.objects + rest.objects, 20);
    assert_eq!(engine.owner_stats(1).unwrap().disk_bytes, 0);
    assert_eq!(engine.stats().live_extents, 0);
    engine.assert_consistent();

    // Nothing left on disk is not an error.
    assert_eq!(engine.batch_out(1, u64::MAX).unwrap().extents, 0);
}

#[test]
fn test_batch_out_read_failure_relinks_extents() {
    let (engine, device) = engine_with_device();
    swapped_out(&engine, 20);

    device.fail_next_reads(1);
    let report = engine.batch_out(1, u64::MAX).unwrap();
    assert!(report.failure.is_some());
    assert!(engine.stats().live_extents > 0);
    engine.assert_consistent();

    let retry = engine.batch_out(1, u64::MAX).unwrap();
    assert!(retry.failure.is_none());
    assert_eq!(engine.stats().live_extents, 0);
    engine.assert_consistent();
}

#[test]
fn test_pre_out_blocks_reclaim_until_done() {
    let (engine, device) = engine_with_device();
    swapped_out(&engine, 20);

    device.pause();
    let report = engine.pre_out(1, u64::MAX).unwrap();
    assert_eq!(report.extents, 3);
    assert_eq!(report.bytes, 20 * PAGE as u64);
    assert_eq!(report.objects, 0);

    engine.store(1, 30, &noise_page(30)).unwrap();
    assert!(matches!(
        engine.reclaim_in(1, true),
        Err(SwapError::NotEligible { owner: 1, .. })
    ));
    assert!(matches!(
        engine.batch_out(1, u64::MAX),
        Err(SwapError::NotEligible { .. })
    ));

    device.resume();
    wait_until("pre-out to finish", || {
        !matches!(engine.reclaim_in(1, true), Err(SwapError::NotEligible { .. }))
    });
    for id in 0..20 {
        assert_eq!(engine.load(id).unwrap(), noise_page(id as u64));
    }
    engine.assert_consistent();
}

#[test]
fn test_destroy_waits_for_pre_out() {
    let (engine, device) = engine_with_device();
    swapped_out(&engine, 20);

    device.pause();
    assert_eq!(engine.pre_out(1, u64::MAX).unwrap().extents, 3);
    let destroyer = {
        let engine = engine.clone();
        thread::spawn(move || engine.destroy_owner(1))
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!destroyer.is_finished(), "destroy raced an in-flight pre-out");

    device.resume();
    let report = destroyer.join().unwrap().unwrap();
    // Pre-out already brought every extent back.
    assert_eq!(report.extents, 0);
    assert!(engine.owners().is_empty());
    assert_eq!(engine.stats().live_extents, 0);
    for id in 0..20 {
        assert_eq!(engine.load(id).unwrap(), noise_page(id as u64));
    }
    engine.assert_consistent();
}
