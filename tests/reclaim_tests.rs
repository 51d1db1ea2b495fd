//! Integration tests for reclaim-in: packing, accounting and write failures.

use std::sync::Arc;
use std::thread;

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

/// Incompressible page: stored raw, so seven fit in one 4 KiB extent.
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

fn engine_with_device(config: Config) -> (Engine, Arc<MemDevice>) {
    let device = Arc::new(MemDevice::new(config.geometry.device_bytes(), &config.io).unwrap());
    let engine = Engine::new(config, device.clone()).unwrap();
    (engine, device)
}

fn fill(engine: &Engine, owner: u16, ids: std::ops::Range<usize>) {
    for id in ids {
        engine.store(owner, id, &noise_page(id as u64)).unwrap();
    }
}

#[test]
fn test_forced_reclaim_moves_everything() {
    let (engine, device) = engine_with_device(test_config());
    fill(&engine, 1, 0..20);
    assert!(engine
        .object_flags(0)
        .unwrap()
        .contains(ObjectFlags::INCOMPRESSIBLE));

    let report = engine.reclaim_in(1, true).unwrap();
    assert_eq!(report.objects, 20);
    assert_eq!(report.bytes, 20 * PAGE as u64);
    assert_eq!(report.extents, 3);
    assert!(!report.out_of_space);
    assert!(report.failure.is_none());

    let stats = engine.owner_stats(1).unwrap();
    assert_eq!(stats.ram_objects, 0);
    assert_eq!(stats.disk_objects, 20);
    assert_eq!(stats.disk_bytes, 20 * PAGE as u64);
    assert_eq!(engine.stats().live_extents, 3);
    for id in 0..20 {
        assert!(engine.is_on_disk(id).unwrap());
    }

    // Adjacent extents go out as one merged transfer.
    let writes: Vec<_> = device
        .transfers()
        .into_iter()
        .filter(|t| t.direction == Direction::Write)
        .collect();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].len, 3 * 4096);
    engine.assert_consistent();
}

#[test]
fn test_reclaim_honours_ratio() {
    let (engine, _device) = engine_with_device(test_config());
    fill(&engine, 1, 0..20);
    engine.set_owner_ratio(1, 50).unwrap();

    let report = engine.reclaim_in(1, false).unwrap();
    assert_eq!(report.target, 10 * PAGE as u64);
    assert_eq!(report.bytes, 10 * PAGE as u64);
    assert_eq!(report.objects, 10);

    let stats = engine.owner_stats(1).unwrap();
    assert_eq!(stats.ram_objects, 10);
    assert_eq!(stats.disk_objects, 10);
    engine.assert_consistent();

    // At the target ratio nothing is left to do.
    assert!(matches!(
        engine.reclaim_in(1, false),
        Err(SwapError::NotEligible { owner: 1, .. })
    ));
}

#[test]
fn test_reclaim_takes_cold_end_first() {
    let (engine, _device) = engine_with_device(test_config());
    fill(&engine, 1, 0..10);
    // Touch the oldest objects so they become hot.
    for id in 0..3 {
        engine.load(id).unwrap();
    }
    engine.set_owner_ratio(1, 30).unwrap();
    let report = engine.reclaim_in(1, false).unwrap();
    assert_eq!(report.objects, 3);
    for id in 0..3 {
        assert!(!engine.is_on_disk(id).unwrap(), "hot object {id} was reclaimed");
    }
    for id in 3..6 {
        assert!(engine.is_on_disk(id).unwrap(), "cold object {id} stayed in RAM");
    }
}

#[test]
fn test_zero_pages_stay_in_ram() {
    let (engine, _device) = engine_with_device(test_config());
    engine.store(1, 0, &[0u8; PAGE]).unwrap();
    fill(&engine, 1, 1..4);

    let report = engine.reclaim_in(1, true).unwrap();
    assert_eq!(report.objects, 3);
    assert!(!engine.is_on_disk(0).unwrap());
    assert_eq!(engine.load(0).unwrap(), vec![0u8; PAGE]);
    engine.assert_consistent();
}

#[test]
fn test_not_eligible_cases() {
    let mut config = test_config();
    config.reclaim.min_reclaim_bytes = 4 * PAGE as u64;
    let (engine, _device) = engine_with_device(config);

    assert!(matches!(
        engine.reclaim_in(9, true),
        Err(SwapError::InvalidOwner(9))
    ));
    assert!(matches!(
        engine.reclaim_in(2, true),
        Err(SwapError::NotEligible { owner: 2, .. })
    ));

    fill(&engine, 1, 0..4);
    // 50% of four pages is below the threshold.
    assert!(matches!(
        engine.reclaim_in(1, false),
        Err(SwapError::NotEligible { .. })
    ));

    engine.set_owner_enabled(1, false).unwrap();
    assert!(engine.reclaim_in(1, true).is_err());
    engine.set_owner_enabled(1, true).unwrap();

    engine.set_enabled(false);
    assert!(engine.reclaim_in(1, true).is_err());
    engine.set_enabled(true);

    assert_eq!(engine.reclaim_in(1, true).unwrap().objects, 4);
}

#[test]
fn test_out_of_space() {
    let mut config = test_config();
    config.geometry.extent_count = 2;
    let (engine, _device) = engine_with_device(config);
    fill(&engine, 1, 0..20);

    let report = engine.reclaim_in(1, true).unwrap();
    assert!(report.out_of_space);
    assert_eq!(report.objects, 14);
    assert_eq!(engine.owner_stats(1).unwrap().ram_objects, 6);

    assert!(matches!(
        engine.reclaim_in(1, true),
        Err(SwapError::NoSpace(_))
    ));
    engine.assert_consistent();
}

#[test]
fn test_daily_quota_caps_reclaim() {
    let mut config = test_config();
    config.reclaim.daily_quota_bytes = 2 * PAGE as u64;
    let (engine, _device) = engine_with_device(config);
    fill(&engine, 1, 0..10);
    engine.set_owner_ratio(1, 100).unwrap();

    let report = engine.reclaim_in(1, false).unwrap();
    assert_eq!(report.bytes, 2 * PAGE as u64);
    assert!(matches!(
        engine.reclaim_in(1, false),
        Err(SwapError::NotEligible { .. })
    ));

    // Forced reclaim is not charged against the quota.
    assert_eq!(engine.reclaim_in(1, true).unwrap().objects, 8);
}

#[test]
fn test_write_failure_restores_objects() {
    let (engine, device) = engine_with_device(test_config());
    fill(&engine, 1, 0..10);
    device.fail_next_writes(1);

    let report = engine.reclaim_in(1, true).unwrap();
    assert!(report.failure.is_some());
    assert_eq!(report.bytes, 0);

    let stats = engine.owner_stats(1).unwrap();
    assert_eq!(stats.ram_objects, 10);
    assert_eq!(stats.disk_objects, 0);
    assert_eq!(engine.stats().live_extents, 0);
    engine.assert_consistent();
    for id in 0..10 {
        assert_eq!(engine.load(id).unwrap(), noise_page(id as u64));
    }

    let retry = engine.reclaim_in(1, true).unwrap();
    assert_eq!(retry.objects, 10);
    assert!(retry.failure.is_none());
    engine.assert_consistent();
}

#[test]
fn test_write_failure_keeps_lru_order() {
    let (engine, device) = engine_with_device(test_config());
    fill(&engine, 1, 0..3);
    device.fail_next_writes(1);
    assert!(engine.reclaim_in(1, true).unwrap().failure.is_some());

    // Object 0 was the coldest before the failure and must still be.
    engine.set_owner_ratio(1, 30).unwrap();
    let report = engine.reclaim_in(1, false).unwrap();
    assert_eq!(report.objects, 1);
    assert!(engine.is_on_disk(0).unwrap());
    assert!(!engine.is_on_disk(1).unwrap());
    assert!(!engine.is_on_disk(2).unwrap());
    engine.assert_consistent();
}

#[test]
fn test_rejected_submission_restores_objects() {
    let (engine, device) = engine_with_device(test_config());
    fill(&engine, 1, 0..5);
    device.reject_next_submits(1);

    let report = engine.reclaim_in(1, true).unwrap();
    assert!(report.failure.is_some());
    assert_eq!(engine.owner_stats(1).unwrap().ram_objects, 5);
    engine.assert_consistent();
}

#[test]
fn test_concurrent_reclaim_never_duplicates_objects() {
    let (engine, _device) = engine_with_device(test_config());
    let engine = Arc::new(engine);
    fill(&engine, 1, 0..28);
    fill(&engine, 2, 28..56);

    let handles: Vec<_> = [1u16, 1, 2, 2]
        .into_iter()
        .map(|owner| {
            let engine = engine.clone();
            thread::spawn(move || engine.reclaim_in(owner, true).unwrap())
        })
        .collect();
    let moved: u64 = handles
        .into_iter()
        .map(|h| h.join().unwrap().objects)
        .sum();

    assert_eq!(moved, 56);
    engine.assert_consistent();
    for id in 0..56 {
        assert_eq!(engine.load(id).unwrap(), noise_page(id as u64));
    }
    engine.assert_consistent();
}
