//! Memory owners: the attribution unit whose resident sizes and LRU order are
//! tracked independently (the cgroup analogue).
//!
//! Owners are created lazily the first time an object is attributed to them
//! and live in a fixed registry indexed by id. Id 0 is reserved for "no owner".

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Owner identifier. Valid owners are `1..=owner_count`.
pub type OwnerId = u16;

/// Attribution used for objects and extents that belong to nobody.
pub const NO_OWNER: OwnerId = 0;

/// Snapshot of an owner's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerStats {
    pub ram_bytes: u64,
    pub ram_objects: u64,
    pub disk_bytes: u64,
    pub disk_objects: u64,
}

/// One memory owner.
#[derive(Debug)]
pub struct Owner {
    id: OwnerId,
    /// Head of the RAM-resident LRU in the object table.
    ram_head: usize,
    /// Head of the extent LRU in the extent table.
    ext_head: usize,

    ram_bytes: AtomicU64,
    ram_objects: AtomicU64,
    disk_bytes: AtomicU64,
    disk_objects: AtomicU64,

    /// Set while a bulk promotion for this owner is running.
    in_promotion: AtomicBool,
    promotion_lock: Mutex<()>,
    promotion_done: Condvar,
    /// Cleared once the owner starts draining; late arrivals go to NO_OWNER.
    alive: AtomicBool,
    enabled: AtomicBool,
    /// Target disk share of the total resident size, in percent.
    ratio: AtomicU32,

    /// Serializes reclaim, bulk promotion and destruction.
    reclaim_lock: Mutex<()>,
}

impl Owner {
    pub fn new(id: OwnerId, ram_head: usize, ext_head: usize, ratio: u32) -> Self {
        Self {
            id,
            ram_head,
            ext_head,
            ram_bytes: AtomicU64::new(0),
            ram_objects: AtomicU64::new(0),
            disk_bytes: AtomicU64::new(0),
            disk_objects: AtomicU64::new(0),
            in_promotion: AtomicBool::new(false),
            promotion_lock: Mutex::new(()),
            promotion_done: Condvar::new(),
            alive: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            ratio: AtomicU32::new(ratio.min(100)),
            reclaim_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn ram_head(&self) -> usize {
        self.ram_head
    }

    pub fn ext_head(&self) -> usize {
        self.ext_head
    }

    pub fn stats(&self) -> OwnerStats {
        OwnerStats {
            ram_bytes: self.ram_bytes.load(Ordering::Relaxed),
            ram_objects: self.ram_objects.load(Ordering::Relaxed),
            disk_bytes: self.disk_bytes.load(Ordering::Relaxed),
            disk_objects: self.disk_objects.load(Ordering::Relaxed),
        }
    }

    pub fn ram_bytes(&self) -> u64 {
        self.ram_bytes.load(Ordering::Relaxed)
    }

    pub fn disk_bytes(&self) -> u64 {
        self.disk_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_ram(&self, bytes: u64) {
        self.ram_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.ram_objects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sub_ram(&self, bytes: u64) {
        let prev = self.ram_bytes.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "owner {} ram bytes underflow", self.id);
        self.ram_objects.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn add_disk(&self, bytes: u64) {
        self.disk_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.disk_objects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sub_disk(&self, bytes: u64) {
        let prev = self.disk_bytes.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "owner {} disk bytes underflow", self.id);
        self.disk_objects.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn ratio(&self) -> u32 {
        self.ratio.load(Ordering::Relaxed)
    }

    /// Set the target disk share in percent (clamped to 100).
    pub fn set_ratio(&self, percent: u32) {
        self.ratio.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn in_promotion(&self) -> bool {
        self.in_promotion.load(Ordering::Acquire)
    }

    /// Returns false if a promotion was already running.
    pub(crate) fn begin_promotion(&self) -> bool {
        !self.in_promotion.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_promotion(&self) {
        let _guard = self.promotion_lock.lock();
        self.in_promotion.store(false, Ordering::Release);
        self.promotion_done.notify_all();
    }

    /// Block until no bulk promotion is running. False if `deadline` passed
    /// first.
    pub(crate) fn wait_promotion(&self, deadline: Instant) -> bool {
        let mut guard = self.promotion_lock.lock();
        while self.in_promotion() {
            if self.promotion_done.wait_until(&mut guard, deadline).timed_out() {
                return !self.in_promotion();
            }
        }
        true
    }

    pub(crate) fn lock_reclaim(&self) -> MutexGuard<'_, ()> {
        self.reclaim_lock.lock()
    }

    /// Bytes that should move to disk to bring the disk share up to the
    /// configured ratio: `max(0, (ram + disk) * ratio - disk)`.
    pub fn reclaimable(&self) -> u64 {
        let ram = self.ram_bytes();
        let disk = self.disk_bytes();
        let target = (ram + disk) * u64::from(self.ratio()) / 100;
        target.saturating_sub(disk).min(ram)
    }
}

/// Fixed-size table of owners addressed by id.
#[derive(Debug)]
pub struct OwnerRegistry {
    slots: Box<[RwLock<Option<Arc<Owner>>>]>,
}

impl OwnerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| RwLock::new(None)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_valid(&self, id: OwnerId) -> bool {
        id != NO_OWNER && (id as usize) <= self.slots.len()
    }

    pub fn get(&self, id: OwnerId) -> Option<Arc<Owner>> {
        if !self.is_valid(id) {
            return None;
        }
        self.slots[id as usize - 1].read().clone()
    }

    /// Look up an owner, creating it with `make` if the slot is empty.
    pub fn get_or_create(
        &self,
        id: OwnerId,
        make: impl FnOnce() -> Owner,
    ) -> Option<Arc<Owner>> {
        if !self.is_valid(id) {
            return None;
        }
        if let Some(owner) = self.slots[id as usize - 1].read().clone() {
            return Some(owner);
        }
        let mut slot = self.slots[id as usize - 1].write();
        let owner = slot.get_or_insert_with(|| {
            debug!(owner = id, "Created owner");
            Arc::new(make())
        });
        Some(owner.clone())
    }

    /// Drop the registry entry. Returns the owner that was registered.
    pub fn remove(&self, id: OwnerId) -> Option<Arc<Owner>> {
        if !self.is_valid(id) {
            return None;
        }
        self.slots[id as usize - 1].write().take()
    }

    /// All currently registered owners.
    pub fn owners(&self) -> Vec<Arc<Owner>> {
        self.slots.iter().filter_map(|s| s.read().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reclaimable_follows_ratio() {
        let owner = Owner::new(1, 0, 0, 50);
        for _ in 0..10 {
            owner.add_ram(100);
        }
        // 1000 in RAM, nothing on disk, 50% target -> 500 to move.
        assert_eq!(owner.reclaimable(), 500);

        for _ in 0..5 {
            owner.sub_ram(100);
            owner.add_disk(100);
        }
        assert_eq!(owner.reclaimable(), 0);
    }

    #[test]
    fn test_reclaimable_never_exceeds_ram() {
        let owner = Owner::new(1, 0, 0, 100);
        owner.add_ram(10);
        owner.add_disk(90);
        assert_eq!(owner.reclaimable(), 10);
    }

    #[test]
    fn test_ratio_clamped() {
        let owner = Owner::new(1, 0, 0, 250);
        assert_eq!(owner.ratio(), 100);
        owner.set_ratio(30);
        assert_eq!(owner.ratio(), 30);
    }

    #[test]
    fn test_promotion_flag_exclusive() {
        let owner = Owner::new(1, 0, 0, 0);
        assert!(owner.begin_promotion());
        assert!(!owner.begin_promotion());
        owner.end_promotion();
        assert!(!owner.in_promotion());
    }

    #[test]
    fn test_wait_promotion_wakes_on_end() {
        let owner = Arc::new(Owner::new(1, 0, 0, 0));
        assert!(owner.begin_promotion());
        let expired = Instant::now();
        assert!(!owner.wait_promotion(expired));

        let ender = {
            let owner = owner.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                owner.end_promotion();
            })
        };
        assert!(owner.wait_promotion(Instant::now() + std::time::Duration::from_secs(5)));
        ender.join().unwrap();
        assert!(owner.wait_promotion(expired));
    }

    #[test]
    fn test_registry_lazy_create() {
        let registry = OwnerRegistry::new(4);
        assert!(registry.get(2).is_none());
        let a = registry.get_or_create(2, || Owner::new(2, 10, 20, 40)).unwrap();
        let b = registry.get_or_create(2, || unreachable!()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.owners().len(), 1);

        assert!(registry.get_or_create(0, || Owner::new(0, 0, 0, 0)).is_none());
        assert!(registry.get_or_create(5, || Owner::new(5, 0, 0, 0)).is_none());

        registry.remove(2);
        assert!(registry.get(2).is_none());
    }
}
