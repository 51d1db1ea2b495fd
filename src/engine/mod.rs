//! The hybridswap engine: RAM tier, extent space, owners and I/O in one
//! explicit context.
//!
//! The engine coordinates block movement between the compressed RAM tier and
//! extents on the backing device:
//! - [`reclaim`]: per-owner write-back of cold objects into new extents
//! - [`promote`]: fault-driven and bulk promotion of extents back into RAM
//! - [`free`]: background release of extents whose last object went away
//! - [`drain`]: owner teardown
//!
//! Lock order is RAM LRU head, then extent reverse-map head, then object
//! slot. Extent waiters are woken only after every list and slot lock is
//! dropped.

mod drain;
mod free;
mod promote;
mod reclaim;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::error::{Result, SwapError};
use crate::extent::{ExtentId, ExtentSpace};
use crate::io::{BackingDevice, DeviceError, IoFailure, IoScheduler, MemDevice};
use crate::list::{IndexTable, Layout, ListGuard};
use crate::owner::{Owner, OwnerId, OwnerRegistry, OwnerStats, NO_OWNER};
use crate::store::{Compressor, Encoded, Handle, ObjectFlags, ObjectId, RamStore, SlotState};

pub use drain::DrainReport;
pub use promote::PromoteReport;
pub use reclaim::ReclaimReport;

use free::FreeMsg;
use promote::ExtentWaits;
use reclaim::DailyQuota;

/// Engine-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub extent_capacity: usize,
    pub live_extents: usize,
    pub fragments: usize,
    pub utilization: f64,
    pub owners: usize,
    pub in_flight: usize,
    pub segments_submitted: u64,
    pub entries_completed: u64,
    pub entries_failed: u64,
}

/// Amount of work done by a bulk operation, filled in from completion
/// threads.
#[derive(Debug, Default)]
struct Progress {
    bytes: AtomicU64,
    objects: AtomicU64,
    extents: AtomicU64,
    failure: Mutex<Option<IoFailure>>,
}

impl Progress {
    fn record(&self, bytes: u64, objects: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.objects.fetch_add(objects, Ordering::Relaxed);
        self.extents.fetch_add(1, Ordering::Relaxed);
    }

    /// Keep the first failure.
    fn fail(&self, failure: IoFailure) {
        self.failure.lock().get_or_insert(failure);
    }

    fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn objects(&self) -> u64 {
        self.objects.load(Ordering::Relaxed)
    }

    fn extents(&self) -> u64 {
        self.extents.load(Ordering::Relaxed)
    }

    fn failure(&self) -> Option<IoFailure> {
        self.failure.lock().clone()
    }
}

/// An object slot locked together with the list it currently sits on.
struct Locked<'a> {
    slot: MutexGuard<'a, SlotState>,
    list: Option<ListGuard<'a>>,
}

struct EngineInner {
    config: Config,
    store: RamStore,
    /// Object nodes: owner RAM LRUs and extent reverse maps.
    objs: IndexTable,
    space: ExtentSpace,
    owners: OwnerRegistry,
    sched: Arc<IoScheduler>,
    waits: ExtentWaits,
    quota: Mutex<DailyQuota>,
    enabled: AtomicBool,
    free_tx: mpsc::UnboundedSender<FreeMsg>,
}

/// The two-tier store.
pub struct Engine {
    inner: Arc<EngineInner>,
    free_worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("space", &self.inner.space)
            .field("sched", &self.inner.sched)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine over `device`, which must hold every extent.
    pub fn new(config: Config, device: Arc<dyn BackingDevice>) -> Result<Self> {
        config.validate()?;
        let g = &config.geometry;
        if device.size() < g.device_bytes() {
            return Err(ConfigError::Invalid(format!(
                "backing device has {} bytes, geometry needs {}",
                device.size(),
                g.device_bytes()
            ))
            .into());
        }

        let compressor = Compressor::new(config.compression.clone(), g.page_size);
        let store = RamStore::new(g.object_count, compressor);
        let objs = IndexTable::new(Layout::new(g.object_count, g.extent_count, g.owner_count));
        let space = ExtentSpace::new(g.extent_count, g.owner_count);
        let owners = OwnerRegistry::new(g.owner_count);
        let sched = Arc::new(IoScheduler::new(device, &config.io));
        let quota = DailyQuota::new(config.reclaim.daily_quota_bytes);
        let enabled = AtomicBool::new(config.reclaim.enabled);
        let (free_tx, free_rx) = mpsc::unbounded_channel();

        info!(
            page_size = g.page_size,
            extent_size = g.extent_size,
            extents = g.extent_count,
            objects = g.object_count,
            owners = g.owner_count,
            "Engine initialized"
        );

        let inner = Arc::new(EngineInner {
            config,
            store,
            objs,
            space,
            owners,
            sched,
            waits: ExtentWaits::new(),
            quota: Mutex::new(quota),
            enabled,
            free_tx,
        });
        let free_worker =
            free::spawn_worker(Arc::downgrade(&inner), free_rx).map_err(DeviceError::from)?;

        Ok(Self {
            inner,
            free_worker: Some(free_worker),
        })
    }

    /// Build an engine over a zeroed in-memory device sized to the geometry.
    pub fn with_mem_device(config: Config) -> Result<Self> {
        let device = MemDevice::new(config.geometry.device_bytes(), &config.io)?;
        Self::new(config, Arc::new(device))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn page_size(&self) -> usize {
        self.inner.config.geometry.page_size
    }

    /// Compress `page` into slot `id` and track it under `owner`. Any
    /// previous content of the slot is dropped first.
    pub fn store(&self, owner: OwnerId, id: ObjectId, page: &[u8]) -> Result<()> {
        let inner = &self.inner;
        inner.check_object(id)?;
        let owner = inner.owner(owner)?;
        let encoded = inner.store.compressor().compress(page)?;

        inner.release_object(id, None, true)?;
        {
            let mut slot = inner.store.lock(id);
            slot.reset();
            match encoded {
                Encoded::Zero => {
                    slot.set_handle(Handle::Ram(Bytes::new()));
                    slot.set_flag(ObjectFlags::IDENTICAL_ZERO_PAGE);
                }
                Encoded::Compressed(payload) => {
                    slot.set_size(payload.len() as u32);
                    slot.set_handle(Handle::Ram(payload));
                }
                Encoded::Raw(payload) => {
                    slot.set_size(payload.len() as u32);
                    slot.set_handle(Handle::Ram(payload));
                    slot.set_flag(ObjectFlags::INCOMPRESSIBLE);
                }
            }
        }
        inner.track_owner(&owner, id)
    }

    /// Read an object back as a full page, faulting its extent in if needed.
    pub fn load(&self, id: ObjectId) -> Result<Vec<u8>> {
        let inner = &self.inner;
        inner.check_object(id)?;
        let deadline = Instant::now() + inner.config.fault.timeout();
        loop {
            let slot = inner.wait_writeback(id, deadline)?;
            let flags = slot.flags();
            if flags.contains(ObjectFlags::IDENTICAL_ZERO_PAGE) {
                return Ok(inner.store.compressor().zero_page());
            }
            match slot.handle() {
                Handle::Empty => return Err(SwapError::ObjectMissing(id)),
                Handle::Ram(payload) => {
                    let payload = payload.clone();
                    drop(slot);
                    inner.touch(id);
                    let raw = flags.contains(ObjectFlags::INCOMPRESSIBLE);
                    return Ok(inner.store.compressor().decompress(&payload, raw)?);
                }
                Handle::Disk(_) => {
                    drop(slot);
                    self.fault_out(id)?;
                }
            }
        }
    }

    /// Untrack an object and empty its slot.
    pub fn remove(&self, id: ObjectId) -> Result<()> {
        self.inner.check_object(id)?;
        if self.inner.release_object(id, None, true)? {
            Ok(())
        } else {
            Err(SwapError::ObjectMissing(id))
        }
    }

    /// Attribute a RAM-resident, untracked object to `owner` and put it at
    /// the hot end of the owner's LRU.
    pub fn track(&self, owner: OwnerId, id: ObjectId) -> Result<()> {
        self.inner.check_object(id)?;
        let owner = self.inner.owner(owner)?;
        self.inner.track_owner(&owner, id)
    }

    /// Detach an object from `owner` ahead of its removal, waiting out any
    /// write-back in progress. A RAM object stays readable but unattributed;
    /// a disk-resident object loses its extent slot and its data.
    pub fn untrack(&self, owner: OwnerId, id: ObjectId) -> Result<()> {
        self.inner.check_object(id)?;
        if !self.inner.owners.is_valid(owner) {
            return Err(SwapError::InvalidOwner(owner));
        }
        if self.inner.release_object(id, Some(owner), false)? {
            Ok(())
        } else {
            Err(SwapError::ObjectMissing(id))
        }
    }

    /// Turn reclaim on or off for the whole engine.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Set an owner's target disk share in percent.
    pub fn set_owner_ratio(&self, owner: OwnerId, percent: u32) -> Result<()> {
        self.inner.owner(owner)?.set_ratio(percent);
        Ok(())
    }

    pub fn set_owner_enabled(&self, owner: OwnerId, enabled: bool) -> Result<()> {
        self.inner.owner(owner)?.set_enabled(enabled);
        Ok(())
    }

    /// Counters of a registered owner.
    pub fn owner_stats(&self, owner: OwnerId) -> Option<OwnerStats> {
        self.inner.owners.get(owner).map(|o| o.stats())
    }

    /// Ids of every registered owner.
    pub fn owners(&self) -> Vec<OwnerId> {
        self.inner.owners.owners().iter().map(|o| o.id()).collect()
    }

    /// Flags of an object, for observers that coordinate with write-back.
    pub fn object_flags(&self, id: ObjectId) -> Result<ObjectFlags> {
        self.inner.check_object(id)?;
        Ok(self.inner.store.object_flags(id))
    }

    /// Whether an object's payload currently lives in an extent.
    pub fn is_on_disk(&self, id: ObjectId) -> Result<bool> {
        self.inner.check_object(id)?;
        Ok(self.inner.store.lock(id).disk_addr().is_some())
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let sched = inner.sched.stats();
        EngineStats {
            extent_capacity: inner.space.capacity(),
            live_extents: inner.space.live_extents(),
            fragments: inner.space.fragments(),
            utilization: inner.space.utilization(),
            owners: inner.owners.owners().len(),
            in_flight: inner.sched.in_flight(),
            segments_submitted: sched.segments_submitted,
            entries_completed: sched.entries_completed,
            entries_failed: sched.entries_failed,
        }
    }

    /// Check the cross-structure invariants. Only meaningful while no
    /// operation is running.
    ///
    /// # Panics
    ///
    /// On any inconsistency between bitmap, owners, extent live counts,
    /// reverse maps and owner counters.
    pub fn assert_consistent(&self) {
        let inner = &self.inner;
        let space = &inner.space;
        let layout = *inner.objs.layout();

        let mut per_owner = vec![0usize; layout.owners + 1];
        for e in 0..space.capacity() {
            let owner = space.owner_of(e);
            assert_eq!(
                space.is_allocated(e),
                owner != NO_OWNER,
                "extent {e}: bitmap and owner disagree"
            );
            if owner != NO_OWNER {
                per_owner[owner as usize] += 1;
            }
        }
        for (owner, &count) in per_owner.iter().enumerate() {
            assert_eq!(
                count,
                space.owner_extents(owner as OwnerId),
                "owner {owner}: extent count mismatch"
            );
        }
        assert_eq!(per_owner.iter().sum::<usize>(), space.live_extents());
        assert_eq!(space.fragments(), space.count_fragments(), "fragment counter drifted");

        let mut refs = vec![0u32; space.capacity()];
        let mut owner_totals = vec![OwnerStats::default(); layout.owners + 1];
        for id in 0..layout.objects {
            let slot = inner.store.lock(id);
            let owner = inner.objs.owner(id);
            assert!(
                !slot.flags().intersects(ObjectFlags::WRITEBACK),
                "object {id} left under write-back"
            );
            if let Some(addr) = slot.disk_addr() {
                assert!(space.is_allocated(addr.extent), "object {id} points at free extent");
                assert_eq!(
                    owner,
                    space.owner_of(addr.extent),
                    "object {id}: reverse map owner mismatch"
                );
                refs[addr.extent] += 1;
                owner_totals[owner as usize].disk_bytes += u64::from(slot.size());
                owner_totals[owner as usize].disk_objects += 1;
            } else if slot.payload().is_some() && owner != NO_OWNER {
                assert!(inner.objs.is_linked(id), "object {id} tracked but not on its LRU");
                owner_totals[owner as usize].ram_bytes += u64::from(slot.size());
                owner_totals[owner as usize].ram_objects += 1;
            }
        }
        for (e, &count) in refs.iter().enumerate() {
            assert_eq!(space.live_objects(e), count, "extent {e}: live count mismatch");
            let listed = inner.objs.lock(layout.extent(e)).len() as u32;
            assert_eq!(listed, count, "extent {e}: reverse map length mismatch");
        }
        for owner in inner.owners.owners() {
            assert_eq!(
                owner.stats(),
                owner_totals[owner.id() as usize],
                "owner {}: counters drifted",
                owner.id()
            );
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.sched.shutdown();
        let _ = self.inner.free_tx.send(FreeMsg::Stop);
        if let Some(worker) = self.free_worker.take() {
            if worker.join().is_err() {
                warn!("Free worker panicked");
            }
        }
        debug!("Engine stopped");
    }
}

impl EngineInner {
    fn check_object(&self, id: ObjectId) -> Result<()> {
        if self.store.contains(id) {
            Ok(())
        } else {
            Err(SwapError::InvalidObject(id))
        }
    }

    /// Look up an owner, creating it on first use.
    fn owner(&self, id: OwnerId) -> Result<Arc<Owner>> {
        let ratio = self.config.reclaim.default_ratio;
        self.owners
            .get_or_create(id, || {
                Owner::new(
                    id,
                    self.objs.layout().owner_head(id),
                    self.space.owner_head(id),
                    ratio,
                )
            })
            .ok_or(SwapError::InvalidOwner(id))
    }

    /// Look up an owner that must already exist.
    fn registered_owner(&self, id: OwnerId) -> Result<Arc<Owner>> {
        if !self.owners.is_valid(id) {
            return Err(SwapError::InvalidOwner(id));
        }
        self.owners.get(id).ok_or(SwapError::NotEligible {
            owner: id,
            reason: "owner is not registered",
        })
    }

    fn extent_size(&self) -> usize {
        self.config.geometry.extent_size
    }

    fn extent_offset(&self, extent: ExtentId) -> u64 {
        extent as u64 * self.extent_size() as u64
    }

    /// Lock an object slot once no write-back flag is set.
    fn wait_writeback(&self, id: ObjectId, deadline: Instant) -> Result<MutexGuard<'_, SlotState>> {
        let mut slot = self.store.lock(id);
        while slot.flags().intersects(ObjectFlags::WRITEBACK) {
            let now = Instant::now();
            if now >= deadline {
                return Err(SwapError::Timeout(self.config.fault.timeout()));
            }
            self.store.wait(id, &mut slot, deadline - now);
        }
        Ok(slot)
    }

    /// The list head an object sits on, judged from its slot.
    fn list_of(&self, id: ObjectId, slot: &SlotState) -> Option<usize> {
        match slot.handle() {
            Handle::Empty => None,
            Handle::Disk(addr) => Some(self.objs.layout().extent(addr.extent)),
            Handle::Ram(_) => {
                let owner = self.objs.owner(id);
                (owner != NO_OWNER).then(|| self.objs.layout().owner_head(owner))
            }
        }
    }

    /// Lock an object and the list holding it, in lock order, with no
    /// write-back in flight.
    fn lock_object(&self, id: ObjectId) -> Result<Locked<'_>> {
        let deadline = Instant::now() + self.config.fault.timeout();
        loop {
            let slot = self.wait_writeback(id, deadline)?;
            let Some(head) = self.list_of(id, &slot) else {
                return Ok(Locked { slot, list: None });
            };
            drop(slot);

            let list = self.objs.lock(head);
            let slot = self.store.lock(id);
            if !slot.flags().intersects(ObjectFlags::WRITEBACK) && self.list_of(id, &slot) == Some(head)
            {
                return Ok(Locked {
                    slot,
                    list: Some(list),
                });
            }
        }
    }

    fn track_owner(&self, owner: &Owner, id: ObjectId) -> Result<()> {
        let lru = self.objs.lock(owner.ram_head());
        let slot = self.store.lock(id);
        if slot.payload().is_none() {
            return Err(SwapError::ObjectMissing(id));
        }
        match self.objs.owner(id) {
            NO_OWNER => {}
            current if current == owner.id() => return Ok(()),
            _ => {
                return Err(SwapError::NotEligible {
                    owner: owner.id(),
                    reason: "object is tracked by another owner",
                })
            }
        }
        // A draining owner takes no new objects; they stay unattributed.
        if !owner.is_alive() {
            return Ok(());
        }
        self.objs.set_owner(id, owner.id());
        lru.insert_head(id);
        owner.add_ram(u64::from(slot.size()));
        Ok(())
    }

    /// Take an object off whatever list holds it and undo its accounting.
    /// With `drop_payload` the slot is emptied too; a disk-resident object
    /// is always emptied since its extent slot goes away. Returns whether
    /// the slot held anything.
    fn release_object(
        &self,
        id: ObjectId,
        expect_owner: Option<OwnerId>,
        drop_payload: bool,
    ) -> Result<bool> {
        let Locked { mut slot, list } = self.lock_object(id)?;
        if slot.is_empty() {
            return Ok(false);
        }
        let owner_id = self.objs.owner(id);
        if let Some(expected) = expect_owner {
            if expected != owner_id {
                return Err(SwapError::NotEligible {
                    owner: expected,
                    reason: "object is tracked by another owner",
                });
            }
        }
        let owner = self.owners.get(owner_id);
        let size = u64::from(slot.size());

        let mut emptied_extent = None;
        if let Some(addr) = slot.disk_addr() {
            if let Some(list) = &list {
                list.remove(id);
            }
            if let Some(owner) = &owner {
                owner.sub_disk(size);
            }
            if self.space.sub_live(addr.extent, size) == 0 {
                emptied_extent = Some(addr.extent);
            }
            slot.reset();
        } else {
            if let Some(list) = &list {
                list.remove(id);
                if let Some(owner) = &owner {
                    owner.sub_ram(size);
                }
            }
            if drop_payload {
                slot.reset();
            }
        }
        self.objs.set_owner(id, NO_OWNER);
        drop(slot);
        drop(list);
        self.store.notify(id);

        if let Some(extent) = emptied_extent {
            self.notify_free(extent);
        }
        Ok(true)
    }

    /// Move a RAM object to the hot end of its owner's LRU.
    fn touch(&self, id: ObjectId) {
        let owner = self.objs.owner(id);
        if owner == NO_OWNER {
            return;
        }
        let lru = self.objs.lock(self.objs.layout().owner_head(owner));
        let slot = self.store.lock(id);
        if slot.payload().is_some()
            && !slot.flags().intersects(ObjectFlags::WRITEBACK)
            && self.objs.owner(id) == owner
            && self.objs.is_linked(id)
        {
            lru.remove(id);
            lru.insert_head(id);
        }
    }

    /// Hand a claimed extent back: link it into its owner's LRU, wake
    /// waiters, and queue it for freeing if nothing in it is live.
    fn release_extent(&self, extent: ExtentId) {
        self.space.release_exclusive(extent);
        self.waits.notify(extent);
        if self.space.live_objects(extent) == 0 {
            self.notify_free(extent);
        }
    }

    /// Back-off step for the next wait.
    fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.config.fault.backoff_max())
    }
}
