//! Promotion of extents back into the RAM tier.
//!
//! Every promotion reads a whole extent and redistributes each record whose
//! object still points at it, so one fault also serves the extent's
//! neighbours. Three entry points:
//! - fault-out: one object, synchronous, never throttled
//! - batch-out: an owner's most recently used extents, synchronous
//! - pre-out: the same, fire-and-forget
//!
//! An extent being read is claimed and detached from its owner's LRU. A
//! fault that finds its extent claimed waits on the extent's condvar with
//! exponential back-off and re-checks the object on every wake.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::{Engine, EngineInner, Progress};
use crate::error::{Result, SwapError};
use crate::extent::layout::records;
use crate::extent::{ExtentAddr, ExtentId};
use crate::io::{IoEntry, IoFailure, IoRequest, Scenario};
use crate::owner::{Owner, OwnerId, NO_OWNER};
use crate::store::{Handle, ObjectFlags, ObjectId};

const WAIT_SHARDS: usize = 64;

/// Condvars for threads waiting on a busy extent, sharded by extent id.
pub(super) struct ExtentWaits {
    shards: Box<[(Mutex<()>, Condvar)]>,
}

impl ExtentWaits {
    pub(super) fn new() -> Self {
        Self {
            shards: (0..WAIT_SHARDS)
                .map(|_| (Mutex::new(()), Condvar::new()))
                .collect(),
        }
    }

    pub(super) fn notify(&self, extent: ExtentId) {
        let (lock, cond) = &self.shards[extent % WAIT_SHARDS];
        let _guard = lock.lock();
        cond.notify_all();
    }

    /// Sleep up to `timeout` unless `still_busy` already says otherwise.
    pub(super) fn wait(&self, extent: ExtentId, timeout: Duration, still_busy: impl FnOnce() -> bool) {
        let (lock, cond) = &self.shards[extent % WAIT_SHARDS];
        let mut guard = lock.lock();
        if still_busy() {
            cond.wait_for(&mut guard, timeout);
        }
    }
}

/// What a promotion moved back into RAM.
///
/// For pre-out the figures describe what was queued: `bytes` is the live
/// size of the queued extents and `objects` stays zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromoteReport {
    pub bytes: u64,
    pub objects: u64,
    pub extents: u64,
    pub failure: Option<IoFailure>,
}

impl PromoteReport {
    fn from_progress(progress: &Progress) -> Self {
        Self {
            bytes: progress.bytes(),
            objects: progress.objects(),
            extents: progress.extents(),
            failure: progress.failure(),
        }
    }
}

impl Engine {
    /// Bring the extent holding `id` back into RAM. Returns an empty report
    /// when the object is not on disk (anymore).
    pub fn fault_out(&self, id: ObjectId) -> Result<PromoteReport> {
        let inner = &self.inner;
        inner.check_object(id)?;
        let fault = &inner.config.fault;
        let deadline = Instant::now() + fault.timeout();
        let mut backoff = fault.backoff_min();

        loop {
            let addr = {
                let slot = inner.wait_writeback(id, deadline)?;
                match slot.disk_addr() {
                    Some(addr) => addr,
                    None => return Ok(PromoteReport::default()),
                }
            };
            let extent = addr.extent;

            if inner.space.claim_exclusive(extent) {
                if inner.store.lock(id).disk_addr() != Some(addr) {
                    // Object moved between lookup and claim.
                    inner.release_extent(extent);
                    continue;
                }
                inner.space.detach(extent);

                let progress = Arc::new(Progress::default());
                let mut req = inner.start_promotion(Scenario::FaultOut, progress.clone());
                req.submit(inner.read_entry(extent))?;
                req.finish();

                let report = PromoteReport::from_progress(&progress);
                if let Some(failure) = report.failure {
                    return Err(SwapError::Io(failure));
                }
                debug!(object = id, extent, objects = report.objects, "Fault promoted extent");
                return Ok(report);
            }

            if Instant::now() >= deadline {
                return Err(SwapError::Timeout(fault.timeout()));
            }
            inner.waits.wait(extent, backoff, || {
                inner.store.lock(id).disk_addr() == Some(addr) && !inner.space.test_exclusive(extent)
            });
            backoff = inner.next_backoff(backoff);
        }
    }

    /// Promote the owner's most recently used extents until `bytes` of live
    /// data came back or no extent is left. Waits for the reads.
    pub fn batch_out(&self, owner: OwnerId, bytes: u64) -> Result<PromoteReport> {
        let inner = &self.inner;
        let owner = inner.registered_owner(owner)?;
        let _serial = owner.lock_reclaim();
        inner.begin_bulk_promotion(&owner)?;

        let progress = Arc::new(Progress::default());
        let mut req = inner.start_promotion(Scenario::BatchOut, progress.clone());
        inner.queue_promotions(&owner, bytes, &mut req);
        req.finish();
        owner.end_promotion();

        let report = PromoteReport::from_progress(&progress);
        info!(
            owner = owner.id(),
            requested = bytes,
            bytes = report.bytes,
            objects = report.objects,
            extents = report.extents,
            failed = report.failure.is_some(),
            "Batch-out finished"
        );
        Ok(report)
    }

    /// Queue promotion of the owner's most recently used extents and return
    /// without waiting. The owner stays in promotion until the last read
    /// completes.
    pub fn pre_out(&self, owner: OwnerId, bytes: u64) -> Result<PromoteReport> {
        let inner = &self.inner;
        let owner = inner.registered_owner(owner)?;
        let _serial = owner.lock_reclaim();
        inner.begin_bulk_promotion(&owner)?;

        let progress = Arc::new(Progress::default());
        let mut req = inner.start_promotion(Scenario::PreOut, progress.clone());
        {
            let owner = owner.clone();
            req.on_release(move || {
                owner.end_promotion();
                debug!(
                    owner = owner.id(),
                    bytes = progress.bytes(),
                    extents = progress.extents(),
                    "Pre-out completed"
                );
            });
        }
        let (queued, extents) = inner.queue_promotions(&owner, bytes, &mut req);
        req.finish();

        debug!(owner = owner.id(), queued, extents, "Pre-out queued");
        Ok(PromoteReport {
            bytes: queued,
            objects: 0,
            extents,
            failure: None,
        })
    }
}

impl EngineInner {
    fn begin_bulk_promotion(&self, owner: &Owner) -> Result<()> {
        if !owner.is_alive() {
            return Err(SwapError::NotEligible {
                owner: owner.id(),
                reason: "owner is being destroyed",
            });
        }
        if !owner.begin_promotion() {
            return Err(SwapError::NotEligible {
                owner: owner.id(),
                reason: "promotion already in progress",
            });
        }
        Ok(())
    }

    /// Open a read request whose completions redistribute extents into RAM.
    pub(super) fn start_promotion(
        self: &Arc<Self>,
        scenario: Scenario,
        progress: Arc<Progress>,
    ) -> IoRequest<ExtentId> {
        let inner = self.clone();
        self.sched
            .start(scenario, move |entry: IoEntry<ExtentId>, status| {
                inner.complete_promotion(entry, status, &progress)
            })
    }

    fn read_entry(&self, extent: ExtentId) -> IoEntry<ExtentId> {
        IoEntry::new(
            self.extent_offset(extent),
            BytesMut::zeroed(self.extent_size()),
            extent,
        )
    }

    /// Claim and detach the owner's extents from the hot end and queue their
    /// reads until `bytes` of live data are queued. Returns the queued bytes
    /// and extent count.
    pub(super) fn queue_promotions(
        &self,
        owner: &Owner,
        bytes: u64,
        req: &mut IoRequest<ExtentId>,
    ) -> (u64, u64) {
        let mut queued = 0u64;
        let mut extents = 0u64;
        while queued < bytes {
            let Some(extent) = self.claim_mru_extent(owner) else {
                break;
            };
            self.space.detach(extent);
            queued += self.space.live_bytes(extent);
            extents += 1;
            // A refused entry already went through its failure completion.
            if req.submit(self.read_entry(extent)).is_err() {
                break;
            }
        }
        (queued, extents)
    }

    fn claim_mru_extent(&self, owner: &Owner) -> Option<ExtentId> {
        let lru = self.space.table().lock(owner.ext_head());
        lru.iter()
            .map(|node| self.space.extent_of_node(node))
            .find(|&extent| self.space.claim_exclusive(extent))
    }

    fn complete_promotion(
        &self,
        entry: IoEntry<ExtentId>,
        status: std::result::Result<(), IoFailure>,
        progress: &Progress,
    ) {
        let extent = entry.ctx;
        let outcome = status.and_then(|()| self.redistribute(extent, &entry.buf));
        match outcome {
            Ok((bytes, objects)) => {
                self.space.free(extent);
                self.waits.notify(extent);
                progress.record(bytes, objects);
            }
            Err(failure) => {
                warn!(extent, error = %failure, "Extent promotion failed, keeping it on disk");
                self.release_extent(extent);
                progress.fail(failure);
            }
        }
    }

    /// Move every record of `image` whose object still points at `extent`
    /// back into RAM. Returns the bytes and objects moved.
    fn redistribute(
        &self,
        extent: ExtentId,
        image: &[u8],
    ) -> std::result::Result<(u64, u64), IoFailure> {
        let owner = self.owners.get(self.space.owner_of(extent));
        let lru = owner.as_ref().map(|o| self.objs.lock(o.ram_head()));
        let rmap = self.objs.lock(self.objs.layout().extent(extent));

        let mut bytes = 0u64;
        let mut moved = Vec::new();
        for record in records(image) {
            if !self.store.contains(record.object) {
                warn!(extent, object = record.object, "Record for unknown object");
                continue;
            }
            let here = ExtentAddr {
                extent,
                offset: record.offset,
            };
            let mut slot = self.store.lock(record.object);
            if slot.disk_addr() != Some(here) {
                continue;
            }
            let size = u64::from(slot.size());
            debug_assert_eq!(size, record.payload.len() as u64);

            rmap.remove(record.object);
            slot.set_handle(Handle::Ram(Bytes::copy_from_slice(record.payload)));
            slot.clear_flag(ObjectFlags::RESIDENT_ON_DISK);
            self.space.sub_live(extent, size);
            match (&owner, &lru) {
                (Some(owner), Some(lru)) => {
                    lru.insert_head(record.object);
                    owner.sub_disk(size);
                    owner.add_ram(size);
                }
                _ => self.objs.set_owner(record.object, NO_OWNER),
            }
            bytes += size;
            moved.push(record.object);
        }
        drop(rmap);
        drop(lru);

        for &id in &moved {
            self.store.notify(id);
        }
        if self.space.live_objects(extent) != 0 {
            return Err(IoFailure::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "extent {extent} image lacks {} live records",
                    self.space.live_objects(extent)
                ),
            ));
        }
        Ok((bytes, moved.len() as u64))
    }
}
