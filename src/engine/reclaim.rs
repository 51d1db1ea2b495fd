//! Reclaim-in: write-back of an owner's cold RAM objects into extents.
//!
//! Each round allocates one extent, packs objects from the cold end of the
//! owner's LRU into a staging buffer, unlinks them and submits the buffer.
//! Packed objects carry `WRITEBACK_PENDING` while the extent is being
//! filled and `WRITEBACK_IN_PROGRESS` from hand-off to the scheduler until
//! the write completes, so readers and removers wait instead of racing the
//! move.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{Engine, EngineInner, Progress};
use crate::error::{Result, SwapError};
use crate::extent::{ExtentAddr, ExtentError, ExtentId, ExtentWriter, PackedObject};
use crate::io::{IoEntry, IoFailure, Scenario};
use crate::owner::{Owner, OwnerId};
use crate::store::{Handle, ObjectFlags};

const QUOTA_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Bytes that may be reclaimed per day, across owners.
#[derive(Debug)]
pub(super) struct DailyQuota {
    limit: u64,
    used: u64,
    window_start: Instant,
}

impl DailyQuota {
    /// A zero limit means unbounded.
    pub(super) fn new(limit: u64) -> Self {
        Self {
            limit,
            used: 0,
            window_start: Instant::now(),
        }
    }

    fn remaining(&mut self, now: Instant) -> u64 {
        if self.limit == 0 {
            return u64::MAX;
        }
        if now.duration_since(self.window_start) >= QUOTA_WINDOW {
            self.used = 0;
            self.window_start = now;
        }
        self.limit.saturating_sub(self.used)
    }

    fn charge(&mut self, bytes: u64) {
        self.used = self.used.saturating_add(bytes);
    }
}

/// What one reclaim-in call moved to disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub owner: OwnerId,
    /// Bytes the call aimed to move.
    pub target: u64,
    pub bytes: u64,
    pub objects: u64,
    pub extents: u64,
    /// Stopped early because every extent is allocated.
    pub out_of_space: bool,
    pub failure: Option<IoFailure>,
}

/// Completion context of one extent write.
struct WriteBack {
    extent: ExtentId,
    owner: Arc<Owner>,
    objects: Vec<PackedObject>,
}

impl Engine {
    /// Move cold objects of `owner` to disk until its disk share reaches the
    /// configured ratio, or its whole RAM size with `force`.
    pub fn reclaim_in(&self, owner: OwnerId, force: bool) -> Result<ReclaimReport> {
        let inner = &self.inner;
        let owner = inner.registered_owner(owner)?;
        let not_eligible = |reason| SwapError::NotEligible {
            owner: owner.id(),
            reason,
        };

        if !inner.config.reclaim.enabled || !inner.enabled.load(Ordering::Relaxed) {
            return Err(not_eligible("reclaim is disabled"));
        }
        let _serial = owner.lock_reclaim();
        if !owner.is_alive() {
            return Err(not_eligible("owner is being destroyed"));
        }
        if !owner.is_enabled() {
            return Err(not_eligible("reclaim is disabled for this owner"));
        }
        if owner.in_promotion() {
            return Err(not_eligible("promotion in progress"));
        }

        let knobs = &inner.config.reclaim;
        let mut target = if force {
            owner.ram_bytes()
        } else {
            owner.reclaimable()
        };
        if !force && (target == 0 || target < knobs.min_reclaim_bytes) {
            return Err(not_eligible("reclaimable size below threshold"));
        }
        if knobs.max_reclaim_bytes > 0 {
            target = target.min(knobs.max_reclaim_bytes);
        }
        if !force {
            target = target.min(inner.quota.lock().remaining(Instant::now()));
            if target == 0 {
                return Err(not_eligible("daily reclaim quota exhausted"));
            }
        }

        let progress = Arc::new(Progress::default());
        let mut req = {
            let sched = inner.sched.clone();
            let inner = inner.clone();
            let progress = progress.clone();
            sched.start(
                Scenario::ReclaimIn,
                move |entry: IoEntry<WriteBack>, status| {
                    inner.complete_writeback(entry.ctx, status, &progress)
                },
            )
        };

        let mut queued = 0u64;
        let mut out_of_space = false;
        while queued < target && progress.failure().is_none() {
            let extent = match inner.space.allocate(owner.id()) {
                Ok(extent) => extent,
                Err(ExtentError::NoSpace { .. }) => {
                    out_of_space = true;
                    break;
                }
            };
            let Some(writer) = inner.pack_extent(&owner, extent, target - queued) else {
                // Nothing eligible left.
                inner.space.free(extent);
                break;
            };
            queued += writer.payload_bytes();
            let (buf, objects) = writer.finish();
            inner.mark_in_progress(&objects);

            let entry = IoEntry::new(
                inner.extent_offset(extent),
                buf,
                WriteBack {
                    extent,
                    owner: owner.clone(),
                    objects,
                },
            );
            if req.submit(entry).is_err() {
                break;
            }
        }
        req.finish();

        let report = ReclaimReport {
            owner: owner.id(),
            target,
            bytes: progress.bytes(),
            objects: progress.objects(),
            extents: progress.extents(),
            out_of_space,
            failure: progress.failure(),
        };
        if !force {
            inner.quota.lock().charge(report.bytes);
        }
        if out_of_space && report.bytes == 0 {
            return Err(ExtentError::NoSpace {
                capacity: inner.space.capacity(),
            }
            .into());
        }
        info!(
            owner = report.owner,
            target = report.target,
            bytes = report.bytes,
            objects = report.objects,
            extents = report.extents,
            out_of_space = report.out_of_space,
            failed = report.failure.is_some(),
            "Reclaim-in finished"
        );
        Ok(report)
    }
}

impl EngineInner {
    /// Fill a staging buffer from the cold end of the owner's LRU, up to
    /// `budget` payload bytes. Returns `None` if nothing was packed.
    fn pack_extent(&self, owner: &Owner, extent: ExtentId, budget: u64) -> Option<ExtentWriter> {
        let mut writer = ExtentWriter::new(self.extent_size());
        let lru = self.objs.lock(owner.ram_head());
        for id in lru.iter_rev_safe() {
            if writer.payload_bytes() >= budget {
                break;
            }
            let mut slot = self.store.lock(id);
            if slot.flags().intersects(
                ObjectFlags::WRITEBACK
                    | ObjectFlags::IDENTICAL_ZERO_PAGE
                    | ObjectFlags::RESIDENT_ON_DISK,
            ) {
                continue;
            }
            let Some(payload) = slot.payload() else {
                continue;
            };
            if !writer.fits(payload.len()) {
                break;
            }
            if writer.push(id, payload).is_none() {
                break;
            }
            slot.set_flag(ObjectFlags::WRITEBACK_PENDING);
            lru.remove(id);
        }
        drop(lru);

        if writer.is_empty() {
            return None;
        }
        debug!(
            owner = owner.id(),
            extent,
            objects = writer.objects().len(),
            bytes = writer.payload_bytes(),
            "Packed extent"
        );
        Some(writer)
    }

    fn mark_in_progress(&self, objects: &[PackedObject]) {
        for packed in objects {
            let mut slot = self.store.lock(packed.object);
            slot.clear_flag(ObjectFlags::WRITEBACK_PENDING);
            slot.set_flag(ObjectFlags::WRITEBACK_IN_PROGRESS);
        }
    }

    fn complete_writeback(
        &self,
        wb: WriteBack,
        status: std::result::Result<(), IoFailure>,
        progress: &Progress,
    ) {
        let WriteBack {
            extent,
            owner,
            objects,
        } = wb;

        if let Err(failure) = status {
            warn!(
                owner = owner.id(),
                extent,
                objects = objects.len(),
                error = %failure,
                "Write-back failed, restoring objects to RAM"
            );
            {
                // Packed coldest first; the coldest must end up at the tail.
                let lru = self.objs.lock(owner.ram_head());
                for packed in objects.iter().rev() {
                    let mut slot = self.store.lock(packed.object);
                    slot.clear_flag(ObjectFlags::WRITEBACK);
                    lru.insert_tail(packed.object);
                }
            }
            for packed in &objects {
                self.store.notify(packed.object);
            }
            self.space.free(extent);
            progress.fail(failure);
            return;
        }

        let mut bytes = 0u64;
        {
            let rmap = self.objs.lock(self.objs.layout().extent(extent));
            for packed in &objects {
                let len = u64::from(packed.len);
                let mut slot = self.store.lock(packed.object);
                slot.set_handle(Handle::Disk(ExtentAddr {
                    extent,
                    offset: packed.offset,
                }));
                slot.set_flag(ObjectFlags::RESIDENT_ON_DISK);
                slot.clear_flag(ObjectFlags::WRITEBACK);
                rmap.insert_tail(packed.object);
                self.space.add_live(extent, len);
                owner.sub_ram(len);
                owner.add_disk(len);
                bytes += len;
            }
        }
        for packed in &objects {
            self.store.notify(packed.object);
        }
        progress.record(bytes, objects.len() as u64);
        debug!(owner = owner.id(), extent, objects = objects.len(), bytes, "Extent written back");
        self.release_extent(extent);
    }
}
