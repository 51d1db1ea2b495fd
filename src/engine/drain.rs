//! Owner teardown.
//!
//! A destroyed owner is drained rather than orphaned: every extent it owns
//! is promoted back into RAM and freed, then its RAM LRU is emptied and the
//! objects are left unattributed. Only then is the registry slot released,
//! so an allocated extent never outlives its owner.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{Engine, EngineInner, Progress};
use crate::error::{Result, SwapError};
use crate::extent::ExtentId;
use crate::io::Scenario;
use crate::owner::{Owner, OwnerId, NO_OWNER};

/// What tearing down an owner did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub owner: OwnerId,
    /// Extents promoted back into RAM.
    pub extents: u64,
    /// Objects promoted back into RAM.
    pub promoted: u64,
    /// Bytes promoted back into RAM.
    pub bytes: u64,
    /// RAM objects left unattributed.
    pub released: u64,
}

impl Engine {
    /// Drain and unregister `owner`. On an I/O error the owner stays
    /// registered but dead, keeping the extents that failed, and a later
    /// call resumes the drain.
    pub fn destroy_owner(&self, owner: OwnerId) -> Result<DrainReport> {
        let inner = &self.inner;
        if !inner.owners.is_valid(owner) {
            return Err(SwapError::InvalidOwner(owner));
        }
        let Some(owner) = inner.owners.get(owner) else {
            return Ok(DrainReport {
                owner,
                ..DrainReport::default()
            });
        };

        let _serial = owner.lock_reclaim();
        owner.mark_dead();

        let fault = &inner.config.fault;
        let deadline = Instant::now() + fault.timeout();
        let mut backoff = fault.backoff_min();
        if !owner.wait_promotion(deadline) {
            return Err(SwapError::Timeout(fault.timeout()));
        }

        let progress = Arc::new(Progress::default());
        loop {
            let mut req = inner.start_promotion(Scenario::BatchOut, progress.clone());
            let (_, queued) = inner.queue_promotions(&owner, u64::MAX, &mut req);
            req.finish();

            if let Some(failure) = progress.failure() {
                warn!(owner = owner.id(), error = %failure, "Owner drain interrupted");
                return Err(SwapError::Io(failure));
            }
            if inner.space.owner_extents(owner.id()) == 0 {
                break;
            }
            if queued == 0 {
                // Remaining extents are claimed by faults or the free worker.
                if Instant::now() >= deadline {
                    return Err(SwapError::Timeout(fault.timeout()));
                }
                if let Some(extent) = inner.claimed_extent_of(owner.id()) {
                    inner.waits.wait(extent, backoff, || {
                        !inner.space.test_exclusive(extent) && inner.space.owner_of(extent) == owner.id()
                    });
                }
                backoff = inner.next_backoff(backoff);
            }
        }

        let released = inner.release_lru(&owner);
        inner.owners.remove(owner.id());

        let report = DrainReport {
            owner: owner.id(),
            extents: progress.extents(),
            promoted: progress.objects(),
            bytes: progress.bytes(),
            released,
        };
        info!(
            owner = report.owner,
            extents = report.extents,
            promoted = report.promoted,
            released = report.released,
            "Owner destroyed"
        );
        Ok(report)
    }
}

impl EngineInner {
    /// Any extent of `owner` currently claimed by someone else.
    fn claimed_extent_of(&self, owner: OwnerId) -> Option<ExtentId> {
        (0..self.space.capacity())
            .find(|&e| self.space.owner_of(e) == owner && !self.space.test_exclusive(e))
    }

    /// Unlink every object of the owner's RAM LRU and attribute it to nobody.
    fn release_lru(&self, owner: &Owner) -> u64 {
        let lru = self.objs.lock(owner.ram_head());
        let mut released = 0;
        for id in lru.iter_safe() {
            let slot = self.store.lock(id);
            lru.remove(id);
            self.objs.set_owner(id, NO_OWNER);
            owner.sub_ram(u64::from(slot.size()));
            released += 1;
        }
        debug!(owner = owner.id(), released, "Released RAM objects");
        released
    }
}
