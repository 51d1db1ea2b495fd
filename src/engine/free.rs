//! Background release of extents whose last live object was removed.
//!
//! Removal decrements an extent's live count under its reverse-map lock.
//! Whoever brings it to zero queues the extent here instead of freeing it
//! inline, because the extent may be claimed by a write-back or promotion
//! at that moment. The worker frees the extent only if it wins the claim;
//! otherwise the claim holder frees or re-links it.

use std::io;
use std::sync::Weak;
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::{Engine, EngineInner};
use crate::extent::ExtentId;

pub(super) enum FreeMsg {
    Extent(ExtentId),
    /// Acknowledge once everything queued before it is handled.
    Sync(oneshot::Sender<()>),
    Stop,
}

pub(super) fn spawn_worker(
    inner: Weak<EngineInner>,
    mut rx: mpsc::UnboundedReceiver<FreeMsg>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("hybridswap-free".into())
        .spawn(move || {
            while let Some(msg) = rx.blocking_recv() {
                match msg {
                    FreeMsg::Extent(extent) => {
                        let Some(inner) = inner.upgrade() else { break };
                        inner.free_if_empty(extent);
                    }
                    FreeMsg::Sync(ack) => {
                        let _ = ack.send(());
                    }
                    FreeMsg::Stop => break,
                }
            }
            debug!("Free worker stopped");
        })
}

impl EngineInner {
    /// Queue an extent whose live count reached zero.
    pub(super) fn notify_free(&self, extent: ExtentId) {
        if let Err(err) = self.free_tx.send(FreeMsg::Extent(extent)) {
            // Worker gone during shutdown; do it here.
            if let FreeMsg::Extent(extent) = err.0 {
                self.free_if_empty(extent);
            }
        }
    }

    pub(super) fn free_if_empty(&self, extent: ExtentId) {
        let space = &self.space;
        if !space.is_allocated(extent) || space.live_objects(extent) != 0 {
            return;
        }
        if !space.claim_exclusive(extent) {
            trace!(extent, "Empty extent busy, claim holder will free it");
            return;
        }
        if space.live_objects(extent) == 0 {
            space.detach(extent);
            space.free(extent);
            debug!(extent, "Freed empty extent");
        } else {
            space.release_exclusive(extent);
        }
        self.waits.notify(extent);
    }
}

impl Engine {
    /// Block until every extent queued for freeing so far is handled.
    pub fn sync_frees(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.free_tx.send(FreeMsg::Sync(tx)).is_ok() {
            let _ = rx.blocking_recv();
        }
    }
}
