//! I/O scheduler: coalesces extent transfers into block transfers.
//!
//! A caller opens an [`IoRequest`] for one scenario and submits entries
//! (device address, buffer, caller context). Entries that are contiguous on
//! the device are merged into a segment, at either end, until the segment
//! would exceed `max_batch_bytes`; the segment is then handed to the device
//! as one gather/scatter transfer. Completions call the request's `done`
//! callback once per entry, in address order within a segment.
//!
//! Write-back and prefetch are throttled: admission blocks while the
//! scheduler-wide in-flight entry count sits at the ceiling. Faults and
//! synchronous promotion always pass.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::IoConfig;
use crate::io::device::{BackingDevice, BlockIo, Completion, Direction, IoFailure};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    #[error("I/O scheduler is shutting down")]
    ShuttingDown,
}

/// Why a request is issued. Decides direction, completion policy and
/// whether admission is throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// RAM → disk write-back.
    ReclaimIn,
    /// Synchronous read of one extent for a faulting object.
    FaultOut,
    /// Synchronous bulk promotion.
    BatchOut,
    /// Fire-and-forget bulk promotion.
    PreOut,
}

impl Scenario {
    pub fn direction(self) -> Direction {
        match self {
            Scenario::ReclaimIn => Direction::Write,
            _ => Direction::Read,
        }
    }

    /// Whether `finish` waits for every segment to complete.
    pub fn waits(self) -> bool {
        !matches!(self, Scenario::PreOut)
    }

    /// Whether admission is subject to the in-flight ceiling.
    pub fn throttled(self) -> bool {
        matches!(self, Scenario::ReclaimIn | Scenario::PreOut)
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scenario::ReclaimIn => write!(f, "reclaim-in"),
            Scenario::FaultOut => write!(f, "fault-out"),
            Scenario::BatchOut => write!(f, "batch-out"),
            Scenario::PreOut => write!(f, "pre-out"),
        }
    }
}

/// One unit of I/O: a buffer bound for (or filled from) `addr`.
#[derive(Debug)]
pub struct IoEntry<C> {
    pub addr: u64,
    pub buf: BytesMut,
    pub ctx: C,
}

impl<C> IoEntry<C> {
    pub fn new(addr: u64, buf: BytesMut, ctx: C) -> Self {
        Self { addr, buf, ctx }
    }

    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn end(&self) -> u64 {
        self.addr + self.len()
    }
}

/// Address-ordered run of contiguous entries.
struct IoSegment<C> {
    start: u64,
    end: u64,
    entries: VecDeque<IoEntry<C>>,
}

impl<C> IoSegment<C> {
    fn new(entry: IoEntry<C>) -> Self {
        Self {
            start: entry.addr,
            end: entry.end(),
            entries: VecDeque::from([entry]),
        }
    }

    fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Append or prepend `entry` if it touches the segment and the result
    /// stays within `max`. Hands the entry back otherwise.
    fn try_merge(&mut self, entry: IoEntry<C>, max: u64) -> Result<(), IoEntry<C>> {
        if self.len() + entry.len() > max {
            return Err(entry);
        }
        if entry.addr == self.end {
            self.end = entry.end();
            self.entries.push_back(entry);
            Ok(())
        } else if entry.end() == self.start {
            self.start = entry.addr;
            self.entries.push_front(entry);
            Ok(())
        } else {
            Err(entry)
        }
    }
}

#[derive(Debug, Default)]
struct Flight {
    in_flight: usize,
    waiters: usize,
}

/// Counters since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    pub segments_submitted: u64,
    pub entries_completed: u64,
    pub entries_failed: u64,
}

/// Scheduler shared by every request of one engine.
pub struct IoScheduler {
    device: Arc<dyn BackingDevice>,
    max_batch_bytes: u64,
    ceiling: usize,
    poll: Duration,
    flight: Mutex<Flight>,
    below_ceiling: Condvar,
    shutdown: AtomicBool,
    segments_submitted: AtomicU64,
    entries_completed: AtomicU64,
    entries_failed: AtomicU64,
}

impl fmt::Debug for IoScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoScheduler")
            .field("max_batch_bytes", &self.max_batch_bytes)
            .field("ceiling", &self.ceiling)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl IoScheduler {
    pub fn new(device: Arc<dyn BackingDevice>, config: &IoConfig) -> Self {
        Self {
            device,
            max_batch_bytes: config.max_batch_bytes as u64,
            ceiling: config.inflight_ceiling.max(1),
            poll: config.admission_poll(),
            flight: Mutex::new(Flight::default()),
            below_ceiling: Condvar::new(),
            shutdown: AtomicBool::new(false),
            segments_submitted: AtomicU64::new(0),
            entries_completed: AtomicU64::new(0),
            entries_failed: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> &Arc<dyn BackingDevice> {
        &self.device
    }

    /// Entries admitted and not yet completed, across all requests.
    pub fn in_flight(&self) -> usize {
        self.flight.lock().in_flight
    }

    pub fn stats(&self) -> SchedStats {
        SchedStats {
            segments_submitted: self.segments_submitted.load(Ordering::Relaxed),
            entries_completed: self.entries_completed.load(Ordering::Relaxed),
            entries_failed: self.entries_failed.load(Ordering::Relaxed),
        }
    }

    /// Refuse further throttled admissions and wake blocked ones.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _flight = self.flight.lock();
        self.below_ceiling.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Open a request. `done` runs once per submitted entry, on a device
    /// completion thread or, for refused entries, on the submitting thread.
    pub fn start<C, F>(self: &Arc<Self>, scenario: Scenario, done: F) -> IoRequest<C>
    where
        C: Send + 'static,
        F: Fn(IoEntry<C>, Result<(), IoFailure>) + Send + Sync + 'static,
    {
        IoRequest {
            shared: Arc::new(RequestShared {
                scenario,
                sched: self.clone(),
                done: Box::new(done),
                in_flight: AtomicUsize::new(0),
                pending: Mutex::new(0),
                settled: Condvar::new(),
                failed: AtomicUsize::new(0),
                on_release: Mutex::new(None),
            }),
            open: None,
            segments: 0,
            entries: 0,
        }
    }

    /// Take one in-flight unit. With `wait` false a full scheduler returns
    /// `Ok(false)` instead of blocking.
    fn acquire(&self, scenario: Scenario, wait: bool) -> Result<bool, SchedError> {
        let mut flight = self.flight.lock();
        if scenario.throttled() {
            while flight.in_flight >= self.ceiling || self.is_shut_down() {
                if self.is_shut_down() {
                    return Err(SchedError::ShuttingDown);
                }
                if !wait {
                    return Ok(false);
                }
                flight.waiters += 1;
                self.below_ceiling.wait_for(&mut flight, self.poll);
                flight.waiters -= 1;
            }
        }
        flight.in_flight += 1;
        Ok(true)
    }

    fn retire(&self, count: usize) {
        let mut flight = self.flight.lock();
        let before = flight.in_flight;
        flight.in_flight -= count;
        if before >= self.ceiling && flight.in_flight < self.ceiling && flight.waiters > 0 {
            self.below_ceiling.notify_all();
        }
    }
}

type DoneFn<C> = dyn Fn(IoEntry<C>, Result<(), IoFailure>) + Send + Sync;

/// State shared between a request's creator and its in-flight segments.
struct RequestShared<C> {
    scenario: Scenario,
    sched: Arc<IoScheduler>,
    done: Box<DoneFn<C>>,
    in_flight: AtomicUsize,
    pending: Mutex<usize>,
    settled: Condvar,
    failed: AtomicUsize,
    on_release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<C> RequestShared<C> {
    fn complete(&self, io: BlockIo, metas: Vec<(u64, C)>, status: Result<(), IoFailure>) {
        let count = metas.len();
        debug_assert_eq!(io.bufs.len(), count, "device lost buffers of a transfer");

        if let Err(failure) = &status {
            warn!(
                scenario = %self.scenario,
                offset = io.offset,
                entries = count,
                error = %failure,
                "Segment transfer failed"
            );
            self.failed.fetch_add(count, Ordering::Relaxed);
            self.sched
                .entries_failed
                .fetch_add(count as u64, Ordering::Relaxed);
        } else {
            trace!(scenario = %self.scenario, offset = io.offset, entries = count, "Segment done");
        }

        for (buf, (addr, ctx)) in io.bufs.into_iter().zip(metas) {
            (self.done)(IoEntry { addr, buf, ctx }, status.clone());
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        self.sched
            .entries_completed
            .fetch_add(count as u64, Ordering::Relaxed);
        self.sched.retire(count);

        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.settled.notify_all();
        }
    }
}

impl<C> Drop for RequestShared<C> {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.get_mut().take() {
            hook();
        }
    }
}

/// What a finished request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSummary {
    pub scenario: Scenario,
    pub segments: usize,
    pub entries: usize,
    /// Entries completed with an error. Only final for waiting scenarios.
    pub failed: usize,
}

/// A batch of entries of one scenario.
pub struct IoRequest<C: Send + 'static> {
    shared: Arc<RequestShared<C>>,
    open: Option<IoSegment<C>>,
    segments: usize,
    entries: usize,
}

impl<C: Send + 'static> fmt::Debug for IoRequest<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRequest")
            .field("scenario", &self.shared.scenario)
            .field("segments", &self.segments)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl<C: Send + 'static> IoRequest<C> {
    pub fn scenario(&self) -> Scenario {
        self.shared.scenario
    }

    /// Entries of this request not yet completed.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Run `hook` once the request is finished and its last segment has
    /// completed.
    pub fn on_release(&self, hook: impl FnOnce() + Send + 'static) {
        *self.shared.on_release.lock() = Some(Box::new(hook));
    }

    /// Add an entry. A refused entry still gets its `done` call, with a
    /// failure, before this returns the error.
    pub fn submit(&mut self, entry: IoEntry<C>) -> Result<(), SchedError> {
        if let Err(err) = self.admit() {
            self.shared.failed.fetch_add(1, Ordering::Relaxed);
            (self.shared.done)(
                entry,
                Err(IoFailure::new(io::ErrorKind::Interrupted, err.to_string())),
            );
            return Err(err);
        }
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        self.entries += 1;

        let max = self.shared.sched.max_batch_bytes;
        match self.open.take() {
            None => self.open = Some(IoSegment::new(entry)),
            Some(mut seg) => match seg.try_merge(entry, max) {
                Ok(()) => self.open = Some(seg),
                Err(entry) => {
                    self.flush(seg);
                    self.open = Some(IoSegment::new(entry));
                }
            },
        }
        Ok(())
    }

    /// Flush the open segment, wait for completion when the scenario asks
    /// for it, and drop the creator's reference.
    pub fn finish(mut self) -> RequestSummary {
        if let Some(seg) = self.open.take() {
            self.flush(seg);
        }
        let scenario = self.shared.scenario;
        if scenario.waits() {
            let mut pending = self.shared.pending.lock();
            while *pending > 0 {
                self.shared.settled.wait(&mut pending);
            }
        }
        let summary = RequestSummary {
            scenario,
            segments: self.segments,
            entries: self.entries,
            failed: self.shared.failed.load(Ordering::Relaxed),
        };
        debug!(
            scenario = %scenario,
            segments = summary.segments,
            entries = summary.entries,
            failed = summary.failed,
            "Request finished"
        );
        summary
    }

    fn admit(&mut self) -> Result<(), SchedError> {
        let sched = self.shared.sched.clone();
        let scenario = self.shared.scenario;
        // Never block while holding admitted entries in the open segment.
        if sched.acquire(scenario, self.open.is_none())? {
            return Ok(());
        }
        if let Some(seg) = self.open.take() {
            self.flush(seg);
        }
        sched.acquire(scenario, true).map(|_| ())
    }

    fn flush(&mut self, seg: IoSegment<C>) {
        let shared = self.shared.clone();
        let offset = seg.start;
        let (bufs, metas): (Vec<BytesMut>, Vec<(u64, C)>) = seg
            .entries
            .into_iter()
            .map(|e| (e.buf, (e.addr, e.ctx)))
            .unzip();
        let io = BlockIo {
            direction: shared.scenario.direction(),
            offset,
            bufs,
        };
        trace!(
            scenario = %shared.scenario,
            offset,
            len = io.len(),
            entries = metas.len(),
            "Submitting segment"
        );

        *shared.pending.lock() += 1;
        self.segments += 1;
        shared.sched.segments_submitted.fetch_add(1, Ordering::Relaxed);

        let completion: Completion = {
            let shared = shared.clone();
            Box::new(move |io, status| shared.complete(io, metas, status))
        };
        if let Err(rejected) = shared.sched.device.submit(io, completion) {
            warn!(
                scenario = %shared.scenario,
                offset,
                error = %rejected.error,
                "Device refused segment"
            );
            (rejected.done)(rejected.io, Err(rejected.error));
        }
    }
}

impl<C: Send + 'static> Drop for IoRequest<C> {
    fn drop(&mut self) {
        if let Some(seg) = self.open.take() {
            self.flush(seg);
        }
    }
}
