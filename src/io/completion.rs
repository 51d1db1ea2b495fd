//! Completion worker pools.
//!
//! Devices finish transfers on the blocking threads of a small, named tokio
//! runtime. Reads and writes get separate pools so a burst of write-back
//! never queues ahead of a latency-sensitive fault.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, trace, warn};

use crate::io::device::Direction;

/// A unit of completion work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Pool owning the current thread, zero outside any pool.
    static CURRENT_POOL: Cell<u64> = const { Cell::new(0) };
}

/// Jobs dispatched and not yet finished.
#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_until(&self, floor: usize) {
        let mut count = self.count.lock();
        while *count > floor {
            self.idle.wait(&mut count);
        }
    }
}

/// Marks a job finished even if it unwinds.
struct JobGuard(Arc<Pending>);

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// A named runtime whose blocking threads run completion jobs.
pub struct CompletionPool {
    id: u64,
    name: String,
    threads: usize,
    runtime: Option<Runtime>,
    pending: Arc<Pending>,
}

impl std::fmt::Debug for CompletionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionPool")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("pending", &*self.pending.count.lock())
            .finish()
    }
}

impl CompletionPool {
    pub fn new(name: &str, threads: usize) -> std::io::Result<Self> {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let threads = threads.max(1);
        let seq = AtomicUsize::new(0);
        let prefix = name.to_string();

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name_fn(move || format!("{prefix}-{}", seq.fetch_add(1, Ordering::Relaxed)))
            .on_thread_start(move || CURRENT_POOL.with(|pool| pool.set(id)))
            .build()?;

        debug!(pool = name, threads, "Started completion pool");
        Ok(Self {
            id,
            name: name.to_string(),
            threads,
            runtime: Some(runtime),
            pending: Arc::new(Pending::default()),
        })
    }

    /// Queue a job. Hands the job back if the pool is shutting down.
    pub fn dispatch(&self, job: Job) -> Result<(), Job> {
        let Some(runtime) = &self.runtime else {
            return Err(job);
        };
        self.pending.add();
        let guard = JobGuard(self.pending.clone());
        runtime.spawn_blocking(move || {
            let _guard = guard;
            job();
        });
        Ok(())
    }
}

impl Drop for CompletionPool {
    fn drop(&mut self) {
        // Queued jobs still run. Dropped from one of our own jobs, that job
        // is the one left pending.
        let floor = usize::from(CURRENT_POOL.with(Cell::get) == self.id);
        self.pending.wait_until(floor);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        trace!(pool = %self.name, "Completion pool stopped");
    }
}

/// Read-side and write-side pools of one device.
#[derive(Debug)]
pub struct Completer {
    read: CompletionPool,
    write: CompletionPool,
}

impl Completer {
    pub fn new(name: &str, read_workers: usize, write_workers: usize) -> std::io::Result<Self> {
        Ok(Self {
            read: CompletionPool::new(&format!("{name}-rd"), read_workers)?,
            write: CompletionPool::new(&format!("{name}-wr"), write_workers)?,
        })
    }

    pub fn dispatch(&self, direction: Direction, job: Job) -> Result<(), Job> {
        match direction {
            Direction::Read => self.read.dispatch(job),
            Direction::Write => self.write.dispatch(job),
        }
    }

    /// Queue a job, or run it on the calling thread if its pool is closed.
    pub fn run(&self, direction: Direction, job: Job) {
        if let Err(job) = self.dispatch(direction, job) {
            warn!(?direction, "Completion pool closed, completing inline");
            job();
        }
    }
}
