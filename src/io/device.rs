//! Backing block devices.
//!
//! A device accepts one contiguous transfer at a time and completes it
//! asynchronously on its completion pools. [`MemDevice`] keeps the image in
//! memory and can inject failures; [`FileDevice`] does positioned I/O on a
//! regular file or block device node.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::IoConfig;
use crate::io::completion::Completer;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Backing file {path} is {actual} bytes, need {needed}")]
    TooSmall {
        path: PathBuf,
        actual: u64,
        needed: u64,
    },
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Failure of one transfer, cloneable so it can be reported per entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct IoFailure {
    pub kind: io::ErrorKind,
    pub message: String,
}

impl IoFailure {
    pub fn new(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<io::Error> for IoFailure {
    fn from(err: io::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// One contiguous transfer: `bufs` laid end to end starting at `offset`.
#[derive(Debug)]
pub struct BlockIo {
    pub direction: Direction,
    pub offset: u64,
    pub bufs: Vec<BytesMut>,
}

impl BlockIo {
    pub fn len(&self) -> u64 {
        self.bufs.iter().map(|b| b.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Invoked exactly once per accepted transfer, with the buffers handed back.
pub type Completion = Box<dyn FnOnce(BlockIo, Result<(), IoFailure>) + Send + 'static>;

/// A transfer the device refused to queue. Nothing was done; the caller owns
/// the buffers and the completion again.
pub struct Rejected {
    pub error: IoFailure,
    pub io: BlockIo,
    pub done: Completion,
}

impl std::fmt::Debug for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .field("io", &self.io)
            .finish_non_exhaustive()
    }
}

/// The backing block device seen by the I/O scheduler.
pub trait BackingDevice: Send + Sync {
    /// Device size in bytes.
    fn size(&self) -> u64;

    /// Queue one transfer. `done` runs exactly once if this returns `Ok`.
    fn submit(&self, io: BlockIo, done: Completion) -> Result<(), Rejected>;
}

fn check_range(size: u64, io: &BlockIo) -> Result<(), IoFailure> {
    if io.offset.checked_add(io.len()).map_or(true, |end| end > size) {
        return Err(IoFailure::new(
            io::ErrorKind::InvalidInput,
            format!(
                "transfer of {} bytes at {} exceeds device size {}",
                io.len(),
                io.offset,
                size
            ),
        ));
    }
    Ok(())
}

/// Counters and failure injection of a [`MemDevice`].
#[derive(Debug, Default)]
struct Faults {
    fail_reads: AtomicUsize,
    fail_writes: AtomicUsize,
    reject_submits: AtomicUsize,
}

/// Pause gate for holding transfers in flight.
#[derive(Debug, Default)]
struct Gate {
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl Gate {
    fn pass(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.resumed.wait(&mut paused);
        }
    }
}

/// Record of one completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRecord {
    pub direction: Direction,
    pub offset: u64,
    pub len: u64,
}

/// In-memory device.
pub struct MemDevice {
    data: Arc<Mutex<Vec<u8>>>,
    completer: Completer,
    faults: Arc<Faults>,
    gate: Arc<Gate>,
    log: Arc<Mutex<Vec<TransferRecord>>>,
}

impl std::fmt::Debug for MemDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDevice")
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

impl MemDevice {
    pub fn new(size: u64, io: &IoConfig) -> Result<Self, DeviceError> {
        Ok(Self {
            data: Arc::new(Mutex::new(vec![0u8; size as usize])),
            completer: Completer::new("memdev", io.read_workers, io.write_workers)?,
            faults: Arc::new(Faults::default()),
            gate: Arc::new(Gate::default()),
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Fail the next `n` read transfers with an I/O error.
    pub fn fail_next_reads(&self, n: usize) {
        self.faults.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` write transfers with an I/O error.
    pub fn fail_next_writes(&self, n: usize) {
        self.faults.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Refuse the next `n` submissions outright.
    pub fn reject_next_submits(&self, n: usize) {
        self.faults.reject_submits.store(n, Ordering::SeqCst);
    }

    /// Hold every transfer on the completion threads until [`resume`](Self::resume).
    pub fn pause(&self) {
        *self.gate.paused.lock() = true;
    }

    pub fn resume(&self) {
        *self.gate.paused.lock() = false;
        self.gate.resumed.notify_all();
    }

    /// Transfers completed so far, in completion order.
    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.log.lock().clone()
    }

    /// Copy of `len` bytes of the image at `offset`.
    pub fn snapshot(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.data.lock();
        data[offset as usize..offset as usize + len].to_vec()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl BackingDevice for MemDevice {
    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn submit(&self, io: BlockIo, done: Completion) -> Result<(), Rejected> {
        if let Err(error) = check_range(self.size(), &io) {
            return Err(Rejected { error, io, done });
        }
        if take_one(&self.faults.reject_submits) {
            let error = IoFailure::new(io::ErrorKind::WouldBlock, "submission rejected");
            return Err(Rejected { error, io, done });
        }

        let data = self.data.clone();
        let faults = self.faults.clone();
        let gate = self.gate.clone();
        let log = self.log.clone();
        let direction = io.direction;
        let job = Box::new(move || {
            let mut io = io;
            gate.pass();
            let failing = match io.direction {
                Direction::Read => take_one(&faults.fail_reads),
                Direction::Write => take_one(&faults.fail_writes),
            };
            if failing {
                done(io, Err(IoFailure::new(io::ErrorKind::Other, "injected I/O error")));
                return;
            }

            let mut pos = io.offset as usize;
            {
                let mut image = data.lock();
                for buf in io.bufs.iter_mut() {
                    let range = pos..pos + buf.len();
                    match io.direction {
                        Direction::Read => buf.copy_from_slice(&image[range]),
                        Direction::Write => image[range].copy_from_slice(buf),
                    }
                    pos += buf.len();
                }
            }
            log.lock().push(TransferRecord {
                direction: io.direction,
                offset: io.offset,
                len: io.len(),
            });
            done(io, Ok(()));
        });

        self.completer.run(direction, job);
        Ok(())
    }
}

/// Device backed by a file or block device node, using positioned I/O.
#[cfg(unix)]
pub struct FileDevice {
    file: Arc<File>,
    path: PathBuf,
    size: u64,
    completer: Completer,
}

#[cfg(unix)]
impl std::fmt::Debug for FileDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDevice")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
impl FileDevice {
    /// Open `path`, creating and extending a regular file to `size` bytes.
    /// An existing block device must already be at least `size` bytes.
    pub fn open(path: &Path, size: u64, io: &IoConfig) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let meta = file.metadata()?;
        if meta.is_file() && meta.len() < size {
            file.set_len(size)?;
        } else if !meta.is_file() {
            let actual = {
                use std::io::{Seek, SeekFrom};
                let mut f = &file;
                f.seek(SeekFrom::End(0))?
            };
            if actual < size {
                return Err(DeviceError::TooSmall {
                    path: path.to_path_buf(),
                    actual,
                    needed: size,
                });
            }
        }

        debug!(path = %path.display(), size, "Opened backing device");
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            size,
            completer: Completer::new("filedev", io.read_workers, io.write_workers)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
impl BackingDevice for FileDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn submit(&self, io: BlockIo, done: Completion) -> Result<(), Rejected> {
        use std::os::unix::fs::FileExt;

        if let Err(error) = check_range(self.size, &io) {
            return Err(Rejected { error, io, done });
        }

        let file = self.file.clone();
        let direction = io.direction;
        let job = Box::new(move || {
            let mut io = io;
            let mut pos = io.offset;
            let mut status = Ok(());
            for buf in io.bufs.iter_mut() {
                let res = match io.direction {
                    Direction::Read => file.read_exact_at(buf, pos),
                    Direction::Write => file.write_all_at(buf, pos),
                };
                if let Err(err) = res {
                    warn!(offset = pos, error = %err, "Backing device transfer failed");
                    status = Err(IoFailure::from(err));
                    break;
                }
                pos += buf.len() as u64;
            }
            done(io, status);
        });

        self.completer.run(direction, job);
        Ok(())
    }
}
