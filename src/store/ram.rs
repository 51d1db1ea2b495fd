//! RAM-resident compressed object store.
//!
//! A fixed array of object slots. Each slot carries its own mutex and
//! condition variable: the mutex guards the handle, size and flags, and the
//! condvar wakes threads waiting for a transient flag (write-back in
//! progress) to clear.

use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::extent::ExtentAddr;
use crate::store::compressor::Compressor;

/// Index of an object slot.
pub type ObjectId = usize;

bitflags::bitflags! {
    /// Per-object status bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ObjectFlags: u8 {
        /// Selected for write-back, not yet handed to the device.
        const WRITEBACK_PENDING = 1 << 0;
        /// Write-back I/O submitted and not yet completed.
        const WRITEBACK_IN_PROGRESS = 1 << 1;
        /// Payload lives in an extent on the backing device.
        const RESIDENT_ON_DISK = 1 << 2;
        /// Page is all zeroes; no payload is stored anywhere.
        const IDENTICAL_ZERO_PAGE = 1 << 3;
        /// Payload is the raw page rather than a zstd frame.
        const INCOMPRESSIBLE = 1 << 4;

        /// Either write-back bit.
        const WRITEBACK = Self::WRITEBACK_PENDING.bits() | Self::WRITEBACK_IN_PROGRESS.bits();
    }
}

/// Where an object's payload currently lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Handle {
    /// Slot unused.
    #[default]
    Empty,
    /// Compressed payload held in memory. Zero pages hold an empty payload.
    Ram(Bytes),
    /// Payload packed into an extent.
    Disk(ExtentAddr),
}

/// Mutable state of one slot, reachable only through its lock.
#[derive(Debug, Default)]
pub struct SlotState {
    handle: Handle,
    size: u32,
    flags: ObjectFlags,
}

impl SlotState {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn set_handle(&mut self, handle: Handle) {
        self.handle = handle;
    }

    /// Stored (compressed) size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: ObjectFlags) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: ObjectFlags) {
        self.flags.remove(flag);
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.handle, Handle::Empty)
    }

    /// The extent address when the payload lives on disk.
    pub fn disk_addr(&self) -> Option<ExtentAddr> {
        match self.handle {
            Handle::Disk(addr) if self.flags.contains(ObjectFlags::RESIDENT_ON_DISK) => Some(addr),
            _ => None,
        }
    }

    /// The in-memory payload, if any.
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.handle {
            Handle::Ram(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Drop everything and return the slot to the unused state.
    pub fn reset(&mut self) {
        *self = SlotState::default();
    }
}

struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

/// Fixed-capacity store of compressed objects.
pub struct RamStore {
    slots: Box<[Slot]>,
    compressor: Compressor,
}

impl std::fmt::Debug for RamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamStore")
            .field("slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl RamStore {
    pub fn new(object_count: usize, compressor: Compressor) -> Self {
        let slots = (0..object_count)
            .map(|_| Slot {
                state: Mutex::new(SlotState::default()),
                cond: Condvar::new(),
            })
            .collect();
        Self { slots, compressor }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        id < self.slots.len()
    }

    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    /// Take the per-object lock.
    pub fn lock(&self, id: ObjectId) -> MutexGuard<'_, SlotState> {
        self.slots[id].state.lock()
    }

    /// Block on the object's condvar for at most `timeout`. Returns whether
    /// the wait timed out.
    pub fn wait(&self, id: ObjectId, guard: &mut MutexGuard<'_, SlotState>, timeout: Duration) -> bool {
        self.slots[id].cond.wait_for(guard, timeout).timed_out()
    }

    /// Wake everybody waiting on the object.
    pub fn notify(&self, id: ObjectId) {
        self.slots[id].cond.notify_all();
    }

    /// Stored size of an object (0 when unused).
    pub fn object_size(&self, id: ObjectId) -> u32 {
        self.lock(id).size()
    }

    pub fn object_flags(&self, id: ObjectId) -> ObjectFlags {
        self.lock(id).flags()
    }
}
