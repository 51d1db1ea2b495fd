//! Backing device I/O.
//!
//! - [`device`]: the block device boundary plus memory and file devices
//! - [`completion`]: worker pools that complete device transfers
//! - [`scheduler`]: merging of extent transfers and in-flight back-pressure

pub mod completion;
pub mod device;
pub mod scheduler;

pub use device::{
    BackingDevice, BlockIo, Completion, DeviceError, Direction, IoFailure, MemDevice, Rejected,
    TransferRecord,
};
#[cfg(unix)]
pub use device::FileDevice;
pub use scheduler::{IoEntry, IoRequest, IoScheduler, RequestSummary, SchedError, SchedStats, Scenario};
