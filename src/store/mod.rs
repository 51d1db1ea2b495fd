//! RAM tier.
//!
//! - [`ram`]: object slots with handle, size, flags and per-object lock
//! - [`compressor`]: zstd page compression with zero-page detection

pub mod compressor;
pub mod ram;

pub use compressor::{CompressionError, Compressor, Encoded};
pub use ram::{Handle, ObjectFlags, ObjectId, RamStore, SlotState};
