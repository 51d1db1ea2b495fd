//! Disk-tier space management.
//!
//! - [`space`]: bitmap extent allocator with per-owner and per-extent accounting
//! - [`layout`]: packing of compressed objects inside one extent

pub mod layout;
pub mod space;

pub use layout::{ExtentAddr, ExtentWriter, PackedObject, HEADER_LEN};
pub use space::{ExtentError, ExtentId, ExtentSpace};
