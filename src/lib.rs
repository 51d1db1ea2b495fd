//! hybridswap: a two-tier compressed memory store.
//!
//! Pages are compressed into a RAM tier and tracked per owner in LRU order.
//! Cold objects are packed into fixed-size extents and written to a backing
//! device; faults and bulk promotions read whole extents back. Objects,
//! extents and owners are plain indices into fixed tables, linked through
//! intrusive lists.

pub mod config;
pub mod engine;
pub mod error;
pub mod extent;
pub mod io;
pub mod list;
pub mod owner;
pub mod store;

pub use config::{Config, ConfigError};
pub use engine::{DrainReport, Engine, EngineStats, PromoteReport, ReclaimReport};
pub use error::{Result, SwapError};
pub use owner::{OwnerId, OwnerStats, NO_OWNER};
pub use store::{ObjectFlags, ObjectId};
