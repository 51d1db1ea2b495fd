//! Index-addressed intrusive lists.
//!
//! - [`table`]: the node arena, list guards and iterators

pub mod table;

pub use table::{IndexTable, Iter, Layout, ListGuard, NodeKind, SafeIter};
