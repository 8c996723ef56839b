//! Keyspace Module
//!
//! Key ranges and the versioned directory that partitions the keyspace
//! between routers and hosts.
//!
//! ## Partition Invariant
//! ```text
//!  ""                                                      ∞
//!  ├──── r1@h1 ────┼──── r2@h1 ────┼─ unowned ─┼── r9@h2 ──┤
//!  [a              [g              [m          [t
//! ```
//! At every published version the segments are sorted, contiguous, and
//! cover the keyspace with no gap and no overlap.

mod directory;
mod handle;
mod range;
pub mod persist;

pub use directory::{Directory, Owner, Segment};
pub use handle::{DirectoryHandle, DirectoryView};
pub use range::KeyRange;
pub(crate) use range::end_after;
