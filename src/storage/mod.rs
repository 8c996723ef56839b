//! Storage Module
//!
//! The Store collaborator consumed by routers, plus the concrete stores a
//! host runs with.
//!
//! ## Responsibilities
//! - Point reads and writes for one router's records
//! - Lazy, finite range scans (LIST, split/merge migration)
//! - Bounded lock waits so a stuck store surfaces as `Timeout`
//!
//! ## Stores
//! - [`MemStore`]: ordered map, volatile
//! - [`DurableStore`]: `MemStore` rebuilt on open from an append-only,
//!   CRC-checked operation log

mod durable;
mod memory;
mod oplog;
mod provider;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::keyspace::KeyRange;
use crate::protocol::ListFilter;

pub use durable::DurableStore;
pub use memory::MemStore;
pub use oplog::{LogOp, OpLog, RecoveryResult};
pub use provider::{DiskProvider, MemoryProvider, StoreProvider};

/// A stored key/value pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,

    /// Store sequence number of the write that produced this value
    pub version: u64,
}

/// Lazy, finite, non-restartable sequence of records
pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<Record>> + Send + 'a>;

/// Storage engine behind one router
pub trait Store: Send + Sync {
    /// Value for `key`, if present
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite; returns the record version
    fn put(&self, key: &[u8], value: &[u8]) -> Result<u64>;

    /// Remove `key`; returns whether it existed
    fn delete(&self, key: &[u8]) -> Result<bool>;

    /// Records in `range` (and matching `filter`) in key order
    fn scan<'a>(&'a self, range: &KeyRange, filter: Option<&ListFilter>) -> Result<RecordIter<'a>>;

    /// Number of live records
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Make buffered writes durable
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
