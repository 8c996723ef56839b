//! Cache Module
//!
//! Read-through cache sitting in front of a router's store.
//!
//! ## Responsibilities
//! - Serve hot GETs without touching the store
//! - Hold at most `capacity` entries, evicting the least recently used
//! - Drop entries the router no longer owns after a split
//!
//! The router keeps cache and store coherent: a PUT writes the store
//! first and then the cache, both under the router's write lock.

mod recency;

pub use recency::RecencyCache;

use crate::error::Result;

/// Cache collaborator used by routers
pub trait Cache: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Drop `key` if cached
    fn invalidate(&self, key: &[u8]) -> Result<()>;

    /// Drop every entry
    fn clear(&self) -> Result<()>;

    /// Number of cached entries
    fn len(&self) -> usize;
}
