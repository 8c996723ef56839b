//! Store providers
//!
//! The Cradle never constructs stores directly; it asks a provider to open
//! or destroy the store backing a named router.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::SyncStrategy;
use crate::error::{CradleError, Result};

use super::{DurableStore, MemStore, Store};

/// Opens and destroys the store behind a router
pub trait StoreProvider: Send + Sync {
    /// Open the store for `name`, creating it if absent
    fn open(&self, name: &str) -> Result<Arc<dyn Store>>;

    /// Discard every record stored for `name`
    fn destroy(&self, name: &str) -> Result<()>;

    /// Where the store for `name` lives
    fn location(&self, name: &str) -> PathBuf;
}

/// Operation-logged stores under `{root}/{name}`
pub struct DiskProvider {
    root: PathBuf,
    sync: SyncStrategy,
    timeout: Duration,
}

impl DiskProvider {
    pub fn new(root: impl Into<PathBuf>, sync: SyncStrategy, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            sync,
            timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StoreProvider for DiskProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn Store>> {
        let store = DurableStore::open(self.location(name), self.sync, self.timeout)?;
        Ok(Arc::new(store))
    }

    fn destroy(&self, name: &str) -> Result<()> {
        let dir = self.location(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CradleError::Storage(format!(
                "failed to remove {}: {}",
                dir.display(),
                e
            ))),
        }
    }

    fn location(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// Volatile stores kept alive by name until destroyed
pub struct MemoryProvider {
    stores: Mutex<HashMap<String, Arc<MemStore>>>,
    timeout: Duration,
}

impl MemoryProvider {
    pub fn new(timeout: Duration) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            timeout,
        }
    }
}

impl StoreProvider for MemoryProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn Store>> {
        let store = self
            .stores
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemStore::new(self.timeout)))
            .clone();
        Ok(store)
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.stores.lock().remove(name);
        Ok(())
    }

    fn location(&self, name: &str) -> PathBuf {
        PathBuf::from(format!("memory://{}", name))
    }
}
