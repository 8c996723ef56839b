//! Directory publication
//!
//! `DirectoryHandle` is the single shared, published copy; only the Cradle
//! writes it. Routers and the ConnectionManager read through a
//! `DirectoryView`, which caches a snapshot and detects staleness by
//! comparing versions.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{CradleError, Result};

use super::{persist, Directory};

/// Shared, versioned directory
pub struct DirectoryHandle {
    current: RwLock<Arc<Directory>>,

    /// Mirrors `current.version` for lock-free staleness checks
    version: AtomicU64,

    /// Serializes read-modify-publish cycles
    publish_lock: Mutex<()>,

    /// Where each published version is saved, if anywhere
    persist_path: Option<PathBuf>,
}

impl DirectoryHandle {
    pub fn new(initial: Directory, persist_path: Option<PathBuf>) -> Self {
        let version = initial.version();
        Self {
            current: RwLock::new(Arc::new(initial)),
            version: AtomicU64::new(version),
            publish_lock: Mutex::new(()),
            persist_path,
        }
    }

    /// The latest published directory
    pub fn snapshot(&self) -> Arc<Directory> {
        Arc::clone(&self.current.read())
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Compute the next directory from the current one and publish it.
    ///
    /// `mutate` sees the latest version; the publish lock is held across
    /// compute and publish so concurrent lifecycle operations cannot lose
    /// each other's updates.
    pub fn update<F>(&self, mutate: F) -> Result<Arc<Directory>>
    where
        F: FnOnce(&Directory) -> Result<Directory>,
    {
        let _publish = self.publish_lock.lock();
        let current = self.snapshot();
        let next = mutate(&current)?;
        self.install(next)
    }

    /// Publish a complete directory (must be newer than the current one)
    pub fn publish(&self, next: Directory) -> Result<Arc<Directory>> {
        let _publish = self.publish_lock.lock();
        self.install(next)
    }

    /// Called with the publish lock held
    fn install(&self, next: Directory) -> Result<Arc<Directory>> {
        let current_version = self.version();
        if next.version() <= current_version {
            return Err(CradleError::MigrationConflict(format!(
                "directory v{} is not newer than published v{}",
                next.version(),
                current_version
            )));
        }
        next.validate()?;

        // Durable before visible
        if let Some(path) = &self.persist_path {
            persist::save(path, &next)?;
        }

        let next = Arc::new(next);
        *self.current.write() = Arc::clone(&next);
        self.version.store(next.version(), Ordering::Release);

        tracing::debug!("Published directory v{}", next.version());
        Ok(next)
    }
}

/// A cached, never-regressing view of the shared directory
pub struct DirectoryView {
    handle: Arc<DirectoryHandle>,
    cached: Mutex<Arc<Directory>>,
}

impl DirectoryView {
    pub fn new(handle: Arc<DirectoryHandle>) -> Self {
        let cached = Mutex::new(handle.snapshot());
        Self { handle, cached }
    }

    /// The cached copy, without checking for newer versions
    pub fn cached(&self) -> Arc<Directory> {
        Arc::clone(&self.cached.lock())
    }

    /// The cached copy, refreshed first if the shared version moved ahead
    pub fn current(&self) -> Arc<Directory> {
        let cached = self.cached();
        if self.handle.version() > cached.version() {
            self.refresh()
        } else {
            cached
        }
    }

    /// Fetch the published copy; never moves to a lower version than cached
    pub fn refresh(&self) -> Arc<Directory> {
        let fresh = self.handle.snapshot();
        let mut cached = self.cached.lock();
        if fresh.version() > cached.version() {
            *cached = Arc::clone(&fresh);
        }
        Arc::clone(&cached)
    }

    pub fn is_stale(&self) -> bool {
        self.handle.version() > self.cached.lock().version()
    }

    pub fn handle(&self) -> &Arc<DirectoryHandle> {
        &self.handle
    }
}
