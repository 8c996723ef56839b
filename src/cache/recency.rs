//! Least-recently-used cache
//!
//! `HashMap` for lookups plus a `BTreeMap` keyed by access tick for
//! eviction order.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{CradleError, Result};

use super::Cache;

struct Inner {
    entries: HashMap<Vec<u8>, (Vec<u8>, u64)>,
    by_tick: BTreeMap<u64, Vec<u8>>,
    tick: u64,
}

impl Inner {
    fn touch(&mut self, key: &[u8]) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, old_tick)) = self.entries.get_mut(key) {
            self.by_tick.remove(old_tick);
            *old_tick = tick;
            self.by_tick.insert(tick, key.to_vec());
        }
    }

    fn remove(&mut self, key: &[u8]) {
        if let Some((_, tick)) = self.entries.remove(key) {
            self.by_tick.remove(&tick);
        }
    }
}

/// Bounded LRU cache with timed lock acquisition
pub struct RecencyCache {
    inner: Mutex<Inner>,
    capacity: usize,
    timeout: Duration,
}

impl RecencyCache {
    /// A capacity of zero disables caching
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                by_tick: BTreeMap::new(),
                tick: 0,
            }),
            capacity,
            timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .try_lock_for(self.timeout)
            .ok_or_else(|| CradleError::Timeout("cache lock".to_string()))
    }
}

impl Cache for RecencyCache {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut inner = self.lock()?;
        let value = inner.entries.get(key).map(|(value, _)| value.clone());
        if value.is_some() {
            inner.touch(key);
        }
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.capacity == 0 {
            return Ok(());
        }
        let mut inner = self.lock()?;
        inner.remove(key);
        while inner.entries.len() >= self.capacity {
            let Some((_, oldest)) = inner.by_tick.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.insert(key.to_vec(), (value.to_vec(), tick));
        inner.by_tick.insert(tick, key.to_vec());
        Ok(())
    }

    fn invalidate(&self, key: &[u8]) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.entries.clear();
        inner.by_tick.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
