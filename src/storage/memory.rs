//! In-memory store
//!
//! BTreeMap-based store with timed RwLock acquisition.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{CradleError, Result};
use crate::keyspace::KeyRange;
use crate::protocol::ListFilter;

use super::{Record, RecordIter, Store};

/// Records fetched per lock acquisition while scanning
const SCAN_BATCH: usize = 128;

type Entries = BTreeMap<Vec<u8>, (Vec<u8>, u64)>;

/// Ordered in-memory store
pub struct MemStore {
    data: RwLock<Entries>,
    next_version: AtomicU64,
    timeout: Duration,
}

impl MemStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            next_version: AtomicU64::new(1),
            timeout,
        }
    }

    /// Insert with a caller-chosen version (log replay, durable writes)
    pub(crate) fn insert_versioned(&self, key: &[u8], value: &[u8], version: u64) -> Result<()> {
        self.write()?.insert(key.to_vec(), (value.to_vec(), version));
        self.next_version.fetch_max(version + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Every live record, in key order (log compaction)
    pub(crate) fn snapshot(&self) -> Result<Vec<Record>> {
        Ok(self
            .read()?
            .iter()
            .map(|(key, (value, version))| Record {
                key: key.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Entries>> {
        self.data
            .try_read_for(self.timeout)
            .ok_or_else(|| CradleError::Timeout("store read lock".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Entries>> {
        self.data
            .try_write_for(self.timeout)
            .ok_or_else(|| CradleError::Timeout("store write lock".to_string()))
    }
}

impl Store for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).map(|(value, _)| value.clone()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        let mut data = self.write()?;
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        data.insert(key.to_vec(), (value.to_vec(), version));
        Ok(version)
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        Ok(self.write()?.remove(key).is_some())
    }

    fn scan<'a>(&'a self, range: &KeyRange, filter: Option<&ListFilter>) -> Result<RecordIter<'a>> {
        // BTreeMap::range panics on inverted bounds
        if range.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        Ok(Box::new(ScanIter {
            store: self,
            next: Some(Bound::Included(range.start().to_vec())),
            end: range.end().map(<[u8]>::to_vec),
            filter: filter.cloned(),
            buffer: VecDeque::new(),
        }))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }
}

/// Batched scan: takes the read lock once per batch so long scans never
/// starve writers.
struct ScanIter<'a> {
    store: &'a MemStore,
    /// Lower bound of the next batch; `None` once exhausted
    next: Option<Bound<Vec<u8>>>,
    end: Option<Vec<u8>>,
    filter: Option<ListFilter>,
    buffer: VecDeque<Record>,
}

impl ScanIter<'_> {
    fn fill(&mut self) -> Result<()> {
        let Some(lower) = self.next.take() else {
            return Ok(());
        };
        let upper = match &self.end {
            Some(end) => Bound::Excluded(end.clone()),
            None => Bound::Unbounded,
        };
        let data = self.store.read()?;
        let mut last = None;
        let mut taken = 0;
        for (key, (value, version)) in data.range((lower, upper)) {
            taken += 1;
            last = Some(key.clone());
            if self.filter.as_ref().map_or(true, |f| f.matches(key)) {
                self.buffer.push_back(Record {
                    key: key.clone(),
                    value: value.clone(),
                    version: *version,
                });
            }
            if taken == SCAN_BATCH {
                break;
            }
        }
        if taken == SCAN_BATCH {
            self.next = last.map(Bound::Excluded);
        }
        Ok(())
    }
}

impl Iterator for ScanIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.is_empty() && self.next.is_some() {
            if let Err(e) = self.fill() {
                self.next = None;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
