//! Durable store
//!
//! A [`MemStore`] whose every mutation is first appended to an
//! [`OpLog`]. Opening the store replays the log; once enough overwritten
//! or deleted entries pile up the log is rewritten with live records only.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::SyncStrategy;
use crate::error::{CradleError, Result};
use crate::keyspace::KeyRange;
use crate::protocol::ListFilter;

use super::memory::MemStore;
use super::oplog::{LogOp, OpLog, RecoveryResult};
use super::{RecordIter, Store};

/// Log file name inside a node directory
pub const LOG_FILE: &str = "ops.log";

/// Dead entries tolerated before the log is compacted
const DEFAULT_COMPACT_AFTER: u64 = 4096;

struct LogState {
    log: OpLog,
    /// Entries superseded by a later put or delete
    dead: u64,
}

/// Operation-logged store rooted at one directory
pub struct DurableStore {
    dir: PathBuf,
    mem: MemStore,
    log: Mutex<LogState>,
    timeout: Duration,
    compact_after: u64,
}

impl DurableStore {
    /// Open (or create) the store in `dir`, replaying its log.
    pub fn open(dir: impl AsRef<Path>, sync: SyncStrategy, timeout: Duration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mem = MemStore::new(timeout);
        let mut dead = 0u64;
        let (log, recovery) = OpLog::open(&dir.join(LOG_FILE), sync, |lsn, op| {
            match op {
                LogOp::Put { key, value } => {
                    if mem.get(&key)?.is_some() {
                        dead += 1;
                    }
                    mem.insert_versioned(&key, &value, lsn)
                }
                LogOp::Delete { key } => {
                    if mem.delete(&key)? {
                        dead += 1;
                    }
                    dead += 1;
                    Ok(())
                }
            }
        })?;

        log_recovery(&dir, &recovery);

        Ok(Self {
            dir,
            mem,
            log: Mutex::new(LogState { log, dead }),
            timeout,
            compact_after: DEFAULT_COMPACT_AFTER,
        })
    }

    /// Override the compaction trigger
    pub fn with_compact_after(mut self, dead_entries: u64) -> Self {
        self.compact_after = dead_entries.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rewrite the log with live records only
    pub fn compact(&self) -> Result<()> {
        let mut state = self.lock_log()?;
        self.compact_locked(&mut state)
    }

    fn compact_locked(&self, state: &mut LogState) -> Result<()> {
        let records = self.mem.snapshot()?;
        state.log.rewrite(&records)?;
        tracing::debug!(
            "Compacted {} ({} live records, {} dead entries dropped)",
            self.dir.display(),
            records.len(),
            state.dead
        );
        state.dead = 0;
        Ok(())
    }

    fn lock_log(&self) -> Result<parking_lot::MutexGuard<'_, LogState>> {
        self.log
            .try_lock_for(self.timeout)
            .ok_or_else(|| CradleError::Timeout("store log lock".to_string()))
    }

    fn maybe_compact(&self, state: &mut LogState) {
        if state.dead < self.compact_after {
            return;
        }
        // A failed compaction leaves the old log in place; the write already succeeded.
        if let Err(e) = self.compact_locked(state) {
            tracing::warn!("Compaction of {} failed: {}", self.dir.display(), e);
        }
    }
}

impl Store for DurableStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.mem.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        let mut state = self.lock_log()?;
        let lsn = state.log.append(&LogOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        if self.mem.get(key)?.is_some() {
            state.dead += 1;
        }
        self.mem.insert_versioned(key, value, lsn)?;
        self.maybe_compact(&mut state);
        Ok(lsn)
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut state = self.lock_log()?;
        if self.mem.get(key)?.is_none() {
            return Ok(false);
        }
        state.log.append(&LogOp::Delete { key: key.to_vec() })?;
        self.mem.delete(key)?;
        state.dead += 2;
        self.maybe_compact(&mut state);
        Ok(true)
    }

    fn scan<'a>(&'a self, range: &KeyRange, filter: Option<&ListFilter>) -> Result<RecordIter<'a>> {
        self.mem.scan(range, filter)
    }

    fn len(&self) -> Result<usize> {
        self.mem.len()
    }

    fn flush(&self) -> Result<()> {
        self.lock_log()?.log.sync()
    }
}

fn log_recovery(dir: &Path, recovery: &RecoveryResult) {
    if recovery.was_truncated {
        tracing::warn!(
            "Recovered {} entries from {} (torn tail truncated after LSN {})",
            recovery.entries_recovered,
            dir.display(),
            recovery.last_lsn
        );
    } else if recovery.entries_recovered > 0 {
        tracing::debug!(
            "Recovered {} entries from {}",
            recovery.entries_recovered,
            dir.display()
        );
    }
}
