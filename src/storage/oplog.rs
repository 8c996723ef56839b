//! Operation Log
//!
//! Append-only, CRC-checked record of every store mutation. A
//! `DurableStore` rebuilds its map by replaying the log on open.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//! CRC covers `LSN || Data`; Data is `bincode(LogOp)`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::SyncStrategy;
use crate::error::{CradleError, Result};

use super::Record;

/// Entry header: LSN (8) + CRC (4) + Len (4)
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Largest single entry accepted on replay
const MAX_ENTRY_SIZE: u32 = 32 * 1024 * 1024;

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    /// Put a key-value pair
    Put { key: Vec<u8>, value: Vec<u8> },

    /// Delete a key
    Delete { key: Vec<u8> },
}

/// Result of replaying a log
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Highest valid LSN
    pub last_lsn: u64,

    /// Whether a torn or corrupted tail was cut off
    pub was_truncated: bool,
}

/// Append handle on an operation log file
pub struct OpLog {
    path: PathBuf,
    writer: BufWriter<File>,
    next_lsn: u64,
    sync: SyncStrategy,
    unsynced: usize,
}

impl OpLog {
    /// Replay `path` (if present), cut any torn tail, and open it for appends.
    ///
    /// `apply` sees every valid entry in file order.
    pub fn open<F>(path: &Path, sync: SyncStrategy, mut apply: F) -> Result<(Self, RecoveryResult)>
    where
        F: FnMut(u64, LogOp) -> Result<()>,
    {
        let mut result = RecoveryResult::default();
        let mut valid_len = 0u64;

        if path.exists() {
            let mut reader = BufReader::new(File::open(path)?);
            loop {
                match read_entry(&mut reader) {
                    Ok(Some((lsn, op, size))) => {
                        apply(lsn, op)?;
                        result.entries_recovered += 1;
                        // Compacted logs are written in key order, not LSN order
                        result.last_lsn = result.last_lsn.max(lsn);
                        valid_len += size;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(
                            "Operation log {} has a bad tail after LSN {}: {}",
                            path.display(),
                            result.last_lsn,
                            e
                        );
                        result.was_truncated = true;
                        break;
                    }
                }
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        if result.was_truncated {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        let log = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            next_lsn: result.last_lsn + 1,
            sync,
            unsynced: 0,
        };
        Ok((log, result))
    }

    /// Append one operation; returns its LSN
    pub fn append(&mut self, op: &LogOp) -> Result<u64> {
        let lsn = self.next_lsn;
        write_entry(&mut self.writer, lsn, op)?;
        self.next_lsn += 1;
        self.unsynced += 1;

        let due = match self.sync {
            SyncStrategy::EveryWrite => true,
            SyncStrategy::EveryNEntries { count } => self.unsynced >= count.max(1),
        };
        if due {
            self.sync()?;
        } else {
            self.writer.flush()?;
        }
        Ok(lsn)
    }

    /// Force buffered entries to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Replace the log with one `Put` per live record, keeping versions.
    pub fn rewrite(&mut self, records: &[Record]) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            for record in records {
                let op = LogOp::Put {
                    key: record.key.clone(),
                    value: record.value.clone(),
                };
                write_entry(&mut writer, record.version, &op)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        self.sync()?;
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.unsynced = 0;
        Ok(())
    }

    pub fn next_lsn(&self) -> u64 {
        self.next_lsn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_entry<W: Write>(writer: &mut W, lsn: u64, op: &LogOp) -> Result<()> {
    let data = bincode::serialize(op)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&lsn.to_le_bytes());
    hasher.update(&data);
    let crc = hasher.finalize();

    writer.write_all(&lsn.to_le_bytes())?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(&(data.len() as u32).to_le_bytes())?;
    writer.write_all(&data)?;
    Ok(())
}

/// Read one entry; `Ok(None)` at a clean end of file
fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(u64, LogOp, u64)>> {
    let mut header = [0u8; ENTRY_HEADER_SIZE];
    match reader.read_exact(&mut header[..1]) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut header[1..])?;

    let lsn = u64::from_le_bytes(header[0..8].try_into().unwrap_or_default());
    let crc = u32::from_le_bytes(header[8..12].try_into().unwrap_or_default());
    let len = u32::from_le_bytes(header[12..16].try_into().unwrap_or_default());
    if len > MAX_ENTRY_SIZE {
        return Err(CradleError::LogCorruption(format!(
            "entry {} claims {} bytes",
            lsn, len
        )));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&lsn.to_le_bytes());
    hasher.update(&data);
    if hasher.finalize() != crc {
        return Err(CradleError::LogCorruption(format!("CRC mismatch at LSN {}", lsn)));
    }

    let op: LogOp = bincode::deserialize(&data)?;
    Ok(Some((lsn, op, (ENTRY_HEADER_SIZE + data.len()) as u64)))
}
