//! Directory persistence
//!
//! ## File Format
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────────────────┐
//! │Magic (4) │ CRC (4)  │ Len (4)  │  bincode(Directory)  │
//! └──────────┴──────────┴──────────┴──────────────────────┘
//! ```
//!
//! Written to a temporary file, synced, then renamed over the old copy so
//! a crash leaves either the previous or the new directory on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{CradleError, Result};

use super::Directory;

const MAGIC: &[u8; 4] = b"CKVD";
const HEADER_SIZE: usize = 12;

/// Write the directory atomically
pub fn save(path: &Path, directory: &Directory) -> Result<()> {
    let data = bincode::serialize(directory)?;
    let crc = crc32fast::hash(&data);

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(MAGIC)?;
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&(data.len() as u32).to_le_bytes())?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read a previously saved directory; `Ok(None)` if none exists
pub fn load(path: &Path) -> Result<Option<Directory>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    if bytes.len() < HEADER_SIZE || &bytes[0..4] != MAGIC {
        return Err(CradleError::Storage(format!(
            "{} is not a directory file",
            path.display()
        )));
    }
    let crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let data = bytes.get(HEADER_SIZE..HEADER_SIZE + len).ok_or_else(|| {
        CradleError::Storage(format!("{} is truncated", path.display()))
    })?;
    if crc32fast::hash(data) != crc {
        return Err(CradleError::Storage(format!(
            "{} failed its checksum",
            path.display()
        )));
    }

    let directory: Directory = bincode::deserialize(data)?;
    directory.validate()?;
    Ok(Some(directory))
}
