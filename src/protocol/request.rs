//! Request definitions
//!
//! Represents requests from clients and peer hosts.

use serde::{Deserialize, Serialize};

use crate::error::{CradleError, Result};
use crate::keyspace::KeyRange;

/// Largest key accepted on the wire (64 KiB)
pub const MAX_KEY_SIZE: usize = 64 * 1024;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0x01,
    Admin = 0x02,
    Directory = 0x03,
    Ping = 0x04,
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// GET / PUT / LIST
    Request(Request),

    /// Lifecycle command for the receiving host's cradle
    Admin(AdminCommand),

    /// Fetch the receiving host's directory
    Directory,

    /// Ping (health check)
    Ping,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Request(_) => FrameKind::Request,
            Frame::Admin(_) => FrameKind::Admin,
            Frame::Directory => FrameKind::Directory,
            Frame::Ping => FrameKind::Ping,
        }
    }
}

/// Data operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Get,
    Put,
    List,
}

/// Predicate for LIST
///
/// A LIST starting at `key` returns records with `key <= k`, `k < end`
/// (when set) and `k` starting with `prefix` (when set), at most `limit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    pub prefix: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
    pub limit: Option<u32>,
}

impl ListFilter {
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub fn with_end(mut self, end: impl Into<Vec<u8>>) -> Self {
        self.end = Some(end.into());
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, key: &[u8]) -> bool {
        let below_end = self.end.as_deref().map_or(true, |end| key < end);
        let prefixed = self
            .prefix
            .as_deref()
            .map_or(true, |prefix| key.starts_with(prefix));
        below_end && prefixed
    }

    /// The key range a LIST starting at `start` may touch
    pub fn scan_range(&self, start: &[u8]) -> KeyRange {
        let mut start = start.to_vec();
        if let Some(prefix) = &self.prefix {
            if prefix.as_slice() > start.as_slice() {
                start = prefix.clone();
            }
        }
        let mut end = self.end.clone();
        if let Some(limit) = self.prefix.as_deref().and_then(prefix_successor) {
            if end.as_ref().map_or(true, |end| limit < *end) {
                end = Some(limit);
            }
        }
        KeyRange::new(start, end)
    }
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < u8::MAX {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}

/// A GET, PUT or LIST request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub op: Operation,

    /// Target key; for LIST the inclusive scan start
    pub key: Vec<u8>,

    /// Value to store (PUT only)
    pub value: Option<Vec<u8>>,

    /// Predicate (LIST only)
    pub filter: Option<ListFilter>,

    /// Forwards taken so far
    pub hop_count: u8,
}

impl Request {
    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: Operation::Get,
            key: key.into(),
            value: None,
            filter: None,
            hop_count: 0,
        }
    }

    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: Operation::Put,
            key: key.into(),
            value: Some(value.into()),
            filter: None,
            hop_count: 0,
        }
    }

    pub fn list(start: impl Into<Vec<u8>>, filter: ListFilter) -> Self {
        Self {
            op: Operation::List,
            key: start.into(),
            value: None,
            filter: Some(filter),
            hop_count: 0,
        }
    }

    pub fn with_hops(mut self, hops: u8) -> Self {
        self.hop_count = hops;
        self
    }

    /// Reject field combinations the operation does not accept
    pub fn validate(&self) -> Result<()> {
        if self.key.len() > MAX_KEY_SIZE {
            return Err(CradleError::MalformedRequest(format!(
                "key of {} bytes exceeds {} bytes",
                self.key.len(),
                MAX_KEY_SIZE
            )));
        }
        match self.op {
            Operation::Get => {
                if self.value.is_some() || self.filter.is_some() {
                    return Err(CradleError::MalformedRequest(
                        "GET takes neither a value nor a filter".to_string(),
                    ));
                }
            }
            Operation::Put => {
                if self.value.is_none() {
                    return Err(CradleError::MalformedRequest(
                        "PUT requires a value".to_string(),
                    ));
                }
                if self.filter.is_some() {
                    return Err(CradleError::MalformedRequest(
                        "PUT does not take a filter".to_string(),
                    ));
                }
            }
            Operation::List => {
                if self.value.is_some() {
                    return Err(CradleError::MalformedRequest(
                        "LIST does not take a value".to_string(),
                    ));
                }
                if self.filter.as_ref().and_then(|f| f.limit) == Some(0) {
                    return Err(CradleError::MalformedRequest(
                        "LIST limit must be positive".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Lifecycle commands executed by the receiving host's cradle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminCommand {
    CreateNode { name: String, range: KeyRange },
    DeleteNode { name: String },
    Split { name: String, boundary: Vec<u8> },
    Merge { a: String, b: String },
    SyncPeer { addr: String },
    Rebalance,
}
