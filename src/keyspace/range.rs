//! Key ranges
//!
//! Half-open intervals over the lexicographically ordered byte keyspace.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CradleError;

/// A half-open interval `[start, end)` of the keyspace.
///
/// `end = None` means the range is unbounded above. The empty key is the
/// minimum of the keyspace, so `KeyRange::full()` is `["", ∞)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    start: Vec<u8>,
    end: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: Option<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end,
        }
    }

    /// The whole keyspace
    pub fn full() -> Self {
        Self {
            start: Vec::new(),
            end: None,
        }
    }

    pub fn start(&self) -> &[u8] {
        &self.start
    }

    pub fn end(&self) -> Option<&[u8]> {
        self.end.as_deref()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && self.end.as_deref().map_or(true, |end| key < end)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.end.as_deref(), Some(end) if end <= self.start.as_slice())
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        // Each must start before the other ends
        end_after(other.end(), &self.start) && end_after(self.end(), &other.start)
    }

    /// True when `other` lies entirely inside `self`
    pub fn covers(&self, other: &KeyRange) -> bool {
        other.start >= self.start && cmp_end(other.end(), self.end()) != Ordering::Greater
    }

    /// True when `self` ends exactly where `other` starts
    pub fn precedes(&self, other: &KeyRange) -> bool {
        self.end.as_deref() == Some(other.start.as_slice())
    }

    /// Split into `[start, boundary)` and `[boundary, end)`.
    ///
    /// Returns `None` unless both halves are non-empty.
    pub fn split_at(&self, boundary: &[u8]) -> Option<(KeyRange, KeyRange)> {
        if boundary <= self.start.as_slice() || !self.contains(boundary) {
            return None;
        }
        let lower = KeyRange::new(self.start.clone(), Some(boundary.to_vec()));
        let upper = KeyRange::new(boundary.to_vec(), self.end.clone());
        Some((lower, upper))
    }

    /// Join two adjacent ranges, in either order
    pub fn join(&self, other: &KeyRange) -> Option<KeyRange> {
        if self.precedes(other) {
            Some(KeyRange::new(self.start.clone(), other.end.clone()))
        } else if other.precedes(self) {
            Some(KeyRange::new(other.start.clone(), self.end.clone()))
        } else {
            None
        }
    }

    pub fn intersect(&self, other: &KeyRange) -> Option<KeyRange> {
        if !self.overlaps(other) {
            return None;
        }
        let start = self.start.clone().max(other.start.clone());
        let end = match cmp_end(self.end(), other.end()) {
            Ordering::Greater => other.end.clone(),
            _ => self.end.clone(),
        };
        Some(KeyRange::new(start, end))
    }
}

/// Order two upper bounds where `None` is +∞
pub(crate) fn cmp_end(a: Option<&[u8]>, b: Option<&[u8]>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// True when an upper bound lies strictly after `key`
pub(crate) fn end_after(end: Option<&[u8]>, key: &[u8]) -> bool {
    end.map_or(true, |end| end > key)
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[\"{}\", ", self.start.escape_ascii())?;
        match &self.end {
            Some(end) => write!(f, "\"{}\")", end.escape_ascii()),
            None => write!(f, "∞)"),
        }
    }
}

/// Parses `start..end`; either side may be blank (`..m`, `g..`, `..`)
impl FromStr for KeyRange {
    type Err = CradleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once("..")
            .ok_or_else(|| CradleError::Config(format!("range {:?} is not start..end", s)))?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.as_bytes().to_vec())
        };
        Ok(KeyRange::new(start.as_bytes().to_vec(), end))
    }
}
