//! Directory
//!
//! The versioned partition of the keyspace. Segments are sorted by start
//! key, contiguous, and together cover `["", ∞)` exactly; unowned space is
//! an explicit segment without an owner. Every mutation returns a new
//! Directory with the next version and leaves `self` untouched, so
//! published snapshots stay immutable behind an `Arc`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CradleError, Result};

use super::range::cmp_end;
use super::KeyRange;

/// Who serves a segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    /// Router name (unique per host)
    pub name: String,

    /// Advertised address of the host running the router
    pub host: String,
}

impl Owner {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.host)
    }
}

/// One slice of the partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub range: KeyRange,
    pub owner: Option<Owner>,
}

/// Versioned mapping from key ranges to owners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    version: u64,

    /// Advertised address of the host this copy belongs to
    host: String,

    segments: Vec<Segment>,
}

impl Directory {
    /// A fresh directory: version 1, the whole keyspace unowned
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            version: 1,
            host: host.into(),
            segments: vec![Segment {
                range: KeyRange::full(),
                owner: None,
            }],
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_local(&self, owner: &Owner) -> bool {
        owner.host == self.host
    }

    /// The segment containing `key`
    pub fn lookup(&self, key: &[u8]) -> &Segment {
        // segments[0] starts at "" so the partition point is at least 1
        let idx = self
            .segments
            .partition_point(|seg| seg.range.start() <= key)
            .saturating_sub(1);
        &self.segments[idx]
    }

    pub fn owner_of(&self, key: &[u8]) -> Option<&Owner> {
        self.lookup(key).owner.as_ref()
    }

    /// Segments owned by routers on this host
    pub fn local_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments
            .iter()
            .filter(move |seg| seg.owner.as_ref().map_or(false, |o| self.is_local(o)))
    }

    /// Range of a local router
    pub fn local_range(&self, name: &str) -> Option<&KeyRange> {
        self.local_segments()
            .find(|seg| seg.owner.as_ref().map_or(false, |o| o.name == name))
            .map(|seg| &seg.range)
    }

    /// Check the partition invariant: sorted, contiguous, non-empty, covering
    /// `["", ∞)`, unowned runs coalesced and every owner appearing once.
    pub fn validate(&self) -> Result<()> {
        let first = self
            .segments
            .first()
            .ok_or_else(|| CradleError::RangeConflict("directory has no segments".to_string()))?;
        if !first.range.start().is_empty() {
            return Err(CradleError::RangeConflict(format!(
                "directory does not start at the minimum key: {}",
                first.range
            )));
        }
        for pair in self.segments.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if !a.range.precedes(&b.range) {
                return Err(CradleError::RangeConflict(format!(
                    "gap or overlap between {} and {}",
                    a.range, b.range
                )));
            }
            if a.owner.is_none() && b.owner.is_none() {
                return Err(CradleError::RangeConflict(format!(
                    "uncoalesced unowned segments {} and {}",
                    a.range, b.range
                )));
            }
        }
        if let Some(last) = self.segments.last() {
            if last.range.end().is_some() {
                return Err(CradleError::RangeConflict(format!(
                    "directory does not reach the end of the keyspace: {}",
                    last.range
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for seg in &self.segments {
            if seg.range.is_empty() {
                return Err(CradleError::RangeConflict(format!(
                    "empty segment {}",
                    seg.range
                )));
            }
            if let Some(owner) = &seg.owner {
                if !seen.insert(owner) {
                    return Err(CradleError::RangeConflict(format!(
                        "{} owns more than one segment",
                        owner
                    )));
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Mutations (each returns the next version)
    // =========================================================================

    /// Give a currently unowned range to a new owner
    pub fn assign(&self, range: &KeyRange, owner: Owner) -> Result<Directory> {
        self.check_assignable(range, &owner, |_| false)?;
        Ok(self.next(self.overwrite(range, Some(owner))))
    }

    /// Record a range served by another host.
    ///
    /// Unlike [`assign`](Self::assign) this may replace segments previously
    /// attributed to other hosts, since their view of themselves is newer
    /// than ours. Locally owned segments are never replaced.
    pub fn assign_remote(&self, range: &KeyRange, owner: Owner) -> Result<Directory> {
        if self.is_local(&owner) {
            return Err(CradleError::RangeConflict(format!(
                "{} is not a remote owner",
                owner
            )));
        }
        self.check_assignable(range, &owner, |existing| !self.is_local(existing))?;
        // The owner may have moved: drop its previous segment first
        let mut segments = self.segments.clone();
        for seg in segments.iter_mut() {
            if seg.owner.as_ref() == Some(&owner) {
                seg.owner = None;
            }
        }
        let cleared = Directory {
            version: self.version,
            host: self.host.clone(),
            segments: coalesce(segments),
        };
        Ok(self.next(cleared.overwrite(range, Some(owner))))
    }

    /// Return a local router's range to the unowned pool
    pub fn release(&self, name: &str) -> Result<Directory> {
        let range = self.require_local(name)?.clone();
        Ok(self.next(self.overwrite(&range, None)))
    }

    /// Drop every segment attributed to `host` (peer went away)
    pub fn release_host(&self, host: &str) -> Directory {
        let segments = self
            .segments
            .iter()
            .cloned()
            .map(|mut seg| {
                if seg.owner.as_ref().map_or(false, |o| o.host == host) {
                    seg.owner = None;
                }
                seg
            })
            .collect();
        self.next(coalesce(segments))
    }

    /// Hand `[boundary, end)` of `name`'s range to `upper_owner`
    pub fn split(&self, name: &str, boundary: &[u8], upper_owner: Owner) -> Result<Directory> {
        let range = self.require_local(name)?;
        let (_, upper) = range.split_at(boundary).ok_or_else(|| {
            CradleError::RangeConflict(format!(
                "boundary \"{}\" is not strictly inside {}",
                boundary.escape_ascii(),
                range
            ))
        })?;
        self.check_unique(&upper_owner)?;
        Ok(self.next(self.overwrite(&upper, Some(upper_owner))))
    }

    /// Give `absorbed`'s range to `survivor`; the ranges must be adjacent
    pub fn merge(&self, survivor: &str, absorbed: &str) -> Result<Directory> {
        let a = self.require_local(survivor)?;
        let b = self.require_local(absorbed)?;
        let combined = a.join(b).ok_or_else(|| {
            CradleError::RangeConflict(format!(
                "{} {} and {} {} are not adjacent",
                survivor, a, absorbed, b
            ))
        })?;
        let owner = Owner::new(survivor, self.host.clone());
        Ok(self.next(self.overwrite(&combined, Some(owner))))
    }

    /// Re-home local owners onto a new advertised address (host restart)
    pub fn rehost(&self, host: impl Into<String>) -> Directory {
        let host = host.into();
        let segments = self
            .segments
            .iter()
            .cloned()
            .map(|mut seg| {
                if let Some(owner) = seg.owner.as_mut() {
                    if owner.host == self.host {
                        owner.host = host.clone();
                    }
                }
                seg
            })
            .collect();
        Directory {
            version: self.version + 1,
            host,
            segments,
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn next(&self, segments: Vec<Segment>) -> Directory {
        Directory {
            version: self.version + 1,
            host: self.host.clone(),
            segments,
        }
    }

    fn require_local(&self, name: &str) -> Result<&KeyRange> {
        self.local_range(name)
            .ok_or_else(|| CradleError::UnknownNode(name.to_string()))
    }

    fn check_unique(&self, owner: &Owner) -> Result<()> {
        let taken = self
            .segments
            .iter()
            .any(|seg| seg.owner.as_ref() == Some(owner));
        if taken {
            return Err(CradleError::RangeConflict(format!(
                "{} already owns a range",
                owner
            )));
        }
        Ok(())
    }

    fn check_assignable(
        &self,
        range: &KeyRange,
        owner: &Owner,
        replaceable: impl Fn(&Owner) -> bool,
    ) -> Result<()> {
        if range.is_empty() {
            return Err(CradleError::RangeConflict(format!("empty range {}", range)));
        }
        for seg in self.segments.iter().filter(|seg| seg.range.overlaps(range)) {
            match &seg.owner {
                Some(existing) if existing == owner => {}
                Some(existing) if !replaceable(existing) => {
                    return Err(CradleError::RangeConflict(format!(
                        "{} overlaps {} owned by {}",
                        range, seg.range, existing
                    )));
                }
                _ => {}
            }
        }
        if !replaceable(owner) {
            self.check_unique(owner)?;
        }
        Ok(())
    }

    /// Segments with `range` cut out of whatever held it and given to `owner`
    fn overwrite(&self, range: &KeyRange, owner: Option<Owner>) -> Vec<Segment> {
        let mut out = Vec::with_capacity(self.segments.len() + 2);
        for seg in &self.segments {
            if !seg.range.overlaps(range) {
                out.push(seg.clone());
                continue;
            }
            if seg.range.start() < range.start() {
                out.push(Segment {
                    range: KeyRange::new(seg.range.start().to_vec(), Some(range.start().to_vec())),
                    owner: seg.owner.clone(),
                });
            }
            if let Some(end) = range.end() {
                if cmp_end(seg.range.end(), Some(end)).is_gt() {
                    out.push(Segment {
                        range: KeyRange::new(end.to_vec(), seg.range.end().map(<[u8]>::to_vec)),
                        owner: seg.owner.clone(),
                    });
                }
            }
        }
        out.push(Segment {
            range: range.clone(),
            owner,
        });
        out.sort_by(|a, b| a.range.start().cmp(b.range.start()));
        coalesce(out)
    }
}

/// Merge neighbouring unowned segments
fn coalesce(segments: Vec<Segment>) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    for seg in segments {
        match out.last_mut() {
            Some(prev) if prev.owner.is_none() && seg.owner.is_none() => {
                prev.range = KeyRange::new(
                    prev.range.start().to_vec(),
                    seg.range.end().map(<[u8]>::to_vec),
                );
            }
            _ => out.push(seg),
        }
    }
    out
}

impl fmt::Display for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "directory v{} (host {})", self.version, self.host)?;
        for seg in &self.segments {
            match &seg.owner {
                Some(owner) => writeln!(f, "  {} -> {}", seg.range, owner)?,
                None => writeln!(f, "  {} -> (unowned)", seg.range)?,
            }
        }
        Ok(())
    }
}
