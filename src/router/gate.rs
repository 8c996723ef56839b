//! Write gate
//!
//! Closed while a router takes part in a split or merge. PUTs arriving
//! behind a closed gate are parked with their arrival time and replayed
//! in arrival order once the migration has published its directory.

use std::time::Instant;

use crate::error::CradleError;

use super::Envelope;

/// A write parked behind a closed gate
pub(crate) struct Queued {
    pub arrived: Instant,
    pub envelope: Envelope,
}

impl Queued {
    pub fn now(envelope: Envelope) -> Self {
        Self {
            arrived: Instant::now(),
            envelope,
        }
    }
}

pub(crate) enum Gate {
    Open,
    Migrating(Vec<Queued>),
}

impl Gate {
    pub fn is_open(&self) -> bool {
        matches!(self, Gate::Open)
    }

    /// Close the gate; a gate that is already closed keeps its queue
    pub fn close(&mut self) {
        if self.is_open() {
            *self = Gate::Migrating(Vec::new());
        }
    }

    /// Park `envelope` if closed, otherwise hand it back
    pub fn park(&mut self, envelope: Envelope) -> Option<Envelope> {
        self.prune();
        match self {
            Gate::Open => Some(envelope),
            Gate::Migrating(queue) => {
                queue.push(Queued::now(envelope));
                None
            }
        }
    }

    /// Take the live parked writes, leaving the gate closed
    pub fn drain(&mut self) -> Vec<Queued> {
        self.prune();
        match self {
            Gate::Open => Vec::new(),
            Gate::Migrating(queue) => std::mem::take(queue),
        }
    }

    /// Parked writes whose caller is still waiting
    pub fn queued(&mut self) -> usize {
        self.prune();
        match self {
            Gate::Open => 0,
            Gate::Migrating(queue) => queue.len(),
        }
    }

    /// Answer and drop parked writes whose caller gave up
    fn prune(&mut self) {
        let Gate::Migrating(queue) = self else {
            return;
        };
        if !queue.iter().any(|queued| queued.envelope.is_cancelled()) {
            return;
        }
        let (cancelled, live): (Vec<Queued>, Vec<Queued>) = std::mem::take(queue)
            .into_iter()
            .partition(|queued| queued.envelope.is_cancelled());
        *queue = live;
        tracing::trace!("Dropping {} cancelled parked write(s)", cancelled.len());
        for queued in cancelled {
            queued
                .envelope
                .fail(&CradleError::Timeout("request cancelled".to_string()));
        }
    }
}

/// Interleave two arrival-ordered queues into one
pub(crate) fn merge_by_arrival(a: Vec<Queued>, b: Vec<Queued>) -> Vec<Queued> {
    let mut merged: Vec<Queued> = a.into_iter().chain(b).collect();
    // Stable: equal instants keep their queue order
    merged.sort_by_key(|queued| queued.arrived);
    merged
}
