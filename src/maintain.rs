//! Maintain collaborator
//!
//! Lifecycle events are handed to a background writer thread through a
//! bounded channel. `log_event` never blocks: when the queue is full the
//! event is counted as dropped.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::{self, Sender, TrySendError};
use parking_lot::Mutex;

use crate::error::Result;
use crate::keyspace::KeyRange;

/// Events queued before new ones are dropped
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Something worth recording about the host's topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    NodeCreated { name: String, range: KeyRange },
    NodeDeleted { name: String },
    RouterStarted { name: String, range: KeyRange },
    RouterRetired { name: String },
    NodeSplit { source: String, created: String, boundary: Vec<u8> },
    NodesMerged { survivor: String, absorbed: String },
    DirectoryPublished { version: u64 },
    PeerSynced { addr: String, version: u64 },
    Recovered { nodes: usize, version: u64 },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::NodeCreated { name, range } => write!(f, "node_created name={} range={}", name, range),
            Event::NodeDeleted { name } => write!(f, "node_deleted name={}", name),
            Event::RouterStarted { name, range } => write!(f, "router_started name={} range={}", name, range),
            Event::RouterRetired { name } => write!(f, "router_retired name={}", name),
            Event::NodeSplit { source, created, boundary } => write!(
                f,
                "node_split source={} created={} boundary={:?}",
                source,
                created,
                String::from_utf8_lossy(boundary)
            ),
            Event::NodesMerged { survivor, absorbed } => {
                write!(f, "nodes_merged survivor={} absorbed={}", survivor, absorbed)
            }
            Event::DirectoryPublished { version } => write!(f, "directory_published version={}", version),
            Event::PeerSynced { addr, version } => write!(f, "peer_synced addr={} version={}", addr, version),
            Event::Recovered { nodes, version } => write!(f, "recovered nodes={} version={}", nodes, version),
        }
    }
}

pub trait Maintain: Send + Sync {
    /// Record an event; must return immediately
    fn log_event(&self, event: Event);
}

/// Background event writer: `tracing` plus an optional append-only file
pub struct EventLog {
    sender: Mutex<Option<Sender<Event>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl EventLog {
    /// Start the writer thread; `path` is opened in append mode when given.
    pub fn start(path: Option<PathBuf>) -> Result<Self> {
        let file = match &path {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            None => None,
        };
        let (sender, receiver) = channel::bounded::<Event>(EVENT_QUEUE_CAPACITY);

        let writer = thread::Builder::new()
            .name("cradle-events".to_string())
            .spawn(move || {
                let mut out = file.map(BufWriter::new);
                for event in receiver {
                    tracing::info!(target: "cradlekv::events", "{}", event);
                    if let Some(out) = out.as_mut() {
                        if let Err(e) = append_line(out, &event) {
                            tracing::warn!("Event log write failed: {}", e);
                        }
                    }
                }
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Events discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flush queued events and stop the writer thread
    pub fn close(&self) {
        self.sender.lock().take();
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.join();
        }
    }
}

impl Maintain for EventLog {
    fn log_event(&self, event: Event) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        self.close();
    }
}

fn append_line(out: &mut BufWriter<File>, event: &Event) -> std::io::Result<()> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    writeln!(out, "{} {}", millis, event)?;
    out.flush()
}
