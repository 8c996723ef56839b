//! Cradle Module
//!
//! The per-host orchestrator. The cradle owns every router on the host
//! together with its store and cache, is the only writer of the directory,
//! and runs the lifecycle operations that reshape the keyspace.
//!
//! ## Startup
//! 1. Load `{data_dir}/directory.bin` (or start from an empty directory)
//! 2. Bind the connection manager; the advertised address is the host identity
//! 3. Re-home the directory onto that identity
//! 4. Re-create a router for every locally owned segment
//! 5. Record `--peer` assignments
//!
//! ## Mutual Exclusion
//! A host-wide busy-set keyed by router name. A lifecycle operation that
//! touches a busy router fails with `MigrationConflict` at once; operations
//! on disjoint routers run concurrently and only serialize on the brief
//! directory publish.

mod lifecycle;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::cache::RecencyCache;
use crate::config::{Config, NodeConfig, StorageKind};
use crate::error::{CradleError, Result};
use crate::keyspace::{persist, Directory, DirectoryHandle, KeyRange, Owner};
use crate::maintain::{Event, EventLog, Maintain};
use crate::monitor::{Monitor, Rebalance, ThresholdMonitor};
use crate::network::{ConnectionManager, ControlPlane};
use crate::protocol::{AdminCommand, Frame, Payload, Request, Response};
use crate::router::{Claim, Router, RouterDeps, RouterOptions};
use crate::storage::{DiskProvider, MemoryProvider, StoreProvider};

/// Persisted directory file inside the data directory
pub const DIRECTORY_FILE: &str = "directory.bin";

/// Lifecycle event log inside the data directory
pub const EVENTS_FILE: &str = "events.log";

/// Collaborators injected into every router the cradle creates
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn StoreProvider>,
    pub monitor: Arc<dyn Monitor>,
    pub maintain: Arc<dyn Maintain>,
}

impl Collaborators {
    /// The default stack for `config`: provider per `storage`, a threshold
    /// monitor and an event log in the data directory.
    pub fn from_config(config: &Config) -> Result<Self> {
        let provider: Arc<dyn StoreProvider> = match config.storage {
            StorageKind::Disk { sync } => Arc::new(DiskProvider::new(
                config.nodes_dir(),
                sync,
                config.store_timeout(),
            )),
            StorageKind::Memory => Arc::new(MemoryProvider::new(config.store_timeout())),
        };
        let events = EventLog::start(Some(config.data_dir.join(EVENTS_FILE)))?;
        Ok(Self {
            provider,
            monitor: Arc::new(ThresholdMonitor::new(
                config.split_threshold,
                config.merge_threshold,
            )),
            maintain: Arc::new(events),
        })
    }
}

/// Per-host orchestrator
pub struct Cradle {
    config: Config,
    host: String,
    directory: Arc<DirectoryHandle>,
    manager: Arc<ConnectionManager>,
    collaborators: Collaborators,
    options: RouterOptions,

    routers: RwLock<HashMap<String, Arc<Router>>>,
    busy: Mutex<HashSet<String>>,

    rebalancer: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    closed: AtomicBool,
}

impl Cradle {
    /// Open a cradle with the default collaborators
    pub fn open(config: Config) -> Result<Arc<Cradle>> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let collaborators = Collaborators::from_config(&config)?;
        Self::open_with(config, collaborators)
    }

    /// Open a cradle with caller-supplied collaborators
    pub fn open_with(config: Config, collaborators: Collaborators) -> Result<Arc<Cradle>> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let directory_path = config.data_dir.join(DIRECTORY_FILE);
        let persisted = persist::load(&directory_path)?;
        let recovering = persisted.is_some();
        let initial = persisted.unwrap_or_else(|| Directory::new(String::new()));

        let directory = Arc::new(DirectoryHandle::new(initial, Some(directory_path)));
        let manager = ConnectionManager::new(config.clone(), Arc::clone(&directory))?;
        let bound = manager.listen()?;
        let host = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| bound.to_string());

        // Persist even an unchanged identity so the file exists from now on
        let rehosted = directory.snapshot().rehost(host.clone());
        if let Err(e) = directory.publish(rehosted) {
            manager.shutdown();
            return Err(e);
        }

        let cradle = Arc::new(Cradle {
            options: RouterOptions::from(&config),
            config,
            host,
            directory,
            manager,
            collaborators,
            routers: RwLock::new(HashMap::new()),
            busy: Mutex::new(HashSet::new()),
            rebalancer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let control: Weak<dyn ControlPlane> = Arc::downgrade(&cradle) as Weak<dyn ControlPlane>;
        cradle.manager.attach(control);

        let recovered = cradle.recover()?;
        if recovering {
            cradle.collaborators.maintain.log_event(Event::Recovered {
                nodes: recovered,
                version: cradle.directory.version(),
            });
        }
        cradle.apply_peer_flags()?;
        cradle.start_rebalancer()?;

        tracing::info!(
            "Cradle up on {} with {} router(s), directory v{}",
            cradle.host,
            recovered,
            cradle.directory.version()
        );
        Ok(cradle)
    }

    /// Restart a router for every segment the directory assigns to this host
    fn recover(&self) -> Result<usize> {
        let snapshot = self.directory.snapshot();
        let local: Vec<(String, KeyRange)> = snapshot
            .local_segments()
            .filter_map(|segment| {
                segment
                    .owner
                    .as_ref()
                    .map(|owner| (owner.name.clone(), segment.range.clone()))
            })
            .collect();

        for (name, range) in &local {
            let router = self.start_router(name, range, Claim::Resume)?;
            self.routers.write().insert(name.clone(), router);
            tracing::info!("Recovered router {} for {}", name, range);
        }
        Ok(local.len())
    }

    fn apply_peer_flags(&self) -> Result<()> {
        for assignment in &self.config.peers {
            let (range, owner) = parse_assignment(assignment)?;
            let current = self.directory.snapshot();
            let already = current
                .segments()
                .iter()
                .any(|segment| segment.range == range && segment.owner.as_ref() == Some(&owner));
            if !already {
                self.assign_remote(range, owner)?;
            }
        }
        Ok(())
    }

    fn start_rebalancer(self: &Arc<Self>) -> Result<()> {
        if self.config.rebalance_interval_ms == 0 {
            return Ok(());
        }
        let interval = Duration::from_millis(self.config.rebalance_interval_ms);
        let (stop, stopped) = channel::bounded::<()>(1);
        let cradle = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("rebalancer".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let Some(live) = cradle.upgrade() else {
                    break;
                };
                match live.rebalance_once() {
                    Ok(Rebalance::None) => {}
                    Ok(advice) => tracing::info!("Rebalanced: {:?}", advice),
                    Err(e) => tracing::warn!("Rebalance failed: {}", e),
                }
            })?;
        *self.rebalancer.lock() = Some((stop, handle));
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Advertised address identifying this host in the directory
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.manager.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The latest published directory
    pub fn directory(&self) -> Arc<Directory> {
        self.directory.snapshot()
    }

    pub fn directory_handle(&self) -> &Arc<DirectoryHandle> {
        &self.directory
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn router(&self, name: &str) -> Option<Arc<Router>> {
        self.routers.read().get(name).cloned()
    }

    /// Names of the live routers, sorted
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Route a request from inside the process and wait for the answer
    pub fn submit(&self, request: Request) -> Result<Response> {
        self.manager.submit(request)
    }

    // =========================================================================
    // Peers
    // =========================================================================

    /// Record that `owner` (on another host) serves `range`
    pub fn assign_remote(&self, range: KeyRange, owner: Owner) -> Result<()> {
        let published = self
            .directory
            .update(|current| current.assign_remote(&range, owner.clone()))?;
        tracing::info!("Assigned {} to {} (directory v{})", range, owner, published.version());
        self.collaborators.maintain.log_event(Event::DirectoryPublished {
            version: published.version(),
        });
        Ok(())
    }

    /// Adopt the segments a peer host reports owning itself.
    ///
    /// Returns the number of segments adopted.
    pub fn sync_peer(&self, addr: &str) -> Result<usize> {
        let response = self.manager.call_peer(addr, &Frame::Directory)?;
        let peer = match response.into_result()? {
            Some(Payload::Directory(directory)) => directory,
            other => {
                return Err(CradleError::Protocol(format!(
                    "peer {} answered DIRECTORY with {:?}",
                    addr, other
                )))
            }
        };
        if peer.host() == self.host {
            return Err(CradleError::Config(format!("{} is this host", addr)));
        }

        let owned: Vec<(KeyRange, Owner)> = peer
            .segments()
            .iter()
            .filter_map(|segment| match &segment.owner {
                Some(owner) if owner.host == peer.host() => {
                    Some((segment.range.clone(), owner.clone()))
                }
                _ => None,
            })
            .collect();

        let published = self.directory.update(|current| {
            let mut next = current.release_host(peer.host());
            for (range, owner) in &owned {
                next = next.assign_remote(range, owner.clone())?;
            }
            Ok(next)
        })?;

        tracing::info!(
            "Synced {} segment(s) from {} (peer v{}, local v{})",
            owned.len(),
            peer.host(),
            peer.version(),
            published.version()
        );
        self.collaborators.maintain.log_event(Event::PeerSynced {
            addr: addr.to_string(),
            version: published.version(),
        });
        Ok(owned.len())
    }

    // =========================================================================
    // Rebalancing
    // =========================================================================

    /// Report health for every router, then act on the monitor's advice
    pub fn rebalance_once(&self) -> Result<Rebalance> {
        let routers: Vec<Arc<Router>> = self.routers.read().values().cloned().collect();
        for router in routers {
            router.report_health()?;
        }

        let advice = self.collaborators.monitor.suggest_rebalance();
        match &advice {
            Rebalance::Split { name, boundary } => {
                self.split_node(name, boundary)?;
            }
            Rebalance::Merge { a, b } => {
                self.merge_node(a, b)?;
            }
            Rebalance::None => {}
        }
        Ok(advice)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop the rebalancer, drain connections and routers, flush stores
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Cradle on {} shutting down", self.host);

        if let Some((stop, handle)) = self.rebalancer.lock().take() {
            drop(stop);
            // The last Arc may be released on the rebalancer thread itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        self.manager.shutdown();

        let routers: Vec<Arc<Router>> = self.routers.write().drain().map(|(_, r)| r).collect();
        for router in routers {
            if let Err(e) = router.store().flush() {
                tracing::warn!("Flushing store of {} failed: {}", router.name(), e);
            }
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn start_router(&self, name: &str, range: &KeyRange, claim: Claim) -> Result<Arc<Router>> {
        let provider = &self.collaborators.provider;
        let store = provider.open(name)?;
        let deps = RouterDeps {
            manager: Arc::clone(&self.manager),
            directory: Arc::clone(&self.directory),
            store,
            cache: Arc::new(RecencyCache::new(
                self.config.cache_capacity,
                self.config.store_timeout(),
            )),
            monitor: Arc::clone(&self.collaborators.monitor),
            maintain: Arc::clone(&self.collaborators.maintain),
        };
        let node = NodeConfig::new(name, range.clone(), provider.location(name));
        Router::init(&node, deps, claim, self.options.clone())
    }

    fn owner(&self, name: &str) -> Owner {
        Owner::new(name, self.host.clone())
    }

    fn log_publish(&self, directory: &Directory) {
        self.collaborators.maintain.log_event(Event::DirectoryPublished {
            version: directory.version(),
        });
    }

    /// Claim every name in `names`, or none of them
    fn claim<'a>(&'a self, names: &[&str]) -> Result<BusyGuard<'a>> {
        let mut busy = self.busy.lock();
        if let Some(taken) = names.iter().find(|name| busy.contains(**name)) {
            return Err(CradleError::MigrationConflict(format!(
                "router {} is busy with another lifecycle operation",
                taken
            )));
        }
        for name in names {
            busy.insert(name.to_string());
        }
        Ok(BusyGuard {
            busy: &self.busy,
            names: names.iter().map(|name| name.to_string()).collect(),
        })
    }
}

impl ControlPlane for Cradle {
    fn execute(&self, command: AdminCommand) -> Result<Response> {
        let text = match command {
            AdminCommand::CreateNode { name, range } => {
                self.create_node(&name, range.clone())?;
                format!("created {} for {}", name, range)
            }
            AdminCommand::DeleteNode { name } => {
                self.delete_node(&name)?;
                format!("deleted {}", name)
            }
            AdminCommand::Split { name, boundary } => {
                let created = self.split_node(&name, &boundary)?;
                format!("split {} at {:?} into {}", name, String::from_utf8_lossy(&boundary), created)
            }
            AdminCommand::Merge { a, b } => {
                let survivor = self.merge_node(&a, &b)?;
                format!("merged {} and {} into {}", a, b, survivor)
            }
            AdminCommand::SyncPeer { addr } => {
                let adopted = self.sync_peer(&addr)?;
                format!("adopted {} segment(s) from {}", adopted, addr)
            }
            AdminCommand::Rebalance => format!("{:?}", self.rebalance_once()?),
        };
        Ok(Response::message(text))
    }
}

impl Drop for Cradle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Releases claimed router names when dropped
struct BusyGuard<'a> {
    busy: &'a Mutex<HashSet<String>>,
    names: Vec<String>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self.busy.lock();
        for name in &self.names {
            busy.remove(name);
        }
    }
}

/// Parse `start..end=name@host`
pub fn parse_assignment(text: &str) -> Result<(KeyRange, Owner)> {
    let (range, owner) = text
        .split_once('=')
        .ok_or_else(|| CradleError::Config(format!("expected start..end=name@host, got {:?}", text)))?;
    let range: KeyRange = range.parse()?;
    let (name, host) = owner
        .split_once('@')
        .ok_or_else(|| CradleError::Config(format!("expected name@host, got {:?}", owner)))?;
    if name.is_empty() || host.is_empty() {
        return Err(CradleError::Config(format!("incomplete owner {:?}", owner)));
    }
    Ok((range, Owner::new(name, host)))
}
