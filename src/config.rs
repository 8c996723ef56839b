//! Configuration for CradleKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CradleError, Result};
use crate::keyspace::KeyRange;

/// Main configuration for a CradleKV host
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all host state
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── directory.bin    (persisted directory)
    ///     ├── events.log       (lifecycle event log)
    ///     └── nodes/{name}/    (one store per router)
    pub data_dir: PathBuf,

    /// Which store backs each router
    pub storage: StorageKind,

    /// Max entries held by each router's recency cache
    pub cache_capacity: usize,

    /// Store/Cache lock acquisition bound (milliseconds)
    pub store_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,

    /// Address other hosts use to reach this one (defaults to the bound address)
    pub advertise_addr: Option<String>,

    /// Max concurrent inbound connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds)
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds)
    pub write_timeout_ms: u64,

    /// Time a connection waits for a request to resolve (milliseconds)
    pub request_timeout_ms: u64,

    /// Bound on one outbound relay to a peer host (milliseconds)
    pub forward_timeout_ms: u64,

    /// Connect attempts before a relay fails with ConnectionFailure
    pub connect_attempts: u32,

    /// First backoff delay between connect attempts (milliseconds)
    pub backoff_base_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub backoff_max_ms: u64,

    /// Idle pooled connections kept per peer
    pub max_idle_per_peer: usize,

    /// How long shutdown waits for in-flight connections (milliseconds)
    pub drain_timeout_ms: u64,

    /// Remote assignments (`start..end=name@host`) recorded at startup
    pub peers: Vec<String>,

    // -------------------------------------------------------------------------
    // Routing Configuration
    // -------------------------------------------------------------------------
    /// Maximum forwards before a request fails with RoutingLoop
    pub max_hops: u8,

    /// Hard cap on records returned by one LIST
    pub max_list_results: usize,

    /// Worker threads per router
    pub router_workers: usize,

    /// Inbound queue capacity per router
    pub router_queue_capacity: usize,

    /// Threads draining the manager's dispatch queue
    pub dispatch_workers: usize,

    // -------------------------------------------------------------------------
    // Rebalance Configuration
    // -------------------------------------------------------------------------
    /// Interval of the background rebalance loop (0 disables it)
    pub rebalance_interval_ms: u64,

    /// Record count above which the monitor suggests a split
    pub split_threshold: usize,

    /// Combined record count below which adjacent routers are merged
    pub merge_threshold: usize,
}

/// Store backend used for routers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Operation-logged store under `{data_dir}/nodes/{name}`
    Disk { sync: SyncStrategy },

    /// Volatile in-memory store
    Memory,
}

/// Log sync strategy: how often to fsync the operation log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced entries (balanced durability/performance)
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./cradlekv_data"),
            storage: StorageKind::Disk {
                sync: SyncStrategy::EveryNEntries { count: 100 },
            },
            cache_capacity: 10_000,
            store_timeout_ms: 1000,
            listen_addr: "127.0.0.1:7400".to_string(),
            advertise_addr: None,
            max_connections: 1024,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
            request_timeout_ms: 5000,
            forward_timeout_ms: 3000,
            connect_attempts: 4,
            backoff_base_ms: 20,
            backoff_max_ms: 500,
            max_idle_per_peer: 8,
            drain_timeout_ms: 5000,
            peers: Vec::new(),
            max_hops: 3,
            max_list_results: 1000,
            router_workers: 2,
            router_queue_capacity: 1024,
            dispatch_workers: 4,
            rebalance_interval_ms: 0,
            split_threshold: 100_000,
            merge_threshold: 1_000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject configurations the host cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(CradleError::Config("listen address is empty".to_string()));
        }
        if self.max_hops == 0 {
            return Err(CradleError::Config("max_hops must be at least 1".to_string()));
        }
        if self.router_workers == 0 || self.dispatch_workers == 0 {
            return Err(CradleError::Config(
                "router_workers and dispatch_workers must be at least 1".to_string(),
            ));
        }
        if self.router_queue_capacity == 0 {
            return Err(CradleError::Config(
                "router_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.connect_attempts == 0 {
            return Err(CradleError::Config(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_list_results == 0 {
            return Err(CradleError::Config(
                "max_list_results must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    /// Directory holding the persisted directory and node stores
    pub fn nodes_dir(&self) -> PathBuf {
        self.data_dir.join("nodes")
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the store backend
    pub fn storage(mut self, storage: StorageKind) -> Self {
        self.config.storage = storage;
        self
    }

    /// Set the per-router cache capacity
    pub fn cache_capacity(mut self, entries: usize) -> Self {
        self.config.cache_capacity = entries;
        self
    }

    /// Set the store/cache timeout (in milliseconds)
    pub fn store_timeout_ms(mut self, ms: u64) -> Self {
        self.config.store_timeout_ms = ms;
        self
    }

    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the address advertised to peers
    pub fn advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.advertise_addr = Some(addr.into());
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    /// Set the per-request resolution timeout (in milliseconds)
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    /// Set the outbound relay timeout (in milliseconds)
    pub fn forward_timeout_ms(mut self, ms: u64) -> Self {
        self.config.forward_timeout_ms = ms;
        self
    }

    /// Set connect attempts and backoff bounds for outbound relays
    pub fn retry(mut self, attempts: u32, base_ms: u64, max_ms: u64) -> Self {
        self.config.connect_attempts = attempts;
        self.config.backoff_base_ms = base_ms;
        self.config.backoff_max_ms = max_ms;
        self
    }

    /// Set the shutdown drain timeout (in milliseconds)
    pub fn drain_timeout_ms(mut self, ms: u64) -> Self {
        self.config.drain_timeout_ms = ms;
        self
    }

    /// Add a remote assignment in `start..end=name@host` form
    pub fn peer(mut self, assignment: impl Into<String>) -> Self {
        self.config.peers.push(assignment.into());
        self
    }

    /// Set the hop bound
    pub fn max_hops(mut self, hops: u8) -> Self {
        self.config.max_hops = hops;
        self
    }

    /// Set the LIST result cap
    pub fn max_list_results(mut self, count: usize) -> Self {
        self.config.max_list_results = count;
        self
    }

    /// Set worker threads per router
    pub fn router_workers(mut self, count: usize) -> Self {
        self.config.router_workers = count;
        self
    }

    /// Set inbound queue capacity per router
    pub fn router_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.router_queue_capacity = capacity;
        self
    }

    /// Set dispatch worker threads
    pub fn dispatch_workers(mut self, count: usize) -> Self {
        self.config.dispatch_workers = count;
        self
    }

    /// Set the background rebalance interval (0 disables)
    pub fn rebalance_interval_ms(mut self, ms: u64) -> Self {
        self.config.rebalance_interval_ms = ms;
        self
    }

    /// Set split and merge thresholds (record counts)
    pub fn thresholds(mut self, split: usize, merge: usize) -> Self {
        self.config.split_threshold = split;
        self.config.merge_threshold = merge;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Per-router configuration checked by `Router::init`
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Registered router name, unique per host
    pub name: String,

    /// Range the router will own
    pub range: KeyRange,

    /// Where the router's store lives (unused by in-memory stores)
    pub storage_path: PathBuf,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, range: KeyRange, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            range,
            storage_path: storage_path.into(),
        }
    }

    /// Names double as directory names, so keep them path-safe
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > 64 {
            return Err(CradleError::Config(format!(
                "node name must be 1-64 characters, got {:?}",
                self.name
            )));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(CradleError::Config(format!(
                "node name {:?} contains characters outside [A-Za-z0-9._-]",
                self.name
            )));
        }
        if self.range.is_empty() {
            return Err(CradleError::Config(format!(
                "node {} has an empty range {}",
                self.name, self.range
            )));
        }
        if self.storage_path.as_os_str().is_empty() {
            return Err(CradleError::Config(format!(
                "node {} has no storage path",
                self.name
            )));
        }
        Ok(())
    }
}
