//! Router implementation
//!
//! Worker threads drain a bounded inbound channel. Each request is checked
//! against the router's range: owned keys are answered from cache and
//! store, everything else goes back through the connection manager.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cache::Cache;
use crate::config::{Config, NodeConfig};
use crate::error::{CradleError, Result};
use crate::keyspace::{end_after, Directory, DirectoryHandle, DirectoryView, KeyRange, Owner};
use crate::maintain::{Event, Maintain};
use crate::monitor::{HealthMetrics, Monitor};
use crate::network::ConnectionManager;
use crate::protocol::{Operation, Request, Response};
use crate::storage::{Record, Store};

use super::gate::{merge_by_arrival, Gate, Queued};
use super::Envelope;

/// Tunables shared by every router on a host
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_list_results: usize,

    /// Bound on the router's own write-lock wait
    pub lock_timeout: Duration,
}

impl From<&Config> for RouterOptions {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.router_workers,
            queue_capacity: config.router_queue_capacity,
            max_list_results: config.max_list_results,
            lock_timeout: config.store_timeout(),
        }
    }
}

/// Everything a router talks to
#[derive(Clone)]
pub struct RouterDeps {
    pub manager: Arc<ConnectionManager>,
    pub directory: Arc<DirectoryHandle>,
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn Cache>,
    pub monitor: Arc<dyn Monitor>,
    pub maintain: Arc<dyn Maintain>,
}

/// How a new router's range relates to the current directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The range must be entirely unowned
    Unowned,

    /// The range must lie inside the named local router's segment
    Handoff(String),

    /// The directory must already map exactly this range to this router
    Resume,
}

/// A running router: the handle the connection manager and cradle hold
pub struct Router {
    core: Arc<RouterCore>,
    sender: RwLock<Option<Sender<Envelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct RouterCore {
    name: String,
    range: RwLock<KeyRange>,
    view: DirectoryView,
    manager: Arc<ConnectionManager>,
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    monitor: Arc<dyn Monitor>,
    maintain: Arc<dyn Maintain>,

    /// Write side: PUTs and range changes. Read side: GET and LIST.
    write_lock: RwLock<()>,
    gate: Mutex<Gate>,
    retired: AtomicBool,
    served: AtomicU64,
    options: RouterOptions,
}

impl Router {
    /// Validate, start workers and register with the connection manager.
    ///
    /// A `Handoff` router starts with its gate closed.
    pub fn init(
        config: &NodeConfig,
        deps: RouterDeps,
        claim: Claim,
        options: RouterOptions,
    ) -> Result<Arc<Router>> {
        config.validate()?;
        if options.workers == 0 || options.queue_capacity == 0 {
            return Err(CradleError::Config(format!(
                "router {} needs at least one worker and one queue slot",
                config.name
            )));
        }

        deps.manager.listen()?;
        check_claim(&deps.directory.snapshot(), config, &claim)?;

        let gate = match claim {
            Claim::Handoff(_) => Gate::Migrating(Vec::new()),
            Claim::Unowned | Claim::Resume => Gate::Open,
        };
        let core = Arc::new(RouterCore {
            name: config.name.clone(),
            range: RwLock::new(config.range.clone()),
            view: DirectoryView::new(Arc::clone(&deps.directory)),
            manager: Arc::clone(&deps.manager),
            store: deps.store,
            cache: deps.cache,
            monitor: deps.monitor,
            maintain: deps.maintain,
            write_lock: RwLock::new(()),
            gate: Mutex::new(gate),
            retired: AtomicBool::new(false),
            served: AtomicU64::new(0),
            options,
        });

        let (sender, receiver) = channel::bounded(core.options.queue_capacity);
        let mut workers = Vec::with_capacity(core.options.workers);
        for i in 0..core.options.workers {
            let core = Arc::clone(&core);
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("router-{}-{}", core.name, i))
                .spawn(move || run_worker(core, receiver))?;
            workers.push(worker);
        }

        let router = Arc::new(Router {
            core,
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
        });
        deps.manager.register(&config.name, Arc::clone(&router))?;

        tracing::info!(
            "Router {} started for {} ({:?})",
            config.name,
            config.range,
            claim
        );
        router.core.maintain.log_event(Event::RouterStarted {
            name: config.name.clone(),
            range: config.range.clone(),
        });
        Ok(router)
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn range(&self) -> KeyRange {
        self.core.range.read().clone()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.core.store
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.core.cache
    }

    pub fn is_retired(&self) -> bool {
        self.core.retired.load(Ordering::Acquire)
    }

    pub fn gate_is_open(&self) -> bool {
        self.core.gate.lock().is_open()
    }

    /// Writes currently parked behind the gate
    pub fn queued_writes(&self) -> usize {
        self.core.gate.lock().queued()
    }

    /// Hand `envelope` to a worker, waiting at most `timeout` for queue space
    pub(crate) fn enqueue(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> std::result::Result<(), (Envelope, CradleError)> {
        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            return Err((envelope, CradleError::Shutdown));
        };
        match sender.send_timeout(envelope, timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(envelope)) => Err((
                envelope,
                CradleError::Timeout(format!("router {} queue is full", self.core.name)),
            )),
            Err(SendTimeoutError::Disconnected(envelope)) => Err((envelope, CradleError::Shutdown)),
        }
    }

    /// Close the inbound queue and wait for workers to finish what is queued
    pub(crate) fn drain(&self) {
        self.sender.write().take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!("A worker of router {} panicked", self.core.name);
            }
        }
        tracing::debug!("Router {} drained", self.core.name);
    }

    // -------------------------------------------------------------------------
    // Migration hooks (driven by the cradle)
    // -------------------------------------------------------------------------

    /// Park every later PUT until [`Router::open_gate`]
    pub(crate) fn close_gate(&self) {
        let _guard = self.core.write_lock.write();
        self.core.gate.lock().close();
    }

    /// Take parked writes without opening the gate
    pub(crate) fn take_queued(&self) -> Vec<Queued> {
        let _guard = self.core.write_lock.write();
        self.core.gate.lock().drain()
    }

    /// Replay `extra` and this router's own parked writes in arrival order, then open.
    pub(crate) fn open_gate(&self, extra: Vec<Queued>) {
        let _guard = self.core.write_lock.write();
        let own = self.core.gate.lock().drain();
        let replay = merge_by_arrival(extra, own);
        let count = replay.len();
        for queued in replay {
            self.core.replay_locked(queued.envelope);
        }
        *self.core.gate.lock() = Gate::Open;
        tracing::debug!("Router {} gate open ({} writes replayed)", self.core.name, count);
    }

    /// Narrow the range, dropping records and cache entries outside it
    pub(crate) fn shrink(&self, range: KeyRange) -> Result<usize> {
        self.narrow(range);
        self.purge_outside()
    }

    /// Set a smaller range; keys left outside it stop resolving here at once
    pub(crate) fn narrow(&self, range: KeyRange) {
        let _guard = self.core.write_lock.write();
        *self.core.range.write() = range;
    }

    /// Delete records and cache entries outside the current range.
    ///
    /// Runs without the router lock: `owns` already rejects every key it
    /// touches, so reads and writes on the kept range carry on meanwhile.
    pub(crate) fn purge_outside(&self) -> Result<usize> {
        let range = self.range();
        let outside: Vec<Vec<u8>> = self
            .core
            .store
            .scan(&KeyRange::full(), None)?
            .filter_map(|record| match record {
                Ok(record) if !range.contains(&record.key) => Some(Ok(record.key)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
            .collect::<Result<_>>()?;
        for key in &outside {
            self.core.store.delete(key)?;
            self.core.cache.invalidate(key)?;
        }
        Ok(outside.len())
    }

    pub(crate) fn widen(&self, range: KeyRange) {
        let _guard = self.core.write_lock.write();
        *self.core.range.write() = range;
    }

    /// Stop serving; later messages are re-routed. Returns parked writes.
    pub(crate) fn retire(&self) -> Vec<Queued> {
        let _guard = self.core.write_lock.write();
        self.core.retired.store(true, Ordering::Release);
        let parked = self.core.gate.lock().drain();
        self.core.maintain.log_event(Event::RouterRetired {
            name: self.core.name.clone(),
        });
        parked
    }

    /// Send parked writes back through the connection manager
    pub(crate) fn reroute_all(&self, queued: Vec<Queued>) {
        for queued in queued {
            self.core.forward(queued.envelope);
        }
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    pub fn metrics(&self) -> Result<HealthMetrics> {
        let record_count = self.core.store.len()?;
        let median_key = match record_count {
            0 => None,
            n => self
                .core
                .store
                .scan(&KeyRange::full(), None)?
                .nth(n / 2)
                .transpose()?
                .map(|record| record.key),
        };
        Ok(HealthMetrics {
            range: self.range(),
            record_count,
            median_key,
            requests_served: self.core.served.load(Ordering::Relaxed),
        })
    }

    /// Push current metrics to the monitor
    pub fn report_health(&self) -> Result<()> {
        let metrics = self.metrics()?;
        self.core.monitor.report_health(&self.core.name, metrics);
        Ok(())
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.core.name)
            .field("range", &*self.core.range.read())
            .field("retired", &self.is_retired())
            .finish()
    }
}

fn run_worker(core: Arc<RouterCore>, receiver: Receiver<Envelope>) {
    // Ends once every sender is dropped and the queue is empty
    for envelope in receiver.iter() {
        core.handle(envelope);
    }
}

/// Result of a local attempt: answered, or the key is not ours
enum Local {
    Done(Response),
    NotOwned,
}

impl RouterCore {
    fn handle(&self, envelope: Envelope) {
        if envelope.is_cancelled() {
            tracing::trace!("Router {} skipping cancelled request", self.name);
            envelope.fail(&CradleError::Timeout("request cancelled".to_string()));
            return;
        }
        self.served.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = envelope.request.validate() {
            envelope.fail(&e);
            return;
        }
        if self.retired.load(Ordering::Acquire) {
            self.forward(envelope);
            return;
        }

        tracing::trace!(
            "Router {} handling {:?} {:?}",
            self.name,
            envelope.request.op,
            String::from_utf8_lossy(&envelope.request.key)
        );

        match envelope.request.op {
            Operation::Put => self.put(envelope),
            Operation::Get => {
                let outcome = self.get(&envelope.request.key);
                self.finish(envelope, outcome);
            }
            Operation::List => {
                let outcome = self.list(&envelope.request);
                self.finish(envelope, outcome);
            }
        }
    }

    fn finish(&self, envelope: Envelope, outcome: Result<Local>) {
        match outcome {
            Ok(Local::Done(response)) => envelope.respond(response),
            Ok(Local::NotOwned) => self.not_owned(envelope),
            Err(e) => envelope.fail(&e),
        }
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.write_lock
            .try_read_for(self.options.lock_timeout)
            .ok_or_else(|| CradleError::Timeout(format!("router {} read lock", self.name)))
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        self.write_lock
            .try_write_for(self.options.lock_timeout)
            .ok_or_else(|| CradleError::Timeout(format!("router {} write lock", self.name)))
    }

    fn owns(&self, key: &[u8]) -> bool {
        self.range.read().contains(key)
    }

    /// Retired counts as not owning anything: a merge may have retired this
    /// router while the caller waited for the lock
    fn serves(&self, key: &[u8]) -> bool {
        !self.retired.load(Ordering::Acquire) && self.owns(key)
    }

    fn get(&self, key: &[u8]) -> Result<Local> {
        let _guard = self.read_guard()?;
        if !self.serves(key) {
            return Ok(Local::NotOwned);
        }
        if let Some(value) = self.cache.get(key)? {
            return Ok(Local::Done(Response::value(value)));
        }
        match self.store.get(key)? {
            Some(value) => {
                self.cache.put(key, &value)?;
                Ok(Local::Done(Response::value(value)))
            }
            None => Ok(Local::Done(Response::not_found())),
        }
    }

    fn put(&self, envelope: Envelope) {
        let guard = match self.write_guard() {
            Ok(guard) => guard,
            Err(e) => return envelope.fail(&e),
        };
        if self.retired.load(Ordering::Acquire) {
            drop(guard);
            return self.forward(envelope);
        }
        if !self.owns(&envelope.request.key) {
            drop(guard);
            return self.not_owned(envelope);
        }
        let Some(envelope) = self.gate.lock().park(envelope) else {
            tracing::trace!("Router {} parked a write behind its gate", self.name);
            return;
        };
        let outcome = self.apply_put(&envelope.request);
        drop(guard);
        match outcome {
            Ok(response) => envelope.respond(response),
            Err(e) => envelope.fail(&e),
        }
    }

    /// Caller holds the write lock
    fn apply_put(&self, request: &Request) -> Result<Response> {
        let value = request
            .value
            .as_deref()
            .ok_or_else(|| CradleError::MalformedRequest("PUT without a value".to_string()))?;
        self.store.put(&request.key, value)?;
        self.cache.put(&request.key, value)?;
        Ok(Response::ok(None))
    }

    /// Apply a parked write; caller holds the write lock
    fn replay_locked(&self, envelope: Envelope) {
        if envelope.is_cancelled() {
            tracing::trace!("Router {} dropping cancelled parked write", self.name);
            envelope.fail(&CradleError::Timeout("request cancelled".to_string()));
            return;
        }
        if !self.owns(&envelope.request.key) {
            return self.not_owned(envelope);
        }
        match self.apply_put(&envelope.request) {
            Ok(response) => envelope.respond(response),
            Err(e) => envelope.fail(&e),
        }
    }

    fn list(&self, request: &Request) -> Result<Local> {
        let _guard = self.read_guard()?;
        if !self.serves(&request.key) {
            return Ok(Local::NotOwned);
        }
        let range = self.range.read().clone();

        let filter = request.filter.clone().unwrap_or_default();
        let cap = filter
            .limit
            .map_or(self.options.max_list_results, |limit| {
                (limit as usize).min(self.options.max_list_results)
            });
        let wanted = filter.scan_range(&request.key);

        let mut records: Vec<Record> = Vec::new();
        let mut truncated = false;
        if let Some(scan) = range.intersect(&wanted) {
            for record in self.store.scan(&scan, Some(&filter))? {
                if records.len() == cap {
                    truncated = true;
                    break;
                }
                let mut record = record?;
                if let Some(fresher) = self.cache.get(&record.key)? {
                    record.value = fresher;
                }
                records.push(record);
            }
        }

        let resume = if truncated {
            records.last().map(|record| {
                let mut next = record.key.clone();
                next.push(0);
                next
            })
        } else {
            match range.end() {
                Some(end) if end_after(wanted.end(), end) => {
                    Some(end.max(wanted.start()).to_vec())
                }
                _ => None,
            }
        };
        Ok(Local::Done(Response::records(records, resume)))
    }

    /// The key is outside this router's range: find who owns it
    fn not_owned(&self, envelope: Envelope) {
        let key = &envelope.request.key;
        let mut directory = self.view.cached();
        if self.needs_refresh(&directory, key) {
            directory = self.view.refresh();
        }

        match directory.owner_of(key) {
            Some(owner) if self.is_self(&directory, owner) => {
                tracing::warn!(
                    "Router {} is named owner of {:?} but its range is {}",
                    self.name,
                    String::from_utf8_lossy(key),
                    self.range.read()
                );
                envelope.fail(&CradleError::RangeMismatch {
                    router: self.name.clone(),
                });
            }
            Some(_) => self.forward(envelope),
            None => {
                let err = CradleError::Unavailable(format!(
                    "no owner for key {:?}",
                    String::from_utf8_lossy(key)
                ));
                envelope.fail(&err);
            }
        }
    }

    /// The cached copy names this router, or nobody, for `key`
    fn needs_refresh(&self, directory: &Directory, key: &[u8]) -> bool {
        directory
            .owner_of(key)
            .map_or(true, |owner| self.is_self(directory, owner))
    }

    fn is_self(&self, directory: &Directory, owner: &Owner) -> bool {
        owner.name == self.name && directory.is_local(owner)
    }

    /// Hand the envelope back to the connection manager.
    ///
    /// The hop is counted when the manager relays to another host.
    fn forward(&self, envelope: Envelope) {
        tracing::trace!(
            "Router {} forwarding {:?} (hop {})",
            self.name,
            String::from_utf8_lossy(&envelope.request.key),
            envelope.request.hop_count
        );
        self.manager.dispatch(envelope);
    }
}

/// Check `config.range` against the directory for the given claim
fn check_claim(directory: &Directory, config: &NodeConfig, claim: &Claim) -> Result<()> {
    match claim {
        Claim::Unowned => {
            if directory.local_range(&config.name).is_some() {
                return Err(CradleError::RangeConflict(format!(
                    "router {} already owns a range",
                    config.name
                )));
            }
            let taken = directory
                .segments()
                .iter()
                .find(|segment| segment.owner.is_some() && segment.range.overlaps(&config.range));
            if let Some(segment) = taken {
                return Err(CradleError::RangeConflict(format!(
                    "{} overlaps {} owned by {}",
                    config.range,
                    segment.range,
                    segment.owner.as_ref().map_or_else(String::new, |o| o.to_string())
                )));
            }
        }
        Claim::Handoff(from) => {
            let covered = directory
                .local_range(from)
                .map_or(false, |range| range.covers(&config.range));
            if !covered {
                return Err(CradleError::RangeConflict(format!(
                    "{} is not inside the range of {}",
                    config.range, from
                )));
            }
        }
        Claim::Resume => {
            if directory.local_range(&config.name) != Some(&config.range) {
                return Err(CradleError::RangeConflict(format!(
                    "directory does not map {} to {}",
                    config.range, config.name
                )));
            }
        }
    }
    Ok(())
}
