//! Connection Manager
//!
//! The host's single ingress and egress point. Accepts connections, keeps
//! the dispatch table of live routers, and relays requests for remote
//! ranges to peer hosts.

use std::collections::HashMap;
use std::io::{BufWriter, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{CradleError, Result};
use crate::keyspace::{DirectoryHandle, DirectoryView};
use crate::protocol::{write_response, AdminCommand, Frame, Payload, Request, Response};
use crate::router::{CancelToken, Envelope, Router};

use super::connection::Connection;
use super::pool::{ConnectionPool, PoolOptions};

/// Accept loop poll interval while no connection is pending
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Executes admin frames; implemented by the cradle that owns this manager
pub trait ControlPlane: Send + Sync {
    fn execute(&self, command: AdminCommand) -> Result<Response>;
}

struct Listening {
    addr: SocketAddr,
    acceptor: Option<JoinHandle<()>>,
}

/// Host-wide connection manager
pub struct ConnectionManager {
    config: Config,
    view: DirectoryView,
    routers: RwLock<HashMap<String, Arc<Router>>>,
    pool: ConnectionPool,

    dispatch: RwLock<Option<Sender<Envelope>>>,
    dispatch_workers: Mutex<Vec<JoinHandle<()>>>,

    listener: Mutex<Option<Listening>>,
    shutdown: AtomicBool,

    /// Inbound connections by id, kept so shutdown can close their read side
    connections: Mutex<HashMap<u64, TcpStream>>,
    next_connection: AtomicU64,
    active: AtomicUsize,

    control: RwLock<Option<Weak<dyn ControlPlane>>>,
}

impl ConnectionManager {
    /// Create the manager and start its dispatch workers; call `listen` to accept.
    pub fn new(config: Config, directory: Arc<DirectoryHandle>) -> Result<Arc<Self>> {
        config.validate()?;
        let capacity = config.router_queue_capacity;
        let (sender, receiver) = channel::bounded::<Envelope>(capacity);

        let manager = Arc::new(Self {
            pool: ConnectionPool::new(PoolOptions::from(&config)),
            view: DirectoryView::new(directory),
            routers: RwLock::new(HashMap::new()),
            dispatch: RwLock::new(Some(sender)),
            dispatch_workers: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            control: RwLock::new(None),
            config,
        });

        let mut workers = manager.dispatch_workers.lock();
        for i in 0..manager.config.dispatch_workers {
            let weak = Arc::downgrade(&manager);
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("dispatch-{}", i))
                .spawn(move || run_dispatch(weak, receiver))?;
            workers.push(worker);
        }
        drop(workers);

        Ok(manager)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Attach the cradle that answers ADMIN frames
    pub fn attach(&self, control: Weak<dyn ControlPlane>) {
        *self.control.write() = Some(control);
    }

    // =========================================================================
    // Listener
    // =========================================================================

    /// Bind the configured address once; later calls return the bound address.
    pub fn listen(self: &Arc<Self>) -> Result<SocketAddr> {
        let mut listening = self.listener.lock();
        if let Some(listening) = listening.as_ref() {
            return Ok(listening.addr);
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(CradleError::Shutdown);
        }

        let listener = TcpListener::bind(&self.config.listen_addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let manager = Arc::clone(self);
        let acceptor = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || manager.accept_loop(listener))?;

        tracing::info!("Listening on {}", addr);
        *listening = Some(Listening {
            addr,
            acceptor: Some(acceptor),
        });
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|listening| listening.addr)
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while !self.shutdown.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
        tracing::debug!("Acceptor stopped");
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        // Accepted sockets inherit non-blocking mode on some platforms
        if let Err(e) = stream.set_nonblocking(false) {
            tracing::warn!("Could not configure connection from {}: {}", peer, e);
            return;
        }

        if self.active.load(Ordering::Acquire) >= self.config.max_connections {
            tracing::warn!("Rejecting {}: {} connections open", peer, self.config.max_connections);
            let response = Response::from_error(&CradleError::Unavailable(
                "too many connections".to_string(),
            ));
            let _ = write_response(&mut BufWriter::new(&stream), &response);
            return;
        }

        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        match stream.try_clone() {
            Ok(clone) => {
                self.connections.lock().insert(id, clone);
            }
            Err(e) => {
                tracing::warn!("Could not register connection from {}: {}", peer, e);
                return;
            }
        }
        self.active.fetch_add(1, Ordering::AcqRel);

        let manager = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("conn-{}", id))
            .spawn(move || {
                let outcome = Connection::new(stream, Arc::clone(&manager)).and_then(|mut conn| {
                    conn.set_timeouts(manager.config.read_timeout_ms, manager.config.write_timeout_ms)?;
                    conn.handle()
                });
                if let Err(e) = outcome {
                    tracing::debug!("Connection from {} ended with error: {}", peer, e);
                }
                manager.connections.lock().remove(&id);
                manager.active.fetch_sub(1, Ordering::AcqRel);
            });
        if let Err(e) = spawned {
            tracing::warn!("Could not spawn handler for {}: {}", peer, e);
            self.connections.lock().remove(&id);
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Inbound connections currently open
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    // =========================================================================
    // Dispatch Table
    // =========================================================================

    /// Add `router` under `name`, draining any router it replaces.
    pub fn register(&self, name: &str, router: Arc<Router>) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(CradleError::Shutdown);
        }
        let previous = self.routers.write().insert(name.to_string(), Arc::clone(&router));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &router) {
                tracing::debug!("Router {} re-registered; draining previous handle", name);
                previous.drain();
            }
        }
        Ok(())
    }

    /// Remove `name` from the dispatch table and drain it
    pub fn deregister(&self, name: &str) -> Option<Arc<Router>> {
        let removed = self.routers.write().remove(name);
        if let Some(router) = &removed {
            router.drain();
            tracing::debug!("Router {} deregistered", name);
        }
        removed
    }

    pub fn router(&self, name: &str) -> Option<Arc<Router>> {
        self.routers.read().get(name).cloned()
    }

    /// Registered router names, sorted
    pub fn router_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routers.read().keys().cloned().collect();
        names.sort();
        names
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Queue `envelope` for a dispatch worker.
    ///
    /// Routers and connections both come through here so neither blocks on a
    /// network forward, and a cancelled caller can stop a forward mid-retry.
    pub fn dispatch(&self, envelope: Envelope) {
        let dispatch = self.dispatch.read();
        let Some(sender) = dispatch.as_ref() else {
            return envelope.fail(&CradleError::Shutdown);
        };
        match sender.send_timeout(envelope, self.config.request_timeout()) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(envelope)) => {
                envelope.fail(&CradleError::Timeout("dispatch queue is full".to_string()))
            }
            Err(SendTimeoutError::Disconnected(envelope)) => envelope.fail(&CradleError::Shutdown),
        }
    }

    /// Deliver `envelope` to the owner of its key, answering it on failure.
    pub fn route(&self, mut envelope: Envelope) {
        let hops = envelope.request.hop_count;
        if hops > self.config.max_hops {
            tracing::warn!(
                "Routing loop for {:?}: hop {} over bound {}",
                String::from_utf8_lossy(&envelope.request.key),
                hops,
                self.config.max_hops
            );
            return envelope.fail(&CradleError::RoutingLoop {
                hops,
                bound: self.config.max_hops,
            });
        }
        if envelope.is_cancelled() {
            return envelope.fail(&CradleError::Timeout("request cancelled".to_string()));
        }

        let directory = self.view.current();
        let Some(owner) = directory.owner_of(&envelope.request.key).cloned() else {
            let err = CradleError::Unavailable(format!(
                "no owner for key {:?} at directory version {}",
                String::from_utf8_lossy(&envelope.request.key),
                directory.version()
            ));
            return envelope.fail(&err);
        };

        if directory.is_local(&owner) {
            let Some(router) = self.router(&owner.name) else {
                let err = CradleError::Unavailable(format!("router {} is not registered", owner.name));
                return envelope.fail(&err);
            };
            if let Err((envelope, err)) = router.enqueue(envelope, self.config.request_timeout()) {
                envelope.fail(&err);
            }
            return;
        }

        envelope.request.hop_count = hops.saturating_add(1);
        tracing::trace!("Relaying {:?} to {}", envelope.request.op, owner);
        let frame = Frame::Request(envelope.request.clone());
        match self.pool.forward(&owner.host, &frame, &envelope.cancel) {
            Ok(response) => envelope.respond(response),
            Err(e) => {
                tracing::warn!("Forward to {} failed: {}", owner, e);
                envelope.fail(&e);
            }
        }
    }

    /// Route `request` and wait for its response
    pub fn submit(&self, request: Request) -> Result<Response> {
        let (envelope, reply) = Envelope::new(request);
        let cancel = envelope.cancel.clone();
        self.dispatch(envelope);
        match reply.recv_timeout(self.config.request_timeout()) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => {
                cancel.cancel();
                Err(CradleError::Timeout(format!(
                    "no reply within {:?}",
                    self.config.request_timeout()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(CradleError::Shutdown),
        }
    }

    /// Ask a peer host directly (directory sync, admin relays)
    pub fn call_peer(&self, addr: &str, frame: &Frame) -> Result<Response> {
        self.pool.forward(addr, frame, &CancelToken::new())
    }

    pub(crate) fn execute_admin(&self, command: AdminCommand) -> Response {
        let control = self.control.read().as_ref().and_then(Weak::upgrade);
        let Some(control) = control else {
            return Response::from_error(&CradleError::Unavailable(
                "no cradle attached to this host".to_string(),
            ));
        };
        tracing::debug!("Admin command: {:?}", command);
        match control.execute(command) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Admin command failed: {}", e);
                Response::from_error(&e)
            }
        }
    }

    pub(crate) fn directory_response(&self) -> Response {
        let directory = self.view.current();
        Response::ok(Some(Payload::Directory((*directory).clone())))
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop accepting, let open connections finish, then drain every router.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Connection manager shutting down");

        let acceptor = self
            .listener
            .lock()
            .as_mut()
            .and_then(|listening| listening.acceptor.take());
        if let Some(acceptor) = acceptor {
            let _ = acceptor.join();
        }

        // Closing the read side ends idle connections; busy ones finish their reply
        for stream in self.connections.lock().values() {
            let _ = stream.shutdown(std::net::Shutdown::Read);
        }
        let deadline = Instant::now() + Duration::from_millis(self.config.drain_timeout_ms);
        while self.active.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            thread::sleep(ACCEPT_POLL_INTERVAL);
        }
        let remaining = self.active.load(Ordering::Acquire);
        if remaining > 0 {
            tracing::warn!("{} connection(s) still open after drain timeout", remaining);
        }

        let routers: Vec<String> = self.routers.read().keys().cloned().collect();
        for name in routers {
            self.deregister(&name);
        }

        self.dispatch.write().take();
        let workers: Vec<JoinHandle<()>> = self.dispatch_workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
        self.pool.clear();
        tracing::info!("Connection manager stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

fn run_dispatch(manager: Weak<ConnectionManager>, receiver: Receiver<Envelope>) {
    for envelope in receiver.iter() {
        match manager.upgrade() {
            Some(manager) => manager.route(envelope),
            None => envelope.fail(&CradleError::Shutdown),
        }
    }
}
