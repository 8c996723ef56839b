//! Router Tests
//!
//! Routers driven through a connection manager on one host: point reads
//! and writes, LIST continuation across routers, and claim checks.

use std::sync::Arc;
use std::time::Duration;

use cradlekv::cache::{Cache, RecencyCache};
use cradlekv::keyspace::DirectoryHandle;
use cradlekv::maintain::EventLog;
use cradlekv::monitor::ThresholdMonitor;
use cradlekv::network::ConnectionManager;
use cradlekv::protocol::{ListFilter, Payload, Request, Response, Status};
use cradlekv::router::{Claim, Envelope, Router, RouterDeps, RouterOptions};
use cradlekv::storage::{MemStore, Record, Store};
use cradlekv::{Config, CradleError, Directory, KeyRange, NodeConfig, Owner};

const HOST: &str = "h1";

fn range(start: &str, end: Option<&str>) -> KeyRange {
    KeyRange::new(start.as_bytes().to_vec(), end.map(|e| e.as_bytes().to_vec()))
}

/// One host with a connection manager and no routers yet
struct Host {
    config: Config,
    directory: Arc<DirectoryHandle>,
    manager: Arc<ConnectionManager>,
}

impl Host {
    fn new() -> Self {
        Self::with_config(
            Config::builder()
                .listen_addr("127.0.0.1:0")
                .request_timeout_ms(2000)
                .max_list_results(50)
                .build(),
        )
    }

    fn with_config(config: Config) -> Self {
        let directory = Arc::new(DirectoryHandle::new(Directory::new(HOST), None));
        let manager = ConnectionManager::new(config.clone(), Arc::clone(&directory)).unwrap();
        Self {
            config,
            directory,
            manager,
        }
    }

    fn deps(&self) -> RouterDeps {
        RouterDeps {
            manager: Arc::clone(&self.manager),
            directory: Arc::clone(&self.directory),
            store: Arc::new(MemStore::new(Duration::from_millis(500))),
            cache: Arc::new(RecencyCache::new(64, Duration::from_millis(500))),
            monitor: Arc::new(ThresholdMonitor::new(1000, 10)),
            maintain: Arc::new(EventLog::start(None).unwrap()),
        }
    }

    /// Publish `name` for `range` and start its router
    fn router(&self, name: &str, range: KeyRange) -> Arc<Router> {
        self.directory
            .update(|d| d.assign(&range, Owner::new(name, HOST)))
            .unwrap();
        let node = NodeConfig::new(name, range, format!("memory://{}", name));
        Router::init(&node, self.deps(), Claim::Resume, RouterOptions::from(&self.config)).unwrap()
    }

    fn submit(&self, request: Request) -> Response {
        self.manager.submit(request).unwrap()
    }

    fn put(&self, key: &str, value: &str) {
        let response = self.submit(Request::put(key, value));
        assert_eq!(response.status, Status::Ok, "PUT {}: {:?}", key, response);
    }

    fn list_page(&self, start: &str, filter: ListFilter) -> (Vec<String>, Option<Vec<u8>>) {
        match self.submit(Request::list(start, filter)).into_result().unwrap() {
            Some(Payload::Records { records, resume }) => (keys(&records), resume),
            other => panic!("Expected records, got {:?}", other),
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}

fn keys(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .map(|r| String::from_utf8(r.key.clone()).unwrap())
        .collect()
}

// =============================================================================
// Point Operation Tests
// =============================================================================

#[test]
fn test_put_then_get() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));

    host.put("apple", "red");
    let response = host.submit(Request::get("apple"));
    assert_eq!(response.payload, Some(Payload::Value(b"red".to_vec())));
}

#[test]
fn test_get_missing_key_is_not_found() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));

    let response = host.submit(Request::get("absent"));
    assert_eq!(response.status, Status::NotFound);
}

#[test]
fn test_unowned_key_is_unavailable() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));

    let response = host.submit(Request::put("zebra", "x"));
    assert_eq!(response.status, Status::Unavailable);
}

#[test]
fn test_requests_reach_the_owning_router() {
    let host = Host::new();
    let r1 = host.router("r1", range("a", Some("m")));
    let r2 = host.router("r2", range("m", None));

    host.put("b", "1");
    host.put("x", "2");

    assert_eq!(r1.store().get(b"b").unwrap(), Some(b"1".to_vec()));
    assert_eq!(r1.store().get(b"x").unwrap(), None);
    assert_eq!(r2.store().get(b"x").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn test_put_updates_cache_and_store() {
    let host = Host::new();
    let r1 = host.router("r1", range("a", Some("m")));

    host.put("k", "v1");
    host.put("k", "v2");
    assert_eq!(r1.cache().get(b"k").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(r1.store().get(b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn test_get_fills_cache_from_store() {
    let host = Host::new();
    let r1 = host.router("r1", range("a", Some("m")));
    r1.store().put(b"cold", b"stored").unwrap();
    assert_eq!(r1.cache().get(b"cold").unwrap(), None);

    let response = host.submit(Request::get("cold"));
    assert_eq!(response.payload, Some(Payload::Value(b"stored".to_vec())));
    assert_eq!(r1.cache().get(b"cold").unwrap(), Some(b"stored".to_vec()));
}

// =============================================================================
// Hop Bound & Cancellation Tests
// =============================================================================

#[test]
fn test_hop_count_over_bound_is_routing_loop() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));

    let at_bound = host.submit(Request::get("b").with_hops(3));
    assert_eq!(at_bound.status, Status::NotFound);

    let over = host.submit(Request::get("b").with_hops(4));
    assert_eq!(over.status, Status::RoutingLoop);
}

#[test]
fn test_cancelled_request_times_out() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));

    let (envelope, reply) = Envelope::new(Request::put("b", "never"));
    envelope.cancel.cancel();
    host.manager.route(envelope);

    let response = reply.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(response.status, Status::Timeout);
    assert_eq!(host.submit(Request::get("b")).status, Status::NotFound);
}

// =============================================================================
// LIST Tests
// =============================================================================

#[test]
fn test_list_returns_resume_at_range_end() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));
    host.router("r2", range("m", None));
    for key in ["b", "c", "n", "o"] {
        host.put(key, "v");
    }

    let (first, resume) = host.list_page("a", ListFilter::default());
    assert_eq!(first, ["b", "c"]);
    assert_eq!(resume, Some(b"m".to_vec()));

    let (second, resume) = host.list_page("m", ListFilter::default());
    assert_eq!(second, ["n", "o"]);
    assert_eq!(resume, None);
}

#[test]
fn test_list_limit_truncates_with_resume_after_last_key() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));
    for key in ["b", "c", "d", "e"] {
        host.put(key, "v");
    }

    let (page, resume) = host.list_page("a", ListFilter::default().with_limit(2));
    assert_eq!(page, ["b", "c"]);
    assert_eq!(resume, Some(b"c\0".to_vec()));

    let (rest, _) = host.list_page("c\0", ListFilter::default().with_limit(2));
    assert_eq!(rest, ["d", "e"]);
}

#[test]
fn test_list_prefix_inside_one_range_needs_no_resume() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));
    host.router("r2", range("m", None));
    for key in ["user:1", "user:2", "users", "video:1"] {
        host.put(key, "v");
    }

    let (page, resume) = host.list_page("user:", ListFilter::prefix("user:"));
    assert_eq!(page, ["user:1", "user:2"]);
    assert_eq!(resume, None);
}

#[test]
fn test_list_skips_to_the_prefix_in_a_later_range() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));
    host.router("r2", range("m", None));
    host.put("apple", "v");
    host.put("user:1", "v");

    // Nothing in ["a","m") can match; continue at the prefix itself
    let (page, resume) = host.list_page("a", ListFilter::prefix("user:"));
    assert!(page.is_empty());
    assert_eq!(resume, Some(b"user:".to_vec()));
}

#[test]
fn test_list_end_before_range_end_needs_no_resume() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));
    host.router("r2", range("m", None));
    for key in ["b", "f", "k"] {
        host.put(key, "v");
    }

    let (page, resume) = host.list_page("a", ListFilter::default().with_end("g"));
    assert_eq!(page, ["b", "f"]);
    assert_eq!(resume, None);
}

#[test]
fn test_list_is_capped_by_max_results() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));
    for i in 0..60 {
        host.put(&format!("k{:02}", i), "v");
    }

    let (page, resume) = host.list_page("a", ListFilter::default().with_limit(500));
    assert_eq!(page.len(), 50);
    assert!(resume.is_some());
}

// =============================================================================
// Init & Health Tests
// =============================================================================

#[test]
fn test_unowned_claim_rejects_owned_range() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));

    let node = NodeConfig::new("r2", range("k", Some("p")), "memory://r2");
    let err = Router::init(&node, host.deps(), Claim::Unowned, RouterOptions::from(&host.config))
        .unwrap_err();
    assert!(matches!(err, CradleError::RangeConflict(_)));
    assert!(host.manager.router("r2").is_none());
}

#[test]
fn test_invalid_node_name_is_rejected() {
    let host = Host::new();
    let node = NodeConfig::new("bad/name", range("a", Some("m")), "memory://x");
    let err = Router::init(&node, host.deps(), Claim::Unowned, RouterOptions::from(&host.config))
        .unwrap_err();
    assert!(matches!(err, CradleError::Config(_)));
}

#[test]
fn test_metrics_report_count_and_median() {
    let host = Host::new();
    let r1 = host.router("r1", range("a", Some("m")));
    for key in ["b", "d", "f", "h", "j"] {
        host.put(key, "v");
    }

    let metrics = r1.metrics().unwrap();
    assert_eq!(metrics.record_count, 5);
    assert_eq!(metrics.median_key, Some(b"f".to_vec()));
    assert_eq!(metrics.range, range("a", Some("m")));
    assert!(metrics.requests_served >= 5);
}

#[test]
fn test_router_is_registered_until_deregistered() {
    let host = Host::new();
    host.router("r1", range("a", Some("m")));
    assert_eq!(host.manager.router_names(), ["r1"]);

    host.manager.deregister("r1");
    assert!(host.manager.router("r1").is_none());
    assert_eq!(host.submit(Request::get("b")).status, Status::Unavailable);
}
