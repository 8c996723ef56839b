//! Cradle Tests
//!
//! Lifecycle operations on one host: create, delete, split, merge,
//! rebalancing, recovery after restart and mutual exclusion.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use cradlekv::maintain::EventLog;
use cradlekv::monitor::{Rebalance, ThresholdMonitor};
use cradlekv::protocol::{Payload, Request, Status};
use cradlekv::storage::{MemoryProvider, Store, StoreProvider};
use cradlekv::{Collaborators, Config, Cradle, CradleError, KeyRange, StorageKind, SyncStrategy};
use tempfile::TempDir;

fn range(start: &str, end: Option<&str>) -> KeyRange {
    KeyRange::new(start.as_bytes().to_vec(), end.map(|e| e.as_bytes().to_vec()))
}

fn config(dir: &TempDir, storage: StorageKind) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .listen_addr("127.0.0.1:0")
        .storage(storage)
        .request_timeout_ms(5000)
        .build()
}

fn open_memory(dir: &TempDir) -> Arc<Cradle> {
    Cradle::open(config(dir, StorageKind::Memory)).unwrap()
}

fn put(cradle: &Cradle, key: &str, value: &str) {
    let response = cradle.submit(Request::put(key, value)).unwrap();
    assert_eq!(response.status, Status::Ok, "PUT {}: {:?}", key, response);
}

fn get(cradle: &Cradle, key: &str) -> Option<String> {
    let response = cradle.submit(Request::get(key)).unwrap();
    match response.into_result() {
        Ok(Some(Payload::Value(value))) => Some(String::from_utf8(value).unwrap()),
        Err(CradleError::NotFound) => None,
        other => panic!("GET {}: {:?}", key, other),
    }
}

fn stored(cradle: &Cradle, router: &str, key: &str) -> bool {
    cradle
        .router(router)
        .unwrap()
        .store()
        .get(key.as_bytes())
        .unwrap()
        .is_some()
}

// =============================================================================
// Create & Delete Tests
// =============================================================================

#[test]
fn test_create_then_serve() {
    let dir = TempDir::new().unwrap();
    let cradle = open_memory(&dir);
    let before = cradle.directory().version();

    cradle.create_node("r1", range("a", Some("m"))).unwrap();
    assert_eq!(cradle.directory().version(), before + 1);
    assert_eq!(cradle.node_names(), ["r1"]);

    put(&cradle, "apple", "red");
    assert_eq!(get(&cradle, "apple").as_deref(), Some("red"));
}

#[test]
fn test_create_rejects_overlap_and_duplicates() {
    let dir = TempDir::new().unwrap();
    let cradle = open_memory(&dir);
    cradle.create_node("r1", range("a", Some("m"))).unwrap();

    let overlap = cradle.create_node("r2", range("k", Some("p"))).unwrap_err();
    assert!(matches!(overlap, CradleError::RangeConflict(_)));

    let duplicate = cradle.create_node("r1", range("p", None)).unwrap_err();
    assert!(matches!(duplicate, CradleError::RangeConflict(_)));

    let empty = cradle.create_node("r3", range("q", Some("q"))).unwrap_err();
    assert!(matches!(empty, CradleError::RangeConflict(_)));

    assert_eq!(cradle.node_names(), ["r1"]);
    cradle.directory().validate().unwrap();
}

#[test]
fn test_delete_leaves_range_unowned() {
    let dir = TempDir::new().unwrap();
    let cradle = open_memory(&dir);
    cradle.create_node("r1", range("a", Some("m"))).unwrap();
    put(&cradle, "b", "1");

    cradle.delete_node("r1").unwrap();
    assert!(cradle.router("r1").is_none());
    assert!(cradle.directory().owner_of(b"b").is_none());

    let response = cradle.submit(Request::get("b")).unwrap();
    assert_eq!(response.status, Status::Unavailable);

    // The range can be reused, and starts empty
    cradle.create_node("r1", range("a", Some("m"))).unwrap();
    assert_eq!(get(&cradle, "b"), None);
}

#[test]
fn test_delete_unknown_router() {
    let dir = TempDir::new().unwrap();
    let cradle = open_memory(&dir);
    assert!(matches!(
        cradle.delete_node("ghost"),
        Err(CradleError::UnknownNode(_))
    ));
}

// =============================================================================
// Split Tests
// =============================================================================

#[test]
fn test_split_moves_upper_half() {
    let dir = TempDir::new().unwrap();
    let cradle = open_memory(&dir);
    cradle.create_node("r1", range("a", Some("m"))).unwrap();
    for key in ["b", "f", "g", "k"] {
        put(&cradle, key, key);
    }
    let before = cradle.directory().version();

    let created = cradle.split_node("r1", b"g").unwrap();
    assert_eq!(created, "r1.1");
    assert_eq!(cradle.directory().version(), before + 1);
    cradle.directory().validate().unwrap();

    assert_eq!(cradle.router("r1").unwrap().range(), range("a", Some("g")));
    assert_eq!(cradle.router("r1.1").unwrap().range(), range("g", Some("m")));

    // Records live in exactly one store
    assert!(stored(&cradle, "r1", "f"));
    assert!(!stored(&cradle, "r1", "g"));
    assert!(stored(&cradle, "r1.1", "g"));
    assert!(stored(&cradle, "r1.1", "k"));

    for key in ["b", "f", "g", "k"] {
        assert_eq!(get(&cradle, key).as_deref(), Some(key));
    }
    assert!(cradle.router("r1").unwrap().gate_is_open());
    assert!(cradle.router("r1.1").unwrap().gate_is_open());
}

#[test]
fn test_split_names_are_unique() {
    let dir = TempDir::new().unwrap();
    let cradle = open_memory(&dir);
    cradle.create_node("r1", range("a", None)).unwrap();

    assert_eq!(cradle.split_node("r1", b"m").unwrap(), "r1.1");
    assert_eq!(cradle.split_node("r1.1", b"t").unwrap(), "r1.2");
    assert_eq!(cradle.split_node("r1", b"g").unwrap(), "r1.3");
    assert_eq!(cradle.node_names(), ["r1", "r1.1", "r1.2", "r1.3"]);
    cradle.directory().validate().unwrap();
}

#[test]
fn test_split_rejects_bad_boundary() {
    let dir = TempDir::new().unwrap();
    let cradle = open_memory(&dir);
    cradle.create_node("r1", range("a", Some("m"))).unwrap();
    let before = cradle.directory().version();

    for boundary in ["a", "m", "z"] {
        let err = cradle.split_node("r1", boundary.as_bytes()).unwrap_err();
        assert!(matches!(err, CradleError::RangeConflict(_)), "{}", boundary);
    }
    assert!(matches!(
        cradle.split_node("ghost", b"c"),
        Err(CradleError::UnknownNode(_))
    ));
    assert_eq!(cradle.directory().version(), before);
    assert!(cradle.router("r1").unwrap().gate_is_open());
}

#[test]
fn test_no_write_lost_during_split() {
    let dir = TempDir::new().unwrap();
    let cradle = open_memory(&dir);
    cradle.create_node("r1", range("", None)).unwrap();

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let cradle = Arc::clone(&cradle);
            thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("k{}{:03}", t, i);
                    put(&cradle, &key, &format!("v{}", i));
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(5));
    let created = cradle.split_node("r1", b"k2").unwrap();
    for writer in writers {
        writer.join().unwrap();
    }

    for t in 0..4 {
        for i in 0..100 {
            let key = format!("k{}{:03}", t, i);
            assert_eq!(get(&cradle, &key), Some(format!("v{}", i)), "{}", key);
            let owner = if t < 2 { "r1" } else { created.as_str() };
            assert!(stored(&cradle, owner, &key), "{} not in {}", key, owner);
        }
    }
}

#[test]
fn test_lower_half_stays_available_during_large_split() {
    let dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(dir.path())
        .listen_addr("127.0.0.1:0")
        .storage(StorageKind::Memory)
        .store_timeout_ms(20)
        .request_timeout_ms(10_000)
        .build();
    let cradle = Cradle::open(config).unwrap();
    cradle.create_node("r1", range("a", None)).unwrap();
    put(&cradle, "b", "kept");

    // Enough records above the boundary that cleanup outlasts the lock timeout
    let store = Arc::clone(cradle.router("r1").unwrap().store());
    for i in 0..50_000 {
        store.put(format!("z{:06}", i).as_bytes(), b"moving").unwrap();
    }

    let (started, ready) = channel::bounded::<()>(1);
    let (stop, stopped) = channel::bounded::<()>(1);
    let client = {
        let cradle = Arc::clone(&cradle);
        thread::spawn(move || {
            let mut failures = Vec::new();
            let mut rounds = 0;
            loop {
                for request in [Request::get("b"), Request::put("c", format!("v{}", rounds))] {
                    let response = cradle.submit(request.clone()).unwrap();
                    if response.status != Status::Ok {
                        failures.push((request.op, response));
                    }
                }
                rounds += 1;
                if rounds == 1 {
                    let _ = started.send(());
                }
                if stopped.try_recv().is_ok() {
                    return (rounds, failures);
                }
            }
        })
    };

    ready.recv_timeout(Duration::from_secs(5)).unwrap();
    let created = cradle.split_node("r1", b"m").unwrap();
    stop.send(()).unwrap();
    let (rounds, failures) = client.join().unwrap();

    assert!(
        failures.is_empty(),
        "{} failures in {} rounds, first {:?}",
        failures.len(),
        rounds,
        failures.first()
    );
    assert_eq!(get(&cradle, "b"), Some("kept".to_string()));
    assert!(stored(&cradle, &created, "z000000"));
    assert!(!stored(&cradle, "r1", "z049999"));
}

// =============================================================================
// Merge Tests
// =============================================================================

#[test]
fn test_merge_restores_single_router() {
    let dir = TempDir::new().unwrap();
    let cradle = open_memory(&dir);
    cradle.create_node("r1", range("a", Some("m"))).unwrap();
    for key in ["b", "h", "k"] {
        put(&cradle, key, key);
    }
    let created = cradle.split_node("r1", b"g").unwrap();
    let before = cradle.directory().version();

    // Either argument order picks the lower-start survivor
    let survivor = cradle.merge_node(&created, "r1").unwrap();
    assert_eq!(survivor, "r1");
    assert_eq!(cradle.directory().version(), before + 1);
    assert_eq!(cradle.node_names(), ["r1"]);
    assert_eq!(cradle.router("r1").unwrap().range(), range("a", Some("m")));

    for key in ["b", "h", "k"] {
        assert!(stored(&cradle, "r1", key));
        assert_eq!(get(&cradle, key).as_deref(), Some(key));
    }
    put(&cradle, "l", "after");
    assert!(stored(&cradle, "r1", "l"));
}

#[test]
fn test_merge_rejects_non_adjacent() {
    let dir = TempDir::new().unwrap();
    let cradle = open_memory(&dir);
    cradle.create_node("r1", range("a", Some("c"))).unwrap();
    cradle.create_node("r2", range("d", Some("f"))).unwrap();
    put(&cradle, "b", "1");

    let err = cradle.merge_node("r1", "r2").unwrap_err();
    assert!(matches!(err, CradleError::RangeConflict(_)));
    assert!(matches!(
        cradle.merge_node("r1", "r1"),
        Err(CradleError::RangeConflict(_))
    ));
    assert_eq!(cradle.node_names(), ["r1", "r2"]);
    assert_eq!(get(&cradle, "b").as_deref(), Some("1"));
}

// =============================================================================
// Mutual Exclusion Tests
// =============================================================================

/// Memory provider that stalls when opening one particular store
struct PausingProvider {
    inner: MemoryProvider,
    pause_on: String,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl StoreProvider for PausingProvider {
    fn open(&self, name: &str) -> cradlekv::Result<Arc<dyn Store>> {
        if name == self.pause_on {
            self.entered.send(()).unwrap();
            let _ = self.release.recv_timeout(Duration::from_secs(10));
        }
        self.inner.open(name)
    }

    fn destroy(&self, name: &str) -> cradlekv::Result<()> {
        self.inner.destroy(name)
    }

    fn location(&self, name: &str) -> PathBuf {
        self.inner.location(name)
    }
}

#[test]
fn test_busy_router_conflicts_and_parks_writes() {
    let dir = TempDir::new().unwrap();
    let (entered_tx, entered_rx) = channel::bounded(1);
    let (release_tx, release_rx) = channel::bounded(1);
    let collaborators = Collaborators {
        provider: Arc::new(PausingProvider {
            inner: MemoryProvider::new(Duration::from_millis(500)),
            pause_on: "r1.1".to_string(),
            entered: entered_tx,
            release: release_rx,
        }),
        monitor: Arc::new(ThresholdMonitor::new(1000, 0)),
        maintain: Arc::new(EventLog::start(None).unwrap()),
    };
    let cradle = Cradle::open_with(config(&dir, StorageKind::Memory), collaborators).unwrap();
    cradle.create_node("r1", range("a", Some("m"))).unwrap();
    cradle.create_node("r2", range("m", None)).unwrap();
    put(&cradle, "h", "old");

    let splitter = {
        let cradle = Arc::clone(&cradle);
        thread::spawn(move || cradle.split_node("r1", b"g"))
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // r1 is mid-split
    for err in [
        cradle.split_node("r1", b"c").unwrap_err(),
        cradle.merge_node("r1", "r2").unwrap_err(),
        cradle.delete_node("r1").unwrap_err(),
    ] {
        assert!(matches!(err, CradleError::MigrationConflict(_)), "{:?}", err);
    }
    assert!(!cradle.router("r1").unwrap().gate_is_open());

    // Reads still work; writes park behind the gate
    assert_eq!(get(&cradle, "h").as_deref(), Some("old"));
    let writer = {
        let cradle = Arc::clone(&cradle);
        thread::spawn(move || cradle.submit(Request::put("h", "new")).unwrap())
    };
    let r1 = cradle.router("r1").unwrap();
    while r1.queued_writes() == 0 {
        thread::sleep(Duration::from_millis(5));
    }

    // Disjoint routers are unaffected
    put(&cradle, "x", "free");

    release_tx.send(()).unwrap();
    assert_eq!(splitter.join().unwrap().unwrap(), "r1.1");
    assert_eq!(writer.join().unwrap().status, Status::Ok);

    assert_eq!(get(&cradle, "h").as_deref(), Some("new"));
    assert!(stored(&cradle, "r1.1", "h"));
    assert!(!stored(&cradle, "r1", "h"));
}

// =============================================================================
// Rebalance Tests
// =============================================================================

#[test]
fn test_rebalance_splits_then_merges() {
    let dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(dir.path())
        .listen_addr("127.0.0.1:0")
        .storage(StorageKind::Memory)
        .thresholds(8, 20)
        .build();
    let cradle = Cradle::open(config).unwrap();
    cradle.create_node("r1", range("", None)).unwrap();
    for i in 0..10 {
        put(&cradle, &format!("k{}", i), "v");
    }

    let first = cradle.rebalance_once().unwrap();
    assert_eq!(
        first,
        Rebalance::Split {
            name: "r1".to_string(),
            boundary: b"k5".to_vec()
        }
    );
    assert_eq!(cradle.node_names(), ["r1", "r1.1"]);

    // Neither half is above 8; together they are below 20
    let second = cradle.rebalance_once().unwrap();
    assert!(matches!(second, Rebalance::Merge { .. }), "{:?}", second);
    assert_eq!(cradle.node_names(), ["r1"]);

    for i in 0..10 {
        assert_eq!(get(&cradle, &format!("k{}", i)).as_deref(), Some("v"));
    }
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_restart_recovers_routers_and_records() {
    let dir = TempDir::new().unwrap();
    let disk = StorageKind::Disk {
        sync: SyncStrategy::EveryWrite,
    };

    let version = {
        let cradle = Cradle::open(config(&dir, disk)).unwrap();
        cradle.create_node("r1", range("a", Some("m"))).unwrap();
        for key in ["b", "h"] {
            put(&cradle, key, key);
        }
        cradle.split_node("r1", b"g").unwrap();
        let version = cradle.directory().version();
        version
    };

    let cradle = Cradle::open(config(&dir, disk)).unwrap();
    assert_eq!(cradle.node_names(), ["r1", "r1.1"]);
    assert!(cradle.directory().version() > version);
    assert_eq!(cradle.router("r1.1").unwrap().range(), range("g", Some("m")));

    assert_eq!(get(&cradle, "b").as_deref(), Some("b"));
    assert_eq!(get(&cradle, "h").as_deref(), Some("h"));
    assert!(!stored(&cradle, "r1", "h"));

    // The directory follows the new advertised address
    let owner = cradle.directory().owner_of(b"h").cloned().unwrap();
    assert_eq!(owner.host, cradle.host());
    drop(cradle);

    let events = std::fs::read_to_string(dir.path().join("events.log")).unwrap();
    assert!(events.contains("node_split source=r1 created=r1.1"));
    assert!(events.contains("recovered nodes=2"));
}

#[test]
fn test_deleted_router_store_is_destroyed() {
    let dir = TempDir::new().unwrap();
    let disk = StorageKind::Disk {
        sync: SyncStrategy::EveryWrite,
    };
    let cradle = Cradle::open(config(&dir, disk)).unwrap();
    cradle.create_node("r1", range("a", Some("m"))).unwrap();
    put(&cradle, "b", "1");
    assert!(dir.path().join("nodes").join("r1").exists());

    cradle.delete_node("r1").unwrap();
    assert!(!dir.path().join("nodes").join("r1").exists());
    cradle.shutdown();
}
