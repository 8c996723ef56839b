//! Directory Tests
//!
//! Tests for key ranges, directory mutations, publishing and persistence.

use std::sync::Arc;
use std::thread;

use cradlekv::keyspace::{persist, DirectoryHandle, DirectoryView, Segment};
use cradlekv::{CradleError, Directory, KeyRange, Owner};
use tempfile::TempDir;

fn range(start: &str, end: Option<&str>) -> KeyRange {
    KeyRange::new(start.as_bytes().to_vec(), end.map(|e| e.as_bytes().to_vec()))
}

fn owner_name(dir: &Directory, key: &str) -> Option<String> {
    dir.owner_of(key.as_bytes()).map(|o| o.name.clone())
}

/// Host h1 with r1 ["a","m") and r2 ["m",∞)
fn two_routers() -> Directory {
    Directory::new("h1")
        .assign(&range("a", Some("m")), Owner::new("r1", "h1"))
        .unwrap()
        .assign(&range("m", None), Owner::new("r2", "h1"))
        .unwrap()
}

// =============================================================================
// KeyRange Tests
// =============================================================================

#[test]
fn test_range_is_half_open() {
    let r = range("a", Some("m"));
    assert!(r.contains(b"a"));
    assert!(r.contains(b"lzzz"));
    assert!(!r.contains(b"m"));
    assert!(!r.contains(b""));

    let unbounded = range("m", None);
    assert!(unbounded.contains(b"zzzzzz"));
    assert!(KeyRange::full().contains(b""));
}

#[test]
fn test_range_split_and_join() {
    let r = range("a", Some("m"));
    let (lower, upper) = r.split_at(b"g").unwrap();
    assert_eq!(lower, range("a", Some("g")));
    assert_eq!(upper, range("g", Some("m")));
    assert_eq!(lower.join(&upper), Some(r.clone()));
    assert_eq!(upper.join(&lower), Some(r.clone()));

    // Boundary must be strictly inside
    assert!(r.split_at(b"a").is_none());
    assert!(r.split_at(b"m").is_none());
    assert!(r.split_at(b"z").is_none());

    assert!(range("a", Some("c")).join(&range("d", Some("f"))).is_none());
}

#[test]
fn test_range_parse() {
    assert_eq!("a..m".parse::<KeyRange>().unwrap(), range("a", Some("m")));
    assert_eq!("g..".parse::<KeyRange>().unwrap(), range("g", None));
    assert_eq!("..".parse::<KeyRange>().unwrap(), KeyRange::full());
    assert!("nodots".parse::<KeyRange>().is_err());
}

// =============================================================================
// Directory Mutation Tests
// =============================================================================

#[test]
fn test_new_directory_is_all_unowned() {
    let dir = Directory::new("h1");
    assert_eq!(dir.version(), 1);
    assert_eq!(dir.segments().len(), 1);
    assert!(dir.owner_of(b"anything").is_none());
    dir.validate().unwrap();
}

#[test]
fn test_every_mutation_bumps_version() {
    let dir = two_routers();
    assert_eq!(dir.version(), 3);

    let split = dir.split("r1", b"g", Owner::new("r1.1", "h1")).unwrap();
    assert_eq!(split.version(), 4);
    let merged = split.merge("r1", "r1.1").unwrap();
    assert_eq!(merged.version(), 5);
    let released = merged.release("r2").unwrap();
    assert_eq!(released.version(), 6);

    // The source snapshots are untouched
    assert_eq!(dir.version(), 3);
    assert_eq!(owner_name(&dir, "h").as_deref(), Some("r1"));
}

#[test]
fn test_split_hands_upper_half_to_new_owner() {
    let dir = two_routers()
        .split("r1", b"g", Owner::new("r1.1", "h1"))
        .unwrap();
    dir.validate().unwrap();

    assert_eq!(owner_name(&dir, "a").as_deref(), Some("r1"));
    assert_eq!(owner_name(&dir, "f").as_deref(), Some("r1"));
    assert_eq!(owner_name(&dir, "g").as_deref(), Some("r1.1"));
    assert_eq!(owner_name(&dir, "lzz").as_deref(), Some("r1.1"));
    assert_eq!(owner_name(&dir, "m").as_deref(), Some("r2"));
    assert_eq!(dir.local_range("r1.1"), Some(&range("g", Some("m"))));
}

#[test]
fn test_split_rejects_bad_boundary_and_duplicate_owner() {
    let dir = two_routers();
    assert!(matches!(
        dir.split("r1", b"a", Owner::new("x", "h1")),
        Err(CradleError::RangeConflict(_))
    ));
    assert!(dir.split("r1", b"g", Owner::new("r2", "h1")).is_err());
    assert!(dir.split("nope", b"g", Owner::new("x", "h1")).is_err());
}

#[test]
fn test_merge_requires_adjacency() {
    let dir = Directory::new("h1")
        .assign(&range("a", Some("c")), Owner::new("r1", "h1"))
        .unwrap()
        .assign(&range("d", Some("f")), Owner::new("r2", "h1"))
        .unwrap();
    assert!(matches!(
        dir.merge("r1", "r2"),
        Err(CradleError::RangeConflict(_))
    ));
}

#[test]
fn test_assign_refuses_owned_space() {
    let dir = two_routers();
    assert!(matches!(
        dir.assign(&range("k", Some("p")), Owner::new("r3", "h1")),
        Err(CradleError::RangeConflict(_))
    ));
    // Unowned ["", "a") is still free
    let dir = dir.assign(&range("", Some("a")), Owner::new("r0", "h1")).unwrap();
    dir.validate().unwrap();
    assert_eq!(owner_name(&dir, "").as_deref(), Some("r0"));
}

#[test]
fn test_release_leaves_explicit_unowned_gap() {
    let dir = two_routers().release("r1").unwrap();
    dir.validate().unwrap();
    assert!(dir.owner_of(b"b").is_none());

    // ["", "a") and ["a", "m") coalesce into one unowned segment
    let unowned: Vec<&Segment> = dir.segments().iter().filter(|s| s.owner.is_none()).collect();
    assert_eq!(unowned.len(), 1);
    assert_eq!(unowned[0].range, range("", Some("m")));
}

#[test]
fn test_remote_owners_are_not_local() {
    let dir = two_routers()
        .release("r2")
        .unwrap()
        .assign_remote(&range("m", None), Owner::new("r9", "h2"))
        .unwrap();
    dir.validate().unwrap();

    let owner = dir.owner_of(b"t").unwrap();
    assert_eq!(owner, &Owner::new("r9", "h2"));
    assert!(!dir.is_local(owner));
    assert_eq!(dir.local_segments().count(), 1);

    // A peer can never take over a local router's space
    assert!(dir
        .assign_remote(&range("a", Some("c")), Owner::new("r8", "h2"))
        .is_err());
    // Nor can a local owner be recorded as remote
    assert!(dir
        .assign_remote(&range("", Some("a")), Owner::new("r5", "h1"))
        .is_err());
}

#[test]
fn test_release_host_and_rehost() {
    let dir = two_routers()
        .release("r2")
        .unwrap()
        .assign_remote(&range("m", None), Owner::new("r9", "h2"))
        .unwrap();

    let forgotten = dir.release_host("h2");
    assert!(forgotten.owner_of(b"t").is_none());
    assert_eq!(owner_name(&forgotten, "b").as_deref(), Some("r1"));

    let moved = dir.rehost("h1-new");
    assert_eq!(moved.host(), "h1-new");
    assert_eq!(moved.owner_of(b"b"), Some(&Owner::new("r1", "h1-new")));
    assert_eq!(moved.owner_of(b"t"), Some(&Owner::new("r9", "h2")));
    assert!(moved.version() > dir.version());
}

// =============================================================================
// Handle & View Tests
// =============================================================================

#[test]
fn test_handle_rejects_stale_publish() {
    let handle = DirectoryHandle::new(Directory::new("h1"), None);
    let next = handle
        .update(|d| d.assign(&range("a", Some("m")), Owner::new("r1", "h1")))
        .unwrap();
    assert_eq!(next.version(), 2);

    let stale = Directory::new("h1");
    assert!(matches!(
        handle.publish(stale),
        Err(CradleError::MigrationConflict(_))
    ));
    assert_eq!(handle.version(), 2);
}

#[test]
fn test_failed_update_publishes_nothing() {
    let handle = DirectoryHandle::new(two_routers(), None);
    let before = handle.version();
    assert!(handle.update(|d| d.release("missing")).is_err());
    assert_eq!(handle.version(), before);
}

#[test]
fn test_concurrent_updates_are_not_lost() {
    let handle = Arc::new(DirectoryHandle::new(Directory::new("h1"), None));
    let workers: Vec<_> = (0..8u8)
        .map(|i| {
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                let start = vec![b'a' + i * 2];
                let end = vec![b'a' + i * 2 + 1];
                handle
                    .update(|d| {
                        d.assign(&KeyRange::new(start, Some(end)), Owner::new(format!("r{}", i), "h1"))
                    })
                    .unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let dir = handle.snapshot();
    assert_eq!(dir.version(), 9);
    assert_eq!(dir.local_segments().count(), 8);
    dir.validate().unwrap();
}

#[test]
fn test_view_refreshes_and_never_regresses() {
    let handle = Arc::new(DirectoryHandle::new(Directory::new("h1"), None));
    let view = DirectoryView::new(Arc::clone(&handle));
    assert_eq!(view.cached().version(), 1);

    handle
        .update(|d| d.assign(&range("a", Some("m")), Owner::new("r1", "h1")))
        .unwrap();
    assert!(view.is_stale());
    assert_eq!(view.cached().version(), 1);
    assert_eq!(view.current().version(), 2);
    assert!(!view.is_stale());
    assert_eq!(view.refresh().version(), 2);
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_publish_persists_before_visible() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("directory.bin");
    let handle = DirectoryHandle::new(Directory::new("h1"), Some(path.clone()));

    handle
        .update(|d| d.assign(&range("a", Some("m")), Owner::new("r1", "h1")))
        .unwrap();

    let loaded = persist::load(&path).unwrap().unwrap();
    assert_eq!(loaded, *handle.snapshot());
}

#[test]
fn test_load_missing_file_is_none() {
    let dir = TempDir::new().unwrap();
    assert!(persist::load(&dir.path().join("absent.bin")).unwrap().is_none());
}

#[test]
fn test_corrupt_directory_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("directory.bin");
    persist::save(&path, &two_routers()).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(persist::load(&path), Err(CradleError::Storage(_))));
}
