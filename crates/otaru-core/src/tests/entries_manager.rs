use std::sync::Arc;

use chrono::TimeDelta;

use otaru_storage::{BlobHandle, BlobStore};
use otaru_types::flags::OpenFlags;

use crate::cachedblobstore::{CacheEntry, CacheEntryState, EntriesManager};
use crate::clock::{Clock, NEVER};
use crate::error::OtaruError;
use crate::testutil::{assert_blob_version, TestEnv};

fn paths(entries: &[Arc<CacheEntry>]) -> Vec<String> {
    entries.iter().map(|e| e.blobpath().to_string()).collect()
}

/// Registers the fixture used by the sync candidate tests.
fn populate_sync_fixture(env: &TestEnv, mgr: &EntriesManager) {
    let now = env.clock.now();
    let secs = TimeDelta::seconds;
    let fixture = [
        ("dirtyRecentWrite", CacheEntryState::Dirty, now, now),
        ("dirtyRecentSync", CacheEntryState::Dirty, now, now - secs(180)),
        ("dirtySuperOld", CacheEntryState::Dirty, NEVER, NEVER),
        ("writeInProgressOldSync", CacheEntryState::Dirty, now, now - secs(330)),
        ("dirtyWrite5", CacheEntryState::Dirty, now - secs(5), now - secs(5)),
        ("cleanOld", CacheEntryState::Clean, now - secs(330), now - secs(330)),
    ];
    for (bp, state, last_write, last_sync) in fixture {
        let entry = mgr.open_entry(bp).unwrap();
        entry.set_state_for_test(state, last_write, last_sync);
    }
}

#[test]
fn start_and_quit() {
    let env = TestEnv::new();
    let mgr = EntriesManager::new(env.context()).unwrap();
    assert_eq!(mgr.num_entries().unwrap(), 0);
    mgr.quit();
    mgr.quit();
    match mgr.num_entries() {
        Err(OtaruError::InvalidState(_)) => {}
        other => panic!("expected InvalidState, got: {other:?}"),
    }
}

#[test]
fn open_entry_returns_same_entry() {
    let env = TestEnv::new();
    let mgr = EntriesManager::new(env.context()).unwrap();
    let a = mgr.open_entry("foo").unwrap();
    let b = mgr.open_entry("foo").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.state(), CacheEntryState::Uninitialized);
    assert_eq!(mgr.num_entries().unwrap(), 1);
}

#[test]
fn find_sync_candidates_orders_by_overdue_axis() {
    let env = TestEnv::new();
    let mgr = EntriesManager::new(env.context()).unwrap();
    populate_sync_fixture(&env, &mgr);

    assert_eq!(
        paths(&mgr.find_sync_candidates(10).unwrap()),
        ["dirtySuperOld", "writeInProgressOldSync", "dirtyWrite5"]
    );
    assert_eq!(
        paths(&mgr.find_sync_candidates(1).unwrap()),
        ["dirtySuperOld"]
    );
}

#[test]
fn find_all_syncable_returns_every_dirty_entry() {
    let env = TestEnv::new();
    let mgr = EntriesManager::new(env.context()).unwrap();
    populate_sync_fixture(&env, &mgr);

    let mut all = paths(&mgr.find_all_syncable().unwrap());
    all.sort();
    assert_eq!(
        all,
        [
            "dirtyRecentSync",
            "dirtyRecentWrite",
            "dirtySuperOld",
            "dirtyWrite5",
            "writeInProgressOldSync",
        ]
    );
}

#[test]
fn choose_sync_entry_prefers_oldest_write() {
    let env = TestEnv::new();
    let mgr = EntriesManager::new(env.context()).unwrap();
    populate_sync_fixture(&env, &mgr);

    let chosen = mgr.choose_sync_entry().unwrap().expect("an entry is overdue");
    assert_eq!(chosen.blobpath(), "dirtySuperOld");
}

#[test]
fn choose_sync_entry_none_when_recent() {
    let env = TestEnv::new();
    let mgr = EntriesManager::new(env.context()).unwrap();
    let now = env.clock.now();
    mgr.open_entry("fresh")
        .unwrap()
        .set_state_for_test(CacheEntryState::Dirty, now, now);

    assert!(mgr.choose_sync_entry().unwrap().is_none());
    assert!(mgr.find_sync_candidates(10).unwrap().is_empty());

    env.clock.advance(TimeDelta::seconds(4));
    let chosen = mgr.choose_sync_entry().unwrap().expect("write timeout passed");
    assert_eq!(chosen.blobpath(), "fresh");
}

#[test]
fn list_blobs_only_reports_active_entries() {
    let env = TestEnv::new();
    let mgr = EntriesManager::new(env.context()).unwrap();

    let entry = mgr.open_entry("opened").unwrap();
    let handle = entry.open_handle(OpenFlags::RDWR_CREATE).unwrap();
    mgr.open_entry("registered").unwrap();

    assert_eq!(mgr.list_blobs().unwrap(), ["opened"]);
    drop(handle);

    let mut infos = mgr.dump_entries_info().unwrap();
    infos.sort_by(|a, b| a.blobpath.cmp(&b.blobpath));
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].blobpath, "opened");
    assert_eq!(infos[0].state, CacheEntryState::Clean);
    assert_eq!(infos[0].number_of_handles, 0);
    assert_eq!(infos[1].state, CacheEntryState::Uninitialized);
}

#[test]
fn drop_cache_entry_writes_back_and_removes_cache_blob() {
    let env = TestEnv::new();
    let ctx = env.context();
    let mgr = EntriesManager::new(ctx.clone()).unwrap();

    let entry = mgr.open_entry("foo").unwrap();
    let mut handle = entry.open_handle(OpenFlags::RDWR_CREATE).unwrap();
    handle.pwrite(&[1, 2, 3, 4], 0).unwrap();
    assert_eq!(entry.state(), CacheEntryState::Dirty);

    match mgr.drop_cache_entry("foo") {
        Err(OtaruError::InvalidState(msg)) => assert!(msg.contains("open handles")),
        other => panic!("expected InvalidState while a handle is open, got: {other:?}"),
    }
    handle.close().unwrap();

    mgr.drop_cache_entry("foo").unwrap();
    assert_eq!(mgr.num_entries().unwrap(), 0);
    assert!(env.cache.get("foo").is_none());
    assert_eq!(env.backend.mem().get("foo").unwrap(), vec![1u8, 2, 3, 4]);
    assert_eq!(ctx.version_cache.query("foo").unwrap(), 1);

    // Dropping an unknown path is fine.
    mgr.drop_cache_entry("unknown").unwrap();
}

#[test]
fn remove_blob_abandons_dirty_entry() {
    let env = TestEnv::new();
    let mgr = EntriesManager::new(env.context()).unwrap();

    let entry = mgr.open_entry("foo").unwrap();
    let mut handle = entry.open_handle(OpenFlags::RDWR_CREATE).unwrap();
    handle.pwrite(&[7, 7], 0).unwrap();
    drop(handle);

    mgr.remove_blob("foo").unwrap();
    assert_eq!(entry.state(), CacheEntryState::Closed);
    assert_eq!(mgr.num_entries().unwrap(), 0);
    assert_blob_version(env.backend.as_ref(), "foo", 0);
}

#[test]
fn eviction_prefers_idle_timed_out_entries() {
    let mut env = TestEnv::new();
    env.config.max_entries = 2;
    let mgr = EntriesManager::new(env.context()).unwrap();

    let busy = mgr.open_entry("busy").unwrap();
    let _h = busy.open_handle(OpenFlags::RDWR_CREATE).unwrap();
    env.clock.advance(TimeDelta::seconds(1));
    mgr.open_entry("idle-old").unwrap();
    env.clock.advance(TimeDelta::seconds(1));
    mgr.open_entry("idle-new").unwrap();
    assert_eq!(mgr.num_entries().unwrap(), 3);

    env.clock.advance(TimeDelta::seconds(11));
    mgr.open_entry("fourth").unwrap();

    let mut left: Vec<String> = mgr
        .dump_entries_info()
        .unwrap()
        .into_iter()
        .map(|i| i.blobpath)
        .collect();
    left.sort();
    assert_eq!(left, ["busy", "fourth", "idle-new"]);
}

#[test]
fn eviction_fails_when_every_entry_is_busy() {
    let mut env = TestEnv::new();
    env.config.max_entries = 2;
    let mgr = EntriesManager::new(env.context()).unwrap();

    let mut handles = Vec::new();
    for bp in ["a", "b", "c"] {
        let entry = mgr.open_entry(bp).unwrap();
        handles.push(entry.open_handle(OpenFlags::RDWR_CREATE).unwrap());
    }

    match mgr.open_entry("d") {
        Err(OtaruError::TooManyOpenFiles) => {}
        other => panic!("expected TooManyOpenFiles, got: {other:?}"),
    }

    handles.pop();
    mgr.open_entry("d").unwrap();
}

#[test]
fn reserved_entry_is_not_evicted_before_its_handle_opens() {
    let mut env = TestEnv::new();
    env.config.max_entries = 2;
    let mgr = EntriesManager::new(env.context()).unwrap();

    let _a = mgr.open_handle("a", OpenFlags::RDWR_CREATE).unwrap();
    let _b = mgr.open_handle("b", OpenFlags::RDWR_CREATE).unwrap();
    let c = mgr.reserve_entry("c").unwrap();
    assert!(c.is_busy());
    assert_eq!(c.num_handles(), 0);

    match mgr.open_entry("d") {
        Err(OtaruError::TooManyOpenFiles) => {}
        other => panic!("expected TooManyOpenFiles, got: {other:?}"),
    }

    let mut h = c.open_reserved_handle(OpenFlags::RDWR_CREATE).unwrap();
    h.pwrite(&[4, 0xaa], 0).unwrap();
    assert_eq!(c.state(), CacheEntryState::Dirty);
    assert_eq!(paths(&mgr.find_all_syncable().unwrap()), ["c"]);
    assert!(mgr.list_blobs().unwrap().contains(&"c".to_string()));

    drop(h);
    assert!(!c.is_busy());
    mgr.open_entry("d").unwrap();
    assert_eq!(c.state(), CacheEntryState::Closed);
    assert_blob_version(env.backend.as_ref(), "c", 4);
}

#[test]
fn reserved_entry_cannot_be_dropped() {
    let env = TestEnv::new();
    let mgr = EntriesManager::new(env.context()).unwrap();

    let entry = mgr.reserve_entry("foo").unwrap();
    match mgr.drop_cache_entry("foo") {
        Err(OtaruError::InvalidState(_)) => {}
        other => panic!("expected InvalidState, got: {other:?}"),
    }
    drop(entry.open_reserved_handle(OpenFlags::RDWR_CREATE).unwrap());
    mgr.drop_cache_entry("foo").unwrap();
    assert_eq!(mgr.num_entries().unwrap(), 0);
}

#[test]
fn sync_all_flushes_dirty_entries() {
    let env = TestEnv::new();
    let mgr = EntriesManager::new(env.context()).unwrap();

    for (bp, ver) in [("x", 3u8), ("y", 5u8)] {
        let entry = mgr.open_entry(bp).unwrap();
        let mut h = entry.open_handle(OpenFlags::RDWR_CREATE).unwrap();
        h.pwrite(&[ver, 0xaa], 0).unwrap();
    }
    mgr.sync_all().unwrap();

    assert_blob_version(env.backend.as_ref(), "x", 3);
    assert_blob_version(env.backend.as_ref(), "y", 5);
    assert!(mgr.find_all_syncable().unwrap().is_empty());
    assert!(env.backend.list_blobs().unwrap().contains(&"x".to_string()));
}
