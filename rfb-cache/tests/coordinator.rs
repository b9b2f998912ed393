//! Multi-viewer coordination tests. These run the election and IPC inside
//! one process (two coordinator instances over the same directory), which
//! exercises the same flock and socket paths as two separate viewers.

use rfb_cache::coordinator::{
    coordinator_lock_path, coordinator_pid_path, coordinator_socket_path, CacheCoordinator,
    CoordinatorRole, WireIndexEntry,
};
use rfb_cache::CacheKey;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn sample_entry(id: u64) -> WireIndexEntry {
    WireIndexEntry {
        key: *CacheKey::from_id(id).as_bytes(),
        shard_id: 0,
        offset: 0,
        size: 64,
        width: 8,
        height: 8,
        stride_pixels: 8,
        canonical_hash: id,
        actual_hash: id,
        quality_code: 4,
        cold: false,
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn first_process_becomes_master() {
    let dir = TempDir::new().unwrap();
    let mut coord = CacheCoordinator::create(dir.path(), None, None);
    assert_eq!(coord.role(), CoordinatorRole::Master);
    assert!(coord.start());
    assert!(coord.is_running());

    assert!(coordinator_lock_path(dir.path()).exists());
    assert!(coordinator_pid_path(dir.path()).exists());
    assert!(coordinator_socket_path(dir.path()).exists());

    coord.stop();
    assert!(!coord.is_running());
}

#[test]
fn second_process_becomes_slave_and_master_counts_it() {
    let dir = TempDir::new().unwrap();

    let mut master = CacheCoordinator::create(dir.path(), None, None);
    assert_eq!(master.role(), CoordinatorRole::Master);
    assert!(master.start());

    let mut slave = CacheCoordinator::create(dir.path(), None, None);
    assert_eq!(slave.role(), CoordinatorRole::Slave);
    assert!(slave.start());

    // The master must report one connected slave within 200 ms.
    assert!(wait_until(Duration::from_millis(200), || {
        master.stats().connected_slaves == 1
    }));

    slave.stop();
    master.stop();
}

#[test]
fn slave_write_request_is_serviced_by_master() {
    let dir = TempDir::new().unwrap();

    let served = Arc::new(AtomicUsize::new(0));
    let served2 = Arc::clone(&served);
    let write_cb = Arc::new(move |entry: WireIndexEntry, payload: Vec<u8>| {
        assert_eq!(payload.len(), entry.size as usize);
        served2.fetch_add(1, Ordering::SeqCst);
        // Pretend the payload landed at shard 3, offset 4096.
        Some(WireIndexEntry {
            shard_id: 3,
            offset: 4096,
            ..entry
        })
    });

    let mut master = CacheCoordinator::create(dir.path(), None, Some(write_cb));
    assert!(master.start());

    let mut slave = CacheCoordinator::create(dir.path(), None, None);
    assert_eq!(slave.role(), CoordinatorRole::Slave);
    assert!(slave.start());
    assert!(wait_until(Duration::from_millis(500), || {
        master.stats().connected_slaves == 1
    }));

    let entry = sample_entry(0xAA);
    let assigned = slave.write_request(&entry, &vec![7u8; 64]).unwrap();
    assert_eq!(assigned.shard_id, 3);
    assert_eq!(assigned.offset, 4096);
    assert_eq!(served.load(Ordering::SeqCst), 1);
    assert_eq!(slave.stats().writes_forwarded, 1);

    slave.stop();
    master.stop();
}

#[test]
fn master_pushes_index_updates_to_slaves() {
    let dir = TempDir::new().unwrap();

    let received: Arc<Mutex<Vec<WireIndexEntry>>> = Arc::new(Mutex::new(Vec::new()));
    let received2 = Arc::clone(&received);
    let index_cb = Arc::new(move |entries: Vec<WireIndexEntry>| {
        received2.lock().unwrap().extend(entries);
    });

    let mut master = CacheCoordinator::create(dir.path(), None, None);
    assert!(master.start());
    let mut slave = CacheCoordinator::create(dir.path(), Some(index_cb), None);
    assert!(slave.start());
    assert!(wait_until(Duration::from_millis(500), || {
        master.stats().connected_slaves == 1
    }));

    master.push_index_update(&[sample_entry(1), sample_entry(2)]);

    assert!(wait_until(Duration::from_millis(500), || {
        received.lock().unwrap().len() == 2
    }));
    assert_eq!(slave.stats().index_updates_received, 1);

    slave.stop();
    master.stop();
}

#[test]
fn slave_write_times_out_without_a_serving_master() {
    let dir = TempDir::new().unwrap();

    // Master with no write callback: requests are answered with failure.
    let mut master = CacheCoordinator::create(dir.path(), None, None);
    assert!(master.start());
    let mut slave = CacheCoordinator::create(dir.path(), None, None);
    assert!(slave.start());
    slave.set_write_timeout(Duration::from_millis(100));
    assert!(wait_until(Duration::from_millis(500), || {
        master.stats().connected_slaves == 1
    }));

    let err = slave.write_request(&sample_entry(1), &[0u8; 64]).unwrap_err();
    // Refusal surfaces as an error; the caller keeps the entry memory-only.
    assert!(slave.stats().write_failures >= 1 || err.kind() == std::io::ErrorKind::TimedOut);

    slave.stop();
    master.stop();
}

#[test]
fn released_lock_lets_the_next_process_win() {
    let dir = TempDir::new().unwrap();

    {
        let mut first = CacheCoordinator::create(dir.path(), None, None);
        assert_eq!(first.role(), CoordinatorRole::Master);
        first.start();
        first.stop();
        // Dropped here: flock released.
    }

    let second = CacheCoordinator::create(dir.path(), None, None);
    assert_eq!(second.role(), CoordinatorRole::Master);
}

#[test]
fn standalone_when_directory_is_unusable() {
    // A path that cannot be created forces the standalone fallback.
    let coord = CacheCoordinator::create(
        std::path::Path::new("/proc/definitely/not/writable"),
        None,
        None,
    );
    assert_eq!(coord.role(), CoordinatorRole::Standalone);
}
