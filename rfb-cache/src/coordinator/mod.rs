//! Multi-viewer cache coordination.
//!
//! Several viewer processes may share one cache directory; exactly one may
//! own disk writes at a time. Election is by non-blocking `flock` on
//! `coordinator.lock`: the winner becomes **master**, writes its pid to
//! `coordinator.pid` and services peers over a UNIX stream socket at
//! `coordinator.sock`; losers become **slaves** and forward their disk
//! writes to the master as `WRITE_REQUEST` frames. The master pushes
//! `INDEX_UPDATE` diffs to all connected slaves as its index grows.
//!
//! If IPC setup fails entirely (socket errors, path too long), the engine
//! runs **standalone** and assumes it is the only writer.
//!
//! The coordinator never touches the engine directly; the engine hands it
//! two callbacks at creation (index-update ingest and write servicing) and
//! the coordinator's threads call them. Destruction order is engine first
//! (it stops the coordinator), so the callbacks never outlive the state
//! they capture.

pub mod wire;

pub use wire::{WireIndexEntry, COORDINATOR_PROTOCOL_VERSION};

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, info, warn};

use wire::{CoordMessage, CoordMsgType};

/// How long a slave waits for the master to service a WRITE_REQUEST before
/// falling back to memory-only for that entry.
pub const WRITE_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// Poll interval for accept/read loops checking the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Path of the flock target inside a cache directory.
pub fn coordinator_lock_path(dir: &Path) -> PathBuf {
    dir.join("coordinator.lock")
}

/// Path of the master pid file inside a cache directory.
pub fn coordinator_pid_path(dir: &Path) -> PathBuf {
    dir.join("coordinator.pid")
}

/// Path of the IPC socket inside a cache directory.
pub fn coordinator_socket_path(dir: &Path) -> PathBuf {
    dir.join("coordinator.sock")
}

/// Which side of the election this process ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorRole {
    /// Holds the flock; owns all disk writes and fans out index updates.
    Master,
    /// Forwards writes to the master over the socket.
    Slave,
    /// IPC unavailable; behaves as the only writer.
    Standalone,
}

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorStats {
    pub role: CoordinatorRole,
    pub connected_slaves: usize,
    pub writes_forwarded: u64,
    pub write_failures: u64,
    pub index_updates_sent: u64,
    pub index_updates_received: u64,
}

/// Called on a slave when the master pushes INDEX_UPDATE entries.
pub type IndexUpdateHandler = Arc<dyn Fn(Vec<WireIndexEntry>) + Send + Sync>;

/// Called on the master to persist a slave's entry. Returns the entry with
/// its assigned shard/offset, or `None` when persistence failed.
pub type WriteRequestHandler =
    Arc<dyn Fn(WireIndexEntry, Vec<u8>) -> Option<WireIndexEntry> + Send + Sync>;

struct Shared {
    running: AtomicBool,
    index_cb: Option<IndexUpdateHandler>,
    write_cb: Option<WriteRequestHandler>,

    // Master: write halves of connected slave sockets, keyed by id.
    slaves: Mutex<Vec<(usize, UnixStream)>>,

    // Slave: write half towards the master, and the response hand-off.
    master_tx: Mutex<Option<UnixStream>>,
    response_tx: crossbeam_channel::Sender<(bool, WireIndexEntry)>,
    response_rx: crossbeam_channel::Receiver<(bool, WireIndexEntry)>,

    writes_forwarded: AtomicU64,
    write_failures: AtomicU64,
    index_updates_sent: AtomicU64,
    index_updates_received: AtomicU64,
    next_slave_id: AtomicUsize,
}

impl Shared {
    fn new(index_cb: Option<IndexUpdateHandler>, write_cb: Option<WriteRequestHandler>) -> Self {
        let (response_tx, response_rx) = crossbeam_channel::bounded(4);
        Self {
            running: AtomicBool::new(false),
            index_cb,
            write_cb,
            slaves: Mutex::new(Vec::new()),
            master_tx: Mutex::new(None),
            response_tx,
            response_rx,
            writes_forwarded: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            index_updates_sent: AtomicU64::new(0),
            index_updates_received: AtomicU64::new(0),
            next_slave_id: AtomicUsize::new(0),
        }
    }
}

/// Master/slave election plus the IPC threads for one cache directory.
pub struct CacheCoordinator {
    role: CoordinatorRole,
    dir: PathBuf,
    write_timeout: Duration,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    /// Held (flocked) for the master's whole lifetime; dropping releases
    /// the lock and lets the next contender win the election.
    _lock_file: Option<File>,
    listener: Option<UnixListener>,
    /// Slave: read half of the master connection, consumed by `start`.
    slave_reader: Option<UnixStream>,
}

impl CacheCoordinator {
    /// Run the election for `dir` and build a coordinator in the resulting
    /// role. IPC failures degrade to [`CoordinatorRole::Standalone`] rather
    /// than erroring; correctness then rests on the single-writer
    /// assumption.
    pub fn create(
        dir: &Path,
        index_cb: Option<IndexUpdateHandler>,
        write_cb: Option<WriteRequestHandler>,
    ) -> Self {
        let shared = Arc::new(Shared::new(index_cb, write_cb));

        match Self::elect(dir, &shared) {
            Ok((role, lock_file, listener, slave_reader)) => Self {
                role,
                dir: dir.to_path_buf(),
                write_timeout: WRITE_REQUEST_TIMEOUT,
                shared,
                threads: Vec::new(),
                _lock_file: lock_file,
                listener,
                slave_reader,
            },
            Err(err) => {
                warn!("cache coordination unavailable, running standalone: {err}");
                Self {
                    role: CoordinatorRole::Standalone,
                    dir: dir.to_path_buf(),
                    write_timeout: WRITE_REQUEST_TIMEOUT,
                    shared,
                    threads: Vec::new(),
                    _lock_file: None,
                    listener: None,
                    slave_reader: None,
                }
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn elect(
        dir: &Path,
        shared: &Arc<Shared>,
    ) -> std::io::Result<(
        CoordinatorRole,
        Option<File>,
        Option<UnixListener>,
        Option<UnixStream>,
    )> {
        fs::create_dir_all(dir)?;
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(coordinator_lock_path(dir))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                // Master: advertise pid, bind a fresh socket.
                fs::write(
                    coordinator_pid_path(dir),
                    format!("{}\n", std::process::id()),
                )?;
                let sock_path = coordinator_socket_path(dir);
                let _ = fs::remove_file(&sock_path);
                let listener = UnixListener::bind(&sock_path)?;
                listener.set_nonblocking(true)?;
                info!("cache coordinator: elected master (pid {})", std::process::id());
                Ok((CoordinatorRole::Master, Some(lock_file), Some(listener), None))
            }
            Err(_) => {
                // Someone else holds the lock; join as slave. The master
                // may still be binding, so retry connecting briefly.
                let sock_path = coordinator_socket_path(dir);
                let mut last_err = None;
                for _ in 0..10 {
                    match UnixStream::connect(&sock_path) {
                        Ok(stream) => {
                            stream.set_read_timeout(Some(POLL_INTERVAL))?;
                            *shared.master_tx.lock().unwrap() = Some(stream.try_clone()?);
                            info!("cache coordinator: joined as slave");
                            return Ok((CoordinatorRole::Slave, None, None, Some(stream)));
                        }
                        Err(err) => {
                            last_err = Some(err);
                            std::thread::sleep(Duration::from_millis(20));
                        }
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "connect retries exhausted")
                }))
            }
        }
    }

    /// This process's election outcome.
    pub fn role(&self) -> CoordinatorRole {
        self.role
    }

    /// The coordinated cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Override the slave write-request timeout (tests use short values).
    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Spawn the IPC threads for this role. Standalone has none.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            return true;
        }
        self.shared.running.store(true, Ordering::SeqCst);

        match self.role {
            CoordinatorRole::Master => {
                let Some(listener) = self.listener.take() else {
                    return false;
                };
                let shared = Arc::clone(&self.shared);
                self.threads.push(std::thread::spawn(move || {
                    master_accept_loop(listener, shared);
                }));
                true
            }
            CoordinatorRole::Slave => {
                let Some(stream) = self.slave_reader.take() else {
                    return false;
                };
                // Announce ourselves before listening for pushes.
                if let Some(tx) = self.shared.master_tx.lock().unwrap().as_mut() {
                    let hello = wire::encode_hello(std::process::id());
                    if tx.write_all(&hello.serialize()).is_err() {
                        self.shared.running.store(false, Ordering::SeqCst);
                        return false;
                    }
                }
                let shared = Arc::clone(&self.shared);
                self.threads.push(std::thread::spawn(move || {
                    slave_read_loop(stream, shared);
                }));
                true
            }
            CoordinatorRole::Standalone => true,
        }
    }

    /// Stop all IPC threads and release resources. The master's flock is
    /// released when the coordinator is dropped.
    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(stream) = self.shared.master_tx.lock().unwrap().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        for (_, stream) in self.shared.slaves.lock().unwrap().drain(..) {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        if self.role == CoordinatorRole::Master {
            let _ = fs::remove_file(coordinator_socket_path(&self.dir));
            let _ = fs::remove_file(coordinator_pid_path(&self.dir));
        }
    }

    /// Slave only: ask the master to persist an entry. Blocks up to the
    /// write timeout; timeout or disconnect is an error and the caller
    /// falls back to memory-only for this entry.
    pub fn write_request(
        &self,
        entry: &WireIndexEntry,
        payload: &[u8],
    ) -> std::io::Result<WireIndexEntry> {
        if self.role != CoordinatorRole::Slave {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "write_request is a slave-side operation",
            ));
        }

        // Drain any stale response left over from a timed-out request.
        while self.shared.response_rx.try_recv().is_ok() {}

        {
            let mut guard = self.shared.master_tx.lock().unwrap();
            let stream = guard.as_mut().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "master connection lost")
            })?;
            let frame = wire::encode_write_request(entry, payload).serialize();
            stream.write_all(&frame)?;
        }

        match self.shared.response_rx.recv_timeout(self.write_timeout) {
            Ok((true, result)) => {
                self.shared.writes_forwarded.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Ok((false, _)) => {
                self.shared.write_failures.fetch_add(1, Ordering::Relaxed);
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "master refused write request",
                ))
            }
            Err(_) => {
                self.shared.write_failures.fetch_add(1, Ordering::Relaxed);
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write request timed out",
                ))
            }
        }
    }

    /// Master only: push index entries to every connected slave. Broken
    /// connections are dropped from the fan-out set.
    pub fn push_index_update(&self, entries: &[WireIndexEntry]) {
        if self.role != CoordinatorRole::Master || entries.is_empty() {
            return;
        }
        let frame = wire::encode_index_update(entries).serialize();
        let mut slaves = self.shared.slaves.lock().unwrap();
        slaves.retain_mut(|(id, stream)| match stream.write_all(&frame) {
            Ok(()) => true,
            Err(err) => {
                debug!("dropping slave {id} from fan-out: {err}");
                false
            }
        });
        if !slaves.is_empty() {
            self.shared
                .index_updates_sent
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            role: self.role,
            connected_slaves: self.shared.slaves.lock().unwrap().len(),
            writes_forwarded: self.shared.writes_forwarded.load(Ordering::Relaxed),
            write_failures: self.shared.write_failures.load(Ordering::Relaxed),
            index_updates_sent: self.shared.index_updates_sent.load(Ordering::Relaxed),
            index_updates_received: self.shared.index_updates_received.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CacheCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Master: accept slave connections until stopped.
fn master_accept_loop(listener: UnixListener, shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let id = shared.next_slave_id.fetch_add(1, Ordering::Relaxed);
                debug!("coordinator: slave connection {id} accepted");
                if stream.set_read_timeout(Some(POLL_INTERVAL)).is_err() {
                    continue;
                }
                let shared2 = Arc::clone(&shared);
                // One servicing thread per slave; requests are handled
                // serially within each connection.
                std::thread::spawn(move || {
                    master_service_loop(id, stream, shared2);
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                if shared.running.load(Ordering::SeqCst) {
                    warn!("coordinator accept failed: {err}");
                }
                break;
            }
        }
    }
}

/// Master: service one slave connection.
fn master_service_loop(id: usize, mut stream: UnixStream, shared: Arc<Shared>) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 16 * 1024];

    while shared.running.load(Ordering::SeqCst) {
        match stream.read(&mut chunk) {
            Ok(0) => break, // peer closed
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => break,
        }

        loop {
            match CoordMessage::parse(&buffer) {
                Ok(Some((msg, consumed))) => {
                    buffer.drain(..consumed);
                    if !master_handle_message(id, &mut stream, &shared, msg) {
                        shared.slaves.lock().unwrap().retain(|(sid, _)| *sid != id);
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("coordinator: corrupt frame from slave {id}: {err}");
                    shared.slaves.lock().unwrap().retain(|(sid, _)| *sid != id);
                    return;
                }
            }
        }
    }

    shared.slaves.lock().unwrap().retain(|(sid, _)| *sid != id);
    debug!("coordinator: slave {id} disconnected");
}

fn master_handle_message(
    id: usize,
    stream: &mut UnixStream,
    shared: &Arc<Shared>,
    msg: CoordMessage,
) -> bool {
    match msg.msg_type {
        CoordMsgType::Hello => {
            if let Some((version, pid)) = wire::decode_hello(&msg.payload) {
                if version != COORDINATOR_PROTOCOL_VERSION {
                    warn!("coordinator: slave {id} speaks version {version}; dropping");
                    return false;
                }
                debug!("coordinator: slave {id} is pid {pid}");
            }
            // Register for index fan-out and greet back.
            match stream.try_clone() {
                Ok(clone) => shared.slaves.lock().unwrap().push((id, clone)),
                Err(_) => return false,
            }
            stream
                .write_all(&wire::encode_hello(std::process::id()).serialize())
                .is_ok()
        }
        CoordMsgType::WriteRequest => {
            let Some((entry, payload)) = wire::decode_write_request(&msg.payload) else {
                return false;
            };
            let result = shared
                .write_cb
                .as_ref()
                .and_then(|cb| cb(entry, payload));
            let response = match result {
                Some(assigned) => wire::encode_write_response(true, &assigned),
                None => wire::encode_write_response(false, &entry),
            };
            stream.write_all(&response.serialize()).is_ok()
        }
        CoordMsgType::Ping => stream
            .write_all(&CoordMessage::new(CoordMsgType::Pong).serialize())
            .is_ok(),
        // Slaves do not push index updates or responses.
        _ => true,
    }
}

/// Slave: receive pushes from the master until stopped.
fn slave_read_loop(mut stream: UnixStream, shared: Arc<Shared>) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 16 * 1024];

    while shared.running.load(Ordering::SeqCst) {
        match stream.read(&mut chunk) {
            Ok(0) => break, // master gone; next insert triggers re-election
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => break,
        }

        loop {
            match CoordMessage::parse(&buffer) {
                Ok(Some((msg, consumed))) => {
                    buffer.drain(..consumed);
                    slave_handle_message(&shared, msg);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("coordinator: corrupt frame from master: {err}");
                    shared.master_tx.lock().unwrap().take();
                    return;
                }
            }
        }
    }

    // Drop the write half so later write_requests fail fast.
    shared.master_tx.lock().unwrap().take();
    debug!("coordinator: master connection closed");
}

fn slave_handle_message(shared: &Arc<Shared>, msg: CoordMessage) {
    match msg.msg_type {
        CoordMsgType::IndexUpdate => {
            if let Some(entries) = wire::decode_index_update(&msg.payload) {
                shared
                    .index_updates_received
                    .fetch_add(1, Ordering::Relaxed);
                if let Some(cb) = shared.index_cb.as_ref() {
                    cb(entries);
                }
            }
        }
        CoordMsgType::WriteResponse => {
            if let Some((ok, entry)) = wire::decode_write_response(&msg.payload) {
                let _ = shared.response_tx.try_send((ok, entry));
            }
        }
        CoordMsgType::Ping => {
            if let Some(stream) = shared.master_tx.lock().unwrap().as_mut() {
                let _ = stream.write_all(&CoordMessage::new(CoordMsgType::Pong).serialize());
            }
        }
        // HELLO reply and PONG need no action.
        _ => {}
    }
}
