//! Client-side persistent cache engine.
//!
//! One engine instance backs both the cross-session persistent cache and
//! the session-only content cache: the latter simply marks inserts as
//! non-persistable so they never touch disk. Content hashes are the stable
//! keys, making entries valid across sessions and servers.
//!
//! The engine is not thread-safe; all mutation happens on the connection's
//! main thread. The only concurrent actors are the coordinator's IPC
//! threads, which talk to the shared [`ShardedStore`] through its mutex and
//! hand results back via queues drained by [`PersistentCacheEngine::maintain`].
//!
//! # Dual-hash design
//!
//! Every entry stores BOTH the server's canonical hash and the hash of the
//! pixels the client actually decoded. For lossless encoders the two are
//! equal; for lossy encoders they differ and the pair is what lets the
//! viewer keep serving the canonical id without permanent visual drift.

use crate::arc_cache::ArcCache;
use crate::coordinator::{
    CacheCoordinator, CoordinatorRole, CoordinatorStats, IndexUpdateHandler, WireIndexEntry,
    WriteRequestHandler,
};
use crate::key::CacheKey;
use crate::store::{IndexEntry, ShardedStore, StoreError};
use rfb_pixelbuffer::PixelFormat;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Engine configuration, mirroring the viewer's cache options.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// In-memory ARC budget in MiB.
    pub max_memory_mb: usize,
    /// On-disk budget in MiB; 0 means twice the memory budget.
    pub max_disk_mb: usize,
    /// Target shard file size in MiB.
    pub shard_size_mb: usize,
    /// Cache directory override; the platform cache dir is used otherwise.
    pub cache_dir: Option<PathBuf>,
    /// When false the engine never reads or writes cache files, even
    /// though it still serves the wire protocol (session-only mode).
    pub persistence_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 2048,
            max_disk_mb: 0,
            shard_size_mb: 64,
            cache_dir: None,
            persistence_enabled: true,
        }
    }
}

impl EngineConfig {
    fn memory_bytes(&self) -> usize {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }

    fn disk_bytes(&self) -> u64 {
        if self.max_disk_mb == 0 {
            2 * self.memory_bytes() as u64
        } else {
            self.max_disk_mb as u64 * 1024 * 1024
        }
    }

    fn shard_bytes(&self) -> u64 {
        (self.shard_size_mb.max(1) as u64) * 1024 * 1024
    }

    fn resolve_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("rfb-cache")
    }
}

/// Lazy-load progress of the on-disk cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationState {
    /// No disk load attempted.
    Uninitialized,
    /// Index loaded; payloads not yet read.
    IndexLoaded,
    /// Some payloads are in memory.
    PartiallyHydrated,
    /// Every indexed payload is in memory.
    FullyHydrated,
}

/// One in-memory cache entry: decoded pixels packed tightly row by row.
#[derive(Debug, Clone)]
pub struct CachedPixels {
    /// Packed pixel data (stride equals width).
    pub pixels: Vec<u8>,
    pub format: PixelFormat,
    pub width: u16,
    pub height: u16,
    /// Stride in pixels. Always equals the width after packing; kept as an
    /// explicit field because protocol and disk records carry it.
    pub stride_pixels: u16,
    /// Server's canonical hash.
    pub canonical_hash: u64,
    /// Client's computed hash of the decoded pixels.
    pub actual_hash: u64,
    /// Unix time of the last lookup hit.
    pub last_access: u64,
}

impl CachedPixels {
    /// Resident byte size.
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }

    /// Lossless iff both hashes agree.
    pub fn is_lossless(&self) -> bool {
        self.canonical_hash == self.actual_hash
    }
}

/// Result of an [`PersistentCacheEngine::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Entry admitted; carries the number of entries evicted to make room.
    Stored { evicted: usize },
    /// Hash mismatch under a lossless encoding: decoder corruption, stride
    /// mismatch or truncated transport. Caching it would poison every
    /// future hit, so the entry is dropped.
    RejectedCorrupt,
    /// Entry larger than the whole memory budget.
    RejectedOversized,
    /// Null key or zero hash; the hash computation failed upstream.
    RejectedNullKey,
}

/// Aggregate statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub total_entries: usize,
    pub total_bytes: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub stores: u64,
    pub rejected_inserts: u64,
    pub evictions: u64,
    pub t1_len: usize,
    pub t2_len: usize,
    pub b1_len: usize,
    pub b2_len: usize,
    pub target_t1_bytes: usize,
}

/// The unified client cache: ARC-managed memory, sharded disk, coordinated
/// multi-process writes, lazy hydration, dual-hash lookup.
pub struct PersistentCacheEngine {
    config: EngineConfig,
    cache_dir: PathBuf,

    /// Resident entries; the ARC decides which keys stay.
    cache: HashMap<CacheKey, CachedPixels>,
    arc: ArcCache<CacheKey>,

    /// Disk layer, created lazily on the first `load_index` so a session
    /// that never negotiates persistence touches no files. Shared with the
    /// coordinator's callback threads.
    store: Option<Arc<Mutex<ShardedStore>>>,

    hydration_state: HydrationState,
    hydration_queue: VecDeque<CacheKey>,
    /// On disk but not in memory.
    cold: HashSet<CacheKey>,
    /// In memory, awaiting payload append to disk.
    dirty: HashSet<CacheKey>,

    /// ARC evictions and invalidations waiting to be reported upstream.
    pending_evictions: Vec<CacheKey>,

    /// Entries learned from the coordinator (master writes serviced for
    /// slaves, or INDEX_UPDATE pushes received as a slave), drained by
    /// `maintain`.
    remote_entries: Arc<Mutex<Vec<WireIndexEntry>>>,

    coordinator: Option<CacheCoordinator>,

    hits: u64,
    misses: u64,
    stores: u64,
    rejected: u64,
}

impl PersistentCacheEngine {
    pub fn new(config: EngineConfig) -> Self {
        let cache_dir = config.resolve_cache_dir();
        let arc = ArcCache::new(config.memory_bytes());
        Self {
            config,
            cache_dir,
            cache: HashMap::new(),
            arc,
            store: None,
            hydration_state: HydrationState::Uninitialized,
            hydration_queue: VecDeque::new(),
            cold: HashSet::new(),
            dirty: HashSet::new(),
            pending_evictions: Vec::new(),
            remote_entries: Arc::new(Mutex::new(Vec::new())),
            coordinator: None,
            hits: 0,
            misses: 0,
            stores: 0,
            rejected: 0,
        }
    }

    /// The directory holding index and shard files.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Whether inserts marked persistable will reach disk.
    pub fn persistence_enabled(&self) -> bool {
        self.config.persistence_enabled
    }

    pub fn hydration_state(&self) -> HydrationState {
        self.hydration_state
    }

    pub fn hydration_queue_len(&self) -> usize {
        self.hydration_queue.len()
    }

    pub fn cold_entry_count(&self) -> usize {
        self.cold.len()
    }

    pub fn dirty_entry_count(&self) -> usize {
        self.dirty.len()
    }

    fn ensure_store(&mut self) -> Result<Arc<Mutex<ShardedStore>>, StoreError> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        let store = ShardedStore::open(
            &self.cache_dir,
            self.config.shard_bytes(),
            self.config.disk_bytes(),
        )?;
        let store = Arc::new(Mutex::new(store));
        self.store = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Load the on-disk index (metadata only; payloads stay cold until
    /// hydration). No-op when persistence is disabled. Returns the number
    /// of entries discovered.
    pub fn load_index(&mut self) -> usize {
        if !self.config.persistence_enabled {
            return 0;
        }
        let store = match self.ensure_store() {
            Ok(store) => store,
            Err(err) => {
                warn!("cache store unavailable: {err}");
                return 0;
            }
        };

        let loaded = {
            let mut store = store.lock().unwrap();
            match store.load_index() {
                Ok(count) => count,
                Err(err) => {
                    warn!("cache index load failed: {err}");
                    0
                }
            }
        };

        self.cold.clear();
        self.hydration_queue.clear();
        {
            let store = store.lock().unwrap();
            for (key, _) in store.entries() {
                self.cold.insert(*key);
                self.hydration_queue.push_back(*key);
            }
        }
        self.hydration_state = HydrationState::IndexLoaded;
        info!("cache index loaded: {loaded} entries awaiting hydration");
        loaded
    }

    /// Append dirty payloads to the store (or forward them to the master
    /// when running as a coordinated slave), then persist the index when it
    /// changed. Returns the number of payloads flushed.
    pub fn flush_dirty(&mut self) -> usize {
        if !self.config.persistence_enabled || self.dirty.is_empty() {
            self.save_index_if_dirty();
            return 0;
        }

        let keys: Vec<CacheKey> = self.dirty.iter().copied().collect();
        let mut flushed = 0usize;

        for key in keys {
            let Some((meta, payload)) = self.cache.get(&key).map(|entry| {
                (
                    IndexEntry {
                        shard_id: 0,
                        offset: 0,
                        size: entry.pixels.len() as u32,
                        width: entry.width,
                        height: entry.height,
                        stride_pixels: entry.stride_pixels,
                        format: entry.format,
                        canonical_hash: entry.canonical_hash,
                        quality_code: IndexEntry::quality_code_for(
                            &entry.format,
                            !entry.is_lossless(),
                        ),
                        cold: false,
                    },
                    entry.pixels.clone(),
                )
            }) else {
                // Evicted before it ever reached disk; nothing to persist.
                self.dirty.remove(&key);
                continue;
            };

            match self.persist_one(key, meta, payload) {
                PersistOutcome::Written => {
                    self.dirty.remove(&key);
                    flushed += 1;
                }
                PersistOutcome::MemoryOnly => {
                    // Coordinator timeout or refusal: keep serving from
                    // memory, stop trying to persist this entry.
                    self.dirty.remove(&key);
                }
                PersistOutcome::Abort => break,
            }
        }

        self.save_index_if_dirty();
        flushed
    }

    fn save_index_if_dirty(&mut self) {
        if !self.config.persistence_enabled || self.is_slave() {
            // Slaves never write index.dat; the master owns it.
            return;
        }
        if let Some(store) = &self.store {
            let mut store = store.lock().unwrap();
            if store.index_dirty() {
                if let Err(err) = store.save_index() {
                    warn!("index save deferred: {err}");
                }
            }
        }
    }

    fn is_slave(&self) -> bool {
        matches!(
            self.coordinator.as_ref().map(CacheCoordinator::role),
            Some(CoordinatorRole::Slave)
        )
    }

    fn persist_one(&mut self, key: CacheKey, meta: IndexEntry, payload: Vec<u8>) -> PersistOutcome {
        if self.is_slave() {
            let wire = WireIndexEntry::from_index_entry(&key, &meta, key.id());
            let result = match self.coordinator.as_ref() {
                Some(coordinator) => coordinator.write_request(&wire, &payload),
                None => return PersistOutcome::Abort,
            };
            match result {
                Ok(assigned) => {
                    if let Some(store) = &self.store {
                        let (key, entry) = assigned.to_index_entry(meta.format);
                        store.lock().unwrap().insert_remote_entry(key, entry);
                    }
                    PersistOutcome::Written
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotConnected => {
                    warn!("cache master gone; attempting re-election");
                    self.reelect();
                    if self.is_slave() {
                        // A new master answered; retry this entry next flush.
                        PersistOutcome::Abort
                    } else {
                        self.persist_local(key, meta, &payload)
                    }
                }
                Err(err) => {
                    warn!("coordinated write failed ({err}); keeping entry memory-only");
                    PersistOutcome::MemoryOnly
                }
            }
        } else {
            self.persist_local(key, meta, &payload)
        }
    }

    fn persist_local(&mut self, key: CacheKey, meta: IndexEntry, payload: &[u8]) -> PersistOutcome {
        let Ok(store) = self.ensure_store() else {
            return PersistOutcome::Abort;
        };
        let mut store = store.lock().unwrap();
        match store.append_payload(key, meta.clone(), payload) {
            Ok(_) => {
                if self.coordinator.is_some() {
                    // Fan this entry out on the next maintain() pass.
                    let wire = WireIndexEntry::from_index_entry(&key, &meta, key.id());
                    self.remote_entries.lock().unwrap().push(wire);
                }
                PersistOutcome::Written
            }
            Err(err) => {
                // Disk full or I/O failure: skip persistence for this
                // entry, leave the rest dirty for a later retry. Memory
                // cache is unaffected.
                warn!("payload append failed: {err}");
                PersistOutcome::Abort
            }
        }
    }

    /// Flush and write the index out; the session-end save path. Slaves
    /// skip the index rewrite entirely: index.dat belongs to the master.
    pub fn save(&mut self) -> usize {
        let flushed = self.flush_dirty();
        if !self.is_slave() {
            if let Some(store) = &self.store {
                let mut store = store.lock().unwrap();
                if let Err(err) = store.save_index() {
                    warn!("final index save failed: {err}");
                }
            }
        }
        flushed
    }

    /// Compact fragmented shards. Returns bytes reclaimed.
    pub fn garbage_collect(&mut self) -> u64 {
        if !self.config.persistence_enabled || self.is_slave() {
            return 0;
        }
        let Some(store) = &self.store else { return 0 };
        let mut store = store.lock().unwrap();
        match store.compact() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("shard compaction failed: {err}");
                0
            }
        }
    }

    /// Total bytes of shard files on disk.
    pub fn disk_usage(&self) -> u64 {
        self.store
            .as_ref()
            .map(|s| s.lock().unwrap().disk_usage())
            .unwrap_or(0)
    }

    /// Load one cold entry's payload into memory. Returns false when the
    /// key is unknown, already resident, or the read fails.
    pub fn hydrate_one(&mut self, key: &CacheKey) -> bool {
        if self.cache.contains_key(key) {
            return false;
        }
        let Some(store) = &self.store else {
            return false;
        };

        let (payload, entry) = {
            let store = store.lock().unwrap();
            let Some(entry) = store.get(key) else {
                return false;
            };
            match store.read_payload(entry) {
                Ok(payload) => (payload, entry.clone()),
                Err(err) => {
                    warn!("hydration read failed for {key:?}: {err}");
                    return false;
                }
            }
        };

        let cached = CachedPixels {
            pixels: payload,
            format: entry.format,
            width: entry.width,
            height: entry.height,
            stride_pixels: entry.stride_pixels,
            canonical_hash: entry.canonical_hash,
            // The disk key is the content hash of the stored pixels, so its
            // leading lane is the actual hash.
            actual_hash: key.id(),
            last_access: now_epoch(),
        };

        let size = cached.byte_size();
        let evicted = self.arc.insert(*key, size);
        self.absorb_evictions(evicted);
        self.cache.insert(*key, cached);
        self.cold.remove(key);

        if let Some(store) = &self.store {
            let mut store = store.lock().unwrap();
            if let Some(entry) = store.get_mut(key) {
                entry.cold = false;
            }
        }

        self.hydration_state = if self.cold.is_empty() {
            HydrationState::FullyHydrated
        } else {
            HydrationState::PartiallyHydrated
        };
        true
    }

    /// Drain up to `max_entries` from the hydration queue; called during
    /// idle flushes so cold entries migrate into memory without blocking
    /// interactive updates. Returns the number hydrated.
    pub fn hydrate_next_batch(&mut self, max_entries: usize) -> usize {
        let mut hydrated = 0;
        while hydrated < max_entries {
            let Some(key) = self.hydration_queue.pop_front() else {
                break;
            };
            if self.cache.contains_key(&key) || !self.cold.contains(&key) {
                continue;
            }
            if self.hydrate_one(&key) {
                hydrated += 1;
            }
        }
        hydrated
    }

    /// True when the key is resident or available cold on disk.
    pub fn has(&self, key: &CacheKey) -> bool {
        self.cache.contains_key(key) || self.cold.contains(key)
    }

    /// Direct lookup by key; promotes in the ARC on a hit.
    pub fn get_by_key(&mut self, key: &CacheKey) -> Option<&CachedPixels> {
        match self.cache.get_mut(key) {
            Some(entry) => {
                entry.last_access = now_epoch();
                self.arc.on_lookup(key);
                self.hits += 1;
                self.cache.get(key)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Lookup by the server's canonical hash, constrained to the given
    /// dimensions.
    ///
    /// `min_bpp` guards quality: if the only matching entries have lower
    /// bpp than the session's format, `None` is returned so the caller
    /// requests fresh high-quality pixels instead of upscaling a degraded
    /// copy. Among surviving candidates, higher bpp wins, then lossless
    /// over lossy. Cold candidates are hydrated on demand.
    pub fn get_by_canonical_hash(
        &mut self,
        canonical_id: u64,
        width: u16,
        height: u16,
        min_bpp: u8,
    ) -> Option<&CachedPixels> {
        // (key, bpp, lossless, resident)
        let mut candidates: Vec<(CacheKey, u8, bool, bool)> = Vec::new();

        for (key, entry) in &self.cache {
            if entry.canonical_hash == canonical_id
                && entry.width == width
                && entry.height == height
            {
                candidates.push((*key, entry.format.bits_per_pixel, entry.is_lossless(), true));
            }
        }
        if let Some(store) = &self.store {
            let store = store.lock().unwrap();
            for (key, entry) in store.entries() {
                if self.cache.contains_key(key) {
                    continue;
                }
                if entry.canonical_hash == canonical_id
                    && entry.width == width
                    && entry.height == height
                {
                    candidates.push((*key, entry.bits_per_pixel(), !entry.is_lossy(), false));
                }
            }
        }

        candidates.retain(|(_, bpp, _, _)| *bpp >= min_bpp);
        if candidates.is_empty() {
            self.misses += 1;
            return None;
        }

        // Higher bpp first, then lossless, then resident to avoid I/O.
        candidates.sort_by_key(|(_, bpp, lossless, resident)| {
            (
                std::cmp::Reverse(*bpp),
                std::cmp::Reverse(*lossless),
                std::cmp::Reverse(*resident),
            )
        });
        let (key, _, _, resident) = candidates[0];

        if !resident && !self.hydrate_one(&key) {
            self.misses += 1;
            return None;
        }

        let Some(entry) = self.cache.get_mut(&key) else {
            self.misses += 1;
            return None;
        };
        entry.last_access = now_epoch();
        self.arc.on_lookup(&key);
        self.hits += 1;
        self.cache.get(&key)
    }

    /// Insert or update a cache entry.
    ///
    /// `pixels` may carry a native stride (in pixels); rows are packed
    /// tightly before storage. `lossy_encoding` states whether the inner
    /// encoding is allowed to alter pixels: a canonical/actual mismatch
    /// under a lossless encoding is corruption and the entry is rejected.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        canonical_id: u64,
        actual_id: u64,
        disk_key: CacheKey,
        pixels: &[u8],
        format: PixelFormat,
        width: u16,
        height: u16,
        stride_pixels: u16,
        lossy_encoding: bool,
        persistable: bool,
    ) -> InsertOutcome {
        if disk_key.is_null() || canonical_id == 0 || actual_id == 0 {
            self.rejected += 1;
            return InsertOutcome::RejectedNullKey;
        }
        if canonical_id != actual_id && !lossy_encoding {
            warn!(
                "hash mismatch under lossless encoding (canonical={canonical_id:016x} actual={actual_id:016x}); dropping entry"
            );
            self.rejected += 1;
            return InsertOutcome::RejectedCorrupt;
        }

        let bpp = format.bytes_per_pixel() as usize;
        let row_bytes = width as usize * bpp;
        let stride_bytes = stride_pixels.max(width) as usize * bpp;

        // Pack rows, dropping any native stride padding.
        let mut packed = Vec::with_capacity(row_bytes * height as usize);
        for y in 0..height as usize {
            let start = y * stride_bytes;
            if start + row_bytes > pixels.len() {
                self.rejected += 1;
                return InsertOutcome::RejectedNullKey;
            }
            packed.extend_from_slice(&pixels[start..start + row_bytes]);
        }

        if self.arc.max_bytes() > 0 && packed.len() > self.arc.max_bytes() {
            self.misses += 1;
            self.rejected += 1;
            return InsertOutcome::RejectedOversized;
        }

        let entry = CachedPixels {
            pixels: packed,
            format,
            width,
            height,
            stride_pixels: width,
            canonical_hash: canonical_id,
            actual_hash: actual_id,
            last_access: now_epoch(),
        };
        let size = entry.byte_size();

        self.cache.remove(&disk_key);
        let evicted = self.arc.insert(disk_key, size);
        let evicted_count = evicted.len();
        self.absorb_evictions(evicted);

        self.cache.insert(disk_key, entry);
        self.cold.remove(&disk_key);
        self.stores += 1;

        if persistable && self.config.persistence_enabled {
            self.dirty.insert(disk_key);
        }

        InsertOutcome::Stored {
            evicted: evicted_count,
        }
    }

    fn absorb_evictions(&mut self, evicted: Vec<CacheKey>) {
        for key in evicted {
            self.cache.remove(&key);
            self.dirty.remove(&key);

            // Keep the disk copy (cold) unless the disk budget is blown, in
            // which case the eviction removes the entry everywhere.
            if let Some(store) = &self.store {
                let mut store = store.lock().unwrap();
                if store.contains(&key) {
                    if store.over_disk_budget() {
                        store.remove_entry(&key);
                        self.cold.remove(&key);
                    } else if let Some(entry) = store.get_mut(&key) {
                        entry.cold = true;
                        self.cold.insert(key);
                    }
                }
            }
        }
        for key in self.arc.take_pending_evictions() {
            self.pending_evictions.push(key);
        }
    }

    /// Drop an entry everywhere (memory, ARC, disk). Used when the viewer
    /// detects a hash mismatch or corruption. The eviction is reported
    /// upstream like any other.
    pub fn invalidate_by_key(&mut self, key: &CacheKey) {
        self.cache.remove(key);
        self.arc.remove(key);
        self.dirty.remove(key);
        self.cold.remove(key);
        if let Some(store) = &self.store {
            store.lock().unwrap().remove_entry(key);
        }
        self.pending_evictions.push(*key);
    }

    /// Whether evictions await reporting.
    pub fn has_pending_evictions(&self) -> bool {
        !self.pending_evictions.is_empty()
    }

    /// Drain the eviction notification queue.
    pub fn take_pending_evictions(&mut self) -> Vec<CacheKey> {
        std::mem::take(&mut self.pending_evictions)
    }

    /// Every key the engine can serve (resident and cold); the HashList
    /// advertisement after reconnect is built from this.
    pub fn all_keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.cache.keys().copied().collect();
        keys.extend(self.cold.iter().copied());
        keys
    }

    /// Drop all in-memory state. Disk files are untouched.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.arc = ArcCache::new(self.config.memory_bytes());
        self.dirty.clear();
        self.cold.clear();
        self.hydration_queue.clear();
        self.pending_evictions.clear();
    }

    pub fn stats(&self) -> EngineStats {
        let arc_stats = self.arc.stats();
        let (t1, t2, b1, b2) = self.arc.list_lengths();
        EngineStats {
            total_entries: self.cache.len(),
            total_bytes: self.arc.current_bytes(),
            cache_hits: self.hits,
            cache_misses: self.misses,
            stores: self.stores,
            rejected_inserts: self.rejected,
            evictions: arc_stats.evictions,
            t1_len: t1,
            t2_len: t2,
            b1_len: b1,
            b2_len: b2,
            target_t1_bytes: self.arc.target_t1_bytes(),
        }
    }

    pub fn reset_stats(&mut self) {
        self.hits = 0;
        self.misses = 0;
        self.stores = 0;
        self.rejected = 0;
    }

    /// Start multi-viewer coordination. Should be called after
    /// [`load_index`](Self::load_index); no-op when persistence is off.
    pub fn start_coordinator(&mut self) -> bool {
        if !self.config.persistence_enabled || self.coordinator.is_some() {
            return false;
        }
        let Ok(store) = self.ensure_store() else {
            return false;
        };

        let (index_cb, write_cb) = Self::make_callbacks(&store, &self.remote_entries);
        let mut coordinator =
            CacheCoordinator::create(&self.cache_dir, Some(index_cb), Some(write_cb));
        let started = coordinator.start();
        info!("cache coordinator role: {:?}", coordinator.role());
        self.coordinator = Some(coordinator);
        started
    }

    fn make_callbacks(
        store: &Arc<Mutex<ShardedStore>>,
        remote: &Arc<Mutex<Vec<WireIndexEntry>>>,
    ) -> (IndexUpdateHandler, WriteRequestHandler) {
        // Slave side: merge master-pushed entries into the local index as
        // cold entries; the engine finishes the bookkeeping in maintain().
        let store_for_index = Arc::clone(store);
        let remote_for_index = Arc::clone(remote);
        let index_cb: IndexUpdateHandler = Arc::new(move |entries: Vec<WireIndexEntry>| {
            let mut store = store_for_index.lock().unwrap();
            for wire in &entries {
                let format = format_for_quality_code(wire.quality_code);
                let (key, mut entry) = wire.to_index_entry(format);
                entry.cold = true;
                store.insert_remote_entry(key, entry);
            }
            remote_for_index.lock().unwrap().extend(entries);
        });

        // Master side: persist a slave's payload and report the assigned
        // location back.
        let store_for_write = Arc::clone(store);
        let remote_for_write = Arc::clone(remote);
        let write_cb: WriteRequestHandler = Arc::new(move |wire: WireIndexEntry, payload: Vec<u8>| {
            let format = format_for_quality_code(wire.quality_code);
            let (key, entry) = wire.to_index_entry(format);
            let mut store = store_for_write.lock().unwrap();
            match store.append_payload(key, entry, &payload) {
                Ok((shard_id, offset)) => {
                    let assigned = WireIndexEntry {
                        shard_id,
                        offset,
                        ..wire
                    };
                    remote_for_write.lock().unwrap().push(assigned);
                    Some(assigned)
                }
                Err(err) => {
                    warn!("coordinated write failed on master: {err}");
                    None
                }
            }
        });

        (index_cb, write_cb)
    }

    /// Stop coordination (called automatically on drop).
    pub fn stop_coordinator(&mut self) {
        if let Some(mut coordinator) = self.coordinator.take() {
            coordinator.stop();
        }
    }

    pub fn coordinator_role(&self) -> Option<CoordinatorRole> {
        self.coordinator.as_ref().map(CacheCoordinator::role)
    }

    pub fn coordinator_stats(&self) -> Option<CoordinatorStats> {
        self.coordinator.as_ref().map(CacheCoordinator::stats)
    }

    /// Re-run the election after the master went away. A process that wins
    /// re-reads the index before accepting writes so its view matches what
    /// the dead master persisted.
    fn reelect(&mut self) {
        self.stop_coordinator();
        let Ok(store) = self.ensure_store() else {
            return;
        };
        let (index_cb, write_cb) = Self::make_callbacks(&store, &self.remote_entries);
        let mut coordinator =
            CacheCoordinator::create(&self.cache_dir, Some(index_cb), Some(write_cb));
        if coordinator.role() == CoordinatorRole::Master {
            let mut store = store.lock().unwrap();
            if let Err(err) = store.load_index() {
                warn!("re-elected master failed to reload index: {err}");
            }
        }
        coordinator.start();
        info!("cache coordinator re-election: {:?}", coordinator.role());
        self.coordinator = Some(coordinator);
    }

    /// Periodic bookkeeping between updates: absorb coordinator traffic
    /// and fan out locally persisted entries when acting as master.
    pub fn maintain(&mut self) {
        let drained: Vec<WireIndexEntry> = {
            let mut remote = self.remote_entries.lock().unwrap();
            remote.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }

        for wire in &drained {
            let key = CacheKey::from_bytes(wire.key);
            if !self.cache.contains_key(&key) {
                self.cold.insert(key);
                self.hydration_queue.push_back(key);
            }
        }

        if matches!(self.coordinator_role(), Some(CoordinatorRole::Master)) {
            if let Some(coordinator) = &self.coordinator {
                coordinator.push_index_update(&drained);
            }
        }

        if self.hydration_state == HydrationState::FullyHydrated && !self.cold.is_empty() {
            self.hydration_state = HydrationState::PartiallyHydrated;
        }
    }

    /// Write a cache state report for post-mortem analysis. Returns the
    /// dump path.
    pub fn dump_debug_state(&self, output_dir: &Path, epoch_timestamp: u32) -> std::io::Result<PathBuf> {
        use std::io::Write as _;

        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join(format!("cache_dump_{epoch_timestamp}.txt"));
        let mut file = std::fs::File::create(&path)?;

        let stats = self.stats();
        writeln!(file, "cache dir: {}", self.cache_dir.display())?;
        writeln!(file, "hydration: {:?}", self.hydration_state)?;
        writeln!(
            file,
            "entries: {} resident ({} bytes), {} cold, {} dirty",
            stats.total_entries,
            stats.total_bytes,
            self.cold.len(),
            self.dirty.len()
        )?;
        writeln!(
            file,
            "hits: {} misses: {} stores: {} rejected: {} evictions: {}",
            stats.cache_hits, stats.cache_misses, stats.stores, stats.rejected_inserts, stats.evictions
        )?;
        writeln!(
            file,
            "arc: t1={} t2={} b1={} b2={} p={}",
            stats.t1_len, stats.t2_len, stats.b1_len, stats.b2_len, stats.target_t1_bytes
        )?;
        if let Some(coord) = self.coordinator_stats() {
            writeln!(file, "coordinator: {coord:?}")?;
        }

        let mut keys: Vec<&CacheKey> = self.cache.keys().collect();
        keys.sort_unstable_by_key(|k| *k.as_bytes());
        for key in keys {
            let entry = &self.cache[key];
            writeln!(
                file,
                "{key:?} {}x{} bpp={} canonical={:016x} actual={:016x}{}{}",
                entry.width,
                entry.height,
                entry.format.bits_per_pixel,
                entry.canonical_hash,
                entry.actual_hash,
                if entry.is_lossless() { "" } else { " lossy" },
                if self.dirty.contains(key) { " dirty" } else { "" },
            )?;
        }
        debug!("cache debug state dumped to {}", path.display());
        Ok(path)
    }
}

impl Drop for PersistentCacheEngine {
    fn drop(&mut self) {
        self.stop_coordinator();
    }
}

enum PersistOutcome {
    Written,
    MemoryOnly,
    Abort,
}

/// The canonical storage formats by depth class. IPC index entries carry a
/// quality code rather than a full pixel format; decoded client payloads
/// are stored in one of these standard layouts.
fn format_for_quality_code(quality_code: u8) -> PixelFormat {
    match (quality_code >> 1) & 0x3 {
        0 => PixelFormat::bgr233(),
        1 => PixelFormat::rgb565(),
        _ => PixelFormat::rgb888(),
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
