//! Byte-budgeted Adaptive Replacement Cache (ARC).
//!
//! The cache tracks keys and byte sizes only; the owning layer keeps the
//! actual payloads in its own map. Resident keys live on `T1` (seen once)
//! or `T2` (frequent); ghost keys (evicted, no data) live on `B1` or `B2`.
//! An adaptive scalar `p` (in bytes) tracks the target size of T1: hits on
//! B1 grow it, hits on B2 shrink it, steering the cache between recency and
//! frequency.
//!
//! Evicted keys accumulate in a pending list that the decode manager drains
//! to send eviction notifications to the server.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Which ARC list a key currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    T1,
    T2,
    B1,
    B2,
}

/// Hit/miss/eviction counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArcStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Generic ARC core tracking keys and sizes, but not payloads.
///
/// `K` is [`crate::CacheKey`] in production; tests use smaller key types.
#[derive(Debug)]
pub struct ArcCache<K> {
    /// Capacity in bytes for resident entries (T1 + T2 together).
    max_bytes: usize,
    /// Current resident bytes.
    current_bytes: usize,
    /// Resident bytes on T1 only.
    t1_bytes: usize,
    /// Adaptive target size for T1, in bytes. Always in [0, max_bytes].
    p_bytes: usize,

    /// Recency list (resident): keys seen once, front = most recent.
    t1: VecDeque<K>,
    /// Frequency list (resident): keys seen at least twice.
    t2: VecDeque<K>,
    /// Ghosts of T1 evictions.
    b1: VecDeque<K>,
    /// Ghosts of T2 evictions.
    b2: VecDeque<K>,

    /// Per-key membership and resident size (0 for ghosts).
    list_map: HashMap<K, (ListKind, usize)>,

    /// Keys evicted from the resident set since the last drain.
    pending_evictions: Vec<K>,

    stats: ArcStats,
}

impl<K> ArcCache<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an ARC with the given byte capacity.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            current_bytes: 0,
            t1_bytes: 0,
            p_bytes: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            list_map: HashMap::new(),
            pending_evictions: Vec::new(),
            stats: ArcStats::default(),
        }
    }

    /// Configured capacity in bytes.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Current resident size in bytes.
    pub fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    /// Current target size for T1 in bytes (the adaptive `p`).
    pub fn target_t1_bytes(&self) -> usize {
        self.p_bytes
    }

    /// Counts of keys in (T1, T2, B1, B2).
    pub fn list_lengths(&self) -> (usize, usize, usize, usize) {
        (self.t1.len(), self.t2.len(), self.b1.len(), self.b2.len())
    }

    /// Number of resident keys.
    pub fn resident_len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    /// Counters: hits/misses cover lookups only, so they always sum to the
    /// number of `on_lookup` calls.
    pub fn stats(&self) -> ArcStats {
        self.stats
    }

    /// Whether the key is resident (on T1 or T2).
    pub fn is_resident(&self, key: &K) -> bool {
        matches!(
            self.list_map.get(key),
            Some((ListKind::T1 | ListKind::T2, _))
        )
    }

    /// Record a lookup. On a resident hit the key is promoted to the front
    /// of T2; returns whether the key was resident. Counts hit/miss stats.
    pub fn on_lookup(&mut self, key: &K) -> bool {
        match self.list_map.get(key).cloned() {
            Some((ListKind::T1, size)) => {
                self.unlink(key, ListKind::T1);
                self.t1_bytes -= size;
                self.t2.push_front(key.clone());
                self.list_map.insert(key.clone(), (ListKind::T2, size));
                self.stats.hits += 1;
                true
            }
            Some((ListKind::T2, size)) => {
                self.unlink(key, ListKind::T2);
                self.t2.push_front(key.clone());
                self.list_map.insert(key.clone(), (ListKind::T2, size));
                self.stats.hits += 1;
                true
            }
            _ => {
                self.stats.misses += 1;
                false
            }
        }
    }

    /// Insert or update a resident entry of `size_bytes`.
    ///
    /// Entries larger than the whole budget are rejected outright (counted
    /// as a miss, nothing evicted). Returns the keys evicted to make room.
    pub fn insert(&mut self, key: K, size_bytes: usize) -> Vec<K> {
        let mut evicted = Vec::new();

        // Entries larger than the whole budget never enter; the engine
        // layer accounts the dropped insert in its own stats.
        if self.max_bytes > 0 && size_bytes > self.max_bytes {
            return evicted;
        }

        match self.list_map.get(&key).cloned() {
            // Resident: replace in place, promote to T2.
            Some((kind @ (ListKind::T1 | ListKind::T2), old_size)) => {
                self.unlink(&key, kind);
                if kind == ListKind::T1 {
                    self.t1_bytes -= old_size;
                }
                self.current_bytes -= old_size;
                self.make_room(size_bytes, &mut evicted);
                self.t2.push_front(key.clone());
                self.list_map.insert(key, (ListKind::T2, size_bytes));
                self.current_bytes += size_bytes;
            }
            // Ghost hit on B1: recency is winning, grow p.
            Some((ListKind::B1, _)) => {
                let delta = (self.b2.len() / self.b1.len().max(1)).max(1);
                let delta_bytes = delta.saturating_mul(self.average_entry_size());
                self.p_bytes = (self.p_bytes + delta_bytes).min(self.max_bytes);

                self.unlink(&key, ListKind::B1);
                self.list_map.remove(&key);
                self.make_room(size_bytes, &mut evicted);
                self.t2.push_front(key.clone());
                self.list_map.insert(key, (ListKind::T2, size_bytes));
                self.current_bytes += size_bytes;
            }
            // Ghost hit on B2: frequency is winning, shrink p.
            Some((ListKind::B2, _)) => {
                let delta = (self.b1.len() / self.b2.len().max(1)).max(1);
                let delta_bytes = delta.saturating_mul(self.average_entry_size());
                self.p_bytes = self.p_bytes.saturating_sub(delta_bytes);

                self.unlink(&key, ListKind::B2);
                self.list_map.remove(&key);
                self.make_room(size_bytes, &mut evicted);
                self.t2.push_front(key.clone());
                self.list_map.insert(key, (ListKind::T2, size_bytes));
                self.current_bytes += size_bytes;
            }
            // Brand new key: admit to T1.
            None => {
                self.make_room(size_bytes, &mut evicted);
                self.t1.push_front(key.clone());
                self.list_map.insert(key, (ListKind::T1, size_bytes));
                self.current_bytes += size_bytes;
                self.t1_bytes += size_bytes;
            }
        }

        self.trim_ghosts();
        evicted
    }

    /// Remove a key from every list (explicit invalidation). Returns the
    /// resident size if the key was resident.
    pub fn remove(&mut self, key: &K) -> Option<usize> {
        let (kind, size) = self.list_map.remove(key)?;
        self.unlink(key, kind);
        match kind {
            ListKind::T1 => {
                self.current_bytes -= size;
                self.t1_bytes -= size;
                Some(size)
            }
            ListKind::T2 => {
                self.current_bytes -= size;
                Some(size)
            }
            ListKind::B1 | ListKind::B2 => None,
        }
    }

    /// Retrieve and clear the keys evicted since the last call (used for
    /// eviction notifications to the server).
    pub fn take_pending_evictions(&mut self) -> Vec<K> {
        std::mem::take(&mut self.pending_evictions)
    }

    fn average_entry_size(&self) -> usize {
        let resident = self.resident_len();
        if resident == 0 {
            1
        } else {
            (self.current_bytes / resident).max(1)
        }
    }

    fn make_room(&mut self, incoming: usize, evicted: &mut Vec<K>) {
        if self.max_bytes == 0 {
            return;
        }
        while self.current_bytes + incoming > self.max_bytes {
            if !self.replace(evicted) {
                break;
            }
        }
    }

    /// Evict one resident key to its ghost list. Victim comes from T1 when
    /// T1 is over its target (or T2 is empty), otherwise from T2.
    fn replace(&mut self, evicted: &mut Vec<K>) -> bool {
        let from_t1 = if self.t1.is_empty() {
            false
        } else {
            self.t2.is_empty() || self.t1_bytes > self.p_bytes
        };

        let (victim, ghost) = if from_t1 {
            match self.t1.pop_back() {
                Some(v) => (v, ListKind::B1),
                None => return false,
            }
        } else {
            match self.t2.pop_back() {
                Some(v) => (v, ListKind::B2),
                None => return false,
            }
        };

        let Some((kind, size)) = self.list_map.get(&victim).cloned() else {
            return false;
        };
        debug_assert!(matches!(kind, ListKind::T1 | ListKind::T2));

        self.current_bytes -= size;
        if kind == ListKind::T1 {
            self.t1_bytes -= size;
        }

        match ghost {
            ListKind::B1 => self.b1.push_front(victim.clone()),
            ListKind::B2 => self.b2.push_front(victim.clone()),
            _ => unreachable!(),
        }
        self.list_map.insert(victim.clone(), (ghost, 0));

        self.stats.evictions += 1;
        self.pending_evictions.push(victim.clone());
        evicted.push(victim);
        true
    }

    /// Ghost lists are bounded at 4x the resident count.
    fn trim_ghosts(&mut self) {
        let max_ghost = 4 * (self.resident_len() + 1);
        while self.b1.len() > max_ghost {
            if let Some(key) = self.b1.pop_back() {
                self.list_map.remove(&key);
            }
        }
        while self.b2.len() > max_ghost {
            if let Some(key) = self.b2.pop_back() {
                self.list_map.remove(&key);
            }
        }
    }

    fn unlink(&mut self, key: &K, kind: ListKind) {
        let list = match kind {
            ListKind::T1 => &mut self.t1,
            ListKind::T2 => &mut self.t2,
            ListKind::B1 => &mut self.b1,
            ListKind::B2 => &mut self.b2,
        };
        if let Some(pos) = list.iter().position(|k| k == key) {
            list.remove(pos);
        }
    }
}
