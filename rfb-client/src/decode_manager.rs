//! Client-side decode scheduling and cache operations.
//!
//! # Thread model
//!
//! The main network task parses rectangle headers and pulls each payload
//! off the stream ([`DecodeManager::decode_rect`]); codec rectangles are
//! queued for a pool of `min(cores, 4)` worker threads. Workers cooperate
//! through one mutex and two condition variables (producer/consumer) and
//! claim entries under three ordering constraints: fully ordered codecs
//! decode FIFO, partially ordered codecs consult `rects_conflict` before
//! overtaking, and nobody overtakes an entry whose affected region
//! intersects their own.
//!
//! Workers decode into per-entry scratch tiles and only lock the shared
//! framebuffer for the final blit; they never touch cache state. All cache
//! operations - lookups, inserts, query batching, eviction forwarding,
//! hydration - happen on the main thread between worker drains:
//! [`DecodeManager::flush`] is the barrier.
//!
//! Worker failures travel over a channel and are re-raised at the next
//! flush; one bad rectangle aborts the update and surfaces at the
//! connection, which closes.

use crate::errors::RfbClientError;
use crate::stats::CacheProtocolStats;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use rfb_cache::engine::{InsertOutcome, PersistentCacheEngine};
use rfb_cache::{CacheKey, ContentHash};
use rfb_common::{Point, Rect, Region};
use rfb_pixelbuffer::{ManagedPixelBuffer, MutablePixelBuffer, PixelBuffer, PixelFormat};
use rfb_protocol::io::{RfbInStream, RfbOutStream};
use rfb_protocol::messages::cache::{
    CacheEviction, CachedRect, CachedRectInit, CachedRectSeed, DebugDumpRequest,
    LossyHashReport, PersistentCacheQuery, PersistentHashList, RequestCachedData,
    MAX_IDS_PER_MESSAGE,
};
use rfb_protocol::messages::types::{
    encoding_can_be_lossy, Rectangle, ENCODING_CACHED_RECT, ENCODING_CACHED_RECT_INIT,
    ENCODING_CACHED_RECT_SEED, ENCODING_COPYRECT,
};
use rfb_encodings::{flags, Codec, CodecRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Cache misses batch into one PersistentCacheQuery once this many ids
/// accumulate (the rest go at flush).
const QUERY_BATCH_SIZE: usize = 10;

/// Cold entries hydrated per idle flush.
const HYDRATION_BATCH: usize = 5;

/// Decode worker cap.
const MAX_DECODE_THREADS: usize = 4;

/// One queued decode job.
struct QueueEntry {
    seq: u64,
    rect: Rectangle,
    codec: Codec,
    input: Vec<u8>,
    affected: Region,
    active: bool,
}

struct QueueState {
    entries: Vec<QueueEntry>,
    next_seq: u64,
    stopping: bool,
}

struct SharedQueue {
    state: Mutex<QueueState>,
    /// Signalled when the queue drains (flush waits on this).
    producer: Condvar,
    /// Signalled when work arrives (workers wait on this).
    consumer: Condvar,
}

/// A client->server cache message produced by the manager, drained and
/// written by the connection after each flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheMessage {
    RequestCachedData(RequestCachedData),
    Eviction(CacheEviction),
    Query(PersistentCacheQuery),
    LossyReport(LossyHashReport),
    HashList(PersistentHashList),
    DebugDump(DebugDumpRequest),
}

impl CacheMessage {
    /// Serialise into the output stream (type octet included).
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        out: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        match self {
            CacheMessage::RequestCachedData(msg) => msg.write_to(out),
            CacheMessage::Eviction(msg) => msg.write_to(out),
            CacheMessage::Query(msg) => msg.write_to(out),
            CacheMessage::LossyReport(msg) => msg.write_to(out),
            CacheMessage::HashList(msg) => msg.write_to(out),
            CacheMessage::DebugDump(msg) => {
                msg.write_to(out);
                Ok(())
            }
        }
    }
}

/// Decode and cache statistics for one connection.
#[derive(Debug, Default, Clone)]
pub struct DecodeStats {
    /// Rectangles decoded per encoding.
    pub rects_by_encoding: HashMap<i32, u64>,
    pub cache_lookups: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_stores: u64,
    pub queries_sent: u64,
    pub evictions_sent: u64,
}

/// A CachedRectInit whose inner payload is being decoded by the workers;
/// the store step runs after the next drain.
struct PendingStore {
    rect: Rectangle,
    canonical_id: u64,
    lossy_encoding: bool,
    payload_bytes: u64,
}

/// The client decode manager.
pub struct DecodeManager {
    registry: Arc<CodecRegistry>,
    framebuffer: Arc<Mutex<ManagedPixelBuffer>>,
    session_format: PixelFormat,

    engine: PersistentCacheEngine,

    queue: Arc<SharedQueue>,
    workers: Vec<std::thread::JoinHandle<()>>,
    error_rx: Receiver<anyhow::Error>,
    error_tx: Sender<anyhow::Error>,

    pending_stores: Vec<PendingStore>,
    pending_queries: Vec<u64>,
    outgoing: Vec<CacheMessage>,
    hash_list_sequence: u32,
    hash_list_sent: bool,

    stats: DecodeStats,
    bandwidth: CacheProtocolStats,
}

impl DecodeManager {
    pub fn new(
        registry: Arc<CodecRegistry>,
        framebuffer: Arc<Mutex<ManagedPixelBuffer>>,
        engine: PersistentCacheEngine,
    ) -> Self {
        let session_format = *framebuffer.lock().pixel_format();
        let queue = Arc::new(SharedQueue {
            state: Mutex::new(QueueState {
                entries: Vec::new(),
                next_seq: 0,
                stopping: false,
            }),
            producer: Condvar::new(),
            consumer: Condvar::new(),
        });
        let (error_tx, error_rx) = crossbeam_channel::unbounded();

        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_DECODE_THREADS);

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue);
            let framebuffer = Arc::clone(&framebuffer);
            let error_tx = error_tx.clone();
            let format = session_format;
            workers.push(std::thread::spawn(move || {
                decode_worker(worker_id, queue, framebuffer, format, error_tx);
            }));
        }
        debug!("decode manager: {worker_count} worker threads");

        Self {
            registry,
            framebuffer,
            session_format,
            engine,
            queue,
            workers,
            error_rx,
            error_tx,
            pending_stores: Vec::new(),
            pending_queries: Vec::new(),
            outgoing: Vec::new(),
            hash_list_sequence: 0,
            hash_list_sent: false,
            stats: DecodeStats::default(),
            bandwidth: CacheProtocolStats::default(),
        }
    }

    /// The cache engine (tests and the connection's negotiation path).
    pub fn engine(&self) -> &PersistentCacheEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut PersistentCacheEngine {
        &mut self.engine
    }

    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    pub fn bandwidth_stats(&self) -> CacheProtocolStats {
        self.bandwidth
    }

    /// Messages for the server produced since the last drain, in causal
    /// order.
    pub fn take_outgoing(&mut self) -> Vec<CacheMessage> {
        std::mem::take(&mut self.outgoing)
    }

    /// Consume and process one rectangle (header already parsed). Cache
    /// and CopyRect rectangles are handled on the main thread behind a
    /// flush barrier; codec rectangles are queued for the workers.
    pub async fn decode_rect<R: AsyncRead + Unpin>(
        &mut self,
        rect: Rectangle,
        stream: &mut RfbInStream<R>,
    ) -> Result<(), RfbClientError> {
        *self.stats.rects_by_encoding.entry(rect.encoding).or_insert(0) += 1;

        match rect.encoding {
            ENCODING_COPYRECT => {
                let src_x = stream.read_u16().await?;
                let src_y = stream.read_u16().await?;
                // The copy reads framebuffer content, so every queued
                // rectangle must land first.
                self.drain_workers()?;
                let dest = rect_to_common(&rect);
                let delta = Point::new(src_x as i32 - rect.x as i32, src_y as i32 - rect.y as i32);
                self.framebuffer
                    .lock()
                    .copy_rect(dest, delta)
                    .map_err(RfbClientError::Decode)?;
                Ok(())
            }
            ENCODING_CACHED_RECT => {
                let msg = CachedRect::read_from(stream).await?;
                // Barrier plus store settlement: an init earlier in this
                // update must be in the cache before a reference to it.
                self.drain_workers()?;
                self.settle_pending_stores();
                self.handle_cached_ref(&rect, msg.cache_id);
                Ok(())
            }
            ENCODING_CACHED_RECT_INIT => {
                let msg = CachedRectInit::read_from(stream).await?;
                self.queue_cached_init(&rect, msg, stream).await
            }
            ENCODING_CACHED_RECT_SEED => {
                let msg = CachedRectSeed::read_from(stream).await?;
                // Seeds read the framebuffer as already painted.
                self.drain_workers()?;
                self.settle_pending_stores();
                self.seed_cached_rect(&rect, msg.cache_id);
                Ok(())
            }
            encoding => {
                let codec = *self
                    .registry
                    .get(encoding)
                    .ok_or(RfbClientError::UnsupportedEncoding(encoding))?;
                let mut input = Vec::new();
                codec
                    .read_rect(&rect, stream, &self.session_format, &mut input)
                    .await
                    .map_err(RfbClientError::Decode)?;
                self.enqueue(rect, codec, input);
                Ok(())
            }
        }
    }

    fn enqueue(&mut self, rect: Rectangle, codec: Codec, input: Vec<u8>) {
        let affected = codec.affected_region(&rect);
        let mut state = self.queue.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(QueueEntry {
            seq,
            rect,
            codec,
            input,
            affected,
            active: false,
        });
        drop(state);
        self.queue.consumer.notify_one();
    }

    /// The worker barrier alone: wait until every queued rectangle has
    /// decoded and re-raise worker errors. Used mid-update by operations
    /// that read the framebuffer.
    fn drain_workers(&mut self) -> Result<(), RfbClientError> {
        {
            let mut state = self.queue.state.lock();
            while !state.entries.is_empty() {
                self.queue.producer.wait(&mut state);
            }
        }

        if let Ok(err) = self.error_rx.try_recv() {
            // Drain any trailing errors; the first one closes the session.
            while self.error_rx.try_recv().is_ok() {}
            return Err(RfbClientError::Decode(err));
        }
        Ok(())
    }

    /// Run the store halves of any CachedInit rectangles whose payloads
    /// have finished decoding. Callers must have drained the workers.
    fn settle_pending_stores(&mut self) {
        let stores: Vec<PendingStore> = std::mem::take(&mut self.pending_stores);
        for store in stores {
            self.complete_cached_store(store);
        }
    }

    /// The end-of-update flush: worker barrier, deferred stores, then the
    /// batched cache traffic (queries, evictions), coordinator bookkeeping
    /// and a slice of background hydration.
    pub fn flush(&mut self) -> Result<(), RfbClientError> {
        self.drain_workers()?;
        self.settle_pending_stores();
        self.flush_pending_queries();
        self.flush_pending_evictions();
        self.engine.maintain();
        self.engine.hydrate_next_batch(HYDRATION_BATCH);
        Ok(())
    }

    /// CachedRef: serve the rectangle from cache or ask the server again.
    fn handle_cached_ref(&mut self, rect: &Rectangle, cache_id: u64) {
        self.stats.cache_lookups += 1;
        let min_bpp = self.session_format.bits_per_pixel;

        let hit = self
            .engine
            .get_by_canonical_hash(cache_id, rect.width, rect.height, min_bpp)
            .map(|entry| (entry.pixels.clone(), entry.stride_pixels as usize));

        match hit {
            Some((pixels, stride)) => {
                self.stats.cache_hits += 1;
                self.bandwidth.track_reference(rect, self.session_format.bytes_per_pixel());
                if let Err(err) =
                    self.framebuffer
                        .lock()
                        .image_rect(rect_to_common(rect), &pixels, stride)
                {
                    warn!("cache hit blit failed for id {cache_id:016x}: {err}");
                }
            }
            None => {
                self.stats.cache_misses += 1;
                debug!("cache miss for referenced id {cache_id:016x}; requesting resend");
                // Ask for the pixels now and probe the server's view of
                // this id alongside the next batch.
                self.outgoing.push(CacheMessage::RequestCachedData(
                    RequestCachedData::new(cache_id),
                ));
                self.pending_queries.push(cache_id);
                if self.pending_queries.len() >= QUERY_BATCH_SIZE {
                    self.flush_pending_queries();
                }
            }
        }
    }

    /// CachedInit: queue the inner payload for normal decoding and defer
    /// the store step to the next drain.
    async fn queue_cached_init<R: AsyncRead + Unpin>(
        &mut self,
        rect: &Rectangle,
        msg: CachedRectInit,
        stream: &mut RfbInStream<R>,
    ) -> Result<(), RfbClientError> {
        let codec = *self
            .registry
            .get(msg.inner_encoding)
            .ok_or(RfbClientError::UnsupportedEncoding(msg.inner_encoding))?;

        let inner_rect = Rectangle {
            encoding: msg.inner_encoding,
            ..*rect
        };
        let mut input = Vec::new();
        codec
            .read_rect(&inner_rect, stream, &self.session_format, &mut input)
            .await
            .map_err(RfbClientError::Decode)?;

        let lossy_encoding =
            encoding_can_be_lossy(msg.inner_encoding) || codec.flags() & flags::LOSSY != 0;
        self.pending_stores.push(PendingStore {
            rect: *rect,
            canonical_id: msg.cache_id,
            lossy_encoding,
            payload_bytes: input.len() as u64,
        });
        self.enqueue(inner_rect, codec, input);
        Ok(())
    }

    /// The deferred half of CachedInit: hash what was actually decoded,
    /// detect lossy or corrupt payloads, store, and report mappings.
    fn complete_cached_store(&mut self, store: PendingStore) {
        let rect = rect_to_common(&store.rect);
        let (key, pixels, format) = {
            let fb = self.framebuffer.lock();
            let key = ContentHash::compute_rect(&*fb, rect);
            let Some(pixels) = fb.extract_packed(rect) else {
                warn!("cached init rect {rect:?} fell outside the framebuffer");
                return;
            };
            (key, pixels, *fb.pixel_format())
        };

        if key.is_null() {
            warn!("hash of decoded rect {rect:?} failed; not caching");
            return;
        }
        let actual_id = key.id();
        let hash_match = actual_id == store.canonical_id;

        if !hash_match && !store.lossy_encoding {
            // Lossless encoding but the pixels hash differently: decoder
            // corruption, stride mismatch or truncated transport. Caching
            // would replay the corruption on every future hit.
            warn!(
                "hash mismatch under lossless init (canonical={:016x} actual={:016x}); dropping",
                store.canonical_id, actual_id
            );
            return;
        }

        if !hash_match {
            // Lossy decode: tell the server what we actually hold so it
            // can keep referencing the canonical id.
            self.outgoing.push(CacheMessage::LossyReport(LossyHashReport::new(
                store.canonical_id,
                actual_id,
            )));
        }

        let outcome = self.engine.insert(
            store.canonical_id,
            actual_id,
            key,
            &pixels,
            format,
            store.rect.width,
            store.rect.height,
            store.rect.width,
            store.lossy_encoding,
            true,
        );
        if matches!(outcome, InsertOutcome::Stored { .. }) {
            self.stats.cache_stores += 1;
            self.bandwidth.track_init(store.payload_bytes);
        }

        // Inserts can evict; forward those notifications promptly.
        self.flush_pending_evictions();
    }

    /// CachedSeed: associate the pixels already on screen with an id. No
    /// wire payload was consumed.
    fn seed_cached_rect(&mut self, rect: &Rectangle, cache_id: u64) {
        let rect_c = rect_to_common(rect);
        let (key, pixels, format) = {
            let fb = self.framebuffer.lock();
            let key = ContentHash::compute_rect(&*fb, rect_c);
            let Some(pixels) = fb.extract_packed(rect_c) else {
                warn!("seed rect {rect_c:?} fell outside the framebuffer");
                return;
            };
            (key, pixels, *fb.pixel_format())
        };
        if key.is_null() {
            return;
        }

        let actual_id = key.id();
        if actual_id != cache_id {
            // Seeds always carry the canonical hash, but our framebuffer
            // may hold a lossy decode of it; report the mapping.
            self.outgoing.push(CacheMessage::LossyReport(LossyHashReport::new(
                cache_id, actual_id,
            )));
        }

        let outcome = self.engine.insert(
            cache_id,
            actual_id,
            key,
            &pixels,
            format,
            rect.width,
            rect.height,
            rect.width,
            // A mismatch here reflects earlier lossy content, not
            // corruption: nothing was decoded for this rect.
            actual_id != cache_id,
            true,
        );
        if matches!(outcome, InsertOutcome::Stored { .. }) {
            self.stats.cache_stores += 1;
        }
        self.flush_pending_evictions();
    }

    fn flush_pending_queries(&mut self) {
        if self.pending_queries.is_empty() {
            return;
        }
        for chunk in std::mem::take(&mut self.pending_queries).chunks(MAX_IDS_PER_MESSAGE) {
            self.stats.queries_sent += chunk.len() as u64;
            self.outgoing
                .push(CacheMessage::Query(PersistentCacheQuery::new(chunk.to_vec())));
        }
    }

    fn flush_pending_evictions(&mut self) {
        if !self.engine.has_pending_evictions() {
            return;
        }
        let ids: Vec<u64> = self
            .engine
            .take_pending_evictions()
            .iter()
            .map(CacheKey::id)
            .filter(|&id| id != 0)
            .collect();
        for chunk in ids.chunks(MAX_IDS_PER_MESSAGE) {
            self.stats.evictions_sent += chunk.len() as u64;
            self.outgoing
                .push(CacheMessage::Eviction(CacheEviction::new(chunk.to_vec())));
        }
    }

    /// Advertise ids surviving from a previous session, chunked, once per
    /// connection. Called right after the security handshake completes.
    pub fn advertise_hash_list(&mut self) {
        if self.hash_list_sent {
            return;
        }
        self.hash_list_sent = true;

        let ids: Vec<u64> = self
            .engine
            .all_keys()
            .iter()
            .map(CacheKey::id)
            .filter(|&id| id != 0)
            .collect();
        if ids.is_empty() {
            return;
        }

        self.hash_list_sequence += 1;
        let chunks: Vec<&[u64]> = ids.chunks(MAX_IDS_PER_MESSAGE).collect();
        let total = chunks.len() as u16;
        for (index, chunk) in chunks.into_iter().enumerate() {
            self.outgoing.push(CacheMessage::HashList(PersistentHashList {
                sequence_id: self.hash_list_sequence,
                total_chunks: total,
                chunk_index: index as u16,
                ids: chunk.to_vec(),
            }));
        }
        info!(
            "advertised {} cached ids in {} chunk(s)",
            ids.len(),
            total
        );
    }

    /// Corruption post-mortem: write a local cache state dump and ask the
    /// server (via the queued message) to write a matching one under the
    /// same timestamp.
    pub fn request_debug_dump(
        &mut self,
        output_dir: &std::path::Path,
        epoch_timestamp: u32,
    ) -> std::io::Result<std::path::PathBuf> {
        let path = self.engine.dump_debug_state(output_dir, epoch_timestamp)?;
        self.outgoing.push(CacheMessage::DebugDump(DebugDumpRequest {
            epoch_timestamp,
        }));
        Ok(path)
    }

    /// End-of-session summary.
    pub fn log_stats(&self) {
        info!(
            "decode manager: {} lookups, {} hits, {} misses, {} stores; {}",
            self.stats.cache_lookups,
            self.stats.cache_hits,
            self.stats.cache_misses,
            self.stats.cache_stores,
            self.bandwidth.format_summary("cache protocol"),
        );
    }

    /// Session-end persistence: flush dirty payloads and the index.
    pub fn save_cache(&mut self) -> usize {
        self.engine.save()
    }
}

impl Drop for DecodeManager {
    fn drop(&mut self) {
        {
            let mut state = self.queue.state.lock();
            state.stopping = true;
        }
        self.queue.consumer.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn rect_to_common(rect: &Rectangle) -> Rect {
    Rect::new(
        rect.x as i32,
        rect.y as i32,
        rect.width as u32,
        rect.height as u32,
    )
}

/// Pick the next entry a worker may legally claim, honouring the three
/// ordering constraints. Returns the entry's index.
fn find_claimable(state: &QueueState) -> Option<usize> {
    'candidates: for (index, entry) in state.entries.iter().enumerate() {
        if entry.active {
            continue;
        }
        for earlier in &state.entries[..index] {
            let same_encoding = earlier.rect.encoding == entry.rect.encoding;
            if entry.codec.flags() & flags::FULLY_ORDERED != 0 && same_encoding {
                continue 'candidates;
            }
            if entry.codec.flags() & flags::PARTIALLY_ORDERED != 0
                && same_encoding
                && entry.codec.rects_conflict(&entry.rect, &earlier.rect)
            {
                continue 'candidates;
            }
            if !earlier.affected.intersect(&entry.affected).is_empty() {
                continue 'candidates;
            }
        }
        return Some(index);
    }
    None
}

/// Worker thread body: claim, decode into a scratch tile, blit, repeat.
fn decode_worker(
    worker_id: usize,
    queue: Arc<SharedQueue>,
    framebuffer: Arc<Mutex<ManagedPixelBuffer>>,
    format: PixelFormat,
    error_tx: Sender<anyhow::Error>,
) {
    loop {
        // Claim one entry, taking its input with us.
        let (seq, rect, codec, input) = {
            let mut state = queue.state.lock();
            loop {
                if state.stopping {
                    return;
                }
                if let Some(index) = find_claimable(&state) {
                    let entry = &mut state.entries[index];
                    entry.active = true;
                    break (
                        entry.seq,
                        entry.rect,
                        entry.codec,
                        std::mem::take(&mut entry.input),
                    );
                }
                queue.consumer.wait(&mut state);
            }
        };

        // CPU-heavy part outside any lock.
        let result = (|| -> anyhow::Result<()> {
            let mut tile =
                ManagedPixelBuffer::new(rect.width as u32, rect.height as u32, format);
            codec.decode_rect(&rect, &input, &format, &mut tile)?;
            framebuffer.lock().image_rect(
                Rect::new(
                    rect.x as i32,
                    rect.y as i32,
                    rect.width as u32,
                    rect.height as u32,
                ),
                tile.data(),
                tile.stride(),
            )?;
            Ok(())
        })();

        if let Err(err) = result {
            tracing::warn!("decode worker {worker_id}: rect {rect:?} failed: {err}");
            let _ = error_tx.send(err);
        }

        // Retire the entry and wake both sides: the producer may be
        // waiting in flush, other workers may now be unblocked.
        {
            let mut state = queue.state.lock();
            state.entries.retain(|e| e.seq != seq);
        }
        queue.producer.notify_all();
        queue.consumer.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfb_cache::engine::EngineConfig;
    use rfb_protocol::messages::types::ENCODING_RAW;
    use std::io::Cursor;

    fn memory_manager(fb_w: u32, fb_h: u32) -> DecodeManager {
        let framebuffer = Arc::new(Mutex::new(ManagedPixelBuffer::new(
            fb_w,
            fb_h,
            PixelFormat::rgb888(),
        )));
        let engine = PersistentCacheEngine::new(EngineConfig {
            max_memory_mb: 64,
            persistence_enabled: false,
            ..EngineConfig::default()
        });
        DecodeManager::new(Arc::new(CodecRegistry::standard()), framebuffer, engine)
    }

    fn raw_rect(x: u16, y: u16, w: u16, h: u16) -> Rectangle {
        Rectangle {
            x,
            y,
            width: w,
            height: h,
            encoding: ENCODING_RAW,
        }
    }

    fn solid_payload(w: u16, h: u16, rgb: [u8; 4]) -> Vec<u8> {
        let px = PixelFormat::rgb888().from_rgb888(rgb);
        let mut out = Vec::new();
        for _ in 0..(w as usize * h as usize) {
            out.extend_from_slice(&px);
        }
        out
    }

    fn fb_pixel(dm: &DecodeManager, x: i32, y: i32) -> [u8; 4] {
        let fb = dm.framebuffer.lock();
        let mut stride = 0;
        let pixels = fb.get_buffer(Rect::new(x, y, 1, 1), &mut stride).unwrap();
        [pixels[0], pixels[1], pixels[2], pixels[3]]
    }

    #[tokio::test]
    async fn raw_rect_decodes_through_workers() {
        let mut dm = memory_manager(32, 32);
        let payload = solid_payload(8, 8, [255, 0, 0, 255]);
        let mut stream = RfbInStream::new(Cursor::new(payload));

        dm.decode_rect(raw_rect(4, 4, 8, 8), &mut stream).await.unwrap();
        dm.flush().unwrap();

        assert_eq!(fb_pixel(&dm, 4, 4), [0x00, 0x00, 0xFF, 0x00]);
        assert_eq!(fb_pixel(&dm, 11, 11), [0x00, 0x00, 0xFF, 0x00]);
        // Outside the rect stays black.
        assert_eq!(fb_pixel(&dm, 12, 12), [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn flush_is_a_barrier_for_many_rects() {
        let mut dm = memory_manager(64, 64);
        // 16 disjoint rects in one "update".
        for i in 0..16u16 {
            let (x, y) = ((i % 4) * 16, (i / 4) * 16);
            let payload = solid_payload(16, 16, [i as u8 + 1, 0, 0, 255]);
            let mut stream = RfbInStream::new(Cursor::new(payload));
            dm.decode_rect(raw_rect(x, y, 16, 16), &mut stream).await.unwrap();
        }
        dm.flush().unwrap();

        for i in 0..16u16 {
            let (x, y) = ((i % 4) * 16 + 8, (i / 4) * 16 + 8);
            let px = fb_pixel(&dm, x as i32, y as i32);
            assert_eq!(px[2], i as u8 + 1, "rect {i} not painted");
        }
    }

    #[tokio::test]
    async fn worker_error_surfaces_at_flush() {
        let mut dm = memory_manager(16, 16);
        // Rect extends past the framebuffer; the blit fails in the worker.
        let payload = solid_payload(8, 8, [1, 2, 3, 255]);
        let mut stream = RfbInStream::new(Cursor::new(payload));
        dm.decode_rect(raw_rect(12, 12, 8, 8), &mut stream).await.unwrap();

        let err = dm.flush().unwrap_err();
        assert!(matches!(err, RfbClientError::Decode(_)));
        // The manager stays usable for the connection's error path.
        dm.flush().unwrap();
    }

    #[tokio::test]
    async fn cached_init_stores_and_ref_hits() {
        let mut dm = memory_manager(32, 32);
        let payload = solid_payload(16, 16, [0, 255, 0, 255]);

        // Compute the canonical id the server would send: hash of the
        // decoded pixels (Raw is lossless, so canonical == actual).
        let mut scratch = ManagedPixelBuffer::new(16, 16, PixelFormat::rgb888());
        scratch
            .image_rect(Rect::new(0, 0, 16, 16), &payload, 16)
            .unwrap();
        let canonical = ContentHash::compute_rect(&scratch, Rect::new(0, 0, 16, 16)).id();

        // CachedRectInit wire bytes: id + inner encoding + raw payload.
        let mut wire = Vec::new();
        wire.extend_from_slice(&canonical.to_be_bytes());
        wire.extend_from_slice(&ENCODING_RAW.to_be_bytes());
        wire.extend_from_slice(&payload);
        let mut stream = RfbInStream::new(Cursor::new(wire));

        let rect = Rectangle {
            encoding: ENCODING_CACHED_RECT_INIT,
            ..raw_rect(0, 0, 16, 16)
        };
        dm.decode_rect(rect, &mut stream).await.unwrap();
        dm.flush().unwrap();

        assert_eq!(dm.stats().cache_stores, 1);
        // Lossless agreement: no lossy report went out.
        assert!(dm
            .take_outgoing()
            .iter()
            .all(|m| !matches!(m, CacheMessage::LossyReport(_))));

        // Blank the framebuffer, then serve the same content by reference.
        dm.framebuffer.lock().resize(32, 32);
        let mut wire = Vec::new();
        wire.extend_from_slice(&canonical.to_be_bytes());
        let mut stream = RfbInStream::new(Cursor::new(wire));
        let rect = Rectangle {
            encoding: ENCODING_CACHED_RECT,
            ..raw_rect(8, 8, 16, 16)
        };
        dm.decode_rect(rect, &mut stream).await.unwrap();

        assert_eq!(dm.stats().cache_hits, 1);
        let green = PixelFormat::rgb888().from_rgb888([0, 255, 0, 255]);
        assert_eq!(&fb_pixel(&dm, 8, 8)[..], &green[..]);
    }

    #[tokio::test]
    async fn corrupt_lossless_init_is_dropped() {
        let mut dm = memory_manager(32, 32);
        let payload = solid_payload(16, 16, [9, 9, 9, 255]);

        // Server claims a canonical id that cannot match the pixels.
        let bogus_canonical: u64 = 0xDEAD_BEEF_DEAD_BEEF;
        let mut wire = Vec::new();
        wire.extend_from_slice(&bogus_canonical.to_be_bytes());
        wire.extend_from_slice(&ENCODING_RAW.to_be_bytes());
        wire.extend_from_slice(&payload);
        let mut stream = RfbInStream::new(Cursor::new(wire));

        let rect = Rectangle {
            encoding: ENCODING_CACHED_RECT_INIT,
            ..raw_rect(0, 0, 16, 16)
        };
        dm.decode_rect(rect, &mut stream).await.unwrap();
        dm.flush().unwrap();

        // Pixels were painted (the decode itself succeeded)...
        assert_eq!(dm.stats().cache_stores, 0);
        // ...but nothing was cached and no lossy report was sent (Raw is
        // declared lossless; this is corruption, not compression).
        assert!(dm.engine_mut().get_by_canonical_hash(bogus_canonical, 16, 16, 0).is_none());
        assert!(dm
            .take_outgoing()
            .iter()
            .all(|m| !matches!(m, CacheMessage::LossyReport(_))));
    }

    #[tokio::test]
    async fn ref_miss_requests_resend_and_batches_queries() {
        let mut dm = memory_manager(32, 32);

        for id in 1..=9u64 {
            let mut wire = Vec::new();
            wire.extend_from_slice(&id.to_be_bytes());
            let mut stream = RfbInStream::new(Cursor::new(wire));
            let rect = Rectangle {
                encoding: ENCODING_CACHED_RECT,
                ..raw_rect(0, 0, 16, 16)
            };
            dm.decode_rect(rect, &mut stream).await.unwrap();
        }
        // Nine misses: nine immediate resend requests, no query batch yet.
        let outgoing = dm.take_outgoing();
        let requests = outgoing
            .iter()
            .filter(|m| matches!(m, CacheMessage::RequestCachedData(_)))
            .count();
        assert_eq!(requests, 9);
        assert!(outgoing.iter().all(|m| !matches!(m, CacheMessage::Query(_))));

        // The tenth miss triggers the batch.
        let mut wire = Vec::new();
        wire.extend_from_slice(&10u64.to_be_bytes());
        let mut stream = RfbInStream::new(Cursor::new(wire));
        let rect = Rectangle {
            encoding: ENCODING_CACHED_RECT,
            ..raw_rect(0, 0, 16, 16)
        };
        dm.decode_rect(rect, &mut stream).await.unwrap();

        let outgoing = dm.take_outgoing();
        let query = outgoing
            .iter()
            .find_map(|m| match m {
                CacheMessage::Query(q) => Some(q.clone()),
                _ => None,
            })
            .expect("query batch after ten misses");
        assert_eq!(query.ids, (1..=10u64).collect::<Vec<_>>());
        assert_eq!(dm.stats().cache_misses, 10);
    }

    #[tokio::test]
    async fn seed_associates_framebuffer_pixels() {
        let mut dm = memory_manager(32, 32);

        // Paint a region through the normal path first.
        let payload = solid_payload(16, 16, [12, 34, 56, 255]);
        let mut stream = RfbInStream::new(Cursor::new(payload));
        dm.decode_rect(raw_rect(0, 0, 16, 16), &mut stream).await.unwrap();
        dm.flush().unwrap();

        // The server's canonical hash of the same pixels.
        let canonical = {
            let fb = dm.framebuffer.lock();
            ContentHash::compute_rect(&*fb, Rect::new(0, 0, 16, 16)).id()
        };

        let mut wire = Vec::new();
        wire.extend_from_slice(&canonical.to_be_bytes());
        let mut stream = RfbInStream::new(Cursor::new(wire));
        let rect = Rectangle {
            encoding: ENCODING_CACHED_RECT_SEED,
            ..raw_rect(0, 0, 16, 16)
        };
        dm.decode_rect(rect, &mut stream).await.unwrap();

        assert_eq!(dm.stats().cache_stores, 1);
        // Hashes agreed: no lossy report.
        assert!(dm
            .take_outgoing()
            .iter()
            .all(|m| !matches!(m, CacheMessage::LossyReport(_))));
        assert!(dm
            .engine_mut()
            .get_by_canonical_hash(canonical, 16, 16, 32)
            .is_some());
    }

    #[tokio::test]
    async fn seed_with_foreign_id_reports_lossy_mapping() {
        let mut dm = memory_manager(32, 32);
        let payload = solid_payload(16, 16, [200, 100, 50, 255]);
        let mut stream = RfbInStream::new(Cursor::new(payload));
        dm.decode_rect(raw_rect(0, 0, 16, 16), &mut stream).await.unwrap();
        dm.flush().unwrap();

        // Seed under a canonical id that does not match the pixels, as a
        // server would after sending this region through JPEG.
        let canonical: u64 = 0x1234_5678_9ABC_DEF0;
        let mut wire = Vec::new();
        wire.extend_from_slice(&canonical.to_be_bytes());
        let mut stream = RfbInStream::new(Cursor::new(wire));
        let rect = Rectangle {
            encoding: ENCODING_CACHED_RECT_SEED,
            ..raw_rect(0, 0, 16, 16)
        };
        dm.decode_rect(rect, &mut stream).await.unwrap();

        let outgoing = dm.take_outgoing();
        let report = outgoing
            .iter()
            .find_map(|m| match m {
                CacheMessage::LossyReport(r) => Some(*r),
                _ => None,
            })
            .expect("lossy mapping reported");
        assert_eq!(report.canonical_id, canonical);
        assert_ne!(report.actual_id, canonical);

        // The entry is served under the canonical id regardless.
        assert!(dm
            .engine_mut()
            .get_by_canonical_hash(canonical, 16, 16, 32)
            .is_some());
    }

    #[tokio::test]
    async fn hash_list_chunks_at_one_thousand() {
        let mut dm = memory_manager(16, 16);

        // 1500 tiny entries straight into the engine.
        for id in 1..=1500u64 {
            let pixels = vec![id as u8; 4];
            dm.engine_mut().insert(
                id,
                id,
                CacheKey::from_id(id),
                &pixels,
                PixelFormat::rgb888(),
                1,
                1,
                1,
                false,
                false,
            );
        }

        dm.advertise_hash_list();
        let outgoing = dm.take_outgoing();
        let chunks: Vec<&PersistentHashList> = outgoing
            .iter()
            .filter_map(|m| match m {
                CacheMessage::HashList(h) => Some(h),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].total_chunks, 2);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].ids.len(), 1000);
        assert_eq!(chunks[1].chunk_index, 1);
        assert_eq!(chunks[1].ids.len(), 500);
        assert_eq!(chunks[0].sequence_id, chunks[1].sequence_id);

        // Once per connection only.
        dm.advertise_hash_list();
        assert!(dm.take_outgoing().is_empty());
    }

    #[tokio::test]
    async fn evictions_are_forwarded() {
        let framebuffer = Arc::new(Mutex::new(ManagedPixelBuffer::new(
            16,
            16,
            PixelFormat::rgb888(),
        )));
        // 1 MiB budget so a few inserts force evictions.
        let engine = PersistentCacheEngine::new(EngineConfig {
            max_memory_mb: 1,
            persistence_enabled: false,
            ..EngineConfig::default()
        });
        let mut dm =
            DecodeManager::new(Arc::new(CodecRegistry::standard()), framebuffer, engine);

        for id in 1..=4u64 {
            let pixels = vec![id as u8; 512 * 256 * 4];
            dm.engine_mut().insert(
                id,
                id,
                CacheKey::from_id(id),
                &pixels,
                PixelFormat::rgb888(),
                512,
                256,
                512,
                false,
                false,
            );
        }
        dm.flush().unwrap();

        let outgoing = dm.take_outgoing();
        let evicted: Vec<u64> = outgoing
            .iter()
            .filter_map(|m| match m {
                CacheMessage::Eviction(e) => Some(e.ids.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert!(!evicted.is_empty());
        assert!(dm.stats().evictions_sent > 0);
    }
}
