//! Per-update encode scheduling.
//!
//! The encode manager drives every framebuffer update for one client. Per
//! update it decides, region by region, whether to emit a CopyRect, a
//! solid-colour rect, a plain encoded rect, a cache reference, a cache
//! init (reference plus payload), or a cache seed. It also tracks which
//! screen areas were last sent with a lossy codec so they can be re-sent
//! losslessly once activity quiesces.
//!
//! Ordering within one update matters: copies first (they read old
//! framebuffer content), then whole-region cache hits, then solids, then
//! the per-rect path, then opportunistic seeds of regions just encoded.

use crate::client_state::ClientCacheState;
use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use rfb_cache::ContentHash;
use rfb_common::{Point, Rect, Region};
use rfb_pixelbuffer::PixelBuffer;
use rfb_protocol::io::RfbOutStream;
use rfb_protocol::messages::server::FramebufferUpdate;
use rfb_protocol::messages::types::{
    Rectangle, ENCODING_CACHED_RECT, ENCODING_CACHED_RECT_INIT, ENCODING_CACHED_RECT_SEED,
    ENCODING_COPYRECT, ENCODING_RAW,
};
use rfb_encodings::{flags, Codec, CodecRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tracing::{debug, info, trace};

/// Largest plain sub-rectangle; bigger damage is split before encoding.
const SUB_RECT_MAX_AREA: u64 = 65_536;
const SUB_RECT_MAX_WIDTH: u32 = 2048;

/// Probe granularity of the solid-colour detector.
const SOLID_BLOCK_SIZE: u32 = 16;

/// Bordered-region detection only runs when the damage is at least this
/// large; the detector is not free.
const BORDERED_MIN_DAMAGE_AREA: u64 = 10_000;

/// Gate for the extra whole-update log lines (`CC_DEBUG=1`).
static CC_DEBUG: Lazy<bool> = Lazy::new(|| std::env::var_os("CC_DEBUG").is_some());

/// Gate for tile-scan diagnostics (`CC_TILING_DEBUG=1`).
static TILING_DEBUG: Lazy<bool> = Lazy::new(|| std::env::var_os("CC_TILING_DEBUG").is_some());

/// Damage handed to the manager for one update, as produced by the update
/// tracker: changed region, region satisfied by a copy, and the copy delta.
#[derive(Debug, Default, Clone)]
pub struct UpdateInfo {
    pub changed: Region,
    pub copied: Region,
    pub copy_delta: Point,
}

/// UI-layout proportions of the bordered-region detector. The defaults
/// describe a presentation-style layout (thumbnail panel left, toolbars
/// top, thin margins elsewhere); deployments with different layouts tune
/// or disable this.
#[derive(Debug, Clone, Copy)]
pub struct BorderLayout {
    pub left_pct: u32,
    pub right_pct: u32,
    pub top_pct: u32,
    pub bottom_pct: u32,
}

impl Default for BorderLayout {
    fn default() -> Self {
        Self {
            left_pct: 9,
            right_pct: 2,
            top_pct: 8,
            bottom_pct: 2,
        }
    }
}

impl BorderLayout {
    /// Estimate the content sub-rectangle of a framebuffer. Small screens
    /// and degenerate results yield `None`.
    pub fn content_rect(&self, fb_width: u32, fb_height: u32) -> Option<Rect> {
        if fb_width < 400 || fb_height < 300 {
            return None;
        }
        let left = (fb_width * self.left_pct / 100) as i32;
        let right = (fb_width - fb_width * self.right_pct / 100) as i32;
        let top = (fb_height * self.top_pct / 100) as i32;
        let bottom = (fb_height - fb_height * self.bottom_pct / 100) as i32;

        let content = Rect::from_corners(left, top, right, bottom);
        if content.width >= 300 && content.height >= 200 {
            Some(content)
        } else {
            None
        }
    }
}

/// Tunables for one connection's encode manager.
#[derive(Debug, Clone)]
pub struct EncodeManagerConfig {
    /// Attempt whole-damage bounding-box cache hits.
    pub bbox_cache: bool,
    /// Rectangles below this area are never cached.
    pub min_cache_rect_area: u64,
    /// Bordered-region heuristic; `None` disables it.
    pub border_layout: Option<BorderLayout>,
    /// Tile scan granularity; `None` disables the (experimental) scan.
    pub tile_size: Option<u32>,
    /// Quiesce interval before lossy areas become refresh candidates.
    pub refresh_delay: Duration,
}

impl Default for EncodeManagerConfig {
    fn default() -> Self {
        Self {
            bbox_cache: true,
            min_cache_rect_area: 10_000,
            border_layout: Some(BorderLayout::default()),
            tile_size: None,
            refresh_delay: Duration::from_millis(50),
        }
    }
}

/// One encoded rectangle: header plus its wire payload.
#[derive(Debug, Clone)]
pub struct EncodedRect {
    pub header: Rectangle,
    pub payload: Vec<u8>,
}

/// All rectangles of one FramebufferUpdate message, in emission order.
#[derive(Debug, Default, Clone)]
pub struct UpdateBatch {
    pub rects: Vec<EncodedRect>,
}

impl UpdateBatch {
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rects.len()
    }

    /// Total wire bytes this batch will occupy (headers + payloads).
    pub fn wire_bytes(&self) -> usize {
        self.rects.iter().map(|r| 12 + r.payload.len()).sum()
    }

    /// Rect headers in emission order (tests mostly assert on these).
    pub fn headers(&self) -> Vec<Rectangle> {
        self.rects.iter().map(|r| r.header).collect()
    }

    fn push(&mut self, header: Rectangle, payload: Vec<u8>) {
        self.rects.push(EncodedRect { header, payload });
    }

    /// Write the complete FramebufferUpdate message into the stream
    /// buffer. The caller flushes.
    pub fn write_to<W: AsyncWrite + Unpin>(&self, out: &mut RfbOutStream<W>) {
        FramebufferUpdate::write_header(out, self.rects.len() as u16);
        for rect in &self.rects {
            rect.header.write_to(out);
            out.write_bytes(&rect.payload);
        }
    }
}

/// Encoder type chosen per rectangle from its palette/run analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncoderType {
    Solid,
    Bitmap,
    BitmapRle,
    Indexed,
    IndexedRle,
    FullColour,
}

/// Per-rect analysis result.
struct RectInfo {
    colours: usize,
    rle_runs: usize,
    /// The single colour when `colours == 1`.
    solid_pixel: Option<Vec<u8>>,
}

/// Cache-path counters for one connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheEmissionStats {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub inits_sent: u64,
    pub seeds_sent: u64,
    pub bytes_saved: u64,
}

/// The per-connection update scheduler.
pub struct EncodeManager {
    registry: Arc<CodecRegistry>,
    config: EncodeManagerConfig,

    /// Areas last sent with a lossy codec.
    lossy_region: Region,
    /// Areas that changed since the refresh timer was last armed.
    recently_changed: Region,
    /// Areas due for a lossless re-send.
    pending_refresh: Region,
    refresh_deadline: Option<Instant>,

    updates: u64,
    cache_stats: CacheEmissionStats,
}

impl EncodeManager {
    pub fn new(registry: Arc<CodecRegistry>, config: EncodeManagerConfig) -> Self {
        Self {
            registry,
            config,
            lossy_region: Region::new(),
            recently_changed: Region::new(),
            pending_refresh: Region::new(),
            refresh_deadline: None,
            updates: 0,
            cache_stats: CacheEmissionStats::default(),
        }
    }

    pub fn cache_stats(&self) -> CacheEmissionStats {
        self.cache_stats
    }

    /// Encode one update. The returned batch is ready to be written as a
    /// single FramebufferUpdate message.
    pub fn write_update(
        &mut self,
        ui: &UpdateInfo,
        pb: &dyn PixelBuffer,
        client: &mut ClientCacheState,
        now: Instant,
    ) -> Result<UpdateBatch> {
        self.updates += 1;
        self.handle_refresh_timer(now);

        let mut batch = UpdateBatch::default();
        self.write_copy_rects(ui, &mut batch);

        let mut work = ui.changed.clone();
        if work.is_empty() {
            return Ok(batch);
        }

        self.recently_changed.assign_union(&work);
        self.refresh_deadline = Some(now + self.config.refresh_delay);

        if *CC_DEBUG {
            debug!(
                "update {}: damage {} rects, bbox {:?}",
                self.updates,
                work.num_rects(),
                work.bounding_rect()
            );
        }

        let mut seeds: Vec<(Rect, u64)> = Vec::new();

        if client.cache_enabled() {
            // Bordered-region pass: carve out a known content area.
            self.try_bordered_regions(&ui.changed, pb, client, &mut work, &mut batch, &mut seeds);

            // Bounding-box pass: one reference for the whole damage.
            if !work.is_empty()
                && self.try_bbox_cache(&ui.changed, pb, client, &mut work, &mut batch, &mut seeds)
            {
                self.emit_seeds(&seeds, client, &mut batch);
                return Ok(batch);
            }

            // Tile scan (experimental): reference-sized pieces of damage.
            if let Some(tile_size) = self.config.tile_size {
                self.tile_scan(tile_size, pb, client, &mut work, &mut batch);
            }
        }

        self.write_solid_rects(pb, &mut work, &mut batch)?;
        self.write_rects(pb, client, &work, &mut batch)?;
        self.emit_seeds(&seeds, client, &mut batch);

        Ok(batch)
    }

    /// CopyRect emission: pure blits expressed via coordinates.
    fn write_copy_rects(&mut self, ui: &UpdateInfo, batch: &mut UpdateBatch) {
        for rect in ui.copied.rects() {
            let src_x = (rect.x + ui.copy_delta.x) as u16;
            let src_y = (rect.y + ui.copy_delta.y) as u16;
            let mut payload = Vec::with_capacity(4);
            payload.extend_from_slice(&src_x.to_be_bytes());
            payload.extend_from_slice(&src_y.to_be_bytes());
            batch.push(header(rect, ENCODING_COPYRECT), payload);
            // Copies move pixels with whatever fidelity the source had.
            let src = rect.translate(ui.copy_delta);
            if self.lossy_region.overlaps_rect(&src) {
                self.lossy_region.assign_union_rect(*rect);
            }
        }
    }

    /// Whole-region hit against the heuristic content sub-rectangle.
    fn try_bordered_regions(
        &mut self,
        changed: &Region,
        pb: &dyn PixelBuffer,
        client: &mut ClientCacheState,
        work: &mut Region,
        batch: &mut UpdateBatch,
        seeds: &mut Vec<(Rect, u64)>,
    ) {
        let Some(layout) = self.config.border_layout else {
            return;
        };
        if changed.is_empty() || changed.bounding_rect().area() <= BORDERED_MIN_DAMAGE_AREA {
            return;
        }
        let (fb_w, fb_h) = pb.dimensions();
        let Some(content) = layout.content_rect(fb_w, fb_h) else {
            return;
        };

        let damage_in_content = work.intersect_rect(&content);
        if damage_in_content.is_empty() {
            return;
        }

        // Low coverage means most of the region is stale relative to this
        // update; re-encoding the dirty part beats an optimistic full-region
        // reference.
        let coverage = damage_in_content.bounding_rect().area() as f64 / content.area() as f64;
        if content.area() > self.config.min_cache_rect_area && coverage < 0.5 {
            trace!("bordered region {content:?}: coverage {coverage:.3} too low, skipping");
            return;
        }

        let content_id = ContentHash::compute_rect_id(pb, content);
        if content_id == 0 {
            return;
        }

        self.cache_stats.lookups += 1;
        if client.can_reference(content_id) {
            self.cache_stats.hits += 1;
            self.record_reference_savings(&content, pb);
            batch.push(
                header(&content, ENCODING_CACHED_RECT),
                content_id.to_be_bytes().to_vec(),
            );
            info!(
                "bordered region cache hit {:?} id={:016x} coverage={:.3}",
                content, content_id, coverage
            );
            // The client may only hold lossy pixels for this id; keep the
            // area scheduled for refresh in that case.
            if !client.has_lossy_mapping(content_id) {
                self.lossy_region.assign_subtract_rect(content);
            }
            self.pending_refresh.assign_subtract_rect(content);
            work.assign_subtract_rect(content);
        } else {
            self.cache_stats.misses += 1;
            seeds.push((content, content_id));
        }
    }

    /// Whole-region hit against the damage bounding box. Returns true when
    /// the entire update was satisfied by one reference.
    fn try_bbox_cache(
        &mut self,
        changed: &Region,
        pb: &dyn PixelBuffer,
        client: &mut ClientCacheState,
        work: &mut Region,
        batch: &mut UpdateBatch,
        seeds: &mut Vec<(Rect, u64)>,
    ) -> bool {
        let bbox = work.bounding_rect();
        if bbox.area() < self.config.min_cache_rect_area {
            return false;
        }

        if self.config.bbox_cache {
            // Coverage guard, same rationale as the bordered pass.
            let damage_bbox = changed.bounding_rect();
            let coverage = damage_bbox.area() as f64 / bbox.area() as f64;
            if coverage >= 0.5 {
                let bbox_id = ContentHash::compute_rect_id(pb, bbox);
                if bbox_id != 0 {
                    self.cache_stats.lookups += 1;
                    if client.can_reference(bbox_id) {
                        self.cache_stats.hits += 1;
                        self.record_reference_savings(&bbox, pb);
                        batch.push(
                            header(&bbox, ENCODING_CACHED_RECT),
                            bbox_id.to_be_bytes().to_vec(),
                        );
                        info!(
                            "bounding-box cache hit {:?} id={:016x} ({} damage rects coalesced)",
                            bbox,
                            bbox_id,
                            work.num_rects()
                        );
                        if !client.has_lossy_mapping(bbox_id) {
                            self.lossy_region.assign_subtract_rect(bbox);
                        }
                        self.pending_refresh.assign_subtract_rect(bbox);
                        work.clear();
                        return true;
                    }
                    self.cache_stats.misses += 1;
                }
            } else if *TILING_DEBUG {
                debug!("bbox {bbox:?}: coverage {coverage:.3} too low, skipping lookup");
            }
        }

        // Miss (or lookup skipped): seed the bbox after the damage is
        // encoded so the next identical frame hits.
        let seed_id = ContentHash::compute_rect_id(pb, bbox);
        if seed_id != 0 && !client.knows(seed_id) {
            seeds.push((bbox, seed_id));
        }
        false
    }

    /// Tile scan: hash the damage at tile granularity, reference the tiles
    /// the client already holds, packed into larger rectangles where the
    /// packed hash is also known.
    fn tile_scan(
        &mut self,
        tile_size: u32,
        pb: &dyn PixelBuffer,
        client: &mut ClientCacheState,
        work: &mut Region,
        batch: &mut UpdateBatch,
    ) {
        let tile_size = tile_size.max(16);
        let bbox = work.bounding_rect();
        if bbox.is_empty() {
            return;
        }

        // Collect known tiles, row by row.
        let mut known_tiles: Vec<(Rect, u64)> = Vec::new();
        let mut y = bbox.y;
        while y < bbox.bottom() {
            let h = tile_size.min((bbox.bottom() - y) as u32);
            let mut x = bbox.x;
            while x < bbox.right() {
                let w = tile_size.min((bbox.right() - x) as u32);
                let tile = Rect::new(x, y, w, h);
                if work.intersect_rect(&tile).area() == tile.area() {
                    let id = ContentHash::compute_rect_id(pb, tile);
                    if id != 0 {
                        self.cache_stats.lookups += 1;
                        if client.can_reference(id) {
                            self.cache_stats.hits += 1;
                            known_tiles.push((tile, id));
                        } else {
                            self.cache_stats.misses += 1;
                        }
                    }
                }
                x += w as i32;
            }
            y += h as i32;
        }
        if known_tiles.is_empty() {
            return;
        }

        // Pack horizontally adjacent known tiles into runs.
        let mut runs: Vec<Rect> = Vec::new();
        for (tile, _) in &known_tiles {
            match runs.last_mut() {
                Some(last) if last.y == tile.y && last.right() == tile.x && last.height == tile.height => {
                    *last = Rect::new(last.x, last.y, last.width + tile.width, last.height);
                }
                _ => runs.push(*tile),
            }
        }
        // Largest first: one big verified rectangle beats many small ones.
        runs.sort_by_key(|r| std::cmp::Reverse(r.area()));

        for run in runs {
            if work.intersect_rect(&run).area() != run.area() {
                continue; // partially consumed by an earlier, larger run
            }
            let run_id = ContentHash::compute_rect_id(pb, run);
            if run_id != 0 && client.can_reference(run_id) {
                if *TILING_DEBUG {
                    debug!("tile scan: packed reference {run:?} id={run_id:016x}");
                }
                self.record_reference_savings(&run, pb);
                batch.push(header(&run, ENCODING_CACHED_RECT), run_id.to_be_bytes().to_vec());
                if !client.has_lossy_mapping(run_id) {
                    self.lossy_region.assign_subtract_rect(run);
                }
                work.assign_subtract_rect(run);
            } else {
                // The packed hash is unknown; fall back to the individual
                // verified tiles inside this run.
                for (tile, id) in known_tiles.iter().filter(|(t, _)| run.contains_rect(t)) {
                    if work.intersect_rect(tile).area() != tile.area() {
                        continue;
                    }
                    self.record_reference_savings(tile, pb);
                    batch.push(header(tile, ENCODING_CACHED_RECT), id.to_be_bytes().to_vec());
                    if !client.has_lossy_mapping(*id) {
                        self.lossy_region.assign_subtract_rect(*tile);
                    }
                    work.assign_subtract_rect(*tile);
                }
            }
        }
    }

    /// Solid-colour pass: probe 16x16 blocks, extend solid areas by block
    /// then by pixel, emit them cheaply, and drop them from the work
    /// region.
    fn write_solid_rects(
        &mut self,
        pb: &dyn PixelBuffer,
        work: &mut Region,
        batch: &mut UpdateBatch,
    ) -> Result<()> {
        let rects: Vec<Rect> = work.rects().to_vec();
        for rect in rects {
            self.find_solid_rects(pb, &rect, work, batch)?;
        }
        Ok(())
    }

    fn find_solid_rects(
        &mut self,
        pb: &dyn PixelBuffer,
        bounds: &Rect,
        work: &mut Region,
        batch: &mut UpdateBatch,
    ) -> Result<()> {
        let block = SOLID_BLOCK_SIZE;
        let mut y = bounds.y;
        while y < bounds.bottom() {
            let bh = block.min((bounds.bottom() - y) as u32);
            let mut x = bounds.x;
            while x < bounds.right() {
                let bw = block.min((bounds.right() - x) as u32);
                let probe = Rect::new(x, y, bw, bh);
                x += bw as i32;

                if work.intersect_rect(&probe).area() != probe.area() {
                    continue; // already satisfied by an earlier solid
                }
                let Some(pixel) = self.probe_pixel(pb, &probe) else {
                    continue;
                };
                if !check_solid_rect(pb, &probe, &pixel) {
                    continue;
                }

                let by_block = extend_solid_area_by_block(pb, bounds, &probe, &pixel, block);
                let solid = extend_solid_area_by_pixel(pb, bounds, &by_block, &pixel);
                if solid.area() < (block as u64 * block as u64) {
                    continue;
                }

                let codec = self.select_codec(EncoderType::Solid)?;
                let mut payload = Vec::new();
                codec.write_solid_rect(
                    &pixel,
                    pb.pixel_format(),
                    solid.width as u16,
                    solid.height as u16,
                    &mut payload,
                )?;
                batch.push(header(&solid, codec.encoding()), payload);

                // Solid rects go out losslessly.
                self.lossy_region.assign_subtract_rect(solid);
                self.pending_refresh.assign_subtract_rect(solid);
                work.assign_subtract_rect(solid);
            }
            y += bh as i32;
        }
        Ok(())
    }

    fn probe_pixel(&self, pb: &dyn PixelBuffer, rect: &Rect) -> Option<Vec<u8>> {
        let mut stride = 0usize;
        let pixels = pb.get_buffer(*rect, &mut stride)?;
        let bpp = pb.pixel_format().bytes_per_pixel() as usize;
        Some(pixels[..bpp].to_vec())
    }

    /// Plain/cached per-rect pass over what remains of the damage.
    fn write_rects(
        &mut self,
        pb: &dyn PixelBuffer,
        client: &mut ClientCacheState,
        work: &Region,
        batch: &mut UpdateBatch,
    ) -> Result<()> {
        for rect in work.rects() {
            // Split oversized rects into bounded sub-rectangles.
            let w = rect.width.min(SUB_RECT_MAX_WIDTH);
            let sub_h = (SUB_RECT_MAX_AREA / w as u64).max(1) as u32;

            let mut y = rect.y;
            while y < rect.bottom() {
                let h = sub_h.min((rect.bottom() - y) as u32);
                let mut x = rect.x;
                while x < rect.right() {
                    let sw = w.min((rect.right() - x) as u32);
                    self.write_sub_rect(pb, client, &Rect::new(x, y, sw, h), batch)?;
                    x += sw as i32;
                }
                y += h as i32;
            }
        }
        Ok(())
    }

    fn write_sub_rect(
        &mut self,
        pb: &dyn PixelBuffer,
        client: &mut ClientCacheState,
        rect: &Rect,
        batch: &mut UpdateBatch,
    ) -> Result<()> {
        // Cache path for rectangles worth caching.
        if client.cache_enabled() && rect.area() >= self.config.min_cache_rect_area {
            let id = ContentHash::compute_rect_id(pb, *rect);
            if id != 0 {
                self.cache_stats.lookups += 1;
                if client.can_reference(id) {
                    self.cache_stats.hits += 1;
                    self.record_reference_savings(rect, pb);
                    batch.push(header(rect, ENCODING_CACHED_RECT), id.to_be_bytes().to_vec());
                    if !client.has_lossy_mapping(id) {
                        self.lossy_region.assign_subtract_rect(*rect);
                    }
                    self.pending_refresh.assign_subtract_rect(*rect);
                    return Ok(());
                }
                self.cache_stats.misses += 1;
                return self.write_cached_init(pb, client, rect, id, batch);
            }
        }

        self.write_plain_rect(pb, rect, batch)
    }

    fn write_cached_init(
        &mut self,
        pb: &dyn PixelBuffer,
        client: &mut ClientCacheState,
        rect: &Rect,
        id: u64,
        batch: &mut UpdateBatch,
    ) -> Result<()> {
        let (codec, encoded) = self.encode_rect(pb, rect)?;

        let mut payload = Vec::with_capacity(12 + encoded.len());
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&codec.encoding().to_be_bytes());
        payload.extend_from_slice(&encoded);
        batch.push(header(rect, ENCODING_CACHED_RECT_INIT), payload);

        client.mark_init_sent(id);
        self.cache_stats.inits_sent += 1;
        self.track_fidelity(codec, rect);
        Ok(())
    }

    fn write_plain_rect(
        &mut self,
        pb: &dyn PixelBuffer,
        rect: &Rect,
        batch: &mut UpdateBatch,
    ) -> Result<()> {
        let (codec, encoded) = self.encode_rect(pb, rect)?;
        batch.push(header(rect, codec.encoding()), encoded);
        self.track_fidelity(codec, rect);
        Ok(())
    }

    /// Analyse a rect's palette, pick the codec for its type, encode.
    fn encode_rect(&self, pb: &dyn PixelBuffer, rect: &Rect) -> Result<(Codec, Vec<u8>)> {
        let info = analyse_rect(pb, rect);
        let encoder_type = classify(&info, rect);
        let codec = self.select_codec(encoder_type)?;

        let packed = pb
            .extract_packed(*rect)
            .ok_or_else(|| anyhow!("rect {rect:?} outside framebuffer"))?;

        let mut encoded = Vec::new();
        if encoder_type == EncoderType::Solid {
            let pixel = info
                .solid_pixel
                .as_deref()
                .ok_or_else(|| anyhow!("solid classification without a probe pixel"))?;
            codec.write_solid_rect(
                pixel,
                pb.pixel_format(),
                rect.width as u16,
                rect.height as u16,
                &mut encoded,
            )?;
        } else {
            codec.write_rect(
                &packed,
                pb.pixel_format(),
                rect.width as u16,
                rect.height as u16,
                &mut encoded,
            )?;
        }
        Ok((codec, encoded))
    }

    /// Codec preference per encoder type. Each list is filtered by what
    /// the registry actually holds; Raw is the universal fallback.
    fn select_codec(&self, encoder_type: EncoderType) -> Result<Codec> {
        const TIGHT: i32 = rfb_protocol::messages::types::ENCODING_TIGHT;
        const ZRLE: i32 = rfb_protocol::messages::types::ENCODING_ZRLE;
        const HEXTILE: i32 = rfb_protocol::messages::types::ENCODING_HEXTILE;
        const RRE: i32 = rfb_protocol::messages::types::ENCODING_RRE;

        let preference: &[i32] = match encoder_type {
            EncoderType::Solid => &[RRE, ZRLE, HEXTILE, ENCODING_RAW],
            EncoderType::Bitmap | EncoderType::Indexed => &[TIGHT, ZRLE, HEXTILE, ENCODING_RAW],
            EncoderType::BitmapRle | EncoderType::IndexedRle => &[ZRLE, TIGHT, HEXTILE, ENCODING_RAW],
            EncoderType::FullColour => &[TIGHT, ZRLE, HEXTILE, ENCODING_RAW],
        };

        preference
            .iter()
            .find_map(|encoding| self.registry.get(*encoding).copied())
            .ok_or_else(|| anyhow!("no codec registered for {encoder_type:?}"))
    }

    fn track_fidelity(&mut self, codec: Codec, rect: &Rect) {
        if codec.flags() & flags::LOSSY != 0 {
            self.lossy_region.assign_union_rect(*rect);
        } else {
            self.lossy_region.assign_subtract_rect(*rect);
            self.pending_refresh.assign_subtract_rect(*rect);
        }
    }

    fn record_reference_savings(&mut self, rect: &Rect, pb: &dyn PixelBuffer) {
        let equivalent = 12 + rect.area() * pb.pixel_format().bytes_per_pixel() as u64;
        self.cache_stats.bytes_saved += equivalent.saturating_sub(20);
    }

    /// Emit CachedSeed for regions just encoded whose canonical hash the
    /// client does not know yet. Always carries the canonical hash; a
    /// client that decoded lossily will report its actual hash back.
    fn emit_seeds(
        &mut self,
        seeds: &[(Rect, u64)],
        client: &mut ClientCacheState,
        batch: &mut UpdateBatch,
    ) {
        for (rect, id) in seeds {
            if client.knows(*id) {
                continue;
            }
            batch.push(header(rect, ENCODING_CACHED_RECT_SEED), id.to_be_bytes().to_vec());
            client.mark_init_sent(*id);
            self.cache_stats.seeds_sent += 1;
            debug!("seeded {rect:?} id={id:016x}");
        }
    }

    //
    // Lossless refresh
    //

    /// Advance the quiesce timer: once damage stops arriving for the
    /// configured delay, lossy areas outside the recent churn become
    /// refresh candidates.
    pub fn handle_refresh_timer(&mut self, now: Instant) {
        let Some(deadline) = self.refresh_deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        let stale = self.lossy_region.subtract(&self.recently_changed);
        self.pending_refresh.assign_union(&stale);
        self.recently_changed.clear();
        self.refresh_deadline = None;
    }

    /// Whether any of `req` awaits a lossless re-send.
    pub fn needs_lossless_refresh(&self, req: &Region) -> bool {
        !self.pending_refresh.intersect(req).is_empty()
    }

    /// When the connection should next wake up for refresh work.
    pub fn next_refresh_due(&self) -> Option<Instant> {
        self.refresh_deadline
    }

    /// Schedule an area for refresh regardless of its lossy state.
    pub fn force_refresh(&mut self, req: &Region) {
        self.pending_refresh.assign_union(req);
    }

    /// Drop refresh state outside the given limits (framebuffer resize).
    pub fn prune_lossless_refresh(&mut self, limits: &Region) {
        self.lossy_region = self.lossy_region.intersect(limits);
        self.pending_refresh = self.pending_refresh.intersect(limits);
        self.recently_changed = self.recently_changed.intersect(limits);
    }

    /// Re-send pending-refresh areas inside `req` with strictly lossless
    /// codecs, up to roughly `max_update_bytes` of payload.
    pub fn write_lossless_refresh(
        &mut self,
        req: &Region,
        pb: &dyn PixelBuffer,
        client: &mut ClientCacheState,
        max_update_bytes: usize,
    ) -> Result<UpdateBatch> {
        let mut batch = UpdateBatch::default();
        let todo = self.pending_refresh.intersect(req);

        for rect in todo.rects() {
            if max_update_bytes > 0 && batch.wire_bytes() >= max_update_bytes {
                break;
            }
            let codec = self
                .registry
                .get(ENCODING_RAW)
                .copied()
                .ok_or_else(|| anyhow!("lossless refresh requires the Raw codec"))?;
            debug_assert_eq!(codec.flags() & flags::LOSSY, 0);

            // Refreshed content is also worth caching: send it as an init
            // so the (now lossless) pixels get a canonical id client-side.
            if client.cache_enabled() && rect.area() >= self.config.min_cache_rect_area {
                let id = ContentHash::compute_rect_id(pb, *rect);
                if id != 0 {
                    let packed = pb
                        .extract_packed(*rect)
                        .ok_or_else(|| anyhow!("refresh rect {rect:?} outside framebuffer"))?;
                    let mut encoded = Vec::new();
                    codec.write_rect(
                        &packed,
                        pb.pixel_format(),
                        rect.width as u16,
                        rect.height as u16,
                        &mut encoded,
                    )?;
                    let mut payload = Vec::with_capacity(12 + encoded.len());
                    payload.extend_from_slice(&id.to_be_bytes());
                    payload.extend_from_slice(&codec.encoding().to_be_bytes());
                    payload.extend_from_slice(&encoded);
                    batch.push(header(rect, ENCODING_CACHED_RECT_INIT), payload);
                    client.mark_init_sent(id);
                } else {
                    self.write_plain_rect(pb, rect, &mut batch)?;
                }
            } else {
                self.write_plain_rect(pb, rect, &mut batch)?;
            }

            self.pending_refresh.assign_subtract_rect(*rect);
            self.lossy_region.assign_subtract_rect(*rect);
        }
        Ok(batch)
    }

    /// End-of-session summary.
    pub fn log_stats(&self) {
        let s = &self.cache_stats;
        info!(
            "encode manager: {} updates; cache {} lookups, {} hits, {} misses, {} inits, {} seeds, ~{} bytes saved",
            self.updates, s.lookups, s.hits, s.misses, s.inits_sent, s.seeds_sent, s.bytes_saved
        );
    }
}

fn header(rect: &Rect, encoding: i32) -> Rectangle {
    Rectangle {
        x: rect.x as u16,
        y: rect.y as u16,
        width: rect.width as u16,
        height: rect.height as u16,
        encoding,
    }
}

/// Compare every pixel of `rect` against `pixel`.
fn check_solid_rect(pb: &dyn PixelBuffer, rect: &Rect, pixel: &[u8]) -> bool {
    let mut stride = 0usize;
    let Some(pixels) = pb.get_buffer(*rect, &mut stride) else {
        return false;
    };
    let bpp = pixel.len();
    let stride_bytes = stride * bpp;
    for y in 0..rect.height as usize {
        let row = &pixels[y * stride_bytes..y * stride_bytes + rect.width as usize * bpp];
        if row.chunks_exact(bpp).any(|px| px != pixel) {
            return false;
        }
    }
    true
}

/// Grow a solid block right then down in whole blocks while the colour
/// holds, staying inside `bounds`.
fn extend_solid_area_by_block(
    pb: &dyn PixelBuffer,
    bounds: &Rect,
    start: &Rect,
    pixel: &[u8],
    block: u32,
) -> Rect {
    let mut area = *start;

    loop {
        let step = block.min((bounds.right() - area.right()).max(0) as u32);
        if step == 0 {
            break;
        }
        let strip = Rect::new(area.right(), area.y, step, area.height);
        if !check_solid_rect(pb, &strip, pixel) {
            break;
        }
        area = Rect::new(area.x, area.y, area.width + step, area.height);
    }

    loop {
        let step = block.min((bounds.bottom() - area.bottom()).max(0) as u32);
        if step == 0 {
            break;
        }
        let strip = Rect::new(area.x, area.bottom(), area.width, step);
        if !check_solid_rect(pb, &strip, pixel) {
            break;
        }
        area = Rect::new(area.x, area.y, area.width, area.height + step);
    }

    area
}

/// Grow the block-extended area one pixel row/column at a time.
fn extend_solid_area_by_pixel(
    pb: &dyn PixelBuffer,
    bounds: &Rect,
    start: &Rect,
    pixel: &[u8],
) -> Rect {
    let mut area = *start;

    while area.right() < bounds.right() {
        let column = Rect::new(area.right(), area.y, 1, area.height);
        if !check_solid_rect(pb, &column, pixel) {
            break;
        }
        area = Rect::new(area.x, area.y, area.width + 1, area.height);
    }
    while area.bottom() < bounds.bottom() {
        let row = Rect::new(area.x, area.bottom(), area.width, 1);
        if !check_solid_rect(pb, &row, pixel) {
            break;
        }
        area = Rect::new(area.x, area.y, area.width, area.height + 1);
    }

    area
}

/// Palette/run analysis, capped at 256 colours.
fn analyse_rect(pb: &dyn PixelBuffer, rect: &Rect) -> RectInfo {
    let mut stride = 0usize;
    let Some(pixels) = pb.get_buffer(*rect, &mut stride) else {
        return RectInfo {
            colours: usize::MAX,
            rle_runs: 0,
            solid_pixel: None,
        };
    };
    let bpp = pb.pixel_format().bytes_per_pixel() as usize;
    let stride_bytes = stride * bpp;

    let mut palette: Vec<&[u8]> = Vec::new();
    let mut runs = 0usize;
    let mut overflow = false;

    for y in 0..rect.height as usize {
        let row = &pixels[y * stride_bytes..y * stride_bytes + rect.width as usize * bpp];
        let mut prev: Option<&[u8]> = None;
        for px in row.chunks_exact(bpp) {
            if prev != Some(px) {
                runs += 1;
                prev = Some(px);
            }
            if !overflow && !palette.contains(&px) {
                if palette.len() >= 256 {
                    overflow = true;
                } else {
                    palette.push(px);
                }
            }
        }
    }

    RectInfo {
        colours: if overflow { usize::MAX } else { palette.len() },
        rle_runs: runs,
        solid_pixel: if !overflow && palette.len() == 1 {
            Some(palette[0].to_vec())
        } else {
            None
        },
    }
}

/// The 6-type encoder table: palette size and run density pick the type.
fn classify(info: &RectInfo, rect: &Rect) -> EncoderType {
    let pixels = rect.area() as usize;
    // RLE pays off when runs are long, i.e. few runs per pixel.
    let rle_wins = info.rle_runs * 4 <= pixels;

    match info.colours {
        1 => EncoderType::Solid,
        2 => {
            if rle_wins {
                EncoderType::BitmapRle
            } else {
                EncoderType::Bitmap
            }
        }
        3..=256 => {
            if rle_wins {
                EncoderType::IndexedRle
            } else {
                EncoderType::Indexed
            }
        }
        _ => EncoderType::FullColour,
    }
}
