//! Cache protocol bandwidth statistics (client side).
//!
//! Tracks what the cache messages actually cost on the wire against an
//! estimate of what the same content would have cost re-encoded, so the
//! end-of-session log can state the saving.

use rfb_protocol::messages::types::Rectangle;

/// Aggregate bandwidth statistics for the cache protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheProtocolStats {
    /// Wire bytes spent on reference messages (CachedRect).
    pub cached_rect_bytes: u64,
    pub cached_rect_count: u32,

    /// Wire bytes spent on init messages (CachedRectInit).
    pub cached_rect_init_bytes: u64,
    pub cached_rect_init_count: u32,

    /// Estimated bytes the same updates would have cost without the cache.
    pub alternative_bytes: u64,
}

impl CacheProtocolStats {
    /// Estimated bytes saved against the no-cache baseline.
    pub fn bandwidth_saved(&self) -> u64 {
        let used = self.cached_rect_bytes + self.cached_rect_init_bytes;
        self.alternative_bytes.saturating_sub(used)
    }

    /// Estimated reduction percentage against the no-cache baseline.
    pub fn reduction_percentage(&self) -> f64 {
        let used = self.cached_rect_bytes + self.cached_rect_init_bytes;
        if self.alternative_bytes == 0 || used >= self.alternative_bytes {
            0.0
        } else {
            100.0 * (self.alternative_bytes - used) as f64 / self.alternative_bytes as f64
        }
    }

    /// Record a CachedRect reference: 12-byte header + 8-byte id on the
    /// wire, against an estimated compressed re-encode.
    pub fn track_reference(&mut self, rect: &Rectangle, bytes_per_pixel: u8) {
        let uncompressed = rect.area() * bytes_per_pixel as u64;
        self.cached_rect_bytes += 20;
        self.alternative_bytes += 16 + estimate_compressed(uncompressed);
        self.cached_rect_count += 1;
    }

    /// Record a CachedRectInit: header + id + inner encoding + payload,
    /// against the same payload without the cache preamble.
    pub fn track_init(&mut self, payload_bytes: u64) {
        self.cached_rect_init_bytes += 12 + 8 + 4 + payload_bytes;
        self.alternative_bytes += 16 + payload_bytes;
        self.cached_rect_init_count += 1;
    }

    /// Human-readable end-of-session summary line.
    pub fn format_summary(&self, label: &str) -> String {
        format!(
            "{}: {} bandwidth saving ({:.1}% reduction)",
            label,
            human_bytes(self.bandwidth_saved()),
            self.reduction_percentage(),
        )
    }
}

/// Conservative compressed-size estimate (~10:1) for the baseline.
fn estimate_compressed(uncompressed: u64) -> u64 {
    uncompressed / 10
}

/// IEC-prefixed byte formatter.
fn human_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

    let b = bytes as f64;
    if b >= GIB {
        format!("{:.3} GiB", b / GIB)
    } else if b >= MIB {
        format!("{:.3} MiB", b / MIB)
    } else if b >= KIB {
        format!("{:.3} KiB", b / KIB)
    } else {
        format!("{bytes} B")
    }
}
