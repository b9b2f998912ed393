//! Stable content-based hashing for the cache protocol.
//!
//! Uses SHA-256 truncated to 128 bits (16 bytes): low collision probability
//! at operational scales, cross-platform stability, fast computation.
//!
//! Hashing never operates on native framebuffer bytes. Every rectangle is
//! converted row by row to the canonical representation (32 bpp
//! little-endian true colour, `(r << 16) | (g << 8) | b`) and the width and
//! height are mixed into the digest ahead of the pixel rows. This makes the
//! same content produce the same key regardless of the session's native
//! pixel format, which is what allows cross-depth and cross-session cache
//! hits.

use crate::key::CacheKey;
use once_cell::sync::Lazy;
use rfb_common::Rect;
use rfb_pixelbuffer::PixelBuffer;
use sha2::{Digest, Sha256};

/// Gate for per-rectangle hash log lines (`FB_HASH_DEBUG=1`). Logging
/// only; behaviour never depends on it.
static FB_HASH_DEBUG: Lazy<bool> = Lazy::new(|| std::env::var_os("FB_HASH_DEBUG").is_some());

/// Content hashing entry points.
pub struct ContentHash;

impl ContentHash {
    /// Hash raw bytes (already in the caller's chosen domain) to a key.
    pub fn compute(data: &[u8]) -> CacheKey {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        CacheKey::from_bytes(bytes)
    }

    /// Hash a rectangle of a pixel buffer in the canonical domain.
    ///
    /// Returns the all-zero key when the rectangle cannot be read (out of
    /// bounds, zero area); callers must treat a null key as "do not cache".
    pub fn compute_rect(pb: &dyn PixelBuffer, rect: Rect) -> CacheKey {
        if rect.is_empty() {
            return CacheKey::default();
        }

        let mut stride = 0usize;
        let Some(pixels) = pb.get_buffer(rect, &mut stride) else {
            return CacheKey::default();
        };

        let pf = pb.pixel_format();
        let bpp = pf.bytes_per_pixel() as usize;
        // CRITICAL: stride is in pixels; row offsets need the byte multiply.
        let stride_bytes = stride * bpp;
        let row_bytes = rect.width as usize * bpp;

        let mut hasher = Sha256::new();
        hasher.update((rect.width as u16).to_le_bytes());
        hasher.update((rect.height as u16).to_le_bytes());

        // Fast path: native format already is the canonical layout, so rows
        // can be fed directly (minus the stride padding).
        if pf.is_rgb888() {
            for y in 0..rect.height as usize {
                let row = &pixels[y * stride_bytes..y * stride_bytes + row_bytes];
                hasher.update(row);
            }
        } else {
            let mut canonical_row = vec![0u8; rect.width as usize * 4];
            for y in 0..rect.height as usize {
                let row = &pixels[y * stride_bytes..y * stride_bytes + row_bytes];
                for (x, pixel) in row.chunks_exact(bpp).enumerate() {
                    canonical_row[x * 4..x * 4 + 4].copy_from_slice(&pf.canonical_pixel(pixel));
                }
                hasher.update(&canonical_row);
            }
        }

        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        let key = CacheKey::from_bytes(bytes);
        if *FB_HASH_DEBUG {
            tracing::debug!(
                "fb hash {:?} -> {:016x} ({}bpp)",
                rect,
                key.id(),
                pf.bits_per_pixel
            );
        }
        key
    }

    /// The 64-bit wire id for a rectangle: the key's leading lane, or 0 when
    /// hashing failed.
    pub fn compute_rect_id(pb: &dyn PixelBuffer, rect: Rect) -> u64 {
        Self::compute_rect(pb, rect).id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfb_pixelbuffer::{ManagedPixelBuffer, MutablePixelBuffer, PixelFormat};

    fn solid_buffer(pf: PixelFormat, w: u32, h: u32, rgb: [u8; 4]) -> ManagedPixelBuffer {
        let mut pb = ManagedPixelBuffer::new(w, h, pf);
        let pixel = pf.from_rgb888(rgb);
        pb.fill_rect(Rect::new(0, 0, w, h), &pixel).unwrap();
        pb
    }

    #[test]
    fn deterministic_for_identical_content() {
        let pb = solid_buffer(PixelFormat::rgb888(), 32, 32, [10, 20, 30, 255]);
        let rect = Rect::new(4, 4, 16, 16);
        assert_eq!(
            ContentHash::compute_rect(&pb, rect),
            ContentHash::compute_rect(&pb, rect)
        );
    }

    #[test]
    fn differs_for_different_content() {
        let red = solid_buffer(PixelFormat::rgb888(), 16, 16, [255, 0, 0, 255]);
        let blue = solid_buffer(PixelFormat::rgb888(), 16, 16, [0, 0, 255, 255]);
        let rect = Rect::new(0, 0, 16, 16);
        assert_ne!(
            ContentHash::compute_rect(&red, rect),
            ContentHash::compute_rect(&blue, rect)
        );
    }

    #[test]
    fn dimensions_are_part_of_the_domain() {
        // Same pixel bytes, different shape: 4x8 vs 8x4 of a solid colour.
        let pb = solid_buffer(PixelFormat::rgb888(), 8, 8, [1, 2, 3, 255]);
        let tall = ContentHash::compute_rect(&pb, Rect::new(0, 0, 4, 8));
        let wide = ContentHash::compute_rect(&pb, Rect::new(0, 0, 8, 4));
        assert_ne!(tall, wide);
    }

    #[test]
    fn cross_format_consistency() {
        // The canonical domain makes a full-intensity solid rect hash the
        // same from a 32bpp and a 16bpp framebuffer. (Full intensity avoids
        // quantisation differences between the depths.)
        let rect = Rect::new(0, 0, 8, 8);
        let pb32 = solid_buffer(PixelFormat::rgb888(), 8, 8, [255, 255, 255, 255]);
        let pb16 = solid_buffer(PixelFormat::rgb565(), 8, 8, [255, 255, 255, 255]);
        assert_eq!(
            ContentHash::compute_rect(&pb32, rect),
            ContentHash::compute_rect(&pb16, rect)
        );
    }

    #[test]
    fn stride_padding_is_ignored() {
        // Hash of a sub-rect must not depend on pixels outside it.
        let mut a = solid_buffer(PixelFormat::rgb888(), 16, 16, [9, 9, 9, 255]);
        let mut b = solid_buffer(PixelFormat::rgb888(), 16, 16, [9, 9, 9, 255]);
        let white = PixelFormat::rgb888().from_rgb888([255, 255, 255, 255]);
        // Perturb pixels to the right of the hashed rect in one buffer only.
        a.fill_rect(Rect::new(12, 0, 4, 16), &white).unwrap();
        let _ = b; // b stays untouched there

        let rect = Rect::new(0, 0, 8, 16);
        assert_eq!(
            ContentHash::compute_rect(&a, rect),
            ContentHash::compute_rect(&b, rect)
        );
    }

    #[test]
    fn out_of_bounds_yields_null_key() {
        let pb = solid_buffer(PixelFormat::rgb888(), 8, 8, [0, 0, 0, 255]);
        let key = ContentHash::compute_rect(&pb, Rect::new(4, 4, 8, 8));
        assert!(key.is_null());
        assert_eq!(ContentHash::compute_rect_id(&pb, Rect::new(4, 4, 8, 8)), 0);

        assert!(ContentHash::compute_rect(&pb, Rect::new(0, 0, 0, 0)).is_null());
    }

    #[test]
    fn raw_compute_matches_known_truncation() {
        // compute() is plain truncated SHA-256 of the input bytes.
        let key = ContentHash::compute(b"abc");
        let digest = sha2::Sha256::digest(b"abc");
        assert_eq!(&key.as_bytes()[..], &digest[..16]);
    }
}
