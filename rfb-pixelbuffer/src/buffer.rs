//! Pixel buffer access traits.
//!
//! Two traits cover framebuffer access:
//!
//! - [`PixelBuffer`]: read-only access to pixel data
//! - [`MutablePixelBuffer`]: read-write access with rendering operations
//!
//! # Critical: Stride is in Pixels, Not Bytes!
//!
//! All stride values in this API are measured in **pixels**, not bytes.
//! Byte offsets are computed as `(y * stride + x) * bytes_per_pixel`, and a
//! region's byte length as `height * stride * bytes_per_pixel`. Omitting
//! the bytes-per-pixel multiply caused hash collisions and corruption in an
//! earlier implementation; every consumer of these traits must respect it.

use crate::PixelFormat;
use anyhow::Result;
use rfb_common::{Point, Rect};

/// Read-only pixel buffer access.
///
/// The slice returned by [`get_buffer`](Self::get_buffer) starts at the
/// rectangle's top-left pixel but rows are `stride` pixels apart, so it may
/// span more data than the rectangle itself.
pub trait PixelBuffer {
    /// Buffer dimensions as (width, height) in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// The pixel format of this buffer.
    fn pixel_format(&self) -> &PixelFormat;

    /// Read-only access to a rectangular region.
    ///
    /// On success, `stride` receives the row stride in **pixels** and the
    /// returned slice covers `[rect top-left .. rect bottom-right]` with
    /// that stride. Returns `None` for out-of-bounds rectangles.
    fn get_buffer(&self, rect: Rect, stride: &mut usize) -> Option<&[u8]>;

    /// Copy a rectangle's pixels into a tightly packed row-major buffer,
    /// dropping the inter-row stride padding. Returns `None` for
    /// out-of-bounds rectangles.
    fn extract_packed(&self, rect: Rect) -> Option<Vec<u8>> {
        let mut stride = 0usize;
        let pixels = self.get_buffer(rect, &mut stride)?;
        let bpp = self.pixel_format().bytes_per_pixel() as usize;
        let row_bytes = rect.width as usize * bpp;
        let stride_bytes = stride * bpp;

        let mut packed = Vec::with_capacity(rect.height as usize * row_bytes);
        for y in 0..rect.height as usize {
            let start = y * stride_bytes;
            packed.extend_from_slice(&pixels[start..start + row_bytes]);
        }
        Some(packed)
    }
}

/// Mutable pixel buffer with rendering operations.
///
/// For direct manipulation, pair [`get_buffer_rw`](Self::get_buffer_rw)
/// with [`commit_buffer`](Self::commit_buffer). The high-level operations
/// ([`fill_rect`](Self::fill_rect), [`copy_rect`](Self::copy_rect),
/// [`image_rect`](Self::image_rect)) are what decoders normally use.
pub trait MutablePixelBuffer: PixelBuffer {
    /// Read-write access to a rectangular region; same stride convention as
    /// [`PixelBuffer::get_buffer`]. Callers must `commit_buffer()` the same
    /// rectangle when done.
    fn get_buffer_rw(&mut self, rect: Rect, stride: &mut usize) -> Option<&mut [u8]>;

    /// Finalise changes made through `get_buffer_rw`.
    fn commit_buffer(&mut self, rect: Rect);

    /// Fill a rectangle with a solid pixel value (native format bytes).
    fn fill_rect(&mut self, rect: Rect, pixel: &[u8]) -> Result<()>;

    /// Copy a rectangle within the buffer. `src_offset` is the offset from
    /// the destination to the source; overlapping regions are handled.
    fn copy_rect(&mut self, dest: Rect, src_offset: Point) -> Result<()>;

    /// Blit external pixel data into a rectangle. `stride` is the source
    /// stride in **pixels**; 0 means tightly packed.
    fn image_rect(&mut self, dest: Rect, pixels: &[u8], stride: usize) -> Result<()>;
}
