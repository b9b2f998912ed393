//! Owned pixel buffer backed by a `Vec<u8>`.

use crate::{MutablePixelBuffer, PixelBuffer, PixelFormat};
use anyhow::{anyhow, Result};
use rfb_common::{Point, Rect};

/// A pixel buffer that manages its own memory.
///
/// Data is stored row-major with stride equal to the width (no padding),
/// so `pixel (x, y)` starts at byte offset `(y * width + x) * bpp`. The
/// stride reported through the trait API is still expressed in pixels.
#[derive(Debug, Clone)]
pub struct ManagedPixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    /// Stride in pixels; always equals the width for this implementation.
    stride: usize,
}

impl ManagedPixelBuffer {
    /// Create a zero-initialised buffer.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let stride = width as usize;
        let bpp = format.bytes_per_pixel() as usize;
        Self {
            width,
            height,
            format,
            data: vec![0u8; stride * height as usize * bpp],
            stride,
        }
    }

    /// Build a buffer directly from tightly packed pixel data.
    ///
    /// Fails when `data` does not hold exactly `width * height` pixels.
    pub fn from_packed(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let bpp = format.bytes_per_pixel() as usize;
        let expected = width as usize * height as usize * bpp;
        if data.len() != expected {
            return Err(anyhow!(
                "packed pixel data is {} bytes, expected {} for {}x{}@{}bpp",
                data.len(),
                expected,
                width,
                height,
                format.bits_per_pixel
            ));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            stride: width as usize,
        })
    }

    /// Resize the buffer. Existing content is discarded and the new buffer
    /// is zero-initialised.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.stride = width as usize;
        let bpp = self.format.bytes_per_pixel() as usize;
        self.data.clear();
        self.data.resize(self.stride * height as usize * bpp, 0);
    }

    /// Stride in pixels (equals the width).
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Raw row-major pixel data, no padding.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The rectangle covering the whole buffer.
    pub fn full_rect(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    fn validate_rect(&self, rect: Rect) -> Result<()> {
        if rect.x < 0
            || rect.y < 0
            || rect.right() > self.width as i32
            || rect.bottom() > self.height as i32
        {
            return Err(anyhow!(
                "rectangle out of bounds: {:?} (buffer is {}x{})",
                rect,
                self.width,
                self.height
            ));
        }
        Ok(())
    }

    fn byte_range(&self, rect: Rect) -> (usize, usize) {
        let bpp = self.format.bytes_per_pixel() as usize;
        let start = (rect.y as usize * self.stride + rect.x as usize) * bpp;
        // The final row only extends to the rectangle's right edge.
        let len = if rect.height == 0 {
            0
        } else {
            (rect.height as usize - 1) * self.stride * bpp + rect.width as usize * bpp
        };
        (start, len)
    }
}

impl PixelBuffer for ManagedPixelBuffer {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn pixel_format(&self) -> &PixelFormat {
        &self.format
    }

    fn get_buffer(&self, rect: Rect, stride: &mut usize) -> Option<&[u8]> {
        self.validate_rect(rect).ok()?;
        *stride = self.stride;
        let (start, len) = self.byte_range(rect);
        Some(&self.data[start..start + len])
    }
}

impl MutablePixelBuffer for ManagedPixelBuffer {
    fn get_buffer_rw(&mut self, rect: Rect, stride: &mut usize) -> Option<&mut [u8]> {
        self.validate_rect(rect).ok()?;
        *stride = self.stride;
        let (start, len) = self.byte_range(rect);
        Some(&mut self.data[start..start + len])
    }

    fn commit_buffer(&mut self, _rect: Rect) {
        // Direct storage; nothing to flush.
    }

    fn fill_rect(&mut self, rect: Rect, pixel: &[u8]) -> Result<()> {
        self.validate_rect(rect)?;

        let bpp = self.format.bytes_per_pixel() as usize;
        if pixel.len() != bpp {
            return Err(anyhow!(
                "fill pixel is {} bytes, format needs {}",
                pixel.len(),
                bpp
            ));
        }

        for y in 0..rect.height as usize {
            let row = ((rect.y as usize + y) * self.stride + rect.x as usize) * bpp;
            for x in 0..rect.width as usize {
                let off = row + x * bpp;
                self.data[off..off + bpp].copy_from_slice(pixel);
            }
        }
        Ok(())
    }

    fn copy_rect(&mut self, dest: Rect, src_offset: Point) -> Result<()> {
        self.validate_rect(dest)?;
        let src_rect = dest.translate(src_offset);
        self.validate_rect(src_rect)?;

        let bpp = self.format.bytes_per_pixel() as usize;
        let row_bytes = dest.width as usize * bpp;

        // Row iteration order must avoid clobbering unread source rows when
        // the rectangles overlap: copy bottom-up when the source is above.
        let rows: Box<dyn Iterator<Item = usize>> = if src_offset.y < 0 {
            Box::new((0..dest.height as usize).rev())
        } else {
            Box::new(0..dest.height as usize)
        };

        for y in rows {
            let src = ((src_rect.y as usize + y) * self.stride + src_rect.x as usize) * bpp;
            let dst = ((dest.y as usize + y) * self.stride + dest.x as usize) * bpp;
            self.data.copy_within(src..src + row_bytes, dst);
        }
        Ok(())
    }

    fn image_rect(&mut self, dest: Rect, pixels: &[u8], stride: usize) -> Result<()> {
        self.validate_rect(dest)?;

        let bpp = self.format.bytes_per_pixel() as usize;
        let row_bytes = dest.width as usize * bpp;
        let src_stride = if stride == 0 {
            dest.width as usize
        } else {
            stride
        };
        let src_stride_bytes = src_stride * bpp;

        let required = if dest.height == 0 {
            0
        } else {
            src_stride_bytes * (dest.height as usize - 1) + row_bytes
        };
        if pixels.len() < required {
            return Err(anyhow!(
                "source data is {} bytes, need at least {}",
                pixels.len(),
                required
            ));
        }

        for y in 0..dest.height as usize {
            let dst = ((dest.y as usize + y) * self.stride + dest.x as usize) * bpp;
            let src = y * src_stride_bytes;
            self.data[dst..dst + row_bytes].copy_from_slice(&pixels[src..src + row_bytes]);
        }
        Ok(())
    }
}
