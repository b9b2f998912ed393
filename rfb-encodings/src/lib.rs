//! Codec interfaces for the RFB cache subsystem.
//!
//! Pixel codecs themselves (Tight, ZRLE, Hextile, ...) live outside this
//! repository; the cache core talks to them through the capability set
//! defined here: wire framing ([`Decoder::read_rect`]), CPU decode
//! ([`Decoder::decode_rect`]), encode ([`Encoder`]), ordering flags and
//! conflict queries. [`Raw`] is the one in-tree implementation; it is the
//! lossless-refresh fallback and what the tests drive the managers with.
//!
//! Codecs are distributed through an explicit [`CodecRegistry`] handed to
//! the managers, not process-wide tables: connections own their registry
//! reference, so tests and servers can register different codec sets.
//!
//! Decoding is split in two phases to match the client's thread model:
//! the network thread calls `read_rect` to pull exactly one rectangle's
//! payload off the stream, then a decode worker calls `decode_rect` with
//! those bytes against a scratch tile. Only the network thread touches the
//! socket; only workers burn CPU.

pub mod raw;
pub mod registry;

pub use raw::Raw;
pub use registry::{Codec, CodecRegistry};

use anyhow::Result;
use rfb_common::{Rect, Region};
use rfb_pixelbuffer::{ManagedPixelBuffer, PixelFormat};
use rfb_protocol::io::RfbInStream;
use rfb_protocol::messages::types::Rectangle;
use tokio::io::AsyncRead;

/// Decoder ordering and capability flags.
pub mod flags {
    /// Rectangles of this encoding must decode strictly in arrival order.
    pub const FULLY_ORDERED: u8 = 1 << 0;

    /// Ordering is constrained pairwise; consult
    /// [`Decoder::rects_conflict`](super::Decoder::rects_conflict) before
    /// overtaking.
    pub const PARTIALLY_ORDERED: u8 = 1 << 1;

    /// Payloads are expressed in the framebuffer's native format rather
    /// than the negotiated wire format.
    pub const USE_NATIVE_PIXEL_FORMAT: u8 = 1 << 2;

    /// Decoded output may legitimately differ from the encoded source
    /// (JPEG-style artifacts).
    pub const LOSSY: u8 = 1 << 3;
}

/// Wire framing and CPU decode for one encoding.
#[allow(async_fn_in_trait)]
pub trait Decoder {
    /// The RFB encoding identifier this codec handles.
    fn encoding(&self) -> i32;

    /// Capability flags ([`flags`]).
    fn flags(&self) -> u8 {
        0
    }

    /// Pull exactly this rectangle's payload off the stream into `out`.
    /// Runs on the network thread; must not do heavy computation.
    async fn read_rect<R: AsyncRead + Unpin>(
        &self,
        rect: &Rectangle,
        stream: &mut RfbInStream<R>,
        pixel_format: &PixelFormat,
        out: &mut Vec<u8>,
    ) -> Result<()>;

    /// Decode a payload previously captured by
    /// [`read_rect`](Self::read_rect) into a scratch tile sized exactly
    /// `rect.width` x `rect.height`. Runs on a decode worker.
    fn decode_rect(
        &self,
        rect: &Rectangle,
        input: &[u8],
        pixel_format: &PixelFormat,
        tile: &mut ManagedPixelBuffer,
    ) -> Result<()>;

    /// The framebuffer region this rectangle touches. Most codecs affect
    /// only the rectangle itself.
    fn affected_region(&self, rect: &Rectangle) -> Region {
        Region::from_rect(Rect::new(
            rect.x as i32,
            rect.y as i32,
            rect.width as u32,
            rect.height as u32,
        ))
    }

    /// For partially ordered codecs: whether `a` must not overtake `b`.
    fn rects_conflict(&self, _a: &Rectangle, _b: &Rectangle) -> bool {
        false
    }
}

/// Pixel encode for one encoding (server side).
pub trait Encoder {
    /// The RFB encoding identifier this codec emits.
    fn encoding(&self) -> i32;

    /// Encode packed pixels (stride equals width) into `out`.
    fn write_rect(
        &self,
        pixels: &[u8],
        pixel_format: &PixelFormat,
        width: u16,
        height: u16,
        out: &mut Vec<u8>,
    ) -> Result<()>;

    /// Encode a solid rectangle of one pixel value into `out`.
    fn write_solid_rect(
        &self,
        pixel: &[u8],
        pixel_format: &PixelFormat,
        width: u16,
        height: u16,
        out: &mut Vec<u8>,
    ) -> Result<()>;

    /// JPEG-style quality knob; ignored by lossless codecs.
    fn set_quality_level(&mut self, _quality: i32) {}

    /// Compression-effort knob; ignored where not applicable.
    fn set_compress_level(&mut self, _level: i32) {}
}
