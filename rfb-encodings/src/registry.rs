//! Codec dispatch table.
//!
//! [`Codec`] is a sum type over the codecs a build knows about, giving the
//! managers one concrete value to store per encoding while keeping the
//! decode path free of boxed futures. [`CodecRegistry`] maps encoding
//! identifiers to codecs and is passed into the managers explicitly
//! (dependency injection; there is no process-wide codec table).

use crate::raw::Raw;
use crate::{Decoder, Encoder};
use anyhow::Result;
use rfb_common::Region;
use rfb_pixelbuffer::{ManagedPixelBuffer, PixelFormat};
use rfb_protocol::io::RfbInStream;
use rfb_protocol::messages::types::Rectangle;
use std::collections::HashMap;
use tokio::io::AsyncRead;

/// One registered codec. Out-of-tree codecs (Tight, ZRLE, ...) plug in as
/// further variants.
#[derive(Debug, Clone, Copy)]
pub enum Codec {
    Raw(Raw),
}

impl Codec {
    /// The RFB encoding identifier.
    pub fn encoding(&self) -> i32 {
        match self {
            Codec::Raw(codec) => Decoder::encoding(codec),
        }
    }

    /// Ordering/capability flags ([`crate::flags`]).
    pub fn flags(&self) -> u8 {
        match self {
            Codec::Raw(codec) => Decoder::flags(codec),
        }
    }

    /// Whether decoded pixels may legitimately differ from the source.
    pub fn is_lossy(&self) -> bool {
        self.flags() & crate::flags::LOSSY != 0
    }

    /// Pull one rectangle's payload off the stream (network thread).
    pub async fn read_rect<R: AsyncRead + Unpin>(
        &self,
        rect: &Rectangle,
        stream: &mut RfbInStream<R>,
        pixel_format: &PixelFormat,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        match self {
            Codec::Raw(codec) => codec.read_rect(rect, stream, pixel_format, out).await,
        }
    }

    /// Decode a captured payload into a scratch tile (worker thread).
    pub fn decode_rect(
        &self,
        rect: &Rectangle,
        input: &[u8],
        pixel_format: &PixelFormat,
        tile: &mut ManagedPixelBuffer,
    ) -> Result<()> {
        match self {
            Codec::Raw(codec) => codec.decode_rect(rect, input, pixel_format, tile),
        }
    }

    /// The framebuffer region this rectangle touches.
    pub fn affected_region(&self, rect: &Rectangle) -> Region {
        match self {
            Codec::Raw(codec) => Decoder::affected_region(codec, rect),
        }
    }

    /// Pairwise ordering constraint for partially ordered codecs.
    pub fn rects_conflict(&self, a: &Rectangle, b: &Rectangle) -> bool {
        match self {
            Codec::Raw(codec) => codec.rects_conflict(a, b),
        }
    }

    /// Encode packed pixels into `out` (server side).
    pub fn write_rect(
        &self,
        pixels: &[u8],
        pixel_format: &PixelFormat,
        width: u16,
        height: u16,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        match self {
            Codec::Raw(codec) => codec.write_rect(pixels, pixel_format, width, height, out),
        }
    }

    /// Encode a solid rectangle into `out` (server side).
    pub fn write_solid_rect(
        &self,
        pixel: &[u8],
        pixel_format: &PixelFormat,
        width: u16,
        height: u16,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        match self {
            Codec::Raw(codec) => codec.write_solid_rect(pixel, pixel_format, width, height, out),
        }
    }
}

/// Encoding identifier -> codec table, owned by whoever builds the
/// connection and borrowed by the managers.
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<i32, Codec>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry every connection starts from: just Raw. Real viewers
    /// register their full codec set on top.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Codec::Raw(Raw));
        registry
    }

    /// Register (or replace) a codec under its encoding identifier.
    pub fn register(&mut self, codec: Codec) {
        self.codecs.insert(codec.encoding(), codec);
    }

    /// Look up the codec for an encoding.
    pub fn get(&self, encoding: i32) -> Option<&Codec> {
        self.codecs.get(&encoding)
    }

    /// Whether an encoding is decodable with this registry.
    pub fn supports(&self, encoding: i32) -> bool {
        self.codecs.contains_key(&encoding)
    }

    /// All registered encoding identifiers, sorted.
    pub fn encodings(&self) -> Vec<i32> {
        let mut encodings: Vec<i32> = self.codecs.keys().copied().collect();
        encodings.sort_unstable();
        encodings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfb_protocol::messages::types::ENCODING_RAW;

    #[test]
    fn standard_registry_has_raw() {
        let registry = CodecRegistry::standard();
        assert!(registry.supports(ENCODING_RAW));
        assert!(!registry.supports(7));
        assert_eq!(registry.encodings(), vec![ENCODING_RAW]);
    }

    #[test]
    fn register_replaces() {
        let mut registry = CodecRegistry::new();
        registry.register(Codec::Raw(Raw));
        registry.register(Codec::Raw(Raw));
        assert_eq!(registry.encodings().len(), 1);
    }

    #[test]
    fn codec_dispatch_reaches_raw() {
        let codec = Codec::Raw(Raw);
        assert_eq!(codec.encoding(), ENCODING_RAW);
        assert!(!codec.is_lossy());

        let rect = Rectangle {
            x: 10,
            y: 20,
            width: 4,
            height: 4,
            encoding: ENCODING_RAW,
        };
        let region = codec.affected_region(&rect);
        assert_eq!(region.bounding_rect(), rfb_common::Rect::new(10, 20, 4, 4));
        assert!(!codec.rects_conflict(&rect, &rect));
    }
}
