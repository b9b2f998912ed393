//! Core RFB protocol types and wire constants.

use crate::io::{RfbInStream, RfbOutStream};
use tokio::io::{AsyncRead, AsyncWrite};

//
// Encoding type constants
//

/// Raw encoding - uncompressed pixel data.
pub const ENCODING_RAW: i32 = 0;

/// CopyRect encoding - copy from another screen region.
pub const ENCODING_COPYRECT: i32 = 1;

/// RRE (Rise-and-Run-length Encoding).
pub const ENCODING_RRE: i32 = 2;

/// Hextile encoding - 16x16 tile-based compression.
pub const ENCODING_HEXTILE: i32 = 5;

/// Tight encoding - JPEG and zlib compression. The only standard encoding
/// that can be lossy.
pub const ENCODING_TIGHT: i32 = 7;

/// ZRLE (Zlib Run-Length Encoding).
pub const ENCODING_ZRLE: i32 = 16;

/// Pseudo-encoding: last rectangle marker in a framebuffer update.
pub const PSEUDO_ENCODING_LAST_RECT: i32 = -224;

//
// Cache extension encodings (server -> client, inside FramebufferUpdate)
//

/// CachedRect: reference to content the client already holds. Payload after
/// the rectangle header is the 8-byte cache id only.
pub const ENCODING_CACHED_RECT: i32 = 100;

/// CachedRectInit: cache id + inner encoding + encoded pixel data. Seeds the
/// client cache while also painting the rectangle.
pub const ENCODING_CACHED_RECT_INIT: i32 = 101;

/// CachedRectSeed: associate the pixels already present in the client
/// framebuffer at this rectangle with a cache id. No pixel payload.
pub const ENCODING_CACHED_RECT_SEED: i32 = 102;

//
// Cache extension pseudo-encodings (negotiation)
//

/// Advertises support for the disk-backed persistent cache protocol.
pub const PSEUDO_ENCODING_PERSISTENT_CACHE: i32 = -321;

/// Advertises support for the session-only content cache alias.
pub const PSEUDO_ENCODING_CONTENT_CACHE: i32 = -320;

//
// Cache extension client message types (client -> server)
//

/// RequestCachedData: ask the server to resend pixels for a cache id.
pub const MSG_TYPE_REQUEST_CACHED_DATA: u8 = 244;

/// CacheEviction: notify the server that the client dropped these ids.
pub const MSG_TYPE_CACHE_EVICTION: u8 = 245;

/// PersistentCacheQuery: ask whether the server still holds these ids.
pub const MSG_TYPE_PERSISTENT_CACHE_QUERY: u8 = 246;

/// LossyHashReport: canonical -> actual id mapping after a lossy decode.
pub const MSG_TYPE_LOSSY_HASH_REPORT: u8 = 247;

/// PersistentHashList: advertisement of ids surviving from a prior session.
pub const MSG_TYPE_PERSISTENT_HASH_LIST: u8 = 248;

/// DebugDumpRequest: coordinate a post-mortem cache state dump.
pub const MSG_TYPE_DEBUG_DUMP_REQUEST: u8 = 249;

//
// Standard client message types used by this subsystem
//

/// SetPixelFormat client message.
pub const MSG_TYPE_SET_PIXEL_FORMAT: u8 = 0;

/// SetEncodings client message.
pub const MSG_TYPE_SET_ENCODINGS: u8 = 2;

/// FramebufferUpdateRequest client message.
pub const MSG_TYPE_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// FramebufferUpdate server message.
pub const MSG_TYPE_FRAMEBUFFER_UPDATE: u8 = 0;

/// True when the encoding may legitimately decode to different pixels than
/// were encoded (JPEG artifacts). Hash mismatches under any other encoding
/// indicate corruption.
pub const fn encoding_can_be_lossy(encoding: i32) -> bool {
    encoding == ENCODING_TIGHT
}

/// RFB pixel format specification as carried on the wire (16 bytes).
///
/// Layout: bpp, depth, big_endian, true_color (1 byte each), red/green/blue
/// max (u16 each), red/green/blue shift (1 byte each), 3 zero padding bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: u8, // Boolean: must be 0 or 1
    pub true_color: u8, // Boolean: must be 0 or 1
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// Bytes per pixel (1, 2, 3, or 4).
    pub fn bytes_per_pixel(&self) -> u8 {
        self.bits_per_pixel.div_ceil(8)
    }

    /// Read a PixelFormat, validating booleans and padding strictly.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let bits_per_pixel = stream.read_u8().await?;
        let depth = stream.read_u8().await?;
        let big_endian = stream.read_u8().await?;
        let true_color = stream.read_u8().await?;

        if big_endian > 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("big_endian must be 0 or 1, got {}", big_endian),
            ));
        }
        if true_color > 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("true_color must be 0 or 1, got {}", true_color),
            ));
        }

        let red_max = stream.read_u16().await?;
        let green_max = stream.read_u16().await?;
        let blue_max = stream.read_u16().await?;
        let red_shift = stream.read_u8().await?;
        let green_shift = stream.read_u8().await?;
        let blue_shift = stream.read_u8().await?;

        let mut padding = [0u8; 3];
        stream.read_bytes(&mut padding).await?;
        if padding != [0, 0, 0] {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("padding must be zero, got {:?}", padding),
            ));
        }

        Ok(Self {
            bits_per_pixel,
            depth,
            big_endian,
            true_color,
            red_max,
            green_max,
            blue_max,
            red_shift,
            green_shift,
            blue_shift,
        })
    }

    /// Write this PixelFormat to an output stream.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.big_endian > 1 || self.true_color > 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "boolean fields must be 0 or 1",
            ));
        }

        stream.write_u8(self.bits_per_pixel);
        stream.write_u8(self.depth);
        stream.write_u8(self.big_endian);
        stream.write_u8(self.true_color);
        stream.write_u16(self.red_max);
        stream.write_u16(self.green_max);
        stream.write_u16(self.blue_max);
        stream.write_u8(self.red_shift);
        stream.write_u8(self.green_shift);
        stream.write_u8(self.blue_shift);
        stream.write_u8(0);
        stream.write_u8(0);
        stream.write_u8(0);
        Ok(())
    }
}

/// Rectangle header for framebuffer updates (12 bytes on the wire:
/// x, y, width, height as u16, then a signed 32-bit encoding).
///
/// Only the header is parsed here; the encoding-specific payload is consumed
/// by the matching decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rectangle {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
}

impl Rectangle {
    /// Read a rectangle header.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            x: stream.read_u16().await?,
            y: stream.read_u16().await?,
            width: stream.read_u16().await?,
            height: stream.read_u16().await?,
            encoding: stream.read_i32().await?,
        })
    }

    /// Write a rectangle header.
    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_u16(self.x);
        stream.write_u16(self.y);
        stream.write_u16(self.width);
        stream.write_u16(self.height);
        stream.write_i32(self.encoding);
    }

    /// Pixel area of this rectangle.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn rgb888_wire() -> PixelFormat {
        PixelFormat {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: 0,
            true_color: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    #[tokio::test]
    async fn pixelformat_round_trip() {
        let original = rgb888_wire();

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 16);

        let mut inp = RfbInStream::new(Cursor::new(buffer));
        let read_back = PixelFormat::read_from(&mut inp).await.unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn pixelformat_invalid_boolean_rejected() {
        let data = vec![
            32, 24, 2, 1, // big_endian = 2 is invalid
            0, 255, 0, 255, 0, 255, 16, 8, 0, 0, 0, 0,
        ];
        let mut stream = RfbInStream::new(Cursor::new(data));
        assert!(PixelFormat::read_from(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn pixelformat_nonzero_padding_rejected() {
        let data = vec![
            32, 24, 0, 1, 0, 255, 0, 255, 0, 255, 16, 8, 0, //
            1, 0, 0, // padding must be zero
        ];
        let mut stream = RfbInStream::new(Cursor::new(data));
        assert!(PixelFormat::read_from(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn rectangle_round_trip() {
        let original = Rectangle {
            x: 100,
            y: 200,
            width: 640,
            height: 480,
            encoding: ENCODING_CACHED_RECT,
        };

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out);
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 12);

        let mut inp = RfbInStream::new(Cursor::new(buffer));
        assert_eq!(Rectangle::read_from(&mut inp).await.unwrap(), original);
    }

    #[test]
    fn lossy_classification() {
        assert!(encoding_can_be_lossy(ENCODING_TIGHT));
        assert!(!encoding_can_be_lossy(ENCODING_RAW));
        assert!(!encoding_can_be_lossy(ENCODING_ZRLE));
        assert!(!encoding_can_be_lossy(ENCODING_HEXTILE));
    }
}
