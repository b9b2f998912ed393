//! Client-to-server RFB messages used by the cache subsystem.

use super::types::{self, PixelFormat};
use crate::io::{RfbInStream, RfbOutStream};
use tokio::io::{AsyncRead, AsyncWrite};

/// ClientInit - sent after the security handshake; asks for a shared or
/// exclusive session. Wire format: one boolean byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInit {
    pub shared: bool,
}

impl ClientInit {
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let shared_flag = stream.read_u8().await?;
        if shared_flag > 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("shared flag must be 0 or 1, got {}", shared_flag),
            ));
        }
        Ok(Self {
            shared: shared_flag == 1,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_u8(u8::from(self.shared));
    }
}

/// SetPixelFormat - switch the session's framebuffer format.
///
/// Wire format: type (0), 3 padding bytes, 16-byte PixelFormat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetPixelFormat {
    pub pixel_format: PixelFormat,
}

impl SetPixelFormat {
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        stream.skip(3).await?; // padding
        Ok(Self {
            pixel_format: PixelFormat::read_from(stream).await?,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        stream.write_u8(types::MSG_TYPE_SET_PIXEL_FORMAT);
        stream.write_u8(0);
        stream.write_u8(0);
        stream.write_u8(0);
        self.pixel_format.write_to(stream)
    }
}

/// SetEncodings - declare supported encodings in preference order. This is
/// where the cache pseudo-encodings (-321, -320) are advertised.
///
/// Wire format: type (2), 1 padding byte, u16 count, count signed i32s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetEncodings {
    pub encodings: Vec<i32>,
}

impl SetEncodings {
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        stream.skip(1).await?; // padding
        let num_encodings = stream.read_u16().await? as usize;

        let mut encodings = Vec::with_capacity(num_encodings);
        for _ in 0..num_encodings {
            encodings.push(stream.read_i32().await?);
        }
        Ok(Self { encodings })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_u8(types::MSG_TYPE_SET_ENCODINGS);
        stream.write_u8(0); // padding
        stream.write_u16(self.encodings.len() as u16);
        for encoding in &self.encodings {
            stream.write_i32(*encoding);
        }
    }

    /// True when this advertisement enables the cache protocol (either the
    /// persistent pseudo-encoding or the session-only alias).
    pub fn negotiates_cache(&self) -> bool {
        self.encodings.iter().any(|&e| {
            e == types::PSEUDO_ENCODING_PERSISTENT_CACHE
                || e == types::PSEUDO_ENCODING_CONTENT_CACHE
        })
    }
}

/// FramebufferUpdateRequest - ask the server for an update of a region.
///
/// Wire format: type (3), incremental flag, x, y, width, height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferUpdateRequest {
    pub incremental: bool,
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl FramebufferUpdateRequest {
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let incremental = stream.read_u8().await?;
        if incremental > 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("incremental flag must be 0 or 1, got {}", incremental),
            ));
        }
        Ok(Self {
            incremental: incremental == 1,
            x: stream.read_u16().await?,
            y: stream.read_u16().await?,
            width: stream.read_u16().await?,
            height: stream.read_u16().await?,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_u8(types::MSG_TYPE_FRAMEBUFFER_UPDATE_REQUEST);
        stream.write_u8(u8::from(self.incremental));
        stream.write_u16(self.x);
        stream.write_u16(self.y);
        stream.write_u16(self.width);
        stream.write_u16(self.height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn set_encodings_round_trip() {
        let original = SetEncodings {
            encodings: vec![
                types::ENCODING_RAW,
                types::ENCODING_COPYRECT,
                types::PSEUDO_ENCODING_PERSISTENT_CACHE,
                types::PSEUDO_ENCODING_CONTENT_CACHE,
            ],
        };
        assert!(original.negotiates_cache());

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out);
        out.flush().await.unwrap();

        assert_eq!(buffer[0], types::MSG_TYPE_SET_ENCODINGS);
        let mut inp = RfbInStream::new(Cursor::new(buffer[1..].to_vec()));
        assert_eq!(SetEncodings::read_from(&mut inp).await.unwrap(), original);
    }

    #[tokio::test]
    async fn set_encodings_without_cache_pseudo() {
        let msg = SetEncodings {
            encodings: vec![types::ENCODING_RAW, types::ENCODING_ZRLE],
        };
        assert!(!msg.negotiates_cache());
    }

    #[tokio::test]
    async fn update_request_round_trip() {
        let original = FramebufferUpdateRequest {
            incremental: true,
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
        };

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out);
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 10);

        let mut inp = RfbInStream::new(Cursor::new(buffer[1..].to_vec()));
        assert_eq!(
            FramebufferUpdateRequest::read_from(&mut inp).await.unwrap(),
            original
        );
    }

    #[tokio::test]
    async fn client_init_flag_validated() {
        let mut inp = RfbInStream::new(Cursor::new(vec![2u8]));
        assert!(ClientInit::read_from(&mut inp).await.is_err());
    }
}
