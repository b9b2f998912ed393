//! Server-to-client RFB messages used by the cache subsystem.

use super::types::{self, PixelFormat, Rectangle};
use crate::io::{RfbInStream, RfbOutStream};
use tokio::io::{AsyncRead, AsyncWrite};

/// ServerInit - framebuffer dimensions, native pixel format and desktop
/// name, sent once after ClientInit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub framebuffer_width: u16,
    pub framebuffer_height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
}

impl ServerInit {
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let framebuffer_width = stream.read_u16().await?;
        let framebuffer_height = stream.read_u16().await?;
        let pixel_format = PixelFormat::read_from(stream).await?;

        let name_length = stream.read_u32().await? as usize;
        // Desktop names are short; anything huge is a protocol violation.
        if name_length > 4096 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unreasonable desktop name length: {}", name_length),
            ));
        }
        let mut name_bytes = vec![0u8; name_length];
        stream.read_bytes(&mut name_bytes).await?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();

        Ok(Self {
            framebuffer_width,
            framebuffer_height,
            pixel_format,
            name,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        stream.write_u16(self.framebuffer_width);
        stream.write_u16(self.framebuffer_height);
        self.pixel_format.write_to(stream)?;
        stream.write_u32(self.name.len() as u32);
        stream.write_bytes(self.name.as_bytes());
        Ok(())
    }
}

/// FramebufferUpdate header - rectangle count followed by rectangle
/// headers. Encoding payloads (including the cache rect payloads) follow
/// each header on the wire and are consumed by the decode manager, so only
/// the headers appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferUpdate {
    pub rectangles: Vec<Rectangle>,
}

impl FramebufferUpdate {
    /// Read the count and rectangle headers. Only usable when the payloads
    /// are absent (tests, header-only traces); the real message loop reads
    /// one header at a time and hands the stream to a decoder.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        stream.skip(1).await?; // padding
        let num_rects = stream.read_u16().await? as usize;

        let mut rectangles = Vec::with_capacity(num_rects);
        for _ in 0..num_rects {
            rectangles.push(Rectangle::read_from(stream).await?);
        }
        Ok(Self { rectangles })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_u8(types::MSG_TYPE_FRAMEBUFFER_UPDATE);
        stream.write_u8(0); // padding
        stream.write_u16(self.rectangles.len() as u16);
        for rect in &self.rectangles {
            rect.write_to(stream);
        }
    }

    /// Write only the update preamble (type, padding, rect count); rect
    /// headers and payloads follow through the encode manager.
    pub fn write_header<W: AsyncWrite + Unpin>(stream: &mut RfbOutStream<W>, num_rects: u16) {
        stream.write_u8(types::MSG_TYPE_FRAMEBUFFER_UPDATE);
        stream.write_u8(0);
        stream.write_u16(num_rects);
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
    async fn server_init_round_trip() {
        let original = ServerInit {
            framebuffer_width: 1920,
            framebuffer_height: 1080,
            pixel_format: rgb888_wire(),
            name: "test desktop".to_string(),
        };

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();

        let mut inp = RfbInStream::new(Cursor::new(buffer));
        assert_eq!(ServerInit::read_from(&mut inp).await.unwrap(), original);
    }

    #[tokio::test]
    async fn framebuffer_update_headers_round_trip() {
        let original = FramebufferUpdate {
            rectangles: vec![
                Rectangle {
                    x: 0,
                    y: 0,
                    width: 64,
                    height: 64,
                    encoding: types::ENCODING_CACHED_RECT,
                },
                Rectangle {
                    x: 64,
                    y: 0,
                    width: 64,
                    height: 64,
                    encoding: types::ENCODING_RAW,
                },
            ],
        };

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out);
        out.flush().await.unwrap();

        let mut inp = RfbInStream::new(Cursor::new(buffer[1..].to_vec()));
        assert_eq!(FramebufferUpdate::read_from(&mut inp).await.unwrap(), original);
    }
}
