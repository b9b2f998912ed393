//! Raw codec: uncompressed pixel data.
//!
//! The simplest encoding. The payload is `width * height * bytes_per_pixel`
//! bytes of pixels in the negotiated wire format, row-major, no padding.
//! Least efficient on the wire, cheapest to decode, and - being exactly
//! lossless - the codec the lossless-refresh pass falls back to.

use crate::{Decoder, Encoder};
use anyhow::{ensure, Context, Result};
use rfb_common::Rect;
use rfb_pixelbuffer::{ManagedPixelBuffer, MutablePixelBuffer, PixelBuffer, PixelFormat};
use rfb_protocol::io::RfbInStream;
use rfb_protocol::messages::types::{Rectangle, ENCODING_RAW};
use tokio::io::AsyncRead;

/// The Raw codec. Stateless; one instance serves every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct Raw;

impl Decoder for Raw {
    fn encoding(&self) -> i32 {
        ENCODING_RAW
    }

    async fn read_rect<R: AsyncRead + Unpin>(
        &self,
        rect: &Rectangle,
        stream: &mut RfbInStream<R>,
        pixel_format: &PixelFormat,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let total = rect.width as usize
            * rect.height as usize
            * pixel_format.bytes_per_pixel() as usize;
        out.resize(total, 0);
        stream
            .read_bytes(out)
            .await
            .context("read raw pixel payload")?;
        Ok(())
    }

    fn decode_rect(
        &self,
        rect: &Rectangle,
        input: &[u8],
        pixel_format: &PixelFormat,
        tile: &mut ManagedPixelBuffer,
    ) -> Result<()> {
        let width = rect.width as usize;
        let height = rect.height as usize;
        if width == 0 || height == 0 {
            return Ok(());
        }

        let src_bpp = pixel_format.bytes_per_pixel() as usize;
        ensure!(
            input.len() == width * height * src_bpp,
            "raw payload is {} bytes, expected {} for {}x{}@{}bpp",
            input.len(),
            width * height * src_bpp,
            width,
            height,
            pixel_format.bits_per_pixel
        );
        let (tile_w, tile_h) = tile.dimensions();
        ensure!(
            tile_w as usize == width && tile_h as usize == height,
            "decode tile is {}x{}, rect is {}x{}",
            tile_w,
            tile_h,
            width,
            height
        );

        let dest = Rect::new(0, 0, rect.width as u32, rect.height as u32);
        if *tile.pixel_format() == *pixel_format {
            tile.image_rect(dest, input, width)
                .context("blit raw pixels into tile")?;
        } else {
            // Format conversion path: pixel by pixel through RGB888.
            let dst_format = *tile.pixel_format();
            let mut converted = Vec::with_capacity(
                width * height * dst_format.bytes_per_pixel() as usize,
            );
            for src_pixel in input.chunks_exact(src_bpp) {
                let rgba = pixel_format.to_rgb888(src_pixel);
                converted.extend_from_slice(&dst_format.from_rgb888(rgba));
            }
            tile.image_rect(dest, &converted, width)
                .context("blit converted raw pixels into tile")?;
        }
        Ok(())
    }
}

impl Encoder for Raw {
    fn encoding(&self) -> i32 {
        ENCODING_RAW
    }

    fn write_rect(
        &self,
        pixels: &[u8],
        pixel_format: &PixelFormat,
        width: u16,
        height: u16,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let expected =
            width as usize * height as usize * pixel_format.bytes_per_pixel() as usize;
        ensure!(
            pixels.len() == expected,
            "raw encode input is {} bytes, expected {}",
            pixels.len(),
            expected
        );
        out.extend_from_slice(pixels);
        Ok(())
    }

    fn write_solid_rect(
        &self,
        pixel: &[u8],
        pixel_format: &PixelFormat,
        width: u16,
        height: u16,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        ensure!(
            pixel.len() == pixel_format.bytes_per_pixel() as usize,
            "solid pixel is {} bytes, format needs {}",
            pixel.len(),
            pixel_format.bytes_per_pixel()
        );
        out.reserve(width as usize * height as usize * pixel.len());
        for _ in 0..(width as usize * height as usize) {
            out.extend_from_slice(pixel);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn rect(w: u16, h: u16) -> Rectangle {
        Rectangle {
            x: 0,
            y: 0,
            width: w,
            height: h,
            encoding: ENCODING_RAW,
        }
    }

    #[tokio::test]
    async fn read_consumes_exactly_the_payload() {
        let pf = PixelFormat::rgb888();
        let mut data = vec![0xABu8; 4 * 4 * 4];
        data.extend_from_slice(&[0xFF; 8]); // trailing bytes of the next rect

        let mut stream = RfbInStream::new(Cursor::new(data));
        let mut out = Vec::new();
        Raw.read_rect(&rect(4, 4), &mut stream, &pf, &mut out)
            .await
            .unwrap();
        assert_eq!(out.len(), 64);
        assert!(out.iter().all(|&b| b == 0xAB));
        assert_eq!(stream.available(), 8);
    }

    #[test]
    fn decode_same_format_is_a_blit() {
        let pf = PixelFormat::rgb888();
        let red = pf.from_rgb888([255, 0, 0, 255]);
        let mut payload = Vec::new();
        for _ in 0..16 {
            payload.extend_from_slice(&red);
        }

        let mut tile = ManagedPixelBuffer::new(4, 4, pf);
        Raw.decode_rect(&rect(4, 4), &payload, &pf, &mut tile).unwrap();
        for px in tile.data().chunks(4) {
            assert_eq!(px, &red[..]);
        }
    }

    #[test]
    fn decode_converts_between_formats() {
        let wire_pf = PixelFormat::rgb565();
        let tile_pf = PixelFormat::rgb888();
        let white565 = wire_pf.from_rgb888([255, 255, 255, 255]);
        let mut payload = Vec::new();
        for _ in 0..4 {
            payload.extend_from_slice(&white565);
        }

        let mut tile = ManagedPixelBuffer::new(2, 2, tile_pf);
        Raw.decode_rect(&rect(2, 2), &payload, &wire_pf, &mut tile).unwrap();
        let white888 = tile_pf.from_rgb888([255, 255, 255, 255]);
        for px in tile.data().chunks(4) {
            assert_eq!(px, &white888[..]);
        }
    }

    #[test]
    fn decode_rejects_short_payload() {
        let pf = PixelFormat::rgb888();
        let mut tile = ManagedPixelBuffer::new(4, 4, pf);
        let err = Raw
            .decode_rect(&rect(4, 4), &[0u8; 10], &pf, &mut tile)
            .unwrap_err();
        assert!(err.to_string().contains("expected"));
    }

    #[test]
    fn encode_round_trips_through_decode() {
        let pf = PixelFormat::rgb888();
        let pixels: Vec<u8> = (0..4 * 4 * 4).map(|i| i as u8).collect();

        let mut payload = Vec::new();
        Raw.write_rect(&pixels, &pf, 4, 4, &mut payload).unwrap();

        let mut tile = ManagedPixelBuffer::new(4, 4, pf);
        Raw.decode_rect(&rect(4, 4), &payload, &pf, &mut tile).unwrap();
        assert_eq!(tile.data(), &pixels[..]);
    }

    #[test]
    fn solid_rect_repeats_the_pixel() {
        let pf = PixelFormat::rgb888();
        let blue = pf.from_rgb888([0, 0, 255, 255]);
        let mut payload = Vec::new();
        Raw.write_solid_rect(&blue, &pf, 3, 2, &mut payload).unwrap();
        assert_eq!(payload.len(), 3 * 2 * 4);
        for px in payload.chunks(4) {
            assert_eq!(px, &blue[..]);
        }
    }

    #[test]
    fn raw_is_unordered_and_lossless() {
        assert_eq!(Decoder::flags(&Raw), 0);
        assert_eq!(Decoder::encoding(&Raw), ENCODING_RAW);
    }
}
