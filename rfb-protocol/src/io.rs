//! Buffered I/O streams for RFB protocol communication.
//!
//! [`RfbInStream`] and [`RfbOutStream`] provide buffered reading and writing
//! with type-safe helpers for primitive types in network byte order. Data is
//! buffered internally (8 KiB by default) to minimise system calls; output is
//! only sent on [`RfbOutStream::flush`].

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const DEFAULT_BUFFER_CAPACITY: usize = 8192;

/// Buffered input stream for reading RFB protocol data.
///
/// All multi-byte reads are big-endian (network byte order).
pub struct RfbInStream<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> RfbInStream<R> {
    /// Create a new input stream with the default buffer size.
    pub fn new(reader: R) -> Self {
        Self::with_capacity(reader, DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a new input stream with a specific buffer capacity.
    pub fn with_capacity(reader: R, capacity: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Ensure at least `n` bytes are buffered, reading from the underlying
    /// reader as needed. Fails with `UnexpectedEof` if the stream ends first.
    async fn ensure_bytes(&mut self, n: usize) -> std::io::Result<()> {
        while self.buffer.len() < n {
            let bytes_read = self.reader.read_buf(&mut self.buffer).await?;
            if bytes_read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("expected {} bytes, got {}", n, self.buffer.len()),
                ));
            }
        }
        Ok(())
    }

    /// Read a single byte.
    pub async fn read_u8(&mut self) -> std::io::Result<u8> {
        self.ensure_bytes(1).await?;
        Ok(self.buffer.get_u8())
    }

    /// Read a big-endian u16.
    pub async fn read_u16(&mut self) -> std::io::Result<u16> {
        self.ensure_bytes(2).await?;
        Ok(self.buffer.get_u16())
    }

    /// Read a big-endian u32.
    pub async fn read_u32(&mut self) -> std::io::Result<u32> {
        self.ensure_bytes(4).await?;
        Ok(self.buffer.get_u32())
    }

    /// Read a big-endian u64 (cache ids are 64-bit on the wire).
    pub async fn read_u64(&mut self) -> std::io::Result<u64> {
        self.ensure_bytes(8).await?;
        Ok(self.buffer.get_u64())
    }

    /// Read a big-endian i32 (encoding identifiers are signed).
    pub async fn read_i32(&mut self) -> std::io::Result<i32> {
        self.ensure_bytes(4).await?;
        Ok(self.buffer.get_i32())
    }

    /// Read exactly `buf.len()` bytes.
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.ensure_bytes(buf.len()).await?;
        self.buffer.copy_to_slice(buf);
        Ok(())
    }

    /// Skip `n` bytes.
    pub async fn skip(&mut self, n: usize) -> std::io::Result<()> {
        self.ensure_bytes(n).await?;
        self.buffer.advance(n);
        Ok(())
    }

    /// Number of bytes readable without performing I/O.
    pub fn available(&self) -> usize {
        self.buffer.len()
    }

    /// Consume the stream and return the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Buffered output stream for writing RFB protocol data.
///
/// All multi-byte writes are big-endian. Writes accumulate in the internal
/// buffer; nothing reaches the wire until [`flush`](Self::flush).
pub struct RfbOutStream<W> {
    writer: W,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> RfbOutStream<W> {
    /// Create a new output stream with the default buffer size.
    pub fn new(writer: W) -> Self {
        Self::with_capacity(writer, DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a new output stream with a specific buffer capacity.
    pub fn with_capacity(writer: W, capacity: usize) -> Self {
        Self {
            writer,
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Buffer a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    /// Buffer a big-endian u16.
    pub fn write_u16(&mut self, value: u16) {
        self.buffer.put_u16(value);
    }

    /// Buffer a big-endian u32.
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.put_u32(value);
    }

    /// Buffer a big-endian u64.
    pub fn write_u64(&mut self, value: u64) {
        self.buffer.put_u64(value);
    }

    /// Buffer a big-endian i32.
    pub fn write_i32(&mut self, value: i32) {
        self.buffer.put_i32(value);
    }

    /// Buffer a byte slice.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Write all buffered data to the underlying writer and flush it.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            self.writer.write_all(&self.buffer).await?;
            self.buffer.clear();
        }
        self.writer.flush().await
    }

    /// Number of bytes waiting to be flushed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Consume the stream and return the underlying writer. Buffered data
    /// that has not been flushed is lost.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
