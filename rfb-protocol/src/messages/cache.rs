//! Cache extension wire messages.
//!
//! # Protocol Flow
//!
//! 1. **First time content appears**: the server sends [`CachedRectInit`]
//!    with the cache id, the inner encoding, and encoded pixel data. The
//!    client decodes, stores the pixels, and recomputes the hash of what it
//!    actually decoded; if that differs (lossy inner encoding) it sends a
//!    [`LossyHashReport`] so the server learns the canonical->actual
//!    mapping.
//!
//! 2. **Content repeats**: the server sends [`CachedRect`] with only the
//!    cache id (20 bytes including the rectangle header). The client blits
//!    the cached pixels.
//!
//! 3. **Cache miss**: the client batches ids into [`PersistentCacheQuery`]
//!    or asks for a fresh copy with [`RequestCachedData`]; the server clears
//!    its client-knows state for the id and re-sends a `CachedRectInit`.
//!
//! 4. **Opportunistic caching**: [`CachedRectSeed`] tells the client to
//!    associate the pixels already in its framebuffer with an id; no pixel
//!    payload is carried.
//!
//! 5. **Session resume**: after the security handshake, a client with a
//!    warm persistent cache advertises its ids in [`PersistentHashList`]
//!    chunks. The server treats these ids exactly as if it had just sent a
//!    `CachedRectInit` for each.
//!
//! 6. **Eviction**: ids dropped by the client-side cache are reported in
//!    batched [`CacheEviction`] messages so the server stops emitting
//!    references to them.
//!
//! All cache ids are 8-byte big-endian canonical ids; id 0 is reserved and
//! rejected everywhere.

use super::types;
use crate::io::{RfbInStream, RfbOutStream};
use tokio::io::{AsyncRead, AsyncWrite};

/// Largest id batch accepted in a single eviction/query/hash-list message.
/// Bounds allocation when parsing untrusted input.
pub const MAX_IDS_PER_MESSAGE: usize = 1000;

fn invalid_data(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

fn check_nonzero_id(cache_id: u64, context: &str) -> std::io::Result<()> {
    if cache_id == 0 {
        return Err(invalid_data(format!("{context}: cache id must be non-zero")));
    }
    Ok(())
}

async fn read_id_batch<R: AsyncRead + Unpin>(
    stream: &mut RfbInStream<R>,
    context: &str,
) -> std::io::Result<Vec<u64>> {
    let count = stream.read_u16().await? as usize;
    if count > MAX_IDS_PER_MESSAGE {
        return Err(invalid_data(format!(
            "{context}: id count {count} exceeds limit {MAX_IDS_PER_MESSAGE}"
        )));
    }
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let id = stream.read_u64().await?;
        check_nonzero_id(id, context)?;
        ids.push(id);
    }
    Ok(ids)
}

fn write_id_batch<W: AsyncWrite + Unpin>(
    stream: &mut RfbOutStream<W>,
    ids: &[u64],
    context: &str,
) -> std::io::Result<()> {
    if ids.len() > MAX_IDS_PER_MESSAGE {
        return Err(invalid_data(format!(
            "{context}: id count {} exceeds limit {MAX_IDS_PER_MESSAGE}",
            ids.len()
        )));
    }
    stream.write_u16(ids.len() as u16);
    for &id in ids {
        check_nonzero_id(id, context)?;
        stream.write_u64(id);
    }
    Ok(())
}

/// CachedRect - reference to already-cached content (S->C rect payload).
///
/// Payload after the 12-byte rectangle header: 8-byte cache id. Nothing
/// else; the whole rectangle costs 20 bytes against kilobytes for a
/// re-encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRect {
    /// Canonical content id. Must be non-zero.
    pub cache_id: u64,
}

impl CachedRect {
    pub fn new(cache_id: u64) -> Self {
        debug_assert_ne!(cache_id, 0, "cache id must be non-zero");
        Self { cache_id }
    }

    /// Read the payload (the rectangle header is read separately).
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let cache_id = stream.read_u64().await?;
        check_nonzero_id(cache_id, "CachedRect")?;
        Ok(Self { cache_id })
    }

    /// Write the payload (the rectangle header is written separately).
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        check_nonzero_id(self.cache_id, "CachedRect")?;
        stream.write_u64(self.cache_id);
        Ok(())
    }
}

/// CachedRectInit - initial transmission with cache id and encoded pixels
/// (S->C rect payload).
///
/// Payload after the rectangle header: 8-byte cache id, 4-byte inner
/// encoding, then the inner encoding's pixel data (consumed by the matching
/// decoder, not here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRectInit {
    /// Canonical content id to store the decoded pixels under.
    pub cache_id: u64,

    /// Encoding of the pixel data that follows. Must not itself be a cache
    /// encoding (no recursive caching).
    pub inner_encoding: i32,
}

impl CachedRectInit {
    pub fn new(cache_id: u64, inner_encoding: i32) -> Self {
        debug_assert_ne!(cache_id, 0, "cache id must be non-zero");
        debug_assert!(
            !is_cache_encoding(inner_encoding),
            "inner encoding cannot be a cache encoding"
        );
        Self {
            cache_id,
            inner_encoding,
        }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let cache_id = stream.read_u64().await?;
        let inner_encoding = stream.read_i32().await?;

        check_nonzero_id(cache_id, "CachedRectInit")?;
        if is_cache_encoding(inner_encoding) {
            return Err(invalid_data(format!(
                "CachedRectInit inner encoding cannot be a cache encoding, got {inner_encoding}"
            )));
        }

        Ok(Self {
            cache_id,
            inner_encoding,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        check_nonzero_id(self.cache_id, "CachedRectInit")?;
        if is_cache_encoding(self.inner_encoding) {
            return Err(invalid_data(format!(
                "CachedRectInit inner encoding cannot be a cache encoding, got {}",
                self.inner_encoding
            )));
        }
        stream.write_u64(self.cache_id);
        stream.write_i32(self.inner_encoding);
        Ok(())
    }
}

/// CachedRectSeed - associate existing framebuffer pixels with a cache id
/// (S->C rect payload). Same shape as [`CachedRect`]; the distinction is the
/// rectangle header's encoding value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRectSeed {
    /// Canonical content id computed by the server for this rectangle.
    pub cache_id: u64,
}

impl CachedRectSeed {
    pub fn new(cache_id: u64) -> Self {
        debug_assert_ne!(cache_id, 0, "cache id must be non-zero");
        Self { cache_id }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let cache_id = stream.read_u64().await?;
        check_nonzero_id(cache_id, "CachedRectSeed")?;
        Ok(Self { cache_id })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        check_nonzero_id(self.cache_id, "CachedRectSeed")?;
        stream.write_u64(self.cache_id);
        Ok(())
    }
}

/// True for the three cache rect encodings.
pub fn is_cache_encoding(encoding: i32) -> bool {
    matches!(
        encoding,
        types::ENCODING_CACHED_RECT
            | types::ENCODING_CACHED_RECT_INIT
            | types::ENCODING_CACHED_RECT_SEED
    )
}

/// RequestCachedData - client asks the server to resend the pixels for an
/// id it could not satisfy (C->S message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCachedData {
    pub cache_id: u64,
}

impl RequestCachedData {
    pub fn new(cache_id: u64) -> Self {
        debug_assert_ne!(cache_id, 0, "cache id must be non-zero");
        Self { cache_id }
    }

    /// Read the body; the type octet has already been consumed.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let cache_id = stream.read_u64().await?;
        check_nonzero_id(cache_id, "RequestCachedData")?;
        Ok(Self { cache_id })
    }

    /// Write the full message including the type octet.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        check_nonzero_id(self.cache_id, "RequestCachedData")?;
        stream.write_u8(types::MSG_TYPE_REQUEST_CACHED_DATA);
        stream.write_u64(self.cache_id);
        Ok(())
    }
}

/// CacheEviction - batched notification that the client dropped these ids
/// (C->S message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEviction {
    pub ids: Vec<u64>,
}

impl CacheEviction {
    pub fn new(ids: Vec<u64>) -> Self {
        Self { ids }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            ids: read_id_batch(stream, "CacheEviction").await?,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        stream.write_u8(types::MSG_TYPE_CACHE_EVICTION);
        write_id_batch(stream, &self.ids, "CacheEviction")
    }
}

/// PersistentCacheQuery - batched "do you still hold these ids?" probe
/// (C->S message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentCacheQuery {
    pub ids: Vec<u64>,
}

impl PersistentCacheQuery {
    pub fn new(ids: Vec<u64>) -> Self {
        Self { ids }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            ids: read_id_batch(stream, "PersistentCacheQuery").await?,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        stream.write_u8(types::MSG_TYPE_PERSISTENT_CACHE_QUERY);
        write_id_batch(stream, &self.ids, "PersistentCacheQuery")
    }
}

/// PersistentHashList - one chunk of the client's known-id advertisement
/// sent right after the security handshake (C->S message).
///
/// Body: sequence id (u32), total chunks (u16), chunk index (u16), id count
/// (u16), ids. Chunks carry at most [`MAX_IDS_PER_MESSAGE`] ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentHashList {
    /// Identifies one advertisement across its chunks.
    pub sequence_id: u32,
    pub total_chunks: u16,
    pub chunk_index: u16,
    pub ids: Vec<u64>,
}

impl PersistentHashList {
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let sequence_id = stream.read_u32().await?;
        let total_chunks = stream.read_u16().await?;
        let chunk_index = stream.read_u16().await?;
        if chunk_index >= total_chunks {
            return Err(invalid_data(format!(
                "PersistentHashList: chunk index {chunk_index} out of range for {total_chunks} chunks"
            )));
        }
        let ids = read_id_batch(stream, "PersistentHashList").await?;
        Ok(Self {
            sequence_id,
            total_chunks,
            chunk_index,
            ids,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.chunk_index >= self.total_chunks {
            return Err(invalid_data(format!(
                "PersistentHashList: chunk index {} out of range for {} chunks",
                self.chunk_index, self.total_chunks
            )));
        }
        stream.write_u8(types::MSG_TYPE_PERSISTENT_HASH_LIST);
        stream.write_u32(self.sequence_id);
        stream.write_u16(self.total_chunks);
        stream.write_u16(self.chunk_index);
        write_id_batch(stream, &self.ids, "PersistentHashList")
    }
}

/// LossyHashReport - the client decoded canonical id `canonical_id` into
/// pixels hashing to `actual_id` (C->S message). The server records the
/// mapping so later references to the canonical id still hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossyHashReport {
    pub canonical_id: u64,
    pub actual_id: u64,
}

impl LossyHashReport {
    pub fn new(canonical_id: u64, actual_id: u64) -> Self {
        debug_assert_ne!(canonical_id, 0);
        debug_assert_ne!(actual_id, 0);
        Self {
            canonical_id,
            actual_id,
        }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let canonical_id = stream.read_u64().await?;
        let actual_id = stream.read_u64().await?;
        check_nonzero_id(canonical_id, "LossyHashReport")?;
        check_nonzero_id(actual_id, "LossyHashReport")?;
        Ok(Self {
            canonical_id,
            actual_id,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        check_nonzero_id(self.canonical_id, "LossyHashReport")?;
        check_nonzero_id(self.actual_id, "LossyHashReport")?;
        stream.write_u8(types::MSG_TYPE_LOSSY_HASH_REPORT);
        stream.write_u64(self.canonical_id);
        stream.write_u64(self.actual_id);
        Ok(())
    }
}

/// DebugDumpRequest - ask both sides to write a timestamped cache state
/// dump for post-mortem analysis (C->S message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugDumpRequest {
    /// Unix epoch seconds chosen by the requester; both dumps carry it so
    /// they can be matched up afterwards.
    pub epoch_timestamp: u32,
}

impl DebugDumpRequest {
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            epoch_timestamp: stream.read_u32().await?,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_u8(types::MSG_TYPE_DEBUG_DUMP_REQUEST);
        stream.write_u32(self.epoch_timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn to_bytes(write: impl FnOnce(&mut RfbOutStream<&mut Vec<u8>>)) -> Vec<u8> {
        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        write(&mut out);
        out.flush().await.unwrap();
        buffer
    }

    #[tokio::test]
    async fn cached_rect_round_trip() {
        let original = CachedRect::new(0xAAAA_BBBB_CCCC_0001);
        let bytes = to_bytes(|out| original.write_to(out).unwrap()).await;
        assert_eq!(bytes.len(), 8);

        let mut inp = RfbInStream::new(Cursor::new(bytes));
        assert_eq!(CachedRect::read_from(&mut inp).await.unwrap(), original);
    }

    #[tokio::test]
    async fn cached_rect_zero_id_rejected() {
        let mut stream = RfbInStream::new(Cursor::new(vec![0u8; 8]));
        let err = CachedRect::read_from(&mut stream).await.unwrap_err();
        assert!(err.to_string().contains("non-zero"));
    }

    #[tokio::test]
    async fn cached_rect_init_round_trip() {
        let original = CachedRectInit::new(67890, types::ENCODING_TIGHT);
        let bytes = to_bytes(|out| original.write_to(out).unwrap()).await;
        assert_eq!(bytes.len(), 12);

        let mut inp = RfbInStream::new(Cursor::new(bytes));
        assert_eq!(CachedRectInit::read_from(&mut inp).await.unwrap(), original);
    }

    #[tokio::test]
    async fn cached_rect_init_recursive_encoding_rejected() {
        for bad in [
            types::ENCODING_CACHED_RECT,
            types::ENCODING_CACHED_RECT_INIT,
            types::ENCODING_CACHED_RECT_SEED,
        ] {
            let mut data = Vec::new();
            data.extend_from_slice(&12345u64.to_be_bytes());
            data.extend_from_slice(&bad.to_be_bytes());

            let mut stream = RfbInStream::new(Cursor::new(data));
            let err = CachedRectInit::read_from(&mut stream).await.unwrap_err();
            assert!(err.to_string().contains("cache encoding"));
        }
    }

    #[tokio::test]
    async fn seed_round_trip() {
        let original = CachedRectSeed::new(42);
        let bytes = to_bytes(|out| original.write_to(out).unwrap()).await;
        let mut inp = RfbInStream::new(Cursor::new(bytes));
        assert_eq!(CachedRectSeed::read_from(&mut inp).await.unwrap(), original);
    }

    #[tokio::test]
    async fn request_cached_data_includes_type_octet() {
        let msg = RequestCachedData::new(7);
        let bytes = to_bytes(|out| msg.write_to(out).unwrap()).await;
        assert_eq!(bytes.len(), 9);
        assert_eq!(bytes[0], types::MSG_TYPE_REQUEST_CACHED_DATA);

        let mut inp = RfbInStream::new(Cursor::new(bytes[1..].to_vec()));
        assert_eq!(RequestCachedData::read_from(&mut inp).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn eviction_batch_round_trip() {
        let msg = CacheEviction::new(vec![1, 2, 3, u64::MAX]);
        let bytes = to_bytes(|out| msg.write_to(out).unwrap()).await;
        assert_eq!(bytes.len(), 1 + 2 + 4 * 8);
        assert_eq!(bytes[0], types::MSG_TYPE_CACHE_EVICTION);

        let mut inp = RfbInStream::new(Cursor::new(bytes[1..].to_vec()));
        assert_eq!(CacheEviction::read_from(&mut inp).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn eviction_zero_id_rejected() {
        let mut data = vec![0u8, 2]; // count = 2
        data.extend_from_slice(&1u64.to_be_bytes());
        data.extend_from_slice(&0u64.to_be_bytes());

        let mut inp = RfbInStream::new(Cursor::new(data));
        assert!(CacheEviction::read_from(&mut inp).await.is_err());
    }

    #[tokio::test]
    async fn query_batch_round_trip() {
        let msg = PersistentCacheQuery::new(vec![0xCAFE, 0xBEEF]);
        let bytes = to_bytes(|out| msg.write_to(out).unwrap()).await;
        assert_eq!(bytes[0], types::MSG_TYPE_PERSISTENT_CACHE_QUERY);

        let mut inp = RfbInStream::new(Cursor::new(bytes[1..].to_vec()));
        assert_eq!(PersistentCacheQuery::read_from(&mut inp).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn hash_list_round_trip() {
        let msg = PersistentHashList {
            sequence_id: 99,
            total_chunks: 3,
            chunk_index: 1,
            ids: (1..=1000u64).collect(),
        };
        let bytes = to_bytes(|out| msg.write_to(out).unwrap()).await;
        assert_eq!(bytes[0], types::MSG_TYPE_PERSISTENT_HASH_LIST);
        assert_eq!(bytes.len(), 1 + 4 + 2 + 2 + 2 + 1000 * 8);

        let mut inp = RfbInStream::new(Cursor::new(bytes[1..].to_vec()));
        assert_eq!(PersistentHashList::read_from(&mut inp).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn hash_list_chunk_index_validated() {
        let msg = PersistentHashList {
            sequence_id: 1,
            total_chunks: 2,
            chunk_index: 2,
            ids: vec![1],
        };
        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        assert!(msg.write_to(&mut out).is_err());
    }

    #[tokio::test]
    async fn lossy_report_round_trip() {
        let msg = LossyHashReport::new(0x1111, 0x2222);
        let bytes = to_bytes(|out| msg.write_to(out).unwrap()).await;
        assert_eq!(bytes.len(), 17);
        assert_eq!(bytes[0], types::MSG_TYPE_LOSSY_HASH_REPORT);

        let mut inp = RfbInStream::new(Cursor::new(bytes[1..].to_vec()));
        assert_eq!(LossyHashReport::read_from(&mut inp).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn debug_dump_round_trip() {
        let msg = DebugDumpRequest {
            epoch_timestamp: 1_700_000_000,
        };
        let bytes = to_bytes(|out| msg.write_to(out)).await;
        assert_eq!(bytes.len(), 5);
        assert_eq!(bytes[0], types::MSG_TYPE_DEBUG_DUMP_REQUEST);

        let mut inp = RfbInStream::new(Cursor::new(bytes[1..].to_vec()));
        assert_eq!(DebugDumpRequest::read_from(&mut inp).await.unwrap(), msg);
    }
}
