//! Property tests for message framing.
//!
//! These tests verify that cache message parsing is robust against
//! fragmentation at arbitrary byte boundaries, which is critical for
//! correct operation over real network streams.

#[cfg(test)]
mod tests {
    use super::super::cache::*;
    use crate::io::{RfbInStream, RfbOutStream};
    use proptest::prelude::*;

    /// A fragmenting reader that splits reads at a specific boundary,
    /// simulating network fragmentation: the first read only yields bytes
    /// up to the boundary, later reads yield the rest.
    struct FragmentingReader {
        data: Vec<u8>,
        pos: usize,
        boundary: usize,
    }

    impl FragmentingReader {
        fn new(data: Vec<u8>, boundary: usize) -> Self {
            let boundary = boundary.min(data.len());
            Self {
                data,
                pos: 0,
                boundary,
            }
        }
    }

    impl tokio::io::AsyncRead for FragmentingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.pos >= self.data.len() {
                return std::task::Poll::Ready(Ok(()));
            }

            let available = if self.pos < self.boundary {
                (self.boundary - self.pos).min(buf.remaining())
            } else {
                (self.data.len() - self.pos).min(buf.remaining())
            };

            if available == 0 {
                return std::task::Poll::Ready(Ok(()));
            }

            let data = &self.data[self.pos..self.pos + available];
            buf.put_slice(data);
            self.pos += available;

            std::task::Poll::Ready(Ok(()))
        }
    }

    fn nonzero_ids(max_len: usize) -> impl Strategy<Value = Vec<u64>> {
        prop::collection::vec(1u64..=u64::MAX, 0..max_len)
    }

    proptest! {
        /// CacheEviction batches survive fragmentation at any boundary.
        #[test]
        fn eviction_fragmentation(
            ids in nonzero_ids(50),
            boundary in 0usize..500
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let msg = CacheEviction::new(ids);

                let mut buffer = Vec::new();
                let mut out = RfbOutStream::new(&mut buffer);
                msg.write_to(&mut out).unwrap();
                out.flush().await.unwrap();

                // Skip the type octet; the message loop consumed it already.
                let boundary = boundary.min(buffer.len() - 1);
                let reader = FragmentingReader::new(buffer[1..].to_vec(), boundary);
                let mut inp = RfbInStream::new(reader);

                let parsed = CacheEviction::read_from(&mut inp).await.unwrap();
                prop_assert_eq!(msg, parsed);
                Ok(())
            })?;
        }

        /// PersistentHashList chunks survive fragmentation at any boundary.
        #[test]
        fn hash_list_fragmentation(
            sequence_id in 0u32..=u32::MAX,
            chunk_index in 0u16..8,
            ids in nonzero_ids(100),
            boundary in 0usize..900
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let msg = PersistentHashList {
                    sequence_id,
                    total_chunks: chunk_index + 1,
                    chunk_index,
                    ids,
                };

                let mut buffer = Vec::new();
                let mut out = RfbOutStream::new(&mut buffer);
                msg.write_to(&mut out).unwrap();
                out.flush().await.unwrap();

                let boundary = boundary.min(buffer.len() - 1);
                let reader = FragmentingReader::new(buffer[1..].to_vec(), boundary);
                let mut inp = RfbInStream::new(reader);

                let parsed = PersistentHashList::read_from(&mut inp).await.unwrap();
                prop_assert_eq!(msg, parsed);
                Ok(())
            })?;
        }

        /// LossyHashReport (fixed 16-byte body) survives fragmentation.
        #[test]
        fn lossy_report_fragmentation(
            canonical in 1u64..=u64::MAX,
            actual in 1u64..=u64::MAX,
            boundary in 0usize..17
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let msg = LossyHashReport::new(canonical, actual);

                let mut buffer = Vec::new();
                let mut out = RfbOutStream::new(&mut buffer);
                msg.write_to(&mut out).unwrap();
                out.flush().await.unwrap();

                let boundary = boundary.min(buffer.len() - 1);
                let reader = FragmentingReader::new(buffer[1..].to_vec(), boundary);
                let mut inp = RfbInStream::new(reader);

                let parsed = LossyHashReport::read_from(&mut inp).await.unwrap();
                prop_assert_eq!(msg, parsed);
                Ok(())
            })?;
        }
    }
}
