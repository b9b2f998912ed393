//! Server-side dispatch of client cache messages.
//!
//! The server's message loop reads a type octet, and for the cache range
//! hands the stream here; anything else belongs to the standard RFB
//! handlers. All six client messages resolve to per-connection state
//! updates; none of them write a reply (the protocol heals through the
//! next framebuffer update).

use crate::client_state::ClientCacheState;
use rfb_protocol::io::RfbInStream;
use rfb_protocol::messages::cache::{
    CacheEviction, DebugDumpRequest, LossyHashReport, PersistentCacheQuery, PersistentHashList,
    RequestCachedData,
};
use rfb_protocol::messages::types::{
    MSG_TYPE_CACHE_EVICTION, MSG_TYPE_DEBUG_DUMP_REQUEST, MSG_TYPE_LOSSY_HASH_REPORT,
    MSG_TYPE_PERSISTENT_CACHE_QUERY, MSG_TYPE_PERSISTENT_HASH_LIST, MSG_TYPE_REQUEST_CACHED_DATA,
};
use tokio::io::AsyncRead;
use tracing::{debug, info};

/// Consume one client cache message whose type octet has already been
/// read. Returns `false` (consuming nothing) when the type is not a cache
/// message, so the caller can fall through to its other handlers; wire
/// errors (including zero ids) surface and fail the connection.
pub async fn handle_client_cache_message<R: AsyncRead + Unpin>(
    msg_type: u8,
    stream: &mut RfbInStream<R>,
    state: &mut ClientCacheState,
) -> std::io::Result<bool> {
    match msg_type {
        MSG_TYPE_REQUEST_CACHED_DATA => {
            let msg = RequestCachedData::read_from(stream).await?;
            debug!("client requested resend of id {:016x}", msg.cache_id);
            state.on_request_cached_data(msg.cache_id);
        }
        MSG_TYPE_CACHE_EVICTION => {
            let msg = CacheEviction::read_from(stream).await?;
            let removed = state.on_evictions(&msg.ids);
            debug!("client evicted {} ids ({} were known)", msg.ids.len(), removed);
        }
        MSG_TYPE_PERSISTENT_CACHE_QUERY => {
            let msg = PersistentCacheQuery::read_from(stream).await?;
            debug!("client queried {} ids", msg.ids.len());
            state.on_query(&msg.ids);
        }
        MSG_TYPE_LOSSY_HASH_REPORT => {
            let msg = LossyHashReport::read_from(stream).await?;
            debug!(
                "lossy mapping learned: {:016x} -> {:016x}",
                msg.canonical_id, msg.actual_id
            );
            state.on_lossy_hash_report(msg.canonical_id, msg.actual_id);
        }
        MSG_TYPE_PERSISTENT_HASH_LIST => {
            let msg = PersistentHashList::read_from(stream).await?;
            info!(
                "hash list chunk {}/{} with {} ids (seq {})",
                msg.chunk_index + 1,
                msg.total_chunks,
                msg.ids.len(),
                msg.sequence_id
            );
            state.on_hash_list(&msg.ids);
        }
        MSG_TYPE_DEBUG_DUMP_REQUEST => {
            let msg = DebugDumpRequest::read_from(stream).await?;
            // The server holds no durable cache; its half of a matched
            // dump is the per-connection id state.
            let stats = state.stats();
            info!(
                "debug dump {}: {} known ids, {} lossy mappings, {} added, {} evicted",
                msg.epoch_timestamp,
                stats.current_known,
                stats.lossy_mappings,
                stats.total_added,
                stats.total_evicted
            );
        }
        _ => return Ok(false),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfb_protocol::io::RfbOutStream;
    use rfb_protocol::messages::types as t;
    use std::io::Cursor;

    async fn body_of(write: impl FnOnce(&mut RfbOutStream<&mut Vec<u8>>)) -> (u8, Vec<u8>) {
        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        write(&mut out);
        out.flush().await.unwrap();
        (buffer[0], buffer[1..].to_vec())
    }

    #[tokio::test]
    async fn eviction_message_updates_state() {
        let mut state = ClientCacheState::new(true);
        state.on_hash_list(&[1, 2, 3]);

        let (msg_type, body) =
            body_of(|out| CacheEviction::new(vec![1, 3]).write_to(out).unwrap()).await;
        assert_eq!(msg_type, t::MSG_TYPE_CACHE_EVICTION);

        let mut stream = RfbInStream::new(Cursor::new(body));
        assert!(handle_client_cache_message(msg_type, &mut stream, &mut state)
            .await
            .unwrap());
        assert!(!state.knows(1));
        assert!(state.knows(2));
        assert!(!state.knows(3));
    }

    #[tokio::test]
    async fn request_cached_data_blocks_future_references() {
        let mut state = ClientCacheState::new(true);
        state.on_hash_list(&[42]);
        assert!(state.can_reference(42));

        let (msg_type, body) =
            body_of(|out| RequestCachedData::new(42).write_to(out).unwrap()).await;
        let mut stream = RfbInStream::new(Cursor::new(body));
        handle_client_cache_message(msg_type, &mut stream, &mut state)
            .await
            .unwrap();
        assert!(!state.can_reference(42));
        assert!(state.is_requested(42));
    }

    #[tokio::test]
    async fn lossy_report_recorded() {
        let mut state = ClientCacheState::new(true);
        state.on_hash_list(&[0xAA]);

        let (msg_type, body) =
            body_of(|out| LossyHashReport::new(0xAA, 0xBB).write_to(out).unwrap()).await;
        let mut stream = RfbInStream::new(Cursor::new(body));
        handle_client_cache_message(msg_type, &mut stream, &mut state)
            .await
            .unwrap();
        assert_eq!(state.lossy_actual(0xAA), Some(0xBB));
        // The id stays referenceable.
        assert!(state.can_reference(0xAA));
    }

    #[tokio::test]
    async fn hash_list_seeds_known_ids() {
        let mut state = ClientCacheState::new(true);
        let msg = PersistentHashList {
            sequence_id: 7,
            total_chunks: 1,
            chunk_index: 0,
            ids: vec![10, 20],
        };
        let (msg_type, body) = body_of(|out| msg.write_to(out).unwrap()).await;
        let mut stream = RfbInStream::new(Cursor::new(body));
        handle_client_cache_message(msg_type, &mut stream, &mut state)
            .await
            .unwrap();
        assert!(state.can_reference(10));
        assert!(state.can_reference(20));
    }

    #[tokio::test]
    async fn non_cache_types_fall_through() {
        let mut state = ClientCacheState::new(true);
        let mut stream = RfbInStream::new(Cursor::new(Vec::new()));
        // SetEncodings (2) is not ours; nothing must be consumed.
        assert!(!handle_client_cache_message(2, &mut stream, &mut state)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn zero_id_is_a_wire_error() {
        let mut state = ClientCacheState::new(true);
        let body = 0u64.to_be_bytes().to_vec();
        let mut stream = RfbInStream::new(Cursor::new(body));
        let err = handle_client_cache_message(
            t::MSG_TYPE_REQUEST_CACHED_DATA,
            &mut stream,
            &mut state,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
