//! Connection state machine and cache protocol negotiation.
//!
//! The RFB handshake itself (version exchange, security types,
//! authentication) is driven externally; this module tracks the state
//! progression, layers the cache protocol on top of it, and runs the
//! Normal-phase message loop. The cache protocol reserves no transitions
//! of its own: it is negotiated through SetEncodings pseudo-encodings and
//! becomes active from `Normal` onwards.

use crate::config::Config;
use crate::decode_manager::DecodeManager;
use crate::errors::RfbClientError;
use parking_lot::Mutex;
use rfb_cache::engine::PersistentCacheEngine;
use rfb_pixelbuffer::{ManagedPixelBuffer, PixelFormat};
use rfb_protocol::io::{RfbInStream, RfbOutStream};
use rfb_protocol::messages::client::SetEncodings;
use rfb_protocol::messages::server::ServerInit;
use rfb_protocol::messages::types::{
    Rectangle, MSG_TYPE_FRAMEBUFFER_UPDATE, PSEUDO_ENCODING_CONTENT_CACHE,
    PSEUDO_ENCODING_PERSISTENT_CACHE,
};
use rfb_encodings::CodecRegistry;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// RFB connection phases. Cache state is only active from `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ProtocolVersion,
    SecurityTypes,
    Security,
    SecurityResult,
    Initialisation,
    Normal,
    Closing,
}

impl ConnectionState {
    fn successor(self) -> Option<ConnectionState> {
        match self {
            ConnectionState::ProtocolVersion => Some(ConnectionState::SecurityTypes),
            ConnectionState::SecurityTypes => Some(ConnectionState::Security),
            ConnectionState::Security => Some(ConnectionState::SecurityResult),
            ConnectionState::SecurityResult => Some(ConnectionState::Initialisation),
            ConnectionState::Initialisation => Some(ConnectionState::Normal),
            ConnectionState::Normal => Some(ConnectionState::Closing),
            ConnectionState::Closing => None,
        }
    }
}

/// One client connection's protocol and cache state.
pub struct Connection {
    config: Config,
    registry: Arc<CodecRegistry>,
    state: ConnectionState,

    framebuffer: Option<Arc<Mutex<ManagedPixelBuffer>>>,
    decode_manager: Option<DecodeManager>,
    server_name: String,
}

impl Connection {
    pub fn new(config: Config, registry: Arc<CodecRegistry>) -> Self {
        Self {
            config,
            registry,
            state: ConnectionState::ProtocolVersion,
            framebuffer: None,
            decode_manager: None,
            server_name: String::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The shared framebuffer, available from `Initialisation` onwards.
    pub fn framebuffer(&self) -> Option<Arc<Mutex<ManagedPixelBuffer>>> {
        self.framebuffer.clone()
    }

    pub fn decode_manager(&mut self) -> Option<&mut DecodeManager> {
        self.decode_manager.as_mut()
    }

    /// Advance to the next handshake phase. The handshake driver calls
    /// this as each phase completes; skipping phases is a protocol error.
    pub fn advance(&mut self, next: ConnectionState) -> Result<(), RfbClientError> {
        if self.state.successor() != Some(next) {
            return Err(RfbClientError::Protocol(format!(
                "illegal state transition {:?} -> {next:?}",
                self.state
            )));
        }
        debug!("connection state: {:?} -> {next:?}", self.state);
        self.state = next;
        Ok(())
    }

    /// The SetEncodings advertisement: the registry's codecs in preference
    /// order plus the cache pseudo-encodings the configuration enables.
    /// The server enables cache emission only if at least one cache
    /// pseudo-encoding is present.
    pub fn build_set_encodings(&self) -> SetEncodings {
        let mut encodings = self.registry.encodings();
        if self.config.cache.persistent_cache {
            encodings.push(PSEUDO_ENCODING_PERSISTENT_CACHE);
        }
        if self.config.cache.content_cache {
            encodings.push(PSEUDO_ENCODING_CONTENT_CACHE);
        }
        SetEncodings { encodings }
    }

    /// ServerInit received: size the framebuffer, build the decode manager
    /// and its cache engine, and enter `Normal`. If the configuration
    /// enables any cache protocol, the persistent index is loaded now (not
    /// earlier - a session that never gets here touches no cache files),
    /// the multi-viewer coordinator starts, and the known-id advertisement
    /// is queued.
    pub fn on_server_init(&mut self, init: &ServerInit) -> Result<(), RfbClientError> {
        if self.state != ConnectionState::Initialisation {
            return Err(RfbClientError::Protocol(format!(
                "ServerInit in state {:?}",
                self.state
            )));
        }

        let format = PixelFormat::from(init.pixel_format.clone());
        let framebuffer = Arc::new(Mutex::new(ManagedPixelBuffer::new(
            init.framebuffer_width as u32,
            init.framebuffer_height as u32,
            format,
        )));
        self.framebuffer = Some(Arc::clone(&framebuffer));
        self.server_name = init.name.clone();

        let engine = PersistentCacheEngine::new(self.config.cache.engine_config());
        let mut manager =
            DecodeManager::new(Arc::clone(&self.registry), framebuffer, engine);

        if self.config.cache.any_cache_enabled() {
            let loaded = manager.engine_mut().load_index();
            if self.config.cache.persistent_cache {
                manager.engine_mut().start_coordinator();
            }
            info!(
                "cache ready: {loaded} persisted entries, coordinator {:?}",
                manager.engine().coordinator_role()
            );
            manager.advertise_hash_list();
        }

        self.decode_manager = Some(manager);
        self.advance(ConnectionState::Normal)?;
        info!(
            "session established: {}x{} \"{}\"",
            init.framebuffer_width, init.framebuffer_height, self.server_name
        );
        Ok(())
    }

    /// Process one server message in the Normal phase, writing any cache
    /// replies the decode manager produced. The caller flushes `out`.
    pub async fn process_server_message<R, W>(
        &mut self,
        stream: &mut RfbInStream<R>,
        out: &mut RfbOutStream<W>,
    ) -> Result<(), RfbClientError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.state != ConnectionState::Normal {
            return Err(RfbClientError::Protocol(format!(
                "server message in state {:?}",
                self.state
            )));
        }

        let msg_type = stream.read_u8().await?;
        match msg_type {
            MSG_TYPE_FRAMEBUFFER_UPDATE => self.handle_framebuffer_update(stream, out).await,
            other => Err(RfbClientError::Protocol(format!(
                "unknown server message type {other}"
            ))),
        }
    }

    async fn handle_framebuffer_update<R, W>(
        &mut self,
        stream: &mut RfbInStream<R>,
        out: &mut RfbOutStream<W>,
    ) -> Result<(), RfbClientError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        stream.skip(1).await?; // padding
        let num_rects = stream.read_u16().await?;

        let manager = self
            .decode_manager
            .as_mut()
            .ok_or_else(|| RfbClientError::Protocol("update before ServerInit".to_string()))?;

        for _ in 0..num_rects {
            let rect = Rectangle::read_from(stream).await.map_err(map_wire_error)?;
            manager.decode_rect(rect, stream).await?;
        }

        // End-of-update barrier, then forward whatever the cache produced
        // (queries, evictions, lossy reports) in causal order before the
        // next update request goes out.
        manager.flush()?;
        for message in manager.take_outgoing() {
            message.write_to(out).map_err(map_wire_error)?;
        }
        Ok(())
    }

    /// Orderly shutdown: flush the cache to disk and log statistics.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closing {
            return;
        }
        self.state = ConnectionState::Closing;
        if let Some(manager) = self.decode_manager.as_mut() {
            let flushed = manager.save_cache();
            manager.log_stats();
            debug!("closed connection; {flushed} cache payloads flushed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wire-level `InvalidData` means a malformed message (including a zero
/// cache id): that is a protocol error and fails the connection as such.
fn map_wire_error(err: std::io::Error) -> RfbClientError {
    if err.kind() == std::io::ErrorKind::InvalidData {
        RfbClientError::Protocol(err.to_string())
    } else {
        RfbClientError::Transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode_manager::CacheMessage;
    use rfb_protocol::messages::types::{ENCODING_CACHED_RECT, ENCODING_RAW};
    use rfb_pixelbuffer::PixelBuffer;
    use std::io::Cursor;

    fn wire_pf() -> rfb_protocol::messages::types::PixelFormat {
        rfb_protocol::messages::types::PixelFormat {
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

    fn server_init(w: u16, h: u16) -> ServerInit {
        ServerInit {
            framebuffer_width: w,
            framebuffer_height: h,
            pixel_format: wire_pf(),
            name: "test".to_string(),
        }
    }

    fn session_config(dir: Option<&std::path::Path>) -> Config {
        let mut config = Config::builder().host("test").build().unwrap();
        config.cache.persistent_cache = false; // memory-only in most tests
        config.cache.content_cache = true;
        if let Some(dir) = dir {
            config.cache.persistent_cache = true;
            config.cache.path = Some(dir.to_path_buf());
            config.cache.size_mb = 16;
        }
        config
    }

    fn connect(config: Config) -> Connection {
        let mut conn = Connection::new(config, Arc::new(CodecRegistry::standard()));
        conn.advance(ConnectionState::SecurityTypes).unwrap();
        conn.advance(ConnectionState::Security).unwrap();
        conn.advance(ConnectionState::SecurityResult).unwrap();
        conn.advance(ConnectionState::Initialisation).unwrap();
        conn
    }

    #[test]
    fn states_advance_in_order_only() {
        let mut conn = Connection::new(
            session_config(None),
            Arc::new(CodecRegistry::standard()),
        );
        assert_eq!(conn.state(), ConnectionState::ProtocolVersion);
        // Skipping ahead is a protocol error.
        assert!(conn.advance(ConnectionState::Normal).is_err());
        assert!(conn.advance(ConnectionState::SecurityTypes).is_ok());
        assert!(conn.advance(ConnectionState::SecurityTypes).is_err());
    }

    #[test]
    fn set_encodings_carries_cache_pseudo_encodings() {
        let conn = Connection::new(
            session_config(None),
            Arc::new(CodecRegistry::standard()),
        );
        let msg = conn.build_set_encodings();
        assert!(msg.encodings.contains(&ENCODING_RAW));
        assert!(msg.encodings.contains(&PSEUDO_ENCODING_CONTENT_CACHE));
        assert!(!msg.encodings.contains(&PSEUDO_ENCODING_PERSISTENT_CACHE));
        assert!(msg.negotiates_cache());

        let mut config = session_config(None);
        config.cache.persistent_cache = true;
        let conn = Connection::new(config, Arc::new(CodecRegistry::standard()));
        assert!(conn
            .build_set_encodings()
            .encodings
            .contains(&PSEUDO_ENCODING_PERSISTENT_CACHE));

        let mut config = session_config(None);
        config.cache.content_cache = false;
        config.cache.persistent_cache = false;
        let conn = Connection::new(config, Arc::new(CodecRegistry::standard()));
        assert!(!conn.build_set_encodings().negotiates_cache());
    }

    #[tokio::test]
    async fn server_init_builds_session_and_enters_normal() {
        let mut conn = connect(session_config(None));
        conn.on_server_init(&server_init(640, 480)).unwrap();

        assert_eq!(conn.state(), ConnectionState::Normal);
        assert_eq!(conn.server_name(), "test");
        let fb = conn.framebuffer().unwrap();
        assert_eq!(fb.lock().dimensions(), (640, 480));
        assert!(conn.decode_manager().is_some());
    }

    #[tokio::test]
    async fn update_message_decodes_and_replies() {
        let mut conn = connect(session_config(None));
        conn.on_server_init(&server_init(64, 64)).unwrap();

        // One update: a raw rect plus a reference to an unknown id.
        let mut wire = Vec::new();
        wire.push(MSG_TYPE_FRAMEBUFFER_UPDATE);
        wire.push(0); // padding
        wire.extend_from_slice(&2u16.to_be_bytes());
        // Raw rect 8x8 at (0,0).
        let raw = Rectangle {
            x: 0,
            y: 0,
            width: 8,
            height: 8,
            encoding: ENCODING_RAW,
        };
        let mut hdr = Vec::new();
        {
            let mut out = RfbOutStream::new(&mut hdr);
            raw.write_to(&mut out);
            out.flush().await.unwrap();
        }
        wire.extend_from_slice(&hdr);
        wire.extend_from_slice(&vec![0x42u8; 8 * 8 * 4]);
        // Cache reference to an id the client cannot have.
        let cached = Rectangle {
            x: 8,
            y: 8,
            width: 16,
            height: 16,
            encoding: ENCODING_CACHED_RECT,
        };
        let mut hdr = Vec::new();
        {
            let mut out = RfbOutStream::new(&mut hdr);
            cached.write_to(&mut out);
            out.flush().await.unwrap();
        }
        wire.extend_from_slice(&hdr);
        wire.extend_from_slice(&0xFEED_0000_0000_0001u64.to_be_bytes());

        let mut stream = RfbInStream::new(Cursor::new(wire));
        let mut reply = Vec::new();
        {
            let mut out = RfbOutStream::new(&mut reply);
            conn.process_server_message(&mut stream, &mut out).await.unwrap();
            out.flush().await.unwrap();
        }

        // The raw rect landed.
        let fb = conn.framebuffer().unwrap();
        let mut stride = 0;
        let fb_guard = fb.lock();
        let pixels = fb_guard
            .get_buffer(rfb_common::Rect::new(0, 0, 1, 1), &mut stride)
            .unwrap();
        assert_eq!(pixels[0], 0x42);
        drop(fb_guard);

        // The miss produced a resend request on the wire.
        assert!(!reply.is_empty());
        assert_eq!(
            reply[0],
            rfb_protocol::messages::types::MSG_TYPE_REQUEST_CACHED_DATA
        );
    }

    #[tokio::test]
    async fn zero_cache_id_fails_the_connection() {
        let mut conn = connect(session_config(None));
        conn.on_server_init(&server_init(64, 64)).unwrap();

        let mut wire = Vec::new();
        wire.push(MSG_TYPE_FRAMEBUFFER_UPDATE);
        wire.push(0);
        wire.extend_from_slice(&1u16.to_be_bytes());
        let cached = Rectangle {
            x: 0,
            y: 0,
            width: 16,
            height: 16,
            encoding: ENCODING_CACHED_RECT,
        };
        let mut hdr = Vec::new();
        {
            let mut out = RfbOutStream::new(&mut hdr);
            cached.write_to(&mut out);
            out.flush().await.unwrap();
        }
        wire.extend_from_slice(&hdr);
        wire.extend_from_slice(&0u64.to_be_bytes()); // invalid id

        let mut stream = RfbInStream::new(Cursor::new(wire));
        let mut reply = Vec::new();
        let mut out = RfbOutStream::new(&mut reply);
        let err = conn
            .process_server_message(&mut stream, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, RfbClientError::Transport(_) | RfbClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn unknown_message_type_is_protocol_error() {
        let mut conn = connect(session_config(None));
        conn.on_server_init(&server_init(32, 32)).unwrap();

        let mut stream = RfbInStream::new(Cursor::new(vec![0x77u8]));
        let mut reply = Vec::new();
        let mut out = RfbOutStream::new(&mut reply);
        let err = conn
            .process_server_message(&mut stream, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, RfbClientError::Protocol(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn persistent_session_advertises_prior_ids() {
        let dir = tempfile::TempDir::new().unwrap();

        // Session one: store an entry and shut down cleanly.
        {
            let mut conn = connect(session_config(Some(dir.path())));
            conn.on_server_init(&server_init(64, 64)).unwrap();
            let manager = conn.decode_manager().unwrap();
            let pixels = vec![7u8; 16 * 16 * 4];
            let key = rfb_cache::ContentHash::compute(&pixels);
            manager.engine_mut().insert(
                key.id(),
                key.id(),
                key,
                &pixels,
                PixelFormat::rgb888(),
                16,
                16,
                16,
                false,
                true,
            );
            conn.close();
        }

        // Session two: the surviving id is advertised after init.
        let mut conn = connect(session_config(Some(dir.path())));
        conn.on_server_init(&server_init(64, 64)).unwrap();
        let manager = conn.decode_manager().unwrap();
        let outgoing = manager.take_outgoing();
        let hash_lists: Vec<_> = outgoing
            .iter()
            .filter(|m| matches!(m, CacheMessage::HashList(_)))
            .collect();
        assert_eq!(hash_lists.len(), 1);
    }
}
