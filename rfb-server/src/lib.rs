//! Server-side cache subsystem: the per-update encode scheduler and the
//! per-client cache id bookkeeping.
//!
//! Each client connection owns one [`EncodeManager`] and one
//! [`ClientCacheState`]; connections share the framebuffer read-only and
//! never share mutable cache state. The server holds no durable cache of
//! its own - content hashes recomputed from the framebuffer are the only
//! identity it needs.

pub mod client_state;
pub mod encode_manager;
pub mod messages;

pub use client_state::{CacheIdState, ClientCacheState};
pub use encode_manager::{
    BorderLayout, EncodeManager, EncodeManagerConfig, UpdateBatch, UpdateInfo,
};
pub use messages::handle_client_cache_message;
