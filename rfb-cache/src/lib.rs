//! Content-addressed framebuffer cache engine.
//!
//! This crate is the core of the persistent cache subsystem: a
//! disk-backable, content-hash addressed cache of decoded pixel rectangles,
//! shared safely between multiple viewer processes.
//!
//! Layers, leaves first:
//!
//! - [`CacheKey`] - 16-byte content identifier (truncated SHA-256)
//! - [`ContentHash`] - canonical-domain hashing of framebuffer rectangles
//! - [`ArcCache`] - generic byte-budgeted Adaptive Replacement Cache
//! - [`ShardedStore`] - append-only on-disk payload storage with a master
//!   index file
//! - [`PersistentCacheEngine`] - the public cache interface integrating ARC
//!   and the store, with lazy hydration and dual-hash lookup
//! - [`CacheCoordinator`] - master/slave election and IPC for viewer
//!   processes sharing one cache directory

pub mod arc_cache;
pub mod content_hash;
pub mod coordinator;
pub mod engine;
pub mod key;
pub mod store;

pub use arc_cache::ArcCache;
pub use content_hash::ContentHash;
pub use coordinator::{CacheCoordinator, CoordinatorRole, WireIndexEntry};
pub use engine::{CachedPixels, EngineConfig, HydrationState, PersistentCacheEngine};
pub use key::CacheKey;
pub use store::{IndexEntry, ShardedStore, StoreError};
