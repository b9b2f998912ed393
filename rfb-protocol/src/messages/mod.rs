//! RFB protocol message types for the cache extension.
//!
//! - [`types`] - Shared types: `PixelFormat`, `Rectangle`, encoding and
//!   message-type constants
//! - [`cache`] - The nine cache wire messages
//! - [`client`] - Client-to-server messages (SetEncodings, update requests,
//!   and the cache client messages)
//! - [`server`] - Server-to-client messages (ServerInit, FramebufferUpdate
//!   headers)
//!
//! # Wire Format Rules
//!
//! 1. **Big-endian byte order** for all multi-byte integers
//! 2. **Strict boolean validation** - boolean fields must be 0 or 1
//! 3. **Padding validation** - padding bytes must be zero
//! 4. **Fail-fast errors** - invalid data is an error, never a fallback
//!
//! `FramebufferUpdate` parses rectangle headers only; encoding payloads are
//! consumed by the decode manager through the codec interfaces.

pub mod cache;
pub mod client;
pub mod server;
pub mod types;

mod proptest_framing;

pub use types::{PixelFormat, Rectangle};
