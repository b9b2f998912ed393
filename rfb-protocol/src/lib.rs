//! RFB wire protocol: buffered streams and message types for the
//! content-addressed framebuffer cache extension.
//!
//! The crate is transport-agnostic: streams are generic over tokio
//! [`AsyncRead`](tokio::io::AsyncRead) / [`AsyncWrite`](tokio::io::AsyncWrite)
//! so tests can run against in-memory cursors.

pub mod io;
pub mod messages;
