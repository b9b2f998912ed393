//! Pixel buffers and pixel formats for the RFB cache subsystem.

pub mod buffer;
pub mod format;
pub mod managed;

pub use buffer::{MutablePixelBuffer, PixelBuffer};
pub use format::PixelFormat;
pub use managed::ManagedPixelBuffer;
