//! In-memory context windowing and hierarchical history compression.

pub mod buffer;
pub mod compressor;

pub use buffer::{ContextBuffer, UsageStats, WindowOptions};
pub use compressor::SessionCompressor;
