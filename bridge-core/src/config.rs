//! Client-wide settings. Every field has a default so a partial table deserializes.

use serde::Deserialize;

/// Default per-stream response buffer high watermark (6 MB).
pub const DEFAULT_HIGH_WATERMARK: usize = 6_000_000;

/// Default buffer limit reported to the engine.
pub const DEFAULT_BUFFER_LIMIT: u32 = 65_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Deliver response body only when the caller asks for it (default false).
    #[serde(default)]
    pub async_mode: bool,
    /// Buffered response bytes (async mode) above which the engine is told to stop reading. Low watermark is half. 0 disables.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    /// Buffer limit reported through the stream control interface.
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: u32,
}

fn default_high_watermark() -> usize {
    DEFAULT_HIGH_WATERMARK
}
fn default_buffer_limit() -> u32 {
    DEFAULT_BUFFER_LIMIT
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            async_mode: false,
            high_watermark: default_high_watermark(),
            buffer_limit: default_buffer_limit(),
        }
    }
}

/// Per-stream overrides for `Client::start_stream_with_options`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// `None` uses the client default.
    pub async_mode: Option<bool>,
}
