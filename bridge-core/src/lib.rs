//! Stream lifecycle bridge between foreign callers and a callback-driven HTTP engine.
//! Host-driven: the host owns the engine thread and runs [`BridgeEngine`] on it; any thread may
//! use the [`Client`].

pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod inbound;
pub mod outbound;
pub mod routing;
pub mod stats;
pub mod stream;
pub mod table;
pub mod types;

pub use client::{BridgeEngine, Client, ProvisionalEngine};
pub use codec::{
    AddressProvider, ApiListener, DecoderRef, NewStream, RequestDecoder, ResponseEncoder,
    StreamCallbacks, StreamControl, SyntheticAddress,
};
pub use config::{BridgeConfig, StreamOptions};
pub use dispatcher::{DeferredDeletable, DeferredDeleter};
pub use inbound::HttpCallbacks;
pub use routing::Network;
pub use stats::StatsSnapshot;
pub use types::{ErrorCode, HeaderList, StreamError, StreamId, StreamResetReason};

pub mod ffi;

#[cfg(test)]
mod testing;
