//! Interfaces at the engine boundary.
//!
//! The engine accepts new streams through [`ApiListener`], receives request frames through
//! [`RequestDecoder`], and answers through the [`ResponseEncoder`] it was handed. Responses are
//! posted to the engine queue rather than applied in place, so an engine may respond from inside
//! a decode call.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;

use crate::client::Command;
use crate::dispatcher::{DeferredDeleter, Poster};
use crate::table::StreamKey;
use crate::types::{HeaderList, StreamId, StreamResetReason};

/// Engine-side half of one exchange. Owned by the engine; the bridge keeps only a weak reference.
pub trait RequestDecoder {
    fn decode_headers(&mut self, headers: HeaderList, end_stream: bool);
    fn decode_data(&mut self, data: Bytes, end_stream: bool);
    fn decode_metadata(&mut self, metadata: HeaderList);
    fn decode_trailers(&mut self, trailers: HeaderList);
}

pub type DecoderRef = Rc<RefCell<dyn RequestDecoder>>;

/// Notifications the engine registers on a stream.
pub trait StreamCallbacks {
    fn on_reset_stream(&mut self, reason: StreamResetReason, details: &str);
    fn on_above_write_buffer_high_watermark(&mut self) {}
    fn on_below_write_buffer_low_watermark(&mut self) {}
}

/// What the engine may do with a stream it is accepting.
pub trait StreamControl: AddressProvider {
    fn stream_id(&self) -> StreamId;
    fn add_callbacks(&mut self, callbacks: Box<dyn StreamCallbacks>);
    /// Unsupported; the bridge never stops reading.
    fn read_disable(&mut self, disable: bool);
    fn buffer_limit(&self) -> u32;
    fn response_details(&self) -> &str;
}

/// Local address reported for every bridged stream.
pub trait AddressProvider {
    fn connection_local_address(&self) -> &Arc<SyntheticAddress>;
}

/// Placeholder address shared by all streams of a client.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyntheticAddress;

impl fmt::Display for SyntheticAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("synthetic")
    }
}

/// Handed to [`ApiListener::new_stream`].
pub struct NewStream<'a> {
    pub encoder: ResponseEncoder,
    pub stream: &'a mut dyn StreamControl,
    /// Engine objects tied to this stream should be released through here so they go before the
    /// stream itself.
    pub deleter: &'a DeferredDeleter,
}

/// Entry point of the surrounding engine.
pub trait ApiListener {
    /// Create the engine-side exchange. `None` means creation failed; the stream will be reset.
    fn new_stream(&mut self, cx: NewStream<'_>) -> Option<DecoderRef>;
}

/// One engine-originated event for a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    Headers { headers: HeaderList, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    Trailers(HeaderList),
    Reset(StreamResetReason),
}

/// Engine's handle for answering one stream. Events for a stream that has already finished are
/// dropped by the bridge.
#[derive(Clone)]
pub struct ResponseEncoder {
    id: StreamId,
    key: StreamKey,
    poster: Poster<Command>,
}

impl ResponseEncoder {
    pub(crate) fn new(id: StreamId, key: StreamKey, poster: Poster<Command>) -> Self {
        Self { id, key, poster }
    }

    pub fn stream_id(&self) -> StreamId {
        self.id
    }

    pub fn encode_headers(&self, headers: HeaderList, end_stream: bool) {
        self.send(ResponseEvent::Headers {
            headers,
            end_stream,
        });
    }

    pub fn encode_data(&self, data: Bytes, end_stream: bool) {
        self.send(ResponseEvent::Data { data, end_stream });
    }

    pub fn encode_trailers(&self, trailers: HeaderList) {
        self.send(ResponseEvent::Trailers(trailers));
    }

    /// Remote reset or engine-detected failure.
    pub fn reset_stream(&self, reason: StreamResetReason) {
        self.send(ResponseEvent::Reset(reason));
    }

    fn send(&self, event: ResponseEvent) {
        let posted = self.poster.post(Command::Response {
            id: self.id,
            key: self.key,
            event,
        });
        if !posted {
            tracing::debug!(stream = self.id, "engine queue closed, response dropped");
        }
    }
}
