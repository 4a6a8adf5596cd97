//! Test doubles: a scriptable engine and recording callbacks.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::buffer::Watermark;
use crate::codec::{
    AddressProvider, ApiListener, DecoderRef, NewStream, RequestDecoder, ResponseEncoder,
    StreamCallbacks, StreamControl,
};
use crate::dispatcher::{DeferredDeletable, DeferredDeleter};
use crate::inbound::HttpCallbacks;
use crate::types::{HeaderList, StreamError, StreamId, StreamResetReason};

/// Request frame as seen by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Headers(HeaderList, bool),
    Data(Bytes, bool),
    Metadata(HeaderList),
    Trailers(HeaderList),
}

#[derive(Default)]
pub struct RecordingDecoder {
    pub frames: Vec<Frame>,
}

impl RequestDecoder for RecordingDecoder {
    fn decode_headers(&mut self, headers: HeaderList, end_stream: bool) {
        self.frames.push(Frame::Headers(headers, end_stream));
    }

    fn decode_data(&mut self, data: Bytes, end_stream: bool) {
        self.frames.push(Frame::Data(data, end_stream));
    }

    fn decode_metadata(&mut self, metadata: HeaderList) {
        self.frames.push(Frame::Metadata(metadata));
    }

    fn decode_trailers(&mut self, trailers: HeaderList) {
        self.frames.push(Frame::Trailers(trailers));
    }
}

pub struct ResetLog(pub Rc<RefCell<Vec<(StreamResetReason, String)>>>);

impl StreamCallbacks for ResetLog {
    fn on_reset_stream(&mut self, reason: StreamResetReason, details: &str) {
        self.0.borrow_mut().push((reason, details.to_string()));
    }
}

/// Callback as seen by the caller. Data is copied out for easy comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivered {
    Headers(HeaderList, bool),
    Data(Vec<u8>, bool),
    Trailers(HeaderList),
    Complete,
    Cancel,
    Error(StreamError),
}

#[derive(Clone, Default)]
pub struct RecordingCallbacks {
    events: Arc<Mutex<Vec<Delivered>>>,
}

impl RecordingCallbacks {
    pub fn events(&self) -> Vec<Delivered> {
        self.events.lock().clone()
    }

    pub fn terminal_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    Delivered::Complete | Delivered::Cancel | Delivered::Error(_)
                )
            })
            .count()
    }

    fn push(&self, e: Delivered) {
        self.events.lock().push(e);
    }
}

impl HttpCallbacks for RecordingCallbacks {
    fn on_headers(&mut self, headers: HeaderList, end_stream: bool) {
        self.push(Delivered::Headers(headers, end_stream));
    }

    fn on_data(&mut self, data: Bytes, end_stream: bool) {
        self.push(Delivered::Data(data.to_vec(), end_stream));
    }

    fn on_trailers(&mut self, trailers: HeaderList) {
        self.push(Delivered::Trailers(trailers));
    }

    fn on_complete(&mut self) {
        self.push(Delivered::Complete);
    }

    fn on_cancel(&mut self) {
        self.push(Delivered::Cancel);
    }

    fn on_error(&mut self, error: StreamError) {
        self.push(Delivered::Error(error));
    }
}

pub type DropLog = Arc<Mutex<Vec<&'static str>>>;

pub fn drop_log() -> DropLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Records its name in the log when dropped.
pub struct DropTracker {
    name: &'static str,
    log: DropLog,
}

impl DropTracker {
    pub fn new(name: &'static str, log: DropLog) -> Self {
        Self { name, log }
    }
}

impl Drop for DropTracker {
    fn drop(&mut self) {
        self.log.lock().push(self.name);
    }
}

/// Recording callbacks that also report when the stream lets go of them.
pub struct TrackedCallbacks {
    inner: RecordingCallbacks,
    _tracker: DropTracker,
}

impl TrackedCallbacks {
    pub fn new(inner: RecordingCallbacks, tracker: DropTracker) -> Self {
        Self {
            inner,
            _tracker: tracker,
        }
    }
}

impl HttpCallbacks for TrackedCallbacks {
    fn on_headers(&mut self, headers: HeaderList, end_stream: bool) {
        self.inner.on_headers(headers, end_stream);
    }

    fn on_data(&mut self, data: Bytes, end_stream: bool) {
        self.inner.on_data(data, end_stream);
    }

    fn on_trailers(&mut self, trailers: HeaderList) {
        self.inner.on_trailers(trailers);
    }

    fn on_complete(&mut self) {
        self.inner.on_complete();
    }

    fn on_cancel(&mut self) {
        self.inner.on_cancel();
    }

    fn on_error(&mut self, error: StreamError) {
        self.inner.on_error(error);
    }
}

/// Engine-side exchange: records request frames and keeps the encoder for scripted responses.
struct Exchange {
    encoder: ResponseEncoder,
    decoder: RecordingDecoder,
    _tracker: Option<DropTracker>,
}

impl RequestDecoder for Exchange {
    fn decode_headers(&mut self, headers: HeaderList, end_stream: bool) {
        self.decoder.decode_headers(headers, end_stream);
    }

    fn decode_data(&mut self, data: Bytes, end_stream: bool) {
        self.decoder.decode_data(data, end_stream);
    }

    fn decode_metadata(&mut self, metadata: HeaderList) {
        self.decoder.decode_metadata(metadata);
    }

    fn decode_trailers(&mut self, trailers: HeaderList) {
        self.decoder.decode_trailers(trailers);
    }
}

struct ReleasedExchange(#[allow(dead_code)] Rc<RefCell<Exchange>>);

impl DeferredDeletable for ReleasedExchange {}

#[derive(Default)]
struct EngineState {
    exchanges: BTreeMap<StreamId, Rc<RefCell<Exchange>>>,
    resets: Vec<(StreamId, StreamResetReason, String)>,
    watermarks: Vec<(StreamId, Watermark)>,
    buffer_limits: HashMap<StreamId, u32>,
    local_addresses: HashMap<StreamId, String>,
    decline: bool,
    drop_log: Option<DropLog>,
}

/// Scriptable engine. Exchanges stay alive until their stream is reset, then are released
/// through the deferred deleter.
#[derive(Clone, Default)]
pub struct TestEngine {
    state: Rc<RefCell<EngineState>>,
}

impl TestEngine {
    pub fn set_decline(&self, decline: bool) {
        self.state.borrow_mut().decline = decline;
    }

    pub fn set_drop_log(&self, log: DropLog) {
        self.state.borrow_mut().drop_log = Some(log);
    }

    pub fn encoder(&self, id: StreamId) -> ResponseEncoder {
        self.state
            .borrow()
            .exchanges
            .get(&id)
            .expect("no live exchange")
            .borrow()
            .encoder
            .clone()
    }

    pub fn frames(&self, id: StreamId) -> Vec<Frame> {
        self.state
            .borrow()
            .exchanges
            .get(&id)
            .map(|e| e.borrow().decoder.frames.clone())
            .unwrap_or_default()
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.state.borrow().exchanges.keys().copied().collect()
    }

    pub fn resets(&self) -> Vec<(StreamId, StreamResetReason, String)> {
        self.state.borrow().resets.clone()
    }

    pub fn watermarks(&self) -> Vec<(StreamId, Watermark)> {
        self.state.borrow().watermarks.clone()
    }

    pub fn buffer_limit(&self, id: StreamId) -> Option<u32> {
        self.state.borrow().buffer_limits.get(&id).copied()
    }

    pub fn local_address(&self, id: StreamId) -> Option<String> {
        self.state.borrow().local_addresses.get(&id).cloned()
    }
}

impl ApiListener for TestEngine {
    fn new_stream(&mut self, cx: NewStream<'_>) -> Option<DecoderRef> {
        let mut state = self.state.borrow_mut();
        if state.decline {
            return None;
        }
        let id = cx.stream.stream_id();
        state.buffer_limits.insert(id, cx.stream.buffer_limit());
        let local = cx.stream.connection_local_address().to_string();
        state.local_addresses.insert(id, local);
        let exchange = Rc::new(RefCell::new(Exchange {
            encoder: cx.encoder,
            decoder: RecordingDecoder::default(),
            _tracker: state
                .drop_log
                .clone()
                .map(|log| DropTracker::new("exchange", log)),
        }));
        state.exchanges.insert(id, exchange.clone());
        cx.stream.add_callbacks(Box::new(ExchangeCallbacks {
            id,
            state: self.state.clone(),
            deleter: cx.deleter.clone(),
        }));
        let decoder: DecoderRef = exchange;
        Some(decoder)
    }
}

struct ExchangeCallbacks {
    id: StreamId,
    state: Rc<RefCell<EngineState>>,
    deleter: DeferredDeleter,
}

impl StreamCallbacks for ExchangeCallbacks {
    fn on_reset_stream(&mut self, reason: StreamResetReason, details: &str) {
        let mut state = self.state.borrow_mut();
        state.resets.push((self.id, reason, details.to_string()));
        if let Some(exchange) = state.exchanges.remove(&self.id) {
            self.deleter
                .deferred_delete(Box::new(ReleasedExchange(exchange)));
        }
    }

    fn on_above_write_buffer_high_watermark(&mut self) {
        self.state
            .borrow_mut()
            .watermarks
            .push((self.id, Watermark::High));
    }

    fn on_below_write_buffer_low_watermark(&mut self) {
        self.state
            .borrow_mut()
            .watermarks
            .push((self.id, Watermark::Low));
    }
}
