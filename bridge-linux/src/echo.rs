//! Loopback engine: answers every bridged request by echoing it back.
//!
//! `:path` of `/status/<code>` picks the response status; `/reset` resets the stream instead of
//! answering. Exchanges are released through the deferred deleter once their response is
//! finished or the stream is reset.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bridge_core::{
    AddressProvider, ApiListener, DecoderRef, DeferredDeletable, DeferredDeleter, HeaderList, NewStream,
    RequestDecoder, ResponseEncoder, StreamCallbacks, StreamControl, StreamId, StreamResetReason,
};
use bytes::Bytes;

type Exchanges = Rc<RefCell<HashMap<StreamId, Rc<RefCell<EchoExchange>>>>>;

#[derive(Default)]
pub struct EchoListener {
    exchanges: Exchanges,
}

impl EchoListener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApiListener for EchoListener {
    fn new_stream(&mut self, cx: NewStream<'_>) -> Option<DecoderRef> {
        let id = cx.stream.stream_id();
        let exchange = Rc::new(RefCell::new(EchoExchange {
            id,
            encoder: cx.encoder,
            exchanges: self.exchanges.clone(),
            deleter: cx.deleter.clone(),
            headers_sent: false,
        }));
        self.exchanges.borrow_mut().insert(id, exchange.clone());
        cx.stream.add_callbacks(Box::new(EchoCallbacks {
            id,
            exchanges: self.exchanges.clone(),
            deleter: cx.deleter.clone(),
        }));
        tracing::debug!(
            stream = id,
            buffer_limit = cx.stream.buffer_limit(),
            local = %cx.stream.connection_local_address(),
            "echo exchange"
        );
        let decoder: DecoderRef = exchange;
        Some(decoder)
    }
}

struct EchoExchange {
    id: StreamId,
    encoder: ResponseEncoder,
    exchanges: Exchanges,
    deleter: DeferredDeleter,
    headers_sent: bool,
}

struct Released(#[allow(dead_code)] Rc<RefCell<EchoExchange>>);

impl DeferredDeletable for Released {}

fn release(exchanges: &Exchanges, deleter: &DeferredDeleter, id: StreamId) {
    if let Some(e) = exchanges.borrow_mut().remove(&id) {
        deleter.deferred_delete(Box::new(Released(e)));
    }
}

fn response_status(path: &str) -> Option<&str> {
    let code = path.strip_prefix("/status/")?;
    match code.parse::<u16>() {
        Ok(100..=599) => Some(code),
        _ => None,
    }
}

impl EchoExchange {
    fn finish(&self) {
        release(&self.exchanges, &self.deleter, self.id);
    }
}

impl RequestDecoder for EchoExchange {
    fn decode_headers(&mut self, headers: HeaderList, end_stream: bool) {
        let path = headers.get(":path").unwrap_or("/");
        if path == "/reset" {
            self.encoder.reset_stream(StreamResetReason::RemoteReset);
            return;
        }
        let mut response = HeaderList::new();
        response.push(":status", response_status(path).unwrap_or("200"));
        if let Some(ct) = headers.get("content-type") {
            response.push("content-type", ct);
        }
        for (name, value) in headers.iter().filter(|(n, _)| !n.starts_with(':')) {
            response.push(format!("x-echo-{name}"), value);
        }
        self.headers_sent = true;
        self.encoder.encode_headers(response, end_stream);
        if end_stream {
            self.finish();
        }
    }

    fn decode_data(&mut self, data: Bytes, end_stream: bool) {
        if !self.headers_sent {
            return;
        }
        self.encoder.encode_data(data, end_stream);
        if end_stream {
            self.finish();
        }
    }

    fn decode_metadata(&mut self, metadata: HeaderList) {
        tracing::debug!(stream = self.id, entries = metadata.len(), "metadata ignored");
    }

    fn decode_trailers(&mut self, trailers: HeaderList) {
        if !self.headers_sent {
            return;
        }
        self.encoder.encode_trailers(trailers);
        self.finish();
    }
}

struct EchoCallbacks {
    id: StreamId,
    exchanges: Exchanges,
    deleter: DeferredDeleter,
}

impl StreamCallbacks for EchoCallbacks {
    fn on_reset_stream(&mut self, reason: StreamResetReason, details: &str) {
        tracing::debug!(stream = self.id, %reason, details, "echo exchange reset");
        release(&self.exchanges, &self.deleter, self.id);
    }

    fn on_above_write_buffer_high_watermark(&mut self) {
        tracing::debug!(stream = self.id, "caller is behind");
    }

    fn on_below_write_buffer_low_watermark(&mut self) {
        tracing::debug!(stream = self.id, "caller caught up");
    }
}
