//! Inbound half of a stream: engine responses in, caller callbacks out.
//!
//! Every engine event, pull request and cancellation for one stream goes through
//! [`InboundAdapter::handle`]. In synchronous mode body bytes go straight to the caller and
//! never wait anywhere, so no watermark is ever reported. In async mode they sit in a
//! [`WatermarkBuffer`] and are released only against what the caller asked for with
//! `resume_data`.
//!
//! Exactly one of `on_complete`, `on_cancel`, `on_error` is delivered. After it the adapter is
//! closed and ignores everything.

use bytes::Bytes;

use crate::buffer::{Watermark, WatermarkBuffer};
use crate::types::{names, ErrorCode, HeaderList, StreamError, StreamId};

/// Callbacks into the foreign caller. Invoked on the engine context.
pub trait HttpCallbacks: Send {
    fn on_headers(&mut self, headers: HeaderList, end_stream: bool);
    fn on_data(&mut self, data: Bytes, end_stream: bool);
    fn on_trailers(&mut self, trailers: HeaderList);
    fn on_complete(&mut self);
    fn on_cancel(&mut self);
    fn on_error(&mut self, error: StreamError);
}

#[derive(Debug)]
pub enum InboundEvent {
    Headers { headers: HeaderList, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    Trailers(HeaderList),
    Error(StreamError),
    /// Caller wants this many more body bytes (async mode).
    Resume(u64),
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// `success` is false for non-2xx responses.
    Complete { success: bool },
    Cancel,
    Error,
}

/// What the owner has to act on after one event.
#[derive(Debug, Default)]
pub struct Progress {
    pub terminal: Option<Terminal>,
    pub watermarks: Vec<Watermark>,
}

/// Engine-generated error reply, collected until its end of stream.
struct LocalReply {
    code: ErrorCode,
    message: Option<String>,
    body: Vec<u8>,
}

pub struct InboundAdapter {
    id: StreamId,
    callbacks: Box<dyn HttpCallbacks>,
    async_mode: bool,
    body: WatermarkBuffer,
    trailers: Option<HeaderList>,
    pending_error: Option<StreamError>,
    local_reply: Option<LocalReply>,
    attempt_count: Option<u32>,
    bytes_requested: u64,
    headers_sent: bool,
    remote_closed: bool,
    end_stream_sent: bool,
    success: bool,
    closed: bool,
}

impl InboundAdapter {
    pub fn new(
        id: StreamId,
        callbacks: Box<dyn HttpCallbacks>,
        async_mode: bool,
        high_watermark: usize,
    ) -> Self {
        Self {
            id,
            callbacks,
            async_mode,
            body: WatermarkBuffer::new(high_watermark),
            trailers: None,
            pending_error: None,
            local_reply: None,
            attempt_count: None,
            bytes_requested: 0,
            headers_sent: false,
            remote_closed: false,
            end_stream_sent: false,
            success: false,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn buffered(&self) -> usize {
        self.body.len()
    }

    pub fn bytes_requested(&self) -> u64 {
        self.bytes_requested
    }

    pub fn handle(&mut self, event: InboundEvent) -> Progress {
        let mut p = Progress::default();
        if self.closed {
            tracing::warn!(stream = self.id, ?event, "event after terminal ignored");
            return p;
        }
        match event {
            InboundEvent::Headers {
                headers,
                end_stream,
            } => self.on_headers(headers, end_stream, &mut p),
            InboundEvent::Data { data, end_stream } => self.on_data(data, end_stream, &mut p),
            InboundEvent::Trailers(trailers) => self.on_trailers(trailers, &mut p),
            InboundEvent::Error(error) => self.on_remote_error(error, &mut p),
            InboundEvent::Resume(bytes) => self.on_resume(bytes, &mut p),
            InboundEvent::Cancel => {
                self.close();
                self.callbacks.on_cancel();
                p.terminal = Some(Terminal::Cancel);
            }
        }
        p
    }

    fn on_headers(&mut self, headers: HeaderList, end_stream: bool, p: &mut Progress) {
        if self.headers_sent || self.local_reply.is_some() || self.remote_closed {
            tracing::warn!(stream = self.id, "duplicate response headers ignored");
            return;
        }
        if let Some(n) = headers
            .get(names::ATTEMPT_COUNT)
            .and_then(|v| v.trim().parse().ok())
        {
            self.attempt_count = Some(n);
        }
        if let Some(code) = headers.get(names::ERROR_CODE) {
            let code = ErrorCode::from_i32(code.trim().parse().unwrap_or(0));
            self.local_reply = Some(LocalReply {
                code,
                message: headers.get(names::ERROR_MESSAGE).map(str::to_string),
                body: Vec::new(),
            });
            if end_stream {
                self.remote_closed = true;
                self.fail_local_reply(p);
            }
            return;
        }
        self.success = headers
            .status()
            .map_or(false, |s| (200..300).contains(&s));
        self.headers_sent = true;
        if end_stream {
            self.remote_closed = true;
            self.end_stream_sent = true;
        }
        tracing::debug!(stream = self.id, end_stream, "response headers");
        self.callbacks.on_headers(headers, end_stream);
        self.settle(p);
    }

    fn on_data(&mut self, data: Bytes, end_stream: bool, p: &mut Progress) {
        if self.remote_closed {
            tracing::warn!(stream = self.id, "response data after end of stream ignored");
            return;
        }
        if let Some(reply) = self.local_reply.as_mut() {
            reply.body.extend_from_slice(&data);
            if end_stream {
                self.remote_closed = true;
                self.fail_local_reply(p);
            }
            return;
        }
        if !self.headers_sent {
            tracing::warn!(stream = self.id, "response data before headers ignored");
            return;
        }
        self.remote_closed = end_stream;
        if !self.async_mode {
            if !data.is_empty() || end_stream {
                self.deliver_data(data, end_stream);
            }
            self.settle(p);
            return;
        }
        if let Some(w) = self.body.push(&data) {
            p.watermarks.push(w);
        }
        self.flush(p);
    }

    fn on_trailers(&mut self, trailers: HeaderList, p: &mut Progress) {
        if self.remote_closed {
            tracing::warn!(stream = self.id, "response trailers after end of stream ignored");
            return;
        }
        self.remote_closed = true;
        if self.local_reply.is_some() {
            self.fail_local_reply(p);
            return;
        }
        if !self.headers_sent {
            tracing::warn!(stream = self.id, "response trailers before headers ignored");
            return;
        }
        self.trailers = Some(trailers);
        self.settle(p);
    }

    fn on_remote_error(&mut self, mut error: StreamError, p: &mut Progress) {
        if error.attempt_count.is_none() {
            error.attempt_count = self.attempt_count;
        }
        self.remote_closed = true;
        self.trailers = None;
        if !self.body.is_empty() {
            tracing::debug!(
                stream = self.id,
                buffered = self.body.len(),
                "error deferred until buffered body drains"
            );
            self.pending_error = Some(error);
            return;
        }
        self.fail(error, p);
    }

    fn on_resume(&mut self, bytes: u64, p: &mut Progress) {
        if !self.async_mode {
            tracing::debug!(stream = self.id, "resume_data ignored in synchronous mode");
            return;
        }
        self.bytes_requested = self.bytes_requested.saturating_add(bytes);
        self.flush(p);
    }

    /// Release what the caller asked for, then settle trailers/error/completion.
    fn flush(&mut self, p: &mut Progress) {
        if !self.body.is_empty() {
            if self.bytes_requested > 0 {
                let n = self.bytes_requested.min(self.body.len() as u64) as usize;
                let (bytes, w) = self.body.take(n);
                if let Some(w) = w {
                    p.watermarks.push(w);
                }
                self.bytes_requested -= n as u64;
                let end = self.remote_closed
                    && self.body.is_empty()
                    && self.trailers.is_none()
                    && self.pending_error.is_none();
                self.deliver_data(bytes, end);
            }
        } else if self.remote_closed
            && self.trailers.is_none()
            && self.pending_error.is_none()
            && !self.end_stream_sent
        {
            self.deliver_data(Bytes::new(), true);
        }
        self.settle(p);
    }

    fn settle(&mut self, p: &mut Progress) {
        if self.body.is_empty() {
            if let Some(trailers) = self.trailers.take() {
                self.end_stream_sent = true;
                self.callbacks.on_trailers(trailers);
            }
            if let Some(error) = self.pending_error.take() {
                self.fail(error, p);
                return;
            }
        }
        if self.end_stream_sent {
            self.close();
            self.callbacks.on_complete();
            p.terminal = Some(Terminal::Complete {
                success: self.success,
            });
        }
    }

    fn deliver_data(&mut self, bytes: Bytes, end_stream: bool) {
        if end_stream {
            self.end_stream_sent = true;
        }
        self.callbacks.on_data(bytes, end_stream);
    }

    fn fail_local_reply(&mut self, p: &mut Progress) {
        let Some(reply) = self.local_reply.take() else {
            return;
        };
        let message = reply
            .message
            .unwrap_or_else(|| String::from_utf8_lossy(&reply.body).into_owned());
        let error = StreamError {
            code: reply.code,
            message,
            attempt_count: self.attempt_count,
        };
        self.fail(error, p);
    }

    fn fail(&mut self, error: StreamError, p: &mut Progress) {
        self.close();
        tracing::debug!(stream = self.id, code = ?error.code, "stream error");
        self.callbacks.on_error(error);
        p.terminal = Some(Terminal::Error);
    }

    fn close(&mut self) {
        self.closed = true;
        self.body.clear();
        self.trailers = None;
        self.pending_error = None;
    }
}
