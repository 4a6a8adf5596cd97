//! Outbound half of a stream: caller frames in, engine decoder calls out.
//!
//! Enforces headers -> data*/metadata* -> trailers, with reset allowed at any point and final.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{
    AddressProvider, DecoderRef, RequestDecoder, StreamCallbacks, StreamControl, SyntheticAddress,
};
use crate::types::{HeaderList, StreamId, StreamResetReason};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboundError {
    #[error("engine has not accepted the stream")]
    NotAccepted,
    #[error("headers already sent")]
    HeadersAlreadySent,
    #[error("headers not sent yet")]
    HeadersNotSent,
    #[error("stream closed locally")]
    LocallyClosed,
    #[error("trailers already sent")]
    TrailersAlreadySent,
    #[error("stream was reset")]
    Reset,
}

pub struct OutboundStream {
    id: StreamId,
    address: Arc<SyntheticAddress>,
    buffer_limit: u32,
    decoder: Option<Weak<RefCell<dyn RequestDecoder>>>,
    callbacks: Vec<Box<dyn StreamCallbacks>>,
    response_details: Option<String>,
    headers_sent: bool,
    trailers_sent: bool,
    local_closed: bool,
    reset: bool,
}

impl OutboundStream {
    pub fn new(id: StreamId, address: Arc<SyntheticAddress>, buffer_limit: u32) -> Self {
        Self {
            id,
            address,
            buffer_limit,
            decoder: None,
            callbacks: Vec::new(),
            response_details: None,
            headers_sent: false,
            trailers_sent: false,
            local_closed: false,
            reset: false,
        }
    }

    /// Bind the engine decoder once the engine accepted the stream.
    pub fn bind_decoder(&mut self, decoder: &DecoderRef) {
        self.decoder = Some(Rc::downgrade(decoder));
    }

    /// First write wins.
    pub fn set_response_details(&mut self, details: &str) {
        if self.response_details.is_none() {
            self.response_details = Some(details.to_string());
        }
    }

    pub fn send_headers(&mut self, headers: HeaderList, end_stream: bool) -> Result<(), OutboundError> {
        self.check_open()?;
        if self.headers_sent {
            return Err(OutboundError::HeadersAlreadySent);
        }
        let decoder = self.decoder()?;
        self.headers_sent = true;
        self.local_closed = end_stream;
        decoder.borrow_mut().decode_headers(headers, end_stream);
        Ok(())
    }

    pub fn send_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), OutboundError> {
        self.check_body()?;
        let decoder = self.decoder()?;
        self.local_closed = end_stream;
        decoder.borrow_mut().decode_data(data, end_stream);
        Ok(())
    }

    pub fn send_metadata(&mut self, metadata: HeaderList) -> Result<(), OutboundError> {
        self.check_body()?;
        let decoder = self.decoder()?;
        decoder.borrow_mut().decode_metadata(metadata);
        Ok(())
    }

    /// Trailers close the local side.
    pub fn send_trailers(&mut self, trailers: HeaderList) -> Result<(), OutboundError> {
        if self.reset {
            return Err(OutboundError::Reset);
        }
        if self.trailers_sent {
            return Err(OutboundError::TrailersAlreadySent);
        }
        self.check_body()?;
        let decoder = self.decoder()?;
        self.trailers_sent = true;
        self.local_closed = true;
        decoder.borrow_mut().decode_trailers(trailers);
        Ok(())
    }

    /// Terminal regardless of prior state. Runs reset callbacks once.
    pub fn reset_stream(&mut self, reason: StreamResetReason) {
        if self.reset {
            return;
        }
        self.reset = true;
        self.local_closed = true;
        let details = self.response_details.clone().unwrap_or_default();
        tracing::debug!(stream = self.id, %reason, "running reset callbacks");
        for cb in self.callbacks.iter_mut() {
            cb.on_reset_stream(reason, &details);
        }
    }

    pub fn run_high_watermark_callbacks(&mut self) {
        for cb in self.callbacks.iter_mut() {
            cb.on_above_write_buffer_high_watermark();
        }
    }

    pub fn run_low_watermark_callbacks(&mut self) {
        for cb in self.callbacks.iter_mut() {
            cb.on_below_write_buffer_low_watermark();
        }
    }

    fn check_open(&self) -> Result<(), OutboundError> {
        if self.reset {
            return Err(OutboundError::Reset);
        }
        if self.local_closed {
            return Err(OutboundError::LocallyClosed);
        }
        Ok(())
    }

    fn check_body(&self) -> Result<(), OutboundError> {
        self.check_open()?;
        if !self.headers_sent {
            return Err(OutboundError::HeadersNotSent);
        }
        Ok(())
    }

    fn decoder(&self) -> Result<DecoderRef, OutboundError> {
        self.decoder
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(OutboundError::NotAccepted)
    }
}

impl StreamControl for OutboundStream {
    fn stream_id(&self) -> StreamId {
        self.id
    }

    fn add_callbacks(&mut self, callbacks: Box<dyn StreamCallbacks>) {
        self.callbacks.push(callbacks);
    }

    fn read_disable(&mut self, _disable: bool) {}

    fn buffer_limit(&self) -> u32 {
        self.buffer_limit
    }

    fn response_details(&self) -> &str {
        self.response_details.as_deref().unwrap_or("")
    }
}

impl AddressProvider for OutboundStream {
    fn connection_local_address(&self) -> &Arc<SyntheticAddress> {
        &self.address
    }
}
