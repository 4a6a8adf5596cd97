//! A bridged stream: outbound and inbound halves under one id, and the wrapper that defers
//! its release to the end of a dispatch turn.

use std::cell::RefCell;
use std::rc::Rc;

use crate::dispatcher::DeferredDeletable;
use crate::inbound::InboundAdapter;
use crate::outbound::OutboundStream;
use crate::types::StreamId;

pub struct DirectStream {
    pub id: StreamId,
    pub outbound: OutboundStream,
    pub inbound: InboundAdapter,
}

pub type DirectStreamRef = Rc<RefCell<DirectStream>>;

impl DirectStream {
    pub fn new(id: StreamId, outbound: OutboundStream, inbound: InboundAdapter) -> DirectStreamRef {
        Rc::new(RefCell::new(Self {
            id,
            outbound,
            inbound,
        }))
    }
}

impl Drop for DirectStream {
    fn drop(&mut self) {
        tracing::trace!(stream = self.id, "stream released");
    }
}

/// Holds a removed stream until the deferred sweep, so engine objects queued earlier in the
/// same turn are dropped first.
pub struct DirectStreamWrapper {
    stream: DirectStreamRef,
}

impl DirectStreamWrapper {
    pub fn new(stream: DirectStreamRef) -> Self {
        Self { stream }
    }
}

impl DeferredDeletable for DirectStreamWrapper {
    fn delete_is_pending(&mut self) {
        tracing::trace!(stream = self.stream.borrow().id, "stream queued for release");
    }
}
