//! Engine-context plumbing: a command queue any thread can post to, and the deferred
//! cleanup list that is swept at the end of each dispatch turn.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tokio::sync::mpsc;

/// Object whose drop must wait for the end of the current dispatch turn.
pub trait DeferredDeletable {
    /// Called when the object is queued, before the turn ends.
    fn delete_is_pending(&mut self) {}
}

/// Deferred cleanup list for the engine context. Cloning shares the list.
///
/// Entries are dropped in the order they were queued.
#[derive(Clone, Default)]
pub struct DeferredDeleter {
    pending: Rc<RefCell<VecDeque<Box<dyn DeferredDeletable>>>>,
}

impl DeferredDeleter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deferred_delete(&self, mut item: Box<dyn DeferredDeletable>) {
        item.delete_is_pending();
        self.pending.borrow_mut().push_back(item);
    }

    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Drop everything queued, including entries queued by drops during the sweep.
    pub fn sweep(&self) -> usize {
        let mut dropped = 0;
        loop {
            // Pop outside the drop so a destructor may queue more.
            let next = self.pending.borrow_mut().pop_front();
            match next {
                Some(item) => {
                    drop(item);
                    dropped += 1;
                }
                None => return dropped,
            }
        }
    }
}

/// Sending half of the engine queue. Cheap to clone; usable from any thread.
pub struct Poster<M> {
    tx: mpsc::UnboundedSender<M>,
}

impl<M> Clone for Poster<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> Poster<M> {
    /// Queue a message for the engine context. Returns false once the engine is gone.
    pub fn post(&self, msg: M) -> bool {
        self.try_post(msg).is_ok()
    }

    /// Like [`post`](Self::post), but hands the message back when the engine is gone.
    pub fn try_post(&self, msg: M) -> Result<(), M> {
        self.tx.send(msg).map_err(|e| e.0)
    }
}

/// Receiving half of the engine queue plus the deferred cleanup list.
pub struct Dispatcher<M> {
    rx: mpsc::UnboundedReceiver<M>,
    deleter: DeferredDeleter,
}

/// Create a queue. Messages posted before anyone drains it are held in order.
pub fn channel<M>() -> (Poster<M>, mpsc::UnboundedReceiver<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Poster { tx }, rx)
}

impl<M> Dispatcher<M> {
    pub fn new(rx: mpsc::UnboundedReceiver<M>) -> Self {
        Self {
            rx,
            deleter: DeferredDeleter::new(),
        }
    }

    pub fn deleter(&self) -> &DeferredDeleter {
        &self.deleter
    }

    /// Next queued message without waiting.
    pub fn try_next(&mut self) -> Option<M> {
        self.rx.try_recv().ok()
    }

    /// Next message; `None` once every poster is dropped.
    pub async fn next(&mut self) -> Option<M> {
        self.rx.recv().await
    }

    /// Refuse further posts. Messages already queued can still be taken.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// End of a dispatch turn.
    pub fn end_turn(&self) -> usize {
        self.deleter.sweep()
    }
}
