// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! The shared incoming message dispatch queue.
//!
//! All streams of a session deliver their reassembled inbound
//! messages here.  Consumers register an [IncomingMessageHandler] for
//! each request they have in flight; an arriving message is offered
//! to each waiting handler until one claims it.  Messages that nobody
//! claims are parked and offered again to handlers registered later,
//! preserving arrival order.
//!
//! Handlers are always invoked after the queue lock has been
//! released.
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use crate::error::Code;
use crate::error::Status;
use crate::message::Message;

/// Trait for consumers of inbound messages.
pub trait IncomingMessageHandler: Send + Sync {
    /// Check whether this handler claims `msg`.
    ///
    /// Implementations inspect the message bytes themselves; the
    /// queue attaches no meaning to them.
    fn examine(
        &self,
        msg: &Message
    ) -> bool;

    /// Take delivery of a claimed message.  The handler is retired
    /// afterwards.
    fn process(
        &self,
        msg: Message
    );

    /// Take delivery of a failure.  The handler is retired
    /// afterwards.
    fn fail(
        &self,
        status: Status
    );

    /// Get the time at which this handler expires, if it does.
    fn expires(&self) -> Option<Instant> {
        None
    }
}

struct InboundQueueInner {
    /// Handlers waiting for a message to claim.
    handlers: Vec<Arc<dyn IncomingMessageHandler>>,
    /// Messages nobody has claimed yet, in arrival order.
    parked: VecDeque<Message>
}

/// The incoming dispatch queue shared by the streams of a session.
pub struct InboundQueue {
    inner: Mutex<InboundQueueInner>
}

impl InboundQueue {
    /// Create an empty queue.
    #[inline]
    pub fn new() -> Self {
        InboundQueue {
            inner: Mutex::new(InboundQueueInner {
                handlers: Vec::new(),
                parked: VecDeque::new()
            })
        }
    }

    /// Deliver an inbound message.
    ///
    /// The message goes to the first waiting handler that claims it,
    /// or is parked if no handler does.
    pub fn add_message(
        &self,
        msg: Message
    ) {
        let claimed = {
            let mut inner = self.inner.lock().unwrap();

            match inner.handlers.iter().position(|hnd| hnd.examine(&msg)) {
                Some(idx) => Some(inner.handlers.remove(idx)),
                None => {
                    inner.parked.push_back(msg);

                    return;
                }
            }
        };

        if let Some(handler) = claimed {
            handler.process(msg)
        }
    }

    /// Register a handler for an expected message.
    ///
    /// Parked messages are offered to the handler first, oldest
    /// first; if one is claimed the handler never enters the wait
    /// set.
    pub fn add_handler(
        &self,
        handler: Arc<dyn IncomingMessageHandler>
    ) {
        let claimed = {
            let mut inner = self.inner.lock().unwrap();

            match inner.parked.iter().position(|msg| handler.examine(msg)) {
                Some(idx) => inner.parked.remove(idx),
                None => {
                    inner.handlers.push(handler);

                    return;
                }
            }
        };

        if let Some(msg) = claimed {
            handler.process(msg)
        }
    }

    /// Remove a previously registered handler without invoking it.
    pub fn remove_handler(
        &self,
        handler: &Arc<dyn IncomingMessageHandler>
    ) {
        let mut inner = self.inner.lock().unwrap();

        inner
            .handlers
            .retain(|hnd| !Arc::ptr_eq(hnd, handler))
    }

    /// Fail every waiting handler with `status`.
    ///
    /// Used when the primary stream faults: pending requests can no
    /// longer be matched to replies.
    pub fn fail_all_handlers(
        &self,
        status: Status
    ) {
        let handlers = {
            let mut inner = self.inner.lock().unwrap();

            std::mem::take(&mut inner.handlers)
        };

        for handler in handlers {
            handler.fail(status)
        }
    }

    /// Retire every handler whose expiration has passed.
    pub fn timeout_handlers(
        &self,
        now: Instant
    ) {
        let expired = {
            let mut inner = self.inner.lock().unwrap();
            let mut expired = Vec::new();
            let mut keep = Vec::with_capacity(inner.handlers.len());

            for handler in inner.handlers.drain(..) {
                match handler.expires() {
                    Some(at) if at <= now => expired.push(handler),
                    _ => keep.push(handler)
                }
            }

            inner.handlers = keep;

            expired
        };

        for handler in expired {
            handler.fail(Status::error(Code::SocketTimeout))
        }
    }

    /// Get the number of waiting handlers.
    #[inline]
    pub fn handler_count(&self) -> usize {
        self.inner.lock().unwrap().handlers.len()
    }
}

impl Default for InboundQueue {
    #[inline]
    fn default() -> Self {
        InboundQueue::new()
    }
}

#[cfg(test)]
use std::sync::atomic::AtomicBool;
#[cfg(test)]
use std::sync::atomic::Ordering;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
struct TagHandler {
    tag: u8,
    got: Mutex<Option<Message>>,
    failed: Mutex<Option<Status>>,
    expires: Option<Instant>
}

#[cfg(test)]
impl TagHandler {
    fn new(tag: u8) -> Arc<Self> {
        Arc::new(TagHandler {
            tag: tag,
            got: Mutex::new(None),
            failed: Mutex::new(None),
            expires: None
        })
    }

    fn with_expiry(
        tag: u8,
        at: Instant
    ) -> Arc<Self> {
        Arc::new(TagHandler {
            tag: tag,
            got: Mutex::new(None),
            failed: Mutex::new(None),
            expires: Some(at)
        })
    }
}

#[cfg(test)]
impl IncomingMessageHandler for TagHandler {
    fn examine(
        &self,
        msg: &Message
    ) -> bool {
        msg.as_slice().first() == Some(&self.tag)
    }

    fn process(
        &self,
        msg: Message
    ) {
        *self.got.lock().unwrap() = Some(msg)
    }

    fn fail(
        &self,
        status: Status
    ) {
        *self.failed.lock().unwrap() = Some(status)
    }

    fn expires(&self) -> Option<Instant> {
        self.expires
    }
}

#[test]
fn test_handler_then_message() {
    let queue = InboundQueue::new();
    let handler = TagHandler::new(7);

    queue.add_handler(handler.clone());
    queue.add_message(Message::from_bytes(vec![7, 1, 2]));

    let got = handler.got.lock().unwrap();

    assert_eq!(got.as_ref().unwrap().as_slice(), &[7, 1, 2]);
    assert_eq!(queue.handler_count(), 0);
}

#[test]
fn test_message_parks_until_handler_arrives() {
    let queue = InboundQueue::new();

    queue.add_message(Message::from_bytes(vec![9]));

    let handler = TagHandler::new(9);

    queue.add_handler(handler.clone());

    assert!(handler.got.lock().unwrap().is_some());
    assert_eq!(queue.handler_count(), 0);
}

#[test]
fn test_unclaimed_message_ignored_by_other_handlers() {
    let queue = InboundQueue::new();
    let handler = TagHandler::new(1);

    queue.add_handler(handler.clone());
    queue.add_message(Message::from_bytes(vec![2]));

    assert!(handler.got.lock().unwrap().is_none());
    assert_eq!(queue.handler_count(), 1);
}

#[test]
fn test_fail_all_handlers() {
    let queue = InboundQueue::new();
    let first = TagHandler::new(1);
    let second = TagHandler::new(2);

    queue.add_handler(first.clone());
    queue.add_handler(second.clone());
    queue.fail_all_handlers(Status::error(Code::StreamDisconnect));

    assert_eq!(
        *first.failed.lock().unwrap(),
        Some(Status::error(Code::StreamDisconnect))
    );
    assert_eq!(
        *second.failed.lock().unwrap(),
        Some(Status::error(Code::StreamDisconnect))
    );
    assert_eq!(queue.handler_count(), 0);
}

#[test]
fn test_timeout_retires_only_expired_handlers() {
    let queue = InboundQueue::new();
    let base = Instant::now();
    let expired = TagHandler::with_expiry(1, base + Duration::from_secs(10));
    let live = TagHandler::with_expiry(2, base + Duration::from_secs(90));

    queue.add_handler(expired.clone());
    queue.add_handler(live.clone());
    queue.timeout_handlers(base + Duration::from_secs(30));

    assert_eq!(
        *expired.failed.lock().unwrap(),
        Some(Status::error(Code::SocketTimeout))
    );
    assert!(live.failed.lock().unwrap().is_none());
    assert_eq!(queue.handler_count(), 1);
}

#[test]
fn test_handlers_invoked_outside_lock() {
    // A handler that turns around and touches the queue would
    // deadlock if dispatch held the lock.
    struct Reentrant {
        queue: Arc<InboundQueue>,
        hit: AtomicBool
    }

    impl IncomingMessageHandler for Reentrant {
        fn examine(
            &self,
            _msg: &Message
        ) -> bool {
            true
        }

        fn process(
            &self,
            _msg: Message
        ) {
            self.hit.store(true, Ordering::SeqCst);
            self.queue.add_message(Message::from_bytes(vec![0xff]))
        }

        fn fail(
            &self,
            _status: Status
        ) {
        }
    }

    let queue = Arc::new(InboundQueue::new());
    let handler = Arc::new(Reentrant {
        queue: queue.clone(),
        hit: AtomicBool::new(false)
    });

    queue.add_handler(handler.clone());
    queue.add_message(Message::from_bytes(vec![1]));

    assert!(handler.hit.load(Ordering::SeqCst))
}
