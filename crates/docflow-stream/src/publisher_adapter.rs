//! Credit-to-push adapter
//!
//! Turns a [`CreditSource`] into a [`ReadStream`]. Upstream credit is granted
//! one window at a time, and only once every requested item has arrived and
//! been delivered to the consumer, so a paused consumer holds at most one
//! window in memory.

use std::sync::Arc;

use docflow_common::DocFlowError;
use parking_lot::Mutex;

use crate::context::Context;
use crate::fault::Fault;
use crate::queue::InboundQueue;
use crate::reactive::{CreditSource, Subscriber, Subscription};
use crate::streams::{ErrorHandler, Handler, ReadStream, VoidHandler};

/// Default number of items requested per upstream credit window
pub const DEFAULT_BATCH_SIZE: u64 = 20;

/// Lifecycle of a [`PublisherAdapter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// No consumer attached yet
    Idle,
    /// Subscribed upstream, items flowing
    Started,
    /// Upstream terminated, buffered items still being delivered
    Exhausted,
    /// Terminal
    Stopped,
}

/// [`ReadStream`] over a [`CreditSource`]
pub struct PublisherAdapter<T> {
    inner: Arc<AdapterInner<T>>,
}

struct AdapterInner<T> {
    context: Context,
    source: Arc<dyn CreditSource<T>>,
    batch_size: u64,
    queue: InboundQueue<T>,
    shared: Mutex<AdapterShared<T>>,
}

struct AdapterShared<T> {
    state: AdapterState,
    handler: Option<Handler<T>>,
    end_handler: Option<VoidHandler>,
    exception_handler: Option<ErrorHandler>,
    subscription: Option<Arc<dyn Subscription>>,
    requested_not_received: u64,
    received_not_delivered: u64,
    /// Upstream error held until the buffered items are delivered
    failure: Option<DocFlowError>,
}

impl<T: Send + 'static> PublisherAdapter<T> {
    /// Create an adapter with the default credit window
    pub fn new(context: Context, source: Arc<dyn CreditSource<T>>) -> Self {
        Self::with_batch_size(context, source, DEFAULT_BATCH_SIZE)
    }

    /// Create an adapter requesting `batch_size` items per window
    pub fn with_batch_size(
        context: Context,
        source: Arc<dyn CreditSource<T>>,
        batch_size: u64,
    ) -> Self {
        let queue = InboundQueue::new(context.clone());
        Self {
            inner: Arc::new(AdapterInner {
                context,
                source,
                batch_size: batch_size.max(1),
                queue,
                shared: Mutex::new(AdapterShared {
                    state: AdapterState::Idle,
                    handler: None,
                    end_handler: None,
                    exception_handler: None,
                    subscription: None,
                    requested_not_received: 0,
                    received_not_delivered: 0,
                    failure: None,
                }),
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> AdapterState {
        self.inner.shared.lock().state
    }

    /// Stop the adapter, cancelling upstream; idempotent
    pub fn close(&self) {
        self.inner.stop(true);
    }
}

impl<T: Send + 'static> ReadStream<T> for PublisherAdapter<T> {
    fn handler(&self, handler: Option<Handler<T>>) {
        let Some(handler) = handler else {
            let idle = self.inner.shared.lock().state == AdapterState::Idle;
            if !idle {
                self.inner.stop(true);
            }
            return;
        };

        let subscribe = {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                AdapterState::Stopped => {
                    tracing::debug!("Handler attached to a stopped publisher adapter, ignoring");
                    return;
                }
                AdapterState::Idle => {
                    shared.handler = Some(handler);
                    shared.state = AdapterState::Started;
                    true
                }
                AdapterState::Started | AdapterState::Exhausted => {
                    shared.handler = Some(handler);
                    false
                }
            }
        };

        if subscribe {
            let inner = Arc::clone(&self.inner);
            self.inner
                .queue
                .handler(Some(Arc::new(move |item: T| inner.deliver(item))));
            tracing::debug!(
                context_id = self.inner.context.id(),
                batch_size = self.inner.batch_size,
                "Subscribing publisher adapter upstream"
            );
            let subscriber = Arc::new(AdapterSubscriber {
                inner: Arc::clone(&self.inner),
            });
            self.inner.source.subscribe(subscriber);
        }
    }

    fn pause(&self) {
        self.inner.queue.pause();
    }

    fn resume(&self) {
        self.inner.queue.resume();
    }

    fn fetch(&self, amount: u64) {
        self.inner.queue.fetch(amount);
    }

    fn end_handler(&self, handler: Option<VoidHandler>) {
        self.inner.shared.lock().end_handler = handler;
    }

    fn exception_handler(&self, handler: Option<ErrorHandler>) {
        self.inner.shared.lock().exception_handler = handler;
    }
}

impl<T: Send + 'static> AdapterInner<T> {
    /// Queue handler: hands one item to the consumer, then settles credit
    fn deliver(self: &Arc<Self>, item: T) {
        let (handler, finished, failure) = {
            let mut shared = self.shared.lock();
            if shared.state == AdapterState::Stopped {
                return;
            }
            shared.received_not_delivered = shared.received_not_delivered.saturating_sub(1);
            let finished =
                shared.state == AdapterState::Exhausted && shared.received_not_delivered == 0;
            let failure = if finished { shared.failure.take() } else { None };
            (shared.handler.clone(), finished, failure)
        };

        if let Some(handler) = handler {
            handler(item);
        }

        match (finished, failure) {
            (true, Some(error)) => self.fail(error),
            (true, None) => self.stop(true),
            _ => self.request_more(),
        }
    }

    /// Grant one more window once nothing is in flight
    fn request_more(&self) {
        let (subscription, n) = {
            let mut shared = self.shared.lock();
            if shared.state != AdapterState::Started
                || shared.requested_not_received > 0
                || shared.received_not_delivered > 0
            {
                return;
            }
            let Some(subscription) = shared.subscription.clone() else {
                return;
            };
            shared.requested_not_received = self.batch_size;
            (subscription, self.batch_size)
        };
        tracing::trace!(n, "Requesting upstream credit");
        subscription.request(n);
    }

    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let rejected = {
            let mut shared = self.shared.lock();
            if shared.state == AdapterState::Stopped {
                Some(subscription)
            } else if shared.subscription.is_some() {
                tracing::warn!("Publisher delivered a second subscription, cancelling it");
                Some(subscription)
            } else {
                shared.subscription = Some(subscription);
                None
            }
        };
        match rejected {
            Some(subscription) => subscription.cancel(),
            None => self.request_more(),
        }
    }

    fn on_next(&self, item: T) {
        {
            let mut shared = self.shared.lock();
            if shared.state == AdapterState::Stopped {
                tracing::trace!("Discarding item delivered after stop");
                return;
            }
            if shared.requested_not_received == 0 {
                tracing::warn!("Publisher delivered more items than requested");
            }
            shared.requested_not_received = shared.requested_not_received.saturating_sub(1);
            shared.received_not_delivered += 1;
        }
        self.queue.write(item);
    }

    fn on_complete(&self) {
        let finished = {
            let mut shared = self.shared.lock();
            if shared.state == AdapterState::Stopped {
                return;
            }
            shared.subscription = None;
            if shared.received_not_delivered == 0 {
                true
            } else {
                shared.state = AdapterState::Exhausted;
                false
            }
        };
        if finished {
            self.stop(true);
        }
    }

    /// Buffered items are delivered first; the error follows the last of them
    fn on_error(&self, error: DocFlowError) {
        {
            let mut shared = self.shared.lock();
            match shared.state {
                AdapterState::Stopped | AdapterState::Exhausted => {
                    tracing::trace!(error = %error, "Discarding upstream error after termination");
                    return;
                }
                _ if shared.received_not_delivered > 0 => {
                    tracing::debug!(
                        buffered = shared.received_not_delivered,
                        "Upstream failed, delivering buffered items first"
                    );
                    shared.state = AdapterState::Exhausted;
                    shared.subscription = None;
                    shared.failure = Some(error);
                    return;
                }
                _ => {}
            }
        }
        self.fail(error);
    }

    fn fail(&self, error: DocFlowError) {
        let exception_handler = {
            let mut shared = self.shared.lock();
            if shared.state == AdapterState::Stopped {
                return;
            }
            shared.state = AdapterState::Stopped;
            shared.subscription = None;
            shared.handler = None;
            shared.end_handler = None;
            shared.exception_handler.take()
        };
        self.queue.clear();

        match exception_handler {
            Some(handler) => handler(error),
            None => self
                .context
                .report_failure(Fault::new(error).origin("publisher-adapter")),
        }
    }

    /// Enter the terminal state; cancels upstream and schedules end once
    fn stop(&self, fire_end: bool) {
        let (subscription, end_handler) = {
            let mut shared = self.shared.lock();
            if shared.state == AdapterState::Stopped {
                return;
            }
            shared.state = AdapterState::Stopped;
            shared.handler = None;
            shared.exception_handler = None;
            let end_handler = shared.end_handler.take();
            (shared.subscription.take(), end_handler)
        };
        self.queue.clear();

        if let Some(subscription) = subscription {
            tracing::debug!("Cancelling upstream subscription");
            subscription.cancel();
        }
        if let (true, Some(end_handler)) = (fire_end, end_handler) {
            self.context.run_on_context(move || end_handler());
        }
    }
}

/// Upstream-facing half; every signal is redispatched onto the context
struct AdapterSubscriber<T> {
    inner: Arc<AdapterInner<T>>,
}

impl<T: Send + 'static> Subscriber<T> for AdapterSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .context
            .run_on_context(move || inner.on_subscribe(subscription));
    }

    fn on_next(&self, item: T) {
        let inner = Arc::clone(&self.inner);
        self.inner.context.run_on_context(move || inner.on_next(item));
    }

    fn on_error(&self, error: DocFlowError) {
        let inner = Arc::clone(&self.inner);
        self.inner.context.run_on_context(move || inner.on_error(error));
    }

    fn on_complete(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.context.run_on_context(move || inner.on_complete());
    }
}

// ============================================================================
// Tests
// ============================================================================
