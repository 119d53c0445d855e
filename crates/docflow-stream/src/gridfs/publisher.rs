//! [`ReadStream`] exposed as a [`CreditSource`]
//!
//! Lets a caller-supplied byte stream feed a credit-driven consumer: each
//! `request(n)` becomes a `fetch(n)` on the paused stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use docflow_common::DocFlowError;

use crate::reactive::{CreditSource, Subscriber, Subscription};
use crate::streams::ReadStream;

/// Single-subscriber credit source over a [`ReadStream`]
pub struct ReadStreamPublisher<T> {
    stream: Arc<dyn ReadStream<T>>,
    subscribed: AtomicBool,
}

impl<T: Send + 'static> ReadStreamPublisher<T> {
    pub fn new(stream: Arc<dyn ReadStream<T>>) -> Self {
        Self {
            stream,
            subscribed: AtomicBool::new(false),
        }
    }
}

struct StreamSubscription<T> {
    stream: Arc<dyn ReadStream<T>>,
    released: AtomicBool,
}

impl<T> StreamSubscription<T> {
    /// Detach every handler and leave the stream flowing; runs once
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stream.end_handler(None);
        self.stream.exception_handler(None);
        self.stream.handler(None);
        self.stream.resume();
    }
}

impl<T: Send + 'static> Subscription for StreamSubscription<T> {
    fn request(&self, n: u64) {
        if !self.released.load(Ordering::SeqCst) {
            self.stream.fetch(n);
        }
    }

    fn cancel(&self) {
        tracing::debug!("Stream subscription cancelled");
        self.release();
    }
}

impl<T: Send + 'static> CreditSource<T> for ReadStreamPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if self
            .subscribed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Rejected second subscriber");
            return subscriber.on_error(DocFlowError::Protocol(
                "stream publisher accepts a single subscriber".to_string(),
            ));
        }

        let subscription = Arc::new(StreamSubscription {
            stream: Arc::clone(&self.stream),
            released: AtomicBool::new(false),
        });

        self.stream.pause();
        let next = Arc::clone(&subscriber);
        self.stream
            .handler(Some(Arc::new(move |item: T| next.on_next(item))));

        let (s, sub) = (Arc::clone(&subscriber), Arc::clone(&subscription));
        self.stream.end_handler(Some(Arc::new(move || {
            sub.release();
            s.on_complete();
        })));

        let (s, sub) = (Arc::clone(&subscriber), Arc::clone(&subscription));
        self.stream
            .exception_handler(Some(Arc::new(move |error: DocFlowError| {
                sub.release();
                s.on_error(error);
            })));

        subscriber.on_subscribe(subscription);
    }
}
