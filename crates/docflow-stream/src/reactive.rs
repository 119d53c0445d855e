//! Push-with-credit protocol
//!
//! A [`CreditSource`] delivers items to one [`Subscriber`] and never more than
//! the subscriber requested through its [`Subscription`]. Termination is a
//! single `on_complete` or `on_error`.

use std::sync::Arc;

use docflow_common::DocFlowError;

/// Credit relationship between a source and its single subscriber
pub trait Subscription: Send + Sync {
    /// Authorise `n` more deliveries
    fn request(&self, n: u64);

    /// Stop deliveries and release the relationship
    fn cancel(&self);
}

/// Consumer side of the credit protocol
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

    fn on_next(&self, item: T);

    fn on_error(&self, error: DocFlowError);

    fn on_complete(&self);
}

/// Producer side of the credit protocol
pub trait CreditSource<T>: Send + Sync {
    /// Attach `subscriber`; a source that allows a single subscriber reports
    /// a protocol error to any later one through `on_error`
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

impl<T, S: CreditSource<T> + ?Sized> CreditSource<T> for Arc<S> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        (**self).subscribe(subscriber)
    }
}
