//! Consumer-driven stream protocol
//!
//! A [`ReadStream`] pushes items into a registered handler unless paused or
//! capped by `fetch`. A [`WriteStream`] accepts items and reports pressure
//! through `write_queue_full` and a drain handler.

use std::sync::Arc;

use docflow_common::{DocFlowError, Result};

/// Item callback
pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Callback without payload (end of stream, drain, queue emptied)
pub type VoidHandler = Arc<dyn Fn() + Send + Sync>;

/// Error callback
pub type ErrorHandler = Handler<DocFlowError>;

/// One-shot completion callback
pub type Completion<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Wrap a closure as an item [`Handler`]
pub fn handler<T, F>(f: F) -> Option<Handler<T>>
where
    F: Fn(T) + Send + Sync + 'static,
{
    Some(Arc::new(f))
}

/// Wrap a closure as a [`VoidHandler`]
pub fn void_handler<F>(f: F) -> Option<VoidHandler>
where
    F: Fn() + Send + Sync + 'static,
{
    Some(Arc::new(f))
}

// ============================================================================
// Traits
// ============================================================================

/// Source side of the consumer-driven protocol
pub trait ReadStream<T>: Send + Sync {
    /// Set the item handler; `None` detaches the consumer
    fn handler(&self, handler: Option<Handler<T>>);

    /// Stop delivering items until `resume` or `fetch`
    fn pause(&self);

    /// Deliver items without limit
    fn resume(&self);

    /// Allow `amount` more items to be delivered
    fn fetch(&self, amount: u64);

    /// Set the end-of-stream handler
    fn end_handler(&self, handler: Option<VoidHandler>);

    /// Set the error handler
    fn exception_handler(&self, handler: Option<ErrorHandler>);
}

/// Sink side of the consumer-driven protocol
pub trait WriteStream<T>: Send + Sync {
    /// Write an item; fails fast once the sink has been ended
    fn write(&self, item: T) -> Result<()>;

    /// End the sink, flushing pending writes, then call `done`
    fn end(&self, done: Completion<()>);

    /// Set the occupancy at which `write_queue_full` starts reporting true
    fn set_write_queue_max_size(&self, max_size: usize);

    /// Whether the writer should stop writing until the drain handler fires
    fn write_queue_full(&self) -> bool;

    /// Called once the queue falls back below its low watermark
    fn drain_handler(&self, handler: Option<VoidHandler>);

    /// Set the error handler
    fn exception_handler(&self, handler: Option<ErrorHandler>);
}

impl<T, S: ReadStream<T> + ?Sized> ReadStream<T> for Arc<S> {
    fn handler(&self, handler: Option<Handler<T>>) {
        (**self).handler(handler)
    }
    fn pause(&self) {
        (**self).pause()
    }
    fn resume(&self) {
        (**self).resume()
    }
    fn fetch(&self, amount: u64) {
        (**self).fetch(amount)
    }
    fn end_handler(&self, handler: Option<VoidHandler>) {
        (**self).end_handler(handler)
    }
    fn exception_handler(&self, handler: Option<ErrorHandler>) {
        (**self).exception_handler(handler)
    }
}

impl<T, S: WriteStream<T> + ?Sized> WriteStream<T> for Arc<S> {
    fn write(&self, item: T) -> Result<()> {
        (**self).write(item)
    }
    fn end(&self, done: Completion<()>) {
        (**self).end(done)
    }
    fn set_write_queue_max_size(&self, max_size: usize) {
        (**self).set_write_queue_max_size(max_size)
    }
    fn write_queue_full(&self) -> bool {
        (**self).write_queue_full()
    }
    fn drain_handler(&self, handler: Option<VoidHandler>) {
        (**self).drain_handler(handler)
    }
    fn exception_handler(&self, handler: Option<ErrorHandler>) {
        (**self).exception_handler(handler)
    }
}

// ============================================================================
// Mapping Stream
// ============================================================================

/// Maps every item of an inner stream, forwarding flow control untouched
pub struct MappingStream<I, O> {
    input: Arc<dyn ReadStream<I>>,
    mapper: Arc<dyn Fn(I) -> O + Send + Sync>,
}

impl<I: 'static, O: 'static> MappingStream<I, O> {
    pub fn new<F>(input: Arc<dyn ReadStream<I>>, mapper: F) -> Self
    where
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        Self {
            input,
            mapper: Arc::new(mapper),
        }
    }
}

impl<I: 'static, O: 'static> ReadStream<O> for MappingStream<I, O> {
    fn handler(&self, handler: Option<Handler<O>>) {
        match handler {
            Some(handler) => {
                let mapper = Arc::clone(&self.mapper);
                self.input
                    .handler(Some(Arc::new(move |item: I| handler(mapper(item)))));
            }
            None => self.input.handler(None),
        }
    }

    fn pause(&self) {
        self.input.pause();
    }

    fn resume(&self) {
        self.input.resume();
    }

    fn fetch(&self, amount: u64) {
        self.input.fetch(amount);
    }

    fn end_handler(&self, handler: Option<VoidHandler>) {
        self.input.end_handler(handler);
    }

    fn exception_handler(&self, handler: Option<ErrorHandler>) {
        self.input.exception_handler(handler);
    }
}

// ============================================================================
// Failed Stream
// ============================================================================

/// A stream that never emits and reports a fixed error to its exception handler
///
/// Returned where an operation fails before a real stream can be built, so
/// callers keep a single code path.
pub struct FailedStream {
    error: DocFlowError,
}

impl FailedStream {
    pub fn new(error: DocFlowError) -> Self {
        Self { error }
    }
}

impl<T> ReadStream<T> for FailedStream {
    fn handler(&self, _handler: Option<Handler<T>>) {}

    fn pause(&self) {}

    fn resume(&self) {}

    fn fetch(&self, _amount: u64) {}

    fn end_handler(&self, _handler: Option<VoidHandler>) {}

    fn exception_handler(&self, handler: Option<ErrorHandler>) {
        if let Some(handler) = handler {
            handler(self.error.clone());
        }
    }
}
