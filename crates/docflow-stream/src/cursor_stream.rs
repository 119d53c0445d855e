//! Cursor-to-push adapter
//!
//! Reads a server-side batch cursor one page at a time and pushes the items
//! into an [`InboundQueue`]. The next page is fetched only while the queue
//! accepts writes without pressure, so a paused consumer stops the cursor
//! after at most one page beyond the high watermark.

use std::sync::Arc;

use async_trait::async_trait;
use docflow_common::{DocFlowError, Result};
use parking_lot::Mutex;

use crate::context::Context;
use crate::fault::Fault;
use crate::queue::{InboundQueue, DEFAULT_HIGH_WATER_MARK};
use crate::streams::{ErrorHandler, Handler, ReadStream, VoidHandler};

/// Pull cursor returning one page per call
#[async_trait]
pub trait BatchCursor<T: Send>: Send {
    /// Next page, or `None` once the cursor is exhausted
    async fn next_batch(&mut self) -> Result<Option<Vec<T>>>;

    /// Release server-side resources
    async fn close(&mut self) -> Result<()>;
}

/// Opens a [`BatchCursor`] for one streaming operation
#[async_trait]
pub trait CursorSource<T: Send>: Send + Sync {
    async fn open(&self, batch_size: u32) -> Result<Box<dyn BatchCursor<T>>>;
}

/// Lifecycle of a [`CursorStream`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Open,
    /// Cursor release in progress
    Closing,
    Closed,
}

/// [`ReadStream`] over a [`CursorSource`]
pub struct CursorStream<T: Send> {
    inner: Arc<CursorInner<T>>,
}

struct CursorInner<T: Send> {
    context: Context,
    source: Arc<dyn CursorSource<T>>,
    batch_size: u32,
    queue: InboundQueue<T>,
    shared: Mutex<CursorShared<T>>,
}

struct CursorShared<T: Send> {
    state: CursorState,
    started: bool,
    /// `None` while an open or a read is in flight
    cursor: Option<Box<dyn BatchCursor<T>>>,
    in_flight: bool,
    exhausted: bool,
    failure: Option<DocFlowError>,
    end_handler: Option<VoidHandler>,
    exception_handler: Option<ErrorHandler>,
}

impl<T: Send + 'static> CursorStream<T> {
    pub fn new(context: Context, source: Arc<dyn CursorSource<T>>, batch_size: u32) -> Self {
        Self::with_high_water_mark(context, source, batch_size, DEFAULT_HIGH_WATER_MARK)
    }

    pub fn with_high_water_mark(
        context: Context,
        source: Arc<dyn CursorSource<T>>,
        batch_size: u32,
        high_water_mark: usize,
    ) -> Self {
        let queue = InboundQueue::with_high_water_mark(context.clone(), high_water_mark);
        Self {
            inner: Arc::new(CursorInner {
                context,
                source,
                batch_size: batch_size.max(1),
                queue,
                shared: Mutex::new(CursorShared {
                    state: CursorState::Open,
                    started: false,
                    cursor: None,
                    in_flight: false,
                    exhausted: false,
                    failure: None,
                    end_handler: None,
                    exception_handler: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> CursorState {
        self.inner.shared.lock().state
    }

    /// Release the cursor and fire end; idempotent
    pub fn close(&self) {
        self.inner.close_with(None);
    }
}

impl<T: Send + 'static> ReadStream<T> for CursorStream<T> {
    fn handler(&self, handler: Option<Handler<T>>) {
        let Some(handler) = handler else {
            let started = self.inner.shared.lock().started;
            if started {
                self.inner.close_with(None);
            }
            return;
        };

        let open = {
            let mut shared = self.inner.shared.lock();
            if shared.state != CursorState::Open {
                tracing::debug!("Handler attached to a closed cursor stream, ignoring");
                return;
            }
            let open = !shared.started;
            if open {
                shared.started = true;
                shared.in_flight = true;
            }
            open
        };

        self.inner.queue.handler(Some(handler));
        if open {
            let inner = Arc::clone(&self.inner);
            self.inner
                .queue
                .drain_handler(Some(Arc::new(move || inner.read_next())));
            self.inner.open();
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

impl<T: Send + 'static> CursorInner<T> {
    fn open(self: &Arc<Self>) {
        let source = Arc::clone(&self.source);
        let batch_size = self.batch_size;
        tracing::debug!(
            context_id = self.context.id(),
            batch_size,
            "Opening cursor"
        );
        let inner = Arc::clone(self);
        self.context.execute(
            async move { source.open(batch_size).await },
            move |result| inner.on_opened(result),
        );
    }

    fn on_opened(self: &Arc<Self>, result: Result<Box<dyn BatchCursor<T>>>) {
        let closing = {
            let mut shared = self.shared.lock();
            shared.in_flight = false;
            shared.state != CursorState::Open
        };

        match result {
            Ok(cursor) if closing => self.release(Some(cursor)),
            Ok(cursor) => {
                self.shared.lock().cursor = Some(cursor);
                self.read_next();
            }
            Err(_) if closing => self.release(None),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to open cursor");
                self.close_with(Some(e));
            }
        }
    }

    /// Fetch the next page unless one is in flight or the stream is closing
    fn read_next(self: &Arc<Self>) {
        let mut cursor = {
            let mut shared = self.shared.lock();
            if shared.state != CursorState::Open || shared.in_flight || shared.exhausted {
                return;
            }
            let Some(cursor) = shared.cursor.take() else {
                return;
            };
            shared.in_flight = true;
            cursor
        };

        let inner = Arc::clone(self);
        self.context.execute(
            async move {
                let page = cursor.next_batch().await;
                Ok((cursor, page))
            },
            move |result| match result {
                Ok((cursor, page)) => inner.on_page(cursor, page),
                Err(e) => {
                    inner.shared.lock().in_flight = false;
                    inner.on_failed(e);
                }
            },
        );
    }

    fn on_page(self: &Arc<Self>, cursor: Box<dyn BatchCursor<T>>, page: Result<Option<Vec<T>>>) {
        {
            let mut shared = self.shared.lock();
            shared.in_flight = false;
            if shared.state != CursorState::Open {
                drop(shared);
                self.release(Some(cursor));
                return;
            }
            shared.cursor = Some(cursor);
        }

        let items = match page {
            Ok(Some(items)) if !items.is_empty() => items,
            Ok(_) => return self.on_exhausted(),
            Err(e) => return self.on_failed(e),
        };

        tracing::trace!(items = items.len(), "Cursor page received");
        if self.queue.write_all(items) {
            self.read_next();
        }
    }

    fn on_exhausted(self: &Arc<Self>) {
        self.shared.lock().exhausted = true;
        if self.queue.is_empty() {
            self.close_with(None);
        } else {
            tracing::trace!(buffered = self.queue.len(), "Cursor exhausted, deferring close");
            let inner = Arc::clone(self);
            self.queue
                .empty_handler(Some(Arc::new(move || inner.close_with(None))));
        }
    }

    /// A failed read releases the cursor at once, but the error is raised
    /// only after the consumer has taken every buffered item
    fn on_failed(self: &Arc<Self>, error: DocFlowError) {
        if self.queue.is_empty() {
            return self.close_with(Some(error));
        }

        let cursor = {
            let mut shared = self.shared.lock();
            shared.exhausted = true;
            shared.cursor.take()
        };
        tracing::debug!(
            error = %error,
            buffered = self.queue.len(),
            "Cursor read failed, delivering buffered items first"
        );
        if let Some(mut cursor) = cursor {
            self.context.execute(async move { cursor.close().await }, |result| {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to close cursor");
                }
            });
        }

        let inner = Arc::clone(self);
        let failure = Mutex::new(Some(error));
        self.queue.empty_handler(Some(Arc::new(move || {
            if let Some(error) = failure.lock().take() {
                inner.close_with(Some(error));
            }
        })));
    }

    /// Begin closing; the cursor is released once no operation holds it
    fn close_with(self: &Arc<Self>, failure: Option<DocFlowError>) {
        let (cursor, release_now) = {
            let mut shared = self.shared.lock();
            if shared.state != CursorState::Open {
                return;
            }
            shared.state = CursorState::Closing;
            shared.failure = failure;
            (shared.cursor.take(), !shared.in_flight)
        };
        self.queue.clear();

        if release_now {
            self.release(cursor);
        }
    }

    fn release(self: &Arc<Self>, cursor: Option<Box<dyn BatchCursor<T>>>) {
        let inner = Arc::clone(self);
        match cursor {
            Some(mut cursor) => self.context.execute(
                async move { cursor.close().await },
                move |result| {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Failed to close cursor");
                    }
                    inner.finish();
                },
            ),
            None => self.context.run_on_context(move || inner.finish()),
        }
    }

    fn finish(&self) {
        let (failure, end_handler, exception_handler) = {
            let mut shared = self.shared.lock();
            if shared.state == CursorState::Closed {
                return;
            }
            shared.state = CursorState::Closed;
            (
                shared.failure.take(),
                shared.end_handler.take(),
                shared.exception_handler.take(),
            )
        };
        tracing::debug!(context_id = self.context.id(), "Cursor stream closed");

        match (failure, exception_handler) {
            (None, _) => {
                if let Some(end_handler) = end_handler {
                    end_handler();
                }
            }
            (Some(error), Some(handler)) => handler(error),
            (Some(error), None) => self
                .context
                .report_failure(Fault::new(error).origin("cursor-stream")),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{handler, void_handler};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct PagedCursor {
        items: VecDeque<u32>,
        page: usize,
        served: usize,
        fail_after: Option<usize>,
        reads: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BatchCursor<u32> for PagedCursor {
        async fn next_batch(&mut self) -> Result<Option<Vec<u32>>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_after == Some(self.served) {
                return Err(DocFlowError::Upstream("boom".to_string()));
            }
            self.served += 1;
            if self.items.is_empty() {
                return Ok(None);
            }
            let n = self.page.min(self.items.len());
            Ok(Some(self.items.drain(..n).collect()))
        }

        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct PagedSource {
        count: u32,
        fail_open: bool,
        /// Pages served before every read fails
        fail_after: Option<usize>,
        opened_with: Mutex<Option<u32>>,
        reads: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl PagedSource {
        fn new(count: u32) -> Arc<Self> {
            Arc::new(Self {
                count,
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl CursorSource<u32> for PagedSource {
        async fn open(&self, batch_size: u32) -> Result<Box<dyn BatchCursor<u32>>> {
            if self.fail_open {
                return Err(DocFlowError::MongoDB("namespace not found".to_string()));
            }
            *self.opened_with.lock() = Some(batch_size);
            Ok(Box::new(PagedCursor {
                items: (0..self.count).collect(),
                page: batch_size as usize,
                served: 0,
                fail_after: self.fail_after,
                reads: Arc::clone(&self.reads),
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn counter() -> (Arc<AtomicUsize>, Option<VoidHandler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (
            count,
            void_handler(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test]
    async fn test_streams_every_item_then_ends_once() {
        let ctx = Context::new();
        let source = PagedSource::new(95);
        let stream = CursorStream::new(ctx.clone(), source.clone(), 10);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (ends, end_handler) = counter();
        stream.end_handler(end_handler);
        let s = Arc::clone(&seen);
        stream.handler(handler(move |n: u32| s.lock().push(n)));

        wait_for(|| ends.load(Ordering::SeqCst) == 1).await;
        assert_eq!(*seen.lock(), (0..95).collect::<Vec<_>>());
        assert_eq!(*source.opened_with.lock(), Some(10));
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
        assert_eq!(stream.state(), CursorState::Closed);

        stream.close();
        stream.handler(None);
        ctx.call(|| ()).await.unwrap();
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_paused_stream_stops_reading() {
        let ctx = Context::new();
        let source = PagedSource::new(1000);
        let stream = CursorStream::with_high_water_mark(ctx.clone(), source.clone(), 10, 16);
        stream.pause();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (ends, end_handler) = counter();
        stream.end_handler(end_handler);
        let s = Arc::clone(&seen);
        stream.handler(handler(move |n: u32| s.lock().push(n)));

        // Pages stop once the queue passes its high watermark
        wait_for(|| source.reads.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);
        assert!(seen.lock().is_empty());

        stream.fetch(5);
        wait_for(|| seen.lock().len() == 5).await;
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);

        stream.resume();
        wait_for(|| ends.load(Ordering::SeqCst) == 1).await;
        assert_eq!(*seen.lock(), (0..1000).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_exhausted_close_waits_for_paused_consumer() {
        let ctx = Context::new();
        let source = PagedSource::new(8);
        let stream = CursorStream::new(ctx.clone(), source.clone(), 20);
        stream.pause();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (ends, end_handler) = counter();
        stream.end_handler(end_handler);
        let s = Arc::clone(&seen);
        stream.handler(handler(move |n: u32| s.lock().push(n)));

        wait_for(|| source.reads.load(Ordering::SeqCst) == 2).await;
        ctx.call(|| ()).await.unwrap();
        assert_eq!(ends.load(Ordering::SeqCst), 0);
        assert_eq!(source.closes.load(Ordering::SeqCst), 0);

        // Pause again mid-drain: the deferred close must survive
        stream.fetch(3);
        wait_for(|| seen.lock().len() == 3).await;
        assert_eq!(ends.load(Ordering::SeqCst), 0);

        stream.resume();
        wait_for(|| ends.load(Ordering::SeqCst) == 1).await;
        assert_eq!(seen.lock().len(), 8);
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detach_closes_cursor_once() {
        let ctx = Context::new();
        let source = PagedSource::new(1000);
        let stream = Arc::new(CursorStream::new(ctx.clone(), source.clone(), 10));

        let seen = Arc::new(AtomicUsize::new(0));
        let (ends, end_handler) = counter();
        stream.end_handler(end_handler);
        let s = Arc::clone(&seen);
        let detach = Arc::clone(&stream);
        stream.handler(handler(move |_n: u32| {
            if s.fetch_add(1, Ordering::SeqCst) == 24 {
                detach.handler(None);
            }
        }));

        wait_for(|| ends.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 25);
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_failure_reaches_exception_handler() {
        let ctx = Context::new();
        let source = Arc::new(PagedSource {
            fail_open: true,
            ..Default::default()
        });
        let stream = CursorStream::new(ctx.clone(), source.clone(), 10);

        let errors = Arc::new(Mutex::new(Vec::new()));
        let (ends, end_handler) = counter();
        stream.end_handler(end_handler);
        let e = Arc::clone(&errors);
        stream.exception_handler(Some(Arc::new(move |err: DocFlowError| e.lock().push(err))));
        stream.handler(handler(|_n: u32| {}));

        wait_for(|| !errors.lock().is_empty()).await;
        ctx.call(|| ()).await.unwrap();
        assert_eq!(
            *errors.lock(),
            vec![DocFlowError::MongoDB("namespace not found".to_string())]
        );
        assert_eq!(ends.load(Ordering::SeqCst), 0);
        assert_eq!(source.closes.load(Ordering::SeqCst), 0);
    }

    /// Test a failed page read surfaces only after the buffered page is consumed
    #[tokio::test]
    async fn test_read_failure_follows_buffered_items() {
        let ctx = Context::new();
        let source = Arc::new(PagedSource {
            count: 100,
            fail_after: Some(1),
            ..Default::default()
        });
        let stream = CursorStream::new(ctx.clone(), source.clone(), 5);
        stream.pause();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (ends, end_handler) = counter();
        stream.end_handler(end_handler);
        let (e, observed) = (Arc::clone(&errors), Arc::clone(&seen));
        stream.exception_handler(Some(Arc::new(move |err: DocFlowError| {
            e.lock().push((err, observed.lock().len()));
        })));
        let s = Arc::clone(&seen);
        stream.handler(handler(move |n: u32| s.lock().push(n)));

        // The cursor is released as soon as the read fails
        wait_for(|| source.closes.load(Ordering::SeqCst) == 1).await;
        ctx.call(|| ()).await.unwrap();
        assert!(seen.lock().is_empty());
        assert!(errors.lock().is_empty());
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);

        stream.resume();
        wait_for(|| !errors.lock().is_empty()).await;
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(
            *errors.lock(),
            vec![(DocFlowError::Upstream("boom".to_string()), 5)]
        );
        ctx.call(|| ()).await.unwrap();
        assert_eq!(ends.load(Ordering::SeqCst), 0);
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
        assert_eq!(stream.state(), CursorState::Closed);
    }

    #[tokio::test]
    async fn test_close_before_start_is_harmless() {
        let ctx = Context::new();
        let source = PagedSource::new(10);
        let stream = CursorStream::new(ctx.clone(), source.clone(), 10);
        let (ends, end_handler) = counter();
        stream.end_handler(end_handler);

        stream.close();
        stream.close();
        wait_for(|| ends.load(Ordering::SeqCst) == 1).await;

        stream.handler(handler(|_n: u32| panic!("closed stream emitted")));
        ctx.call(|| ()).await.unwrap();
        assert_eq!(source.reads.load(Ordering::SeqCst), 0);
        assert_eq!(source.closes.load(Ordering::SeqCst), 0);
    }
}
