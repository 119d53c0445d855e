//! Download direction: the driver pushes chunks, a consumer-driven sink
//! absorbs them
//!
//! [`AsyncReadPublisher`] turns a driver download stream into a credit source;
//! [`GridFsDownloadSubscriber`] requests chunks a window at a time and writes
//! them into a [`WriteStream`], waiting for the sink's drain handler whenever
//! it reports a full queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use docflow_common::{DocFlowError, Result};
use futures::io::{AsyncRead, AsyncReadExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::context::Context;
use crate::reactive::{CreditSource, Subscriber, Subscription};
use crate::streams::{Completion, WriteStream};

/// Default number of chunks requested per window
pub const DEFAULT_DOWNLOAD_WINDOW: u64 = 16;

// ============================================================================
// Download subscriber
// ============================================================================

/// Forwards driver chunks into a sink and resolves with the bytes written
pub struct GridFsDownloadSubscriber {
    inner: Arc<DownloadInner>,
}

struct DownloadInner {
    context: Context,
    sink: Arc<dyn WriteStream<Bytes>>,
    window: u64,
    state: Mutex<DownloadState>,
}

struct DownloadState {
    subscription: Option<Arc<dyn Subscription>>,
    outstanding: u64,
    written: u64,
    done: Option<Completion<u64>>,
}

impl GridFsDownloadSubscriber {
    /// `done` is called exactly once, with the total bytes written or the
    /// first failure
    pub fn new(
        context: Context,
        sink: Arc<dyn WriteStream<Bytes>>,
        window: u64,
        done: Completion<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(DownloadInner {
                context,
                sink,
                window: window.max(1),
                state: Mutex::new(DownloadState {
                    subscription: None,
                    outstanding: 0,
                    written: 0,
                    done: Some(done),
                }),
            }),
        }
    }

    /// Bytes the sink has accepted so far
    pub fn bytes_written(&self) -> u64 {
        self.inner.state.lock().written
    }
}

impl DownloadInner {
    fn on_subscribe(self: &Arc<Self>, subscription: Arc<dyn Subscription>) {
        let rejected = {
            let mut state = self.state.lock();
            if state.subscription.is_some() || state.done.is_none() {
                Some(subscription)
            } else {
                state.subscription = Some(subscription);
                None
            }
        };
        if let Some(subscription) = rejected {
            subscription.cancel();
            return;
        }

        let inner = Arc::clone(self);
        self.sink.exception_handler(Some(Arc::new(move |error: DocFlowError| {
            let context = inner.context.clone();
            let inner = Arc::clone(&inner);
            context.dispatch(move || inner.fail_from_sink(error));
        })));
        let inner = Arc::clone(self);
        self.sink.drain_handler(Some(Arc::new(move || {
            let context = inner.context.clone();
            let inner = Arc::clone(&inner);
            context.dispatch(move || inner.request_more());
        })));

        self.request_more();
    }

    /// Request the next window once every chunk of the last one arrived
    fn request_more(&self) {
        let subscription = {
            let mut state = self.state.lock();
            if state.done.is_none() || state.outstanding > 0 {
                return;
            }
            let Some(subscription) = state.subscription.clone() else {
                return;
            };
            state.outstanding = self.window;
            subscription
        };
        tracing::trace!(window = self.window, "Requesting download chunks");
        subscription.request(self.window);
    }

    fn on_next(&self, chunk: Bytes) {
        {
            let mut state = self.state.lock();
            if state.done.is_none() {
                return;
            }
            state.outstanding = state.outstanding.saturating_sub(1);
        }

        let len = chunk.len() as u64;
        if let Err(e) = self.sink.write(chunk) {
            return self.fail_from_sink(e);
        }
        self.state.lock().written += len;
        if !self.sink.write_queue_full() {
            self.request_more();
        }
    }

    /// Sink failure: cancel upstream, then resolve with the error
    fn fail_from_sink(&self, error: DocFlowError) {
        let (subscription, done) = {
            let mut state = self.state.lock();
            (state.subscription.take(), state.done.take())
        };
        let Some(done) = done else {
            return;
        };
        tracing::debug!(error = %error, "Download sink failed, cancelling upstream");
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        self.detach_sink();
        done(Err(error));
    }

    fn on_error(&self, error: DocFlowError) {
        let done = {
            let mut state = self.state.lock();
            state.subscription = None;
            state.done.take()
        };
        if let Some(done) = done {
            self.detach_sink();
            done(Err(error));
        }
    }

    fn detach_sink(&self) {
        self.sink.drain_handler(None);
        self.sink.exception_handler(None);
    }

    fn on_complete(&self) {
        let (done, written) = {
            let mut state = self.state.lock();
            state.subscription = None;
            (state.done.take(), state.written)
        };
        let Some(done) = done else {
            return;
        };
        tracing::debug!(bytes = written, "Download completed, ending sink");
        self.detach_sink();
        self.sink.end(Box::new(move |result: Result<()>| {
            done(result.map(|_| written))
        }));
    }
}

impl Subscriber<Bytes> for GridFsDownloadSubscriber {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .context
            .run_on_context(move || inner.on_subscribe(subscription));
    }

    fn on_next(&self, chunk: Bytes) {
        let inner = Arc::clone(&self.inner);
        self.inner.context.run_on_context(move || inner.on_next(chunk));
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
// AsyncRead publisher
// ============================================================================

/// Credit source emitting the contents of an [`AsyncRead`] as chunks of at
/// most `chunk_size` bytes. Accepts a single subscriber.
pub struct AsyncReadPublisher<R> {
    reader: Mutex<Option<R>>,
    chunk_size: usize,
}

impl<R> AsyncReadPublisher<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            chunk_size: chunk_size.max(1),
        }
    }
}

struct ReadSubscription {
    credit: Mutex<u64>,
    cancelled: AtomicBool,
    wake: Notify,
}

impl Subscription for ReadSubscription {
    fn request(&self, n: u64) {
        {
            let mut credit = self.credit.lock();
            *credit = credit.saturating_add(n);
        }
        self.wake.notify_one();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

impl ReadSubscription {
    /// Wait for one unit of credit; `false` once cancelled
    async fn acquire(&self) -> bool {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            {
                let mut credit = self.credit.lock();
                if *credit > 0 {
                    *credit -= 1;
                    return true;
                }
            }
            self.wake.notified().await;
        }
    }
}

impl<R> CreditSource<Bytes> for AsyncReadPublisher<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Bytes>>) {
        let Some(mut reader) = self.reader.lock().take() else {
            return subscriber.on_error(DocFlowError::Protocol(
                "read publisher accepts a single subscriber".to_string(),
            ));
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => return subscriber.on_error(DocFlowError::Internal(e.to_string())),
        };

        let subscription = Arc::new(ReadSubscription {
            credit: Mutex::new(0),
            cancelled: AtomicBool::new(false),
            wake: Notify::new(),
        });
        subscriber.on_subscribe(subscription.clone());

        let chunk_size = self.chunk_size;
        runtime.spawn(async move {
            loop {
                if !subscription.acquire().await {
                    tracing::trace!("Read publisher cancelled");
                    return;
                }
                let mut chunk = vec![0u8; chunk_size];
                match reader.read(&mut chunk).await {
                    Ok(0) => return subscriber.on_complete(),
                    Ok(n) => {
                        if subscription.cancelled.load(Ordering::SeqCst) {
                            return;
                        }
                        chunk.truncate(n);
                        subscriber.on_next(Bytes::from(chunk));
                    }
                    Err(e) => return subscriber.on_error(e.into()),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{ErrorHandler, VoidHandler};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Sink collecting bytes, full above `limit` until `drain` is called
    struct MemorySink {
        data: Mutex<Vec<u8>>,
        limit: usize,
        /// Bytes accepted before every write fails
        fail_after: Option<usize>,
        drain: Mutex<Option<VoidHandler>>,
        ended: AtomicUsize,
    }

    impl MemorySink {
        fn new(limit: usize) -> Arc<Self> {
            Arc::new(Self {
                data: Mutex::new(Vec::new()),
                limit,
                fail_after: None,
                drain: Mutex::new(None),
                ended: AtomicUsize::new(0),
            })
        }

        fn flush(&self) {
            let drain = self.drain.lock().clone();
            if let Some(drain) = drain {
                drain();
            }
        }
    }

    impl WriteStream<Bytes> for MemorySink {
        fn write(&self, item: Bytes) -> Result<()> {
            let mut data = self.data.lock();
            if self.fail_after.is_some_and(|limit| data.len() >= limit) {
                return Err(DocFlowError::Sink("disk full".to_string()));
            }
            data.extend_from_slice(&item);
            Ok(())
        }

        fn end(&self, done: Completion<()>) {
            self.ended.fetch_add(1, Ordering::SeqCst);
            done(Ok(()));
        }

        fn set_write_queue_max_size(&self, _max_size: usize) {}

        fn write_queue_full(&self) -> bool {
            self.data.lock().len() > self.limit
        }

        fn drain_handler(&self, handler: Option<VoidHandler>) {
            *self.drain.lock() = handler;
        }

        fn exception_handler(&self, _handler: Option<ErrorHandler>) {}
    }

    fn download(
        ctx: &Context,
        sink: Arc<MemorySink>,
        window: u64,
    ) -> (GridFsDownloadSubscriber, oneshot::Receiver<Result<u64>>) {
        let (tx, rx) = oneshot::channel();
        let subscriber = GridFsDownloadSubscriber::new(
            ctx.clone(),
            sink,
            window,
            Box::new(move |result: Result<u64>| {
                let _ = tx.send(result);
            }),
        );
        (subscriber, rx)
    }

    #[tokio::test]
    async fn test_download_copies_every_byte() {
        let ctx = Context::new();
        let sink = MemorySink::new(usize::MAX);
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

        let publisher = AsyncReadPublisher::new(futures::io::Cursor::new(payload.clone()), 1000);
        let (subscriber, rx) = download(&ctx, sink.clone(), 4);
        publisher.subscribe(Arc::new(subscriber));

        let written = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(written, 50_000);
        assert_eq!(*sink.data.lock(), payload);
        assert_eq!(sink.ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_sink_waits_for_drain() {
        let ctx = Context::new();
        let sink = MemorySink::new(10);
        let publisher = AsyncReadPublisher::new(futures::io::Cursor::new(vec![7u8; 100]), 10);
        let (subscriber, mut rx) = download(&ctx, sink.clone(), 2);
        publisher.subscribe(Arc::new(subscriber));

        // Two chunks of the first window fill the sink; nothing more is requested
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.data.lock().len(), 20);
        assert!(rx.try_recv().is_err());

        for _ in 0..10 {
            sink.data.lock().clear();
            sink.flush();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let written = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(written, 100);
    }

    #[tokio::test]
    async fn test_sink_failure_cancels_upstream() {
        let ctx = Context::new();
        let sink = Arc::new(MemorySink {
            data: Mutex::new(Vec::new()),
            limit: usize::MAX,
            fail_after: Some(0),
            drain: Mutex::new(None),
            ended: AtomicUsize::new(0),
        });
        let publisher = AsyncReadPublisher::new(futures::io::Cursor::new(vec![1u8; 64]), 8);
        let (subscriber, rx) = download(&ctx, sink.clone(), 4);
        publisher.subscribe(Arc::new(subscriber));

        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(DocFlowError::Sink("disk full".to_string())));
        assert_eq!(sink.ended.load(Ordering::SeqCst), 0);
    }

    /// Test the byte count covers only chunks the sink accepted
    #[tokio::test]
    async fn test_rejected_chunk_not_counted() {
        let ctx = Context::new();
        let sink = Arc::new(MemorySink {
            data: Mutex::new(Vec::new()),
            limit: usize::MAX,
            fail_after: Some(16),
            drain: Mutex::new(None),
            ended: AtomicUsize::new(0),
        });
        let publisher = AsyncReadPublisher::new(futures::io::Cursor::new(vec![3u8; 64]), 8);
        let (subscriber, rx) = download(&ctx, sink.clone(), 4);
        let subscriber = Arc::new(subscriber);
        publisher.subscribe(subscriber.clone());

        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(DocFlowError::Sink("disk full".to_string())));
        assert_eq!(subscriber.bytes_written(), 16);
        assert_eq!(sink.data.lock().len(), 16);
    }

    #[tokio::test]
    async fn test_read_publisher_rejects_second_subscriber() {
        let ctx = Context::new();
        let publisher = AsyncReadPublisher::new(futures::io::Cursor::new(vec![0u8; 8]), 8);
        let (first, first_rx) = download(&ctx, MemorySink::new(usize::MAX), 4);
        let (second, second_rx) = download(&ctx, MemorySink::new(usize::MAX), 4);

        publisher.subscribe(Arc::new(first));
        publisher.subscribe(Arc::new(second));

        assert!(matches!(
            second_rx.await.unwrap(),
            Err(DocFlowError::Protocol(_))
        ));
        assert_eq!(first_rx.await.unwrap(), Ok(8));
    }
}
