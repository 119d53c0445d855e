//! Upload direction: caller pushes bytes, the driver pulls them
//!
//! [`GridFsUploadBridge`] is the meeting point. The caller writes through the
//! [`WriteStream`] side; the driver pulls through [`GridFsUploadBridge::read`]
//! or the [`UploadReader`] adaptor. Bytes are never dropped: once occupancy
//! reaches the configured maximum the writer is told to pause through
//! `write_queue_full`, and the drain handler fires once a pull brings the
//! buffer below half of it.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use bytes::{Bytes, BytesMut};
use docflow_common::{DocFlowError, Result};
use futures::channel::oneshot;
use futures::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;

use crate::context::Context;
use crate::reactive::{CreditSource, Subscriber, Subscription};
use crate::streams::{Completion, ErrorHandler, VoidHandler, WriteStream};

/// Default maximum occupancy of the upload buffer in bytes
pub const DEFAULT_UPLOAD_QUEUE_SIZE: usize = 8192;

/// Completion of a pull: the destination buffer and the number of bytes
/// appended to it. Zero means end of input.
pub type PullCallback = Completion<(BytesMut, usize)>;

struct PendingPull {
    dest: BytesMut,
    callback: PullCallback,
}

struct UploadState {
    buffer: BytesMut,
    max_size: usize,
    pending: Option<PendingPull>,
    closed: bool,
    overflow: bool,
    drain_handler: Option<VoidHandler>,
    exception_handler: Option<ErrorHandler>,
}

impl UploadState {
    /// Move buffered bytes, then `fresh`, into the destination up to its
    /// spare capacity; whatever does not fit stays buffered
    fn fill(&mut self, dest: &mut BytesMut, fresh: &[u8]) -> usize {
        let start = dest.len();
        let room = dest.capacity() - start;

        let from_buffer = room.min(self.buffer.len());
        dest.extend_from_slice(&self.buffer.split_to(from_buffer));

        let room = room - from_buffer;
        let from_fresh = room.min(fresh.len());
        dest.extend_from_slice(&fresh[..from_fresh]);
        self.buffer.extend_from_slice(&fresh[from_fresh..]);

        dest.len() - start
    }

    fn take_drain(&mut self) -> Option<VoidHandler> {
        if self.overflow && self.buffer.len() < self.max_size / 2 {
            self.overflow = false;
            self.drain_handler.clone()
        } else {
            None
        }
    }
}

/// Ring buffer between a pushing writer and a pulling driver
///
/// Unlike the other adapters the bridge is touched from both the caller's
/// context and driver tasks, so its state sits behind a mutex. Callbacks are
/// never invoked with the lock held.
pub struct GridFsUploadBridge {
    context: Context,
    state: Mutex<UploadState>,
}

impl GridFsUploadBridge {
    pub fn new(context: Context) -> Self {
        Self::with_queue_size(context, DEFAULT_UPLOAD_QUEUE_SIZE)
    }

    pub fn with_queue_size(context: Context, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            context,
            state: Mutex::new(UploadState {
                buffer: BytesMut::with_capacity(max_size),
                max_size,
                pending: None,
                closed: false,
                overflow: false,
                drain_handler: None,
                exception_handler: None,
            }),
        }
    }

    /// Bytes buffered and not yet pulled
    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Pull bytes into the spare capacity of `dest`.
    ///
    /// Completes synchronously when bytes are buffered or the bridge is
    /// closed, otherwise once the next write or `end` arrives. Only one pull
    /// may be pending at a time.
    pub fn read(&self, mut dest: BytesMut, callback: PullCallback) {
        if dest.capacity() == dest.len() {
            return callback(Err(DocFlowError::Protocol(
                "upload pull with a full destination buffer".to_string(),
            )));
        }

        let mut state = self.state.lock();
        if state.pending.is_some() {
            drop(state);
            tracing::warn!("Second pull while one is pending");
            return callback(Err(DocFlowError::Protocol(
                "an upload pull is already pending".to_string(),
            )));
        }

        if !state.buffer.is_empty() {
            let count = state.fill(&mut dest, &[]);
            let drain = state.take_drain();
            drop(state);
            callback(Ok((dest, count)));
            if let Some(drain) = drain {
                self.context.dispatch(move || drain());
            }
        } else if state.closed {
            drop(state);
            callback(Ok((dest, 0)));
        } else {
            state.pending = Some(PendingPull { dest, callback });
        }
    }

    /// Fail the transfer from the driver side: pending pulls and the
    /// exception handler receive `error`
    pub fn fail(&self, error: DocFlowError) {
        let (pending, handler) = {
            let mut state = self.state.lock();
            state.closed = true;
            state.buffer.clear();
            (state.pending.take(), state.exception_handler.take())
        };
        if let Some(pull) = pending {
            (pull.callback)(Err(error.clone()));
        }
        if let Some(handler) = handler {
            self.context.dispatch(move || handler(error));
        }
    }
}

impl WriteStream<Bytes> for GridFsUploadBridge {
    fn write(&self, data: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DocFlowError::StreamClosed);
        }

        match state.pending.take() {
            Some(PendingPull { mut dest, callback }) => {
                let count = state.fill(&mut dest, &data);
                if state.buffer.len() >= state.max_size {
                    state.overflow = true;
                }
                drop(state);
                callback(Ok((dest, count)));
            }
            None => {
                state.buffer.extend_from_slice(&data);
                if state.buffer.len() >= state.max_size {
                    state.overflow = true;
                }
            }
        }
        Ok(())
    }

    fn end(&self, done: Completion<()>) {
        let pending = {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                return done(Ok(()));
            }
            state.closed = true;
            state.pending.take()
        };
        tracing::trace!("Upload bridge ended");

        if let Some(PendingPull { mut dest, callback }) = pending {
            let count = self.state.lock().fill(&mut dest, &[]);
            callback(Ok((dest, count)));
        }
        done(Ok(()));
    }

    fn set_write_queue_max_size(&self, max_size: usize) {
        self.state.lock().max_size = max_size.max(1);
    }

    fn write_queue_full(&self) -> bool {
        let state = self.state.lock();
        state.buffer.len() >= state.max_size
    }

    fn drain_handler(&self, handler: Option<VoidHandler>) {
        self.state.lock().drain_handler = handler;
    }

    fn exception_handler(&self, handler: Option<ErrorHandler>) {
        self.state.lock().exception_handler = handler;
    }
}

// ============================================================================
// AsyncRead adaptor
// ============================================================================

/// [`AsyncRead`] over a [`GridFsUploadBridge`], for drivers that copy from a
/// reader into their upload stream
pub struct UploadReader {
    bridge: Arc<GridFsUploadBridge>,
    pending: Option<oneshot::Receiver<Result<(BytesMut, usize)>>>,
    leftover: BytesMut,
}

impl UploadReader {
    pub fn new(bridge: Arc<GridFsUploadBridge>) -> Self {
        Self {
            bridge,
            pending: None,
            leftover: BytesMut::new(),
        }
    }
}

impl AsyncRead for UploadReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if !this.leftover.is_empty() {
            let n = buf.len().min(this.leftover.len());
            buf[..n].copy_from_slice(&this.leftover.split_to(n));
            return Poll::Ready(Ok(n));
        }

        let bridge = &this.bridge;
        let receiver = this.pending.get_or_insert_with(|| {
            let (tx, rx) = oneshot::channel();
            bridge.read(
                BytesMut::with_capacity(buf.len()),
                Box::new(move |result: Result<(BytesMut, usize)>| {
                    let _ = tx.send(result);
                }),
            );
            rx
        });

        let outcome = match receiver.poll_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(outcome) => outcome,
        };
        this.pending = None;

        match outcome {
            Ok(Ok((mut data, _))) => {
                // A later poll may hand in a shorter buffer than the pull was sized for
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data.split_to(n));
                this.leftover = data;
                Poll::Ready(Ok(n))
            }
            Ok(Err(e)) => Poll::Ready(Err(e.into())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "upload bridge dropped a pending pull",
            ))),
        }
    }
}

// ============================================================================
// Credit source -> AsyncWrite
// ============================================================================

enum Signal {
    Subscribed(Arc<dyn Subscription>),
    Next(Bytes),
    Failed(DocFlowError),
    Completed,
}

struct ChannelSubscriber {
    tx: futures::channel::mpsc::UnboundedSender<Signal>,
}

impl Subscriber<Bytes> for ChannelSubscriber {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let _ = self.tx.unbounded_send(Signal::Subscribed(subscription));
    }

    fn on_next(&self, item: Bytes) {
        let _ = self.tx.unbounded_send(Signal::Next(item));
    }

    fn on_error(&self, error: DocFlowError) {
        let _ = self.tx.unbounded_send(Signal::Failed(error));
    }

    fn on_complete(&self) {
        let _ = self.tx.unbounded_send(Signal::Completed);
    }
}

/// Subscribe to `source` and write every chunk into `writer`, keeping at most
/// `window` chunks requested but not yet written. The writer is closed on
/// completion. Returns the number of bytes written.
pub async fn upload_from_source<W>(
    source: Arc<dyn CreditSource<Bytes>>,
    mut writer: W,
    window: u64,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let window = window.max(1);
    let (tx, mut rx) = futures::channel::mpsc::unbounded();
    source.subscribe(Arc::new(ChannelSubscriber { tx }));

    let mut subscription: Option<Arc<dyn Subscription>> = None;
    let mut written = 0u64;

    while let Some(signal) = rx.next().await {
        match signal {
            Signal::Subscribed(s) => {
                if subscription.is_some() {
                    s.cancel();
                    continue;
                }
                s.request(window);
                subscription = Some(s);
            }
            Signal::Next(chunk) => {
                if let Err(e) = writer.write_all(&chunk).await {
                    if let Some(s) = subscription.take() {
                        s.cancel();
                    }
                    return Err(e.into());
                }
                written += chunk.len() as u64;
                if let Some(s) = &subscription {
                    s.request(1);
                }
            }
            Signal::Failed(e) => return Err(e),
            Signal::Completed => {
                writer.close().await?;
                tracing::debug!(bytes = written, "Upload source completed");
                return Ok(written);
            }
        }
    }

    Err(DocFlowError::Upstream(
        "upload source went away without completing".to_string(),
    ))
}
