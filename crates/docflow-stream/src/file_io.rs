//! File-backed streams
//!
//! [`FileReadStream`] reads a file chunk by chunk through the cursor adapter,
//! so pause and fetch are honoured between chunks. [`FileWriteStream`] hands
//! writes to a background task and reports a full queue once the bytes not
//! yet on disk exceed its budget.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use docflow_common::{DocFlowError, Result};
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::context::Context;
use crate::cursor_stream::{BatchCursor, CursorSource, CursorStream};
use crate::streams::{Completion, ErrorHandler, VoidHandler, WriteStream};

/// Default bytes per chunk read from a file
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Default pending bytes before a file write stream reports a full queue
pub const DEFAULT_WRITE_QUEUE_SIZE: usize = 64 * 1024;

// ============================================================================
// Reading
// ============================================================================

/// Byte stream over a file
pub type FileReadStream = CursorStream<Bytes>;

struct FileChunks {
    file: File,
    chunk_size: usize,
}

#[async_trait]
impl BatchCursor<Bytes> for FileChunks {
    async fn next_batch(&mut self) -> Result<Option<Vec<Bytes>>> {
        let mut chunk = vec![0u8; self.chunk_size];
        let n = self.file.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        chunk.truncate(n);
        Ok(Some(vec![Bytes::from(chunk)]))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct FileSource {
    path: PathBuf,
    chunk_size: usize,
}

#[async_trait]
impl CursorSource<Bytes> for FileSource {
    async fn open(&self, _batch_size: u32) -> Result<Box<dyn BatchCursor<Bytes>>> {
        let file = File::open(&self.path).await?;
        tracing::debug!(path = %self.path.display(), "Opened file for streaming");
        Ok(Box::new(FileChunks {
            file,
            chunk_size: self.chunk_size,
        }))
    }
}

/// Stream the file at `path` in chunks of at most `chunk_size` bytes.
///
/// The file is opened when the first handler is attached; open failures reach
/// the exception handler.
pub fn file_read_stream(
    context: Context,
    path: impl AsRef<Path>,
    chunk_size: usize,
) -> FileReadStream {
    let source = FileSource {
        path: path.as_ref().to_path_buf(),
        chunk_size: chunk_size.max(1),
    };
    CursorStream::with_high_water_mark(context, Arc::new(source), 1, 4)
}

// ============================================================================
// Writing
// ============================================================================

enum WriteOp {
    Data(Bytes),
    End(Completion<()>),
}

struct WriteState {
    pending: usize,
    max_size: usize,
    overflow: bool,
    closed: bool,
    failure: Option<DocFlowError>,
    drain_handler: Option<VoidHandler>,
    exception_handler: Option<ErrorHandler>,
}

/// [`WriteStream`] persisting bytes to a file from a background task
pub struct FileWriteStream {
    path: PathBuf,
    ops: mpsc::UnboundedSender<WriteOp>,
    state: Arc<Mutex<WriteState>>,
}

impl FileWriteStream {
    /// Create (or truncate) the file at `path`
    pub async fn create(context: Context, path: impl AsRef<Path>) -> Result<Self> {
        Self::with_queue_size(context, path, DEFAULT_WRITE_QUEUE_SIZE).await
    }

    pub async fn with_queue_size(
        context: Context,
        path: impl AsRef<Path>,
        max_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        let state = Arc::new(Mutex::new(WriteState {
            pending: 0,
            max_size: max_size.max(1),
            overflow: false,
            closed: false,
            failure: None,
            drain_handler: None,
            exception_handler: None,
        }));
        let (ops, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(file, rx, Arc::clone(&state), context));
        Ok(Self { path, ops, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes accepted but not yet written
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }
}

async fn write_loop(
    mut file: File,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    state: Arc<Mutex<WriteState>>,
    context: Context,
) {
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Data(data) => {
                let result = file.write_all(&data).await;
                let callback: Option<Box<dyn FnOnce() + Send>> = {
                    let mut state = state.lock();
                    state.pending = state.pending.saturating_sub(data.len());
                    match result {
                        Err(e) if state.failure.is_none() => {
                            let error = DocFlowError::from(e);
                            tracing::warn!(error = %error, "File write failed");
                            state.failure = Some(error.clone());
                            state
                                .exception_handler
                                .clone()
                                .map(|h| Box::new(move || h(error)) as Box<dyn FnOnce() + Send>)
                        }
                        Err(_) => None,
                        Ok(()) if state.overflow && state.pending < state.max_size / 2 => {
                            state.overflow = false;
                            state
                                .drain_handler
                                .clone()
                                .map(|h| Box::new(move || h()) as Box<dyn FnOnce() + Send>)
                        }
                        Ok(()) => None,
                    }
                };
                if let Some(callback) = callback {
                    context.run_on_context(callback);
                }
            }
            WriteOp::End(done) => {
                let flushed = file.flush().await.map_err(DocFlowError::from);
                let failure = state.lock().failure.clone();
                let result = match failure {
                    Some(error) => Err(error),
                    None => flushed,
                };
                context.run_on_context(move || done(result));
                return;
            }
        }
    }
}

impl WriteStream<Bytes> for FileWriteStream {
    fn write(&self, data: Bytes) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(DocFlowError::StreamClosed);
            }
            if let Some(error) = &state.failure {
                return Err(error.clone());
            }
            state.pending += data.len();
            if state.pending >= state.max_size {
                state.overflow = true;
            }
        }
        self.ops
            .send(WriteOp::Data(data))
            .map_err(|_| DocFlowError::StreamClosed)
    }

    fn end(&self, done: Completion<()>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                return done(Err(DocFlowError::StreamClosed));
            }
            state.closed = true;
        }
        if let Err(mpsc::error::SendError(WriteOp::End(done))) = self.ops.send(WriteOp::End(done)) {
            done(Err(DocFlowError::StreamClosed));
        }
    }

    fn set_write_queue_max_size(&self, max_size: usize) {
        self.state.lock().max_size = max_size.max(1);
    }

    fn write_queue_full(&self) -> bool {
        let state = self.state.lock();
        state.pending >= state.max_size
    }

    fn drain_handler(&self, handler: Option<VoidHandler>) {
        self.state.lock().drain_handler = handler;
    }

    fn exception_handler(&self, handler: Option<ErrorHandler>) {
        self.state.lock().exception_handler = handler;
    }
}
