//! docflow-stream: flow-control bridge for document-store streaming
//!
//! Reconciles two asynchronous delivery protocols so that query results and
//! GridFS chunks can be consumed without unbounded buffering, without losing
//! items and without stalling the I/O source.
//!
//! # Architecture
//!
//! - [`reactive`]: push-with-credit protocol (`subscribe` / `request(n)` / `cancel`)
//! - [`streams`]: consumer-driven protocol (`handler` / `pause` / `resume` / `fetch`)
//! - [`queue::InboundQueue`]: the bounded delivery queue every adapter builds on
//! - [`PublisherAdapter`]: credit source to consumer-driven stream
//! - [`CursorStream`]: batch cursor to consumer-driven stream
//! - [`gridfs`]: upload and download bridges for chunked file storage
//!
//! Every adapter is bound to a [`Context`], a serial task queue on the tokio
//! runtime. Callbacks arriving from other threads are redispatched onto it
//! before they touch adapter state.
//!
//! # Usage
//!
//! ```rust,ignore
//! use docflow_stream::{handler, Context, CursorStream, ReadStream};
//!
//! let ctx = Context::new();
//! let stream = CursorStream::new(ctx, source, 20);
//! stream.handler(handler(|doc| println!("{:?}", doc)));
//! ```

pub mod config;
pub mod context;
pub mod cursor_stream;
pub mod fault;
pub mod file_io;
pub mod gridfs;
pub mod pipe;
pub mod publisher_adapter;
pub mod queue;
pub mod reactive;
pub mod streams;

pub use config::FlowConfig;
pub use context::Context;
pub use cursor_stream::{BatchCursor, CursorSource, CursorState, CursorStream};
pub use docflow_common::{DocFlowError, Result};
pub use fault::{Fault, FaultHandlerFn, FaultReporter, SharedFaultReporter};
pub use pipe::pipe;
pub use publisher_adapter::{AdapterState, PublisherAdapter, DEFAULT_BATCH_SIZE};
pub use queue::InboundQueue;
pub use reactive::{CreditSource, Subscriber, Subscription};
pub use streams::{
    handler, void_handler, Completion, ErrorHandler, FailedStream, Handler, MappingStream,
    ReadStream, VoidHandler, WriteStream,
};

// File I/O re-exports
pub use file_io::{file_read_stream, FileReadStream, FileWriteStream};

// GridFS re-exports
pub use gridfs::{
    AsyncReadPublisher, GridFsDownloadSubscriber, GridFsUploadBridge, ReadStreamPublisher,
    UploadReader,
};
