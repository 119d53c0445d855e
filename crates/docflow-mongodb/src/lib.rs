//! MongoDB bindings for docflow
//!
//! Connects the flow-control adapters of `docflow-stream` to the official
//! driver.
//!
//! # Features
//! - Reference-counted client sharing by data-source name
//! - `find` / `aggregate` results as pausable document streams
//! - GridFS uploads and downloads with backpressure in both directions

pub mod connection;
pub mod cursor;
pub mod gridfs;

pub use connection::{ClientRegistry, Connection, PoolConfig, DEFAULT_DB_NAME, DEFAULT_POOL_NAME};
pub use cursor::{AggregateSource, DriverCursor, FindSource, MongoStreams};
pub use docflow_common::{DocFlowError, Result};
pub use gridfs::{id_to_hex, GridFsClient, GridFsUpload, GridFsUploadOptions};
