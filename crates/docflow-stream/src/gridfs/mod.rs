//! GridFS transfer bridges
//!
//! GridFS stores a file as a sequence of fixed-size chunks. Uploads and
//! downloads move those bytes between caller-side streams and the driver's
//! reader / writer interfaces without unbounded buffering.

pub mod download;
pub mod publisher;
pub mod upload;

pub use download::{AsyncReadPublisher, GridFsDownloadSubscriber, DEFAULT_DOWNLOAD_WINDOW};
pub use publisher::ReadStreamPublisher;
pub use upload::{
    upload_from_source, GridFsUploadBridge, PullCallback, UploadReader, DEFAULT_UPLOAD_QUEUE_SIZE,
};
