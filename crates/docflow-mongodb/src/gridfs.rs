//! GridFS client over the driver's bucket API
//!
//! Uploads and downloads go through the flow-control bridges of
//! `docflow_stream::gridfs`, so neither a slow caller nor a slow server causes
//! unbounded buffering. File ids cross this API as hex strings.

use std::path::Path;
use std::sync::Arc;

use bson::{oid::ObjectId, Bson, Document};
use bytes::Bytes;
use docflow_common::{DocFlowError, Result};
use docflow_stream::gridfs::upload_from_source;
use docflow_stream::{
    file_read_stream, AsyncReadPublisher, Context, CreditSource, FailedStream, FileWriteStream,
    FlowConfig,
    GridFsDownloadSubscriber, GridFsUploadBridge, PublisherAdapter, ReadStream,
    ReadStreamPublisher, UploadReader, WriteStream,
};
use futures::io::{AsyncRead, AsyncWriteExt};
use mongodb::gridfs::{GridFsBucket, GridFsUploadStream};
use mongodb::options::GridFsBucketOptions;
use mongodb::Database;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Per-upload settings; unset fields use the bucket's defaults
#[derive(Debug, Clone, Default)]
pub struct GridFsUploadOptions {
    /// Size of each stored chunk in bytes
    pub chunk_size_bytes: Option<u32>,
    /// User metadata stored in the files collection
    pub metadata: Option<Document>,
}

/// Hex form of a GridFS file id
pub fn id_to_hex(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_id(id: &str) -> Result<Bson> {
    Ok(Bson::ObjectId(ObjectId::parse_str(id)?))
}

/// An upload fed through a [`GridFsUploadBridge`]
///
/// Write into [`writer`](Self::writer), end it, then await
/// [`finish`](Self::finish).
pub struct GridFsUpload {
    id: String,
    bridge: Arc<GridFsUploadBridge>,
    task: JoinHandle<Result<u64>>,
}

impl GridFsUpload {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn writer(&self) -> Arc<dyn WriteStream<Bytes>> {
        self.bridge.clone()
    }

    /// Wait for the driver to store every written byte. Resolves with the
    /// file id once the writer has been ended.
    pub async fn finish(self) -> Result<String> {
        let bytes = self
            .task
            .await
            .map_err(|e| DocFlowError::Internal(format!("upload task failed: {}", e)))??;
        tracing::debug!(id = %self.id, bytes, "Upload finished");
        Ok(self.id)
    }
}

/// Streaming access to one GridFS bucket
pub struct GridFsClient {
    context: Context,
    bucket: GridFsBucket,
    config: FlowConfig,
}

impl GridFsClient {
    /// Open `bucket_name` in `database`, or the default `fs` bucket
    pub fn new(
        context: Context,
        database: &Database,
        bucket_name: Option<&str>,
        config: FlowConfig,
    ) -> Self {
        let options = GridFsBucketOptions::builder()
            .bucket_name(bucket_name.map(str::to_string))
            .build();
        Self {
            context,
            bucket: database.gridfs_bucket(options),
            config,
        }
    }

    pub fn bucket(&self) -> &GridFsBucket {
        &self.bucket
    }

    async fn open_upload_stream(
        &self,
        filename: &str,
        options: &GridFsUploadOptions,
    ) -> Result<GridFsUploadStream> {
        let mut action = self.bucket.open_upload_stream(filename);
        if let Some(size) = options.chunk_size_bytes {
            action = action.chunk_size_bytes(size);
        }
        if let Some(metadata) = options.metadata.clone() {
            action = action.metadata(metadata);
        }
        Ok(action.await?)
    }

    // ------------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------------

    /// Store every chunk of `stream` as `filename` and return the new id.
    ///
    /// The stream is read under credit, one window of `batch_size` chunks at a
    /// time. On failure the partial upload is aborted.
    pub async fn upload_stream(
        &self,
        stream: Arc<dyn ReadStream<Bytes>>,
        filename: &str,
        options: GridFsUploadOptions,
    ) -> Result<String> {
        let mut upload = self.open_upload_stream(filename, &options).await?;
        let id = id_to_hex(upload.id());

        let publisher: Arc<dyn CreditSource<Bytes>> = Arc::new(ReadStreamPublisher::new(stream));
        let window = u64::from(self.config.batch_size);
        match upload_from_source(publisher, &mut upload, window).await {
            Ok(bytes) => {
                tracing::debug!(id = %id, filename, bytes, "Uploaded stream");
                Ok(id)
            }
            Err(e) => {
                if let Err(abort) = upload.abort().await {
                    tracing::warn!(id = %id, error = %abort, "Failed to abort upload");
                }
                Err(e)
            }
        }
    }

    /// Start an upload the caller feeds through a [`WriteStream`]
    pub async fn open_upload(
        &self,
        filename: &str,
        options: GridFsUploadOptions,
    ) -> Result<GridFsUpload> {
        let mut upload = self.open_upload_stream(filename, &options).await?;
        let id = id_to_hex(upload.id());
        let bridge = Arc::new(GridFsUploadBridge::with_queue_size(
            self.context.clone(),
            self.config.upload_queue_size,
        ));

        let reader = UploadReader::new(Arc::clone(&bridge));
        let failed = Arc::clone(&bridge);
        let task = tokio::spawn(async move {
            let copied = match futures::io::copy(reader, &mut upload).await {
                Ok(bytes) => upload.close().await.map(|_| bytes),
                Err(e) => Err(e),
            };
            match copied {
                Ok(bytes) => Ok(bytes),
                Err(e) => {
                    let error = DocFlowError::from(e);
                    if let Err(abort) = upload.abort().await {
                        tracing::warn!(error = %abort, "Failed to abort upload");
                    }
                    failed.fail(error.clone());
                    Err(error)
                }
            }
        });

        Ok(GridFsUpload { id, bridge, task })
    }

    /// Upload the file at `path`, stored under the path as given
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        options: GridFsUploadOptions,
    ) -> Result<String> {
        let path = path.as_ref();
        tokio::fs::metadata(path).await?;
        let stream = file_read_stream(self.context.clone(), path, self.config.file_chunk_size);
        self.upload_stream(Arc::new(stream), &path.to_string_lossy(), options)
            .await
    }

    // ------------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------------

    async fn download_into<R>(
        &self,
        reader: R,
        sink: Arc<dyn WriteStream<Bytes>>,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let subscriber = GridFsDownloadSubscriber::new(
            self.context.clone(),
            sink,
            self.config.download_window,
            Box::new(move |result: Result<u64>| {
                let _ = tx.send(result);
            }),
        );
        let publisher = AsyncReadPublisher::new(reader, self.config.file_chunk_size);
        publisher.subscribe(Arc::new(subscriber));

        rx.await
            .map_err(|_| DocFlowError::Internal("download dropped without a result".to_string()))?
    }

    /// Write the file named `filename` into `sink` and end it.
    ///
    /// `revision` follows the driver: 0 is the original, -1 the most recent.
    /// Resolves with the number of bytes written.
    pub async fn download_by_name(
        &self,
        sink: Arc<dyn WriteStream<Bytes>>,
        filename: &str,
        revision: Option<i32>,
    ) -> Result<u64> {
        let mut action = self.bucket.open_download_stream_by_name(filename);
        if let Some(revision) = revision {
            action = action.revision(revision);
        }
        let reader = action.await?;
        self.download_into(reader, sink).await
    }

    /// Write the file with hex id `id` into `sink` and end it
    pub async fn download_by_id(
        &self,
        sink: Arc<dyn WriteStream<Bytes>>,
        id: &str,
    ) -> Result<u64> {
        let reader = self.bucket.open_download_stream(parse_id(id)?).await?;
        self.download_into(reader, sink).await
    }

    /// The most recent revision of `filename` as a consumer-driven stream
    pub async fn download_stream(&self, filename: &str) -> Result<PublisherAdapter<Bytes>> {
        let reader = self.bucket.open_download_stream_by_name(filename).await?;
        Ok(self.reader_stream(reader))
    }

    /// The file with hex id `id` as a consumer-driven stream. An invalid id or
    /// a file that cannot be opened is reported to the exception handler.
    pub async fn download_stream_by_id(&self, id: &str) -> Arc<dyn ReadStream<Bytes>> {
        let opened = match parse_id(id) {
            Ok(file_id) => self
                .bucket
                .open_download_stream(file_id)
                .await
                .map_err(DocFlowError::from),
            Err(e) => Err(e),
        };
        match opened {
            Ok(reader) => Arc::new(self.reader_stream(reader)),
            Err(e) => {
                tracing::debug!(error = %e, id, "Download stream failed to open");
                Arc::new(FailedStream::new(e))
            }
        }
    }

    fn reader_stream<R>(&self, reader: R) -> PublisherAdapter<Bytes>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let publisher = Arc::new(AsyncReadPublisher::new(reader, self.config.file_chunk_size));
        PublisherAdapter::with_batch_size(
            self.context.clone(),
            publisher,
            self.config.download_window,
        )
    }

    /// Download `filename` to a local file of the same name
    pub async fn download_file(&self, filename: &str) -> Result<u64> {
        self.download_file_as(filename, filename).await
    }

    /// Download `filename` to `path`
    pub async fn download_file_as(&self, filename: &str, path: impl AsRef<Path>) -> Result<u64> {
        let sink = self.file_sink(path.as_ref()).await?;
        self.download_by_name(sink, filename, None).await
    }

    /// Download the file with hex id `id` to `path`
    pub async fn download_file_by_id(&self, id: &str, path: impl AsRef<Path>) -> Result<u64> {
        let sink = self.file_sink(path.as_ref()).await?;
        self.download_by_id(sink, id).await
    }

    async fn file_sink(&self, path: &Path) -> Result<Arc<dyn WriteStream<Bytes>>> {
        let sink = FileWriteStream::with_queue_size(
            self.context.clone(),
            path,
            self.config.file_write_queue_size,
        )
        .await?;
        Ok(Arc::new(sink))
    }

    // ------------------------------------------------------------------------
    // Management
    // ------------------------------------------------------------------------

    /// Delete the file with hex id `id` and all of its chunks
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.bucket.delete(parse_id(id)?).await?;
        tracing::debug!(id, "Deleted GridFS file");
        Ok(())
    }

    /// Drop the bucket's files and chunks collections
    pub async fn drop_bucket(&self) -> Result<()> {
        self.bucket.drop().await?;
        Ok(())
    }

    /// Ids of every file in the bucket
    pub async fn find_all_ids(&self) -> Result<Vec<String>> {
        self.find_ids(Document::new()).await
    }

    /// Ids of the files whose files-collection document matches `filter`
    pub async fn find_ids(&self, filter: Document) -> Result<Vec<String>> {
        let mut cursor = self.bucket.find(filter).await?;
        let mut ids = Vec::new();
        while cursor.advance().await? {
            let file = cursor.deserialize_current()?;
            ids.push(id_to_hex(&file.id));
        }
        Ok(ids)
    }
}
