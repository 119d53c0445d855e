//! Query streams over driver cursors
//!
//! `find` and `aggregate` cursors are read one page at a time through
//! [`CursorStream`], so a paused consumer stops `getMore` round trips.

use std::sync::Arc;

use async_trait::async_trait;
use bson::Document;
use docflow_common::Result;
use docflow_stream::{BatchCursor, Context, CursorSource, CursorStream, FlowConfig};
use mongodb::options::{AggregateOptions, FindOptions};
use mongodb::{Collection, Cursor};

/// [`BatchCursor`] over a driver cursor
pub struct DriverCursor {
    cursor: Option<Cursor<Document>>,
    batch_size: usize,
}

impl DriverCursor {
    pub fn new(cursor: Cursor<Document>, batch_size: u32) -> Self {
        Self {
            cursor: Some(cursor),
            batch_size: batch_size.max(1) as usize,
        }
    }
}

#[async_trait]
impl BatchCursor<Document> for DriverCursor {
    async fn next_batch(&mut self) -> Result<Option<Vec<Document>>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };

        let mut page = Vec::with_capacity(self.batch_size);
        while page.len() < self.batch_size {
            if !cursor.advance().await? {
                self.cursor = None;
                break;
            }
            page.push(cursor.deserialize_current()?);
        }

        if page.is_empty() {
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping an open driver cursor kills it server-side
        if self.cursor.take().is_some() {
            tracing::trace!("Released driver cursor");
        }
        Ok(())
    }
}

/// Opens a `find` cursor
pub struct FindSource {
    collection: Collection<Document>,
    filter: Document,
    options: Option<FindOptions>,
}

impl FindSource {
    pub fn new(
        collection: Collection<Document>,
        filter: Document,
        options: Option<FindOptions>,
    ) -> Self {
        Self {
            collection,
            filter,
            options,
        }
    }
}

/// Caller options win; otherwise the stream's page size is used
fn find_options(options: Option<FindOptions>, batch_size: u32) -> FindOptions {
    let mut options = options.unwrap_or_default();
    options.batch_size.get_or_insert(batch_size);
    options
}

fn aggregate_options(options: Option<AggregateOptions>, batch_size: u32) -> AggregateOptions {
    let mut options = options.unwrap_or_default();
    options.batch_size.get_or_insert(batch_size);
    options
}

#[async_trait]
impl CursorSource<Document> for FindSource {
    async fn open(&self, batch_size: u32) -> Result<Box<dyn BatchCursor<Document>>> {
        let options = find_options(self.options.clone(), batch_size);
        let page = options.batch_size.unwrap_or(batch_size);
        let cursor = self
            .collection
            .find(self.filter.clone())
            .with_options(options)
            .await?;
        tracing::debug!(
            collection = %self.collection.name(),
            batch_size = page,
            "Opened find cursor"
        );
        Ok(Box::new(DriverCursor::new(cursor, page)))
    }
}

/// Opens an `aggregate` cursor
pub struct AggregateSource {
    collection: Collection<Document>,
    pipeline: Vec<Document>,
    options: Option<AggregateOptions>,
}

impl AggregateSource {
    pub fn new(
        collection: Collection<Document>,
        pipeline: Vec<Document>,
        options: Option<AggregateOptions>,
    ) -> Self {
        Self {
            collection,
            pipeline,
            options,
        }
    }
}

#[async_trait]
impl CursorSource<Document> for AggregateSource {
    async fn open(&self, batch_size: u32) -> Result<Box<dyn BatchCursor<Document>>> {
        let options = aggregate_options(self.options.clone(), batch_size);
        let page = options.batch_size.unwrap_or(batch_size);
        let cursor = self
            .collection
            .aggregate(self.pipeline.clone())
            .with_options(options)
            .await?;
        tracing::debug!(
            collection = %self.collection.name(),
            stages = self.pipeline.len(),
            batch_size = page,
            "Opened aggregate cursor"
        );
        Ok(Box::new(DriverCursor::new(cursor, page)))
    }
}

/// Builds [`CursorStream`]s for queries, sized by a [`FlowConfig`]
#[derive(Clone)]
pub struct MongoStreams {
    context: Context,
    config: FlowConfig,
}

impl MongoStreams {
    pub fn new(context: Context, config: FlowConfig) -> Self {
        Self { context, config }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Stream the documents matching `filter`. The query runs when the first
    /// handler is attached.
    pub fn find_stream(
        &self,
        collection: &Collection<Document>,
        filter: Document,
        options: Option<FindOptions>,
    ) -> CursorStream<Document> {
        let source = FindSource::new(collection.clone(), filter, options);
        self.stream(Arc::new(source))
    }

    /// Stream the output of an aggregation pipeline
    pub fn aggregate_stream(
        &self,
        collection: &Collection<Document>,
        pipeline: Vec<Document>,
        options: Option<AggregateOptions>,
    ) -> CursorStream<Document> {
        let source = AggregateSource::new(collection.clone(), pipeline, options);
        self.stream(Arc::new(source))
    }

    fn stream(&self, source: Arc<dyn CursorSource<Document>>) -> CursorStream<Document> {
        CursorStream::with_high_water_mark(
            self.context.clone(),
            source,
            self.config.batch_size,
            self.config.queue_high_water_mark,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_defaults_to_stream_page() {
        let options = find_options(None, 20);
        assert_eq!(options.batch_size, Some(20));

        let options = aggregate_options(None, 50);
        assert_eq!(options.batch_size, Some(50));
    }

    #[test]
    fn test_caller_batch_size_kept() {
        let caller = FindOptions::builder().batch_size(7u32).limit(100i64).build();
        let options = find_options(Some(caller), 20);
        assert_eq!(options.batch_size, Some(7));
        assert_eq!(options.limit, Some(100));

        let caller = AggregateOptions::builder().batch_size(3u32).allow_disk_use(true).build();
        let options = aggregate_options(Some(caller), 20);
        assert_eq!(options.batch_size, Some(3));
        assert_eq!(options.allow_disk_use, Some(true));
    }
}
