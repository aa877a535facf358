//! MongoDB partition cursor
//!
//! Wraps a driver `find` on one partition collection. The find is issued
//! lazily on the first read so shaping calls made beforehand are sent with
//! it. Server-side shaping after that is refused, and the next read on the
//! partition fails with [`DataLayerError::CursorStarted`]. One document may
//! be held back to answer `has_next`.

use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::{Stream, TryStreamExt};
use mongodb::options::FindOptions;
use mongodb::{Collection, Cursor, Database};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DocumentMapper, ExplainVerbosity, IndexHint, Namespace, PartitionCursor};
use crate::error::{DataLayerError, Result};

/// Query shaping accumulated before the find is sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub limit: Option<i64>,
    pub batch_size: Option<u32>,
    pub hint: Option<IndexHint>,
    pub max_time_ms: Option<u64>,
}

impl CursorOptions {
    /// Driver options for the find, tagged with `comment`
    pub fn to_find_options(&self, comment: &str) -> FindOptions {
        let mut find_opts = FindOptions::default();
        find_opts.comment = Some(Bson::String(comment.to_string()));
        find_opts.projection = self.projection.clone();
        find_opts.sort = self.sort.clone();
        find_opts.limit = self.limit;
        find_opts.batch_size = self.batch_size;
        find_opts.hint = self.hint.clone().map(Into::into);
        find_opts.max_time = self.max_time_ms.map(Duration::from_millis);
        find_opts
    }

    /// Equivalent `find` command document, as wrapped by `explain`
    ///
    /// # Arguments
    /// * `collection` - Collection name
    /// * `filter` - Query filter
    ///
    /// # Returns
    /// * `Document` - `{ find, filter, ... }` with every option that is set
    pub fn to_find_command(&self, collection: &str, filter: &Document) -> Document {
        let mut find_cmd = Document::new();
        find_cmd.insert("find", collection);
        find_cmd.insert("filter", filter.clone());

        if let Some(ref projection) = self.projection {
            find_cmd.insert("projection", projection.clone());
        }
        if let Some(ref sort) = self.sort {
            find_cmd.insert("sort", sort.clone());
        }
        if let Some(limit) = self.limit {
            find_cmd.insert("limit", limit);
        }
        if let Some(batch_size) = self.batch_size {
            find_cmd.insert("batchSize", i64::from(batch_size));
        }
        if let Some(ref hint) = self.hint {
            find_cmd.insert("hint", Bson::from(hint.clone()));
        }
        if let Some(max_time_ms) = self.max_time_ms {
            // maxTimeMS beyond i64 is meaningless to the server
            find_cmd.insert("maxTimeMS", i64::try_from(max_time_ms).unwrap_or(i64::MAX));
        }
        find_cmd
    }
}

/// Identifier attached to every find as its `comment`.
///
/// Format: `fhir-datalayer-<host>-<uuid>`, so slow partitions can be traced
/// back through `$currentOp` or the profiler.
fn operation_comment() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("fhir-datalayer-{}-{}", host, Uuid::new_v4())
}

/// Read side of a partition find, independent of the driver.
///
/// Holds the opened stream, one document peeked by `has_next`, the
/// client-side mappers and the first shaping call that arrived too late.
/// `S` is the driver cursor in production.
struct PartitionReader<S> {
    stream: Option<S>,
    peeked: Option<Document>,
    mappers: Vec<DocumentMapper>,
    late_option: Option<&'static str>,
}

impl<S> PartitionReader<S>
where
    S: Stream<Item = mongodb::error::Result<Document>> + Unpin + Send,
{
    fn new() -> Self {
        Self {
            stream: None,
            peeked: None,
            mappers: Vec::new(),
            late_option: None,
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn open(&mut self, stream: S) {
        self.stream = Some(stream);
    }

    /// Whether server-side shaping can still be applied
    ///
    /// Once the stream is open the option is refused and remembered, so the
    /// next read reports it.
    fn reshape(&mut self, option: &'static str) -> bool {
        if self.stream.is_none() {
            return true;
        }
        if self.late_option.is_none() {
            self.late_option = Some(option);
        }
        false
    }

    /// Report a shaping call that was refused, once
    fn check_reshape(&mut self, collection: &str) -> Result<()> {
        match self.late_option.take() {
            Some(option) => Err(DataLayerError::CursorStarted {
                collection: collection.to_string(),
                option,
            }),
            None => Ok(()),
        }
    }

    fn map(&mut self, mapping: DocumentMapper) {
        self.mappers.push(mapping);
    }

    async fn fetch(&mut self) -> Result<Option<Document>> {
        if let Some(document) = self.peeked.take() {
            return Ok(Some(document));
        }
        match self.stream.as_mut() {
            Some(stream) => Ok(stream.try_next().await?),
            None => Ok(None),
        }
    }

    async fn has_next(&mut self) -> Result<bool> {
        if self.peeked.is_none() {
            self.peeked = self.fetch().await?;
        }
        Ok(self.peeked.is_some())
    }

    // Mappers run on the way out, so they also reach a document peeked
    // before they were added
    async fn next(&mut self) -> Result<Option<Document>> {
        let document = self.fetch().await?;
        Ok(document.map(|d| self.apply_mappers(d)))
    }

    async fn to_array(&mut self) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        while let Some(document) = self.fetch().await? {
            documents.push(self.apply_mappers(document));
        }
        Ok(documents)
    }

    fn apply_mappers(&self, document: Document) -> Document {
        self.mappers
            .iter()
            .fold(document, |document, mapping| mapping(document))
    }
}

/// Partition cursor backed by a MongoDB collection.
pub struct MongoPartitionCursor {
    database: Database,
    collection: Collection<Document>,
    filter: Document,
    options: CursorOptions,
    reader: PartitionReader<Cursor<Document>>,
    comment: String,
}

impl MongoPartitionCursor {
    /// Cursor over `collection` in `database` matching `filter`
    pub fn new(database: &Database, collection: &str, filter: Document) -> Self {
        Self::with_options(database, collection, filter, CursorOptions::default())
    }

    /// Cursor with initial shaping options
    pub fn with_options(
        database: &Database,
        collection: &str,
        filter: Document,
        options: CursorOptions,
    ) -> Self {
        Self {
            database: database.clone(),
            collection: database.collection(collection),
            filter,
            options,
            reader: PartitionReader::new(),
            comment: operation_comment(),
        }
    }

    /// Comment sent with the find
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Options that will be (or were) sent with the find
    pub fn options(&self) -> &CursorOptions {
        &self.options
    }

    fn can_reshape(&mut self, option: &'static str) -> bool {
        if self.reader.reshape(option) {
            return true;
        }
        warn!(
            collection = %self.collection.name(),
            option,
            "Shaping option set on a cursor that already started reading"
        );
        false
    }

    /// Surface a refused shaping call, then send the find if not yet sent
    async fn prepare(&mut self) -> Result<()> {
        self.reader.check_reshape(self.collection.name())?;
        if self.reader.is_open() {
            return Ok(());
        }

        debug!(
            collection = %self.collection.name(),
            filter = %self.filter,
            comment = %self.comment,
            "Opening partition cursor"
        );
        let cursor = self
            .collection
            .find(self.filter.clone())
            .with_options(self.options.to_find_options(&self.comment))
            .await?;
        self.reader.open(cursor);
        Ok(())
    }
}

#[async_trait]
impl PartitionCursor for MongoPartitionCursor {
    async fn has_next(&mut self) -> Result<bool> {
        self.prepare().await?;
        self.reader.has_next().await
    }

    async fn next(&mut self) -> Result<Option<Document>> {
        self.prepare().await?;
        self.reader.next().await
    }

    async fn to_array(&mut self) -> Result<Vec<Document>> {
        self.prepare().await?;
        self.reader.to_array().await
    }

    async fn explain(&mut self, verbosity: ExplainVerbosity) -> Result<Document> {
        self.reader.check_reshape(self.collection.name())?;

        let mut find_cmd = self
            .options
            .to_find_command(self.collection.name(), &self.filter);
        find_cmd.insert("comment", self.comment.as_str());

        let mut explain_cmd = Document::new();
        explain_cmd.insert("explain", find_cmd);
        explain_cmd.insert("verbosity", verbosity.as_str());

        Ok(self.database.run_command(explain_cmd).await?)
    }

    fn project(&mut self, projection: Document) {
        if self.can_reshape("projection") {
            self.options.projection = Some(projection);
        }
    }

    // Mapping is client side, so it applies even after reading started
    fn map(&mut self, mapping: DocumentMapper) {
        self.reader.map(mapping);
    }

    fn sort(&mut self, sort: Document) {
        if self.can_reshape("sort") {
            self.options.sort = Some(sort);
        }
    }

    fn batch_size(&mut self, size: u32) {
        if self.can_reshape("batchSize") {
            self.options.batch_size = Some(size);
        }
    }

    fn hint(&mut self, hint: IndexHint) {
        if self.can_reshape("hint") {
            self.options.hint = Some(hint);
        }
    }

    fn limit(&mut self, count: i64) {
        if self.can_reshape("limit") {
            self.options.limit = Some(count);
        }
    }

    fn max_time_ms(&mut self, millis: u64) {
        if self.can_reshape("maxTimeMS") {
            self.options.max_time_ms = Some(millis);
        }
    }

    fn namespace(&self) -> Namespace {
        Namespace::new(self.database.name(), self.collection.name())
    }
}
