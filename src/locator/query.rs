use std::sync::Arc;

use bson::Document;
use mongodb::Database;
use tracing::debug;

use super::ResourceLocator;
use crate::config::QueryConfig;
use crate::cursor::mongo::CursorOptions;
use crate::cursor::{CursorInfo, MongoPartitionCursor, PartitionedCursor, PartitionedCursorOptions};
use crate::error::Result;
use crate::resource::ResourceFactory;

/// Reads one resource type across all of its partitions.
pub struct QueryManager {
    locator: ResourceLocator,
    factory: Arc<ResourceFactory>,
    defaults: QueryConfig,
}

impl QueryManager {
    /// Create a query manager
    ///
    /// # Arguments
    /// * `locator` - Resource type, version and collection lookup
    /// * `factory` - Deserializers handed to every cursor
    /// * `defaults` - Time limit and batch size applied when a query sets none
    pub fn new(locator: ResourceLocator, factory: Arc<ResourceFactory>, defaults: QueryConfig) -> Self {
        Self {
            locator,
            factory,
            defaults,
        }
    }

    pub fn locator(&self) -> &ResourceLocator {
        &self.locator
    }

    /// Open one cursor per partition matching `filter`
    ///
    /// # Arguments
    /// * `filter` - Query filter
    /// * `options` - Shaping sent with every partition's find
    ///
    /// # Returns
    /// * `Result<PartitionedCursor>` - Cursor over every partition, in partition order
    pub async fn find(&self, filter: Document, options: CursorOptions) -> Result<PartitionedCursor> {
        let names = self.locator.collection_names_for_query(&filter).await?;
        self.open(names, filter, options)
    }

    /// Like [`find`](Self::find), over the history collections
    pub async fn find_history(
        &self,
        filter: Document,
        options: CursorOptions,
    ) -> Result<PartitionedCursor> {
        let names = self.locator.history_collection_names_for_query(&filter).await?;
        self.open(names, filter, options)
    }

    /// First document matching `filter`, searching partitions in order
    pub async fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        for collection in self.locator.collections_for_query(&filter).await? {
            if let Some(document) = collection.find_one(filter.clone()).await? {
                return Ok(Some(document));
            }
        }
        Ok(None)
    }

    /// Documents matching `filter`, summed over partitions
    pub async fn exact_document_count(&self, filter: Document) -> Result<u64> {
        let mut count = 0;
        for collection in self.locator.collections_for_query(&filter).await? {
            count += collection.count_documents(filter.clone()).await?;
        }
        Ok(count)
    }

    /// Collection metadata counts, summed over partitions
    pub async fn estimated_document_count(&self) -> Result<u64> {
        let mut count = 0;
        for collection in self.locator.collections_for_query(&Document::new()).await? {
            count += collection.estimated_document_count().await?;
        }
        Ok(count)
    }

    /// Fill options the query left unset from the configured defaults
    pub fn with_defaults(&self, mut options: CursorOptions) -> CursorOptions {
        if options.max_time_ms.is_none() {
            options.max_time_ms = self.defaults.max_time_ms;
        }
        if options.batch_size.is_none() {
            options.batch_size = self.defaults.batch_size;
        }
        options
    }

    fn open(
        &self,
        collection_names: Vec<String>,
        filter: Document,
        options: CursorOptions,
    ) -> Result<PartitionedCursor> {
        let database = self.locator.database()?;
        let options = self.with_defaults(options);
        debug!(
            resource_type = %self.locator.resource_type(),
            collections = ?collection_names,
            "Opening partition cursors"
        );

        let cursors = collection_names
            .iter()
            .map(|name| partition_cursor(&database, name, &filter, &options))
            .collect();

        PartitionedCursor::new(PartitionedCursorOptions {
            base_version: self.locator.base_version().to_string(),
            resource_type: self.locator.resource_type().to_string(),
            cursors,
            query: filter,
            factory: Arc::clone(&self.factory),
        })
    }
}

fn partition_cursor(
    database: &Database,
    collection: &str,
    filter: &Document,
    options: &CursorOptions,
) -> CursorInfo {
    CursorInfo::with_namespace(
        database.name(),
        collection,
        Box::new(MongoPartitionCursor::with_options(
            database,
            collection,
            filter.clone(),
            options.clone(),
        )),
    )
}
