//! Cursor of cursors
//!
//! [`PartitionedCursor`] presents the per-partition cursors of one logical
//! query as a single cursor. Sequential reads drain the head partition
//! before moving to the next; bulk reads fetch every partition concurrently
//! and concatenate in partition order. Shaping calls are broadcast to every
//! partition that has not been discarded yet.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bson::Document;
use futures::future::try_join_all;
use tracing::{debug, trace};

use super::{CursorInfo, DocumentMapper, ExplainVerbosity, IndexHint};
use crate::error::{DataLayerError, Result, RethrownError, ValidationError};
use crate::metrics;
use crate::resource::{AUDIT_EVENT, Resource, ResourceFactory};

/// Arguments for [`PartitionedCursor::new`].
pub struct PartitionedCursorOptions {
    /// FHIR base version, e.g. `4_0_0`
    pub base_version: String,
    /// Resource type of every document, e.g. `Patient`
    pub resource_type: String,
    /// One entry per partition, in read order
    pub cursors: Vec<CursorInfo>,
    /// Logical query, kept for diagnostics
    pub query: Document,
    /// Turns documents into resources
    pub factory: Arc<ResourceFactory>,
}

/// A single cursor over several partition cursors.
pub struct PartitionedCursor {
    base_version: String,
    resource_type: String,
    cursors: VecDeque<CursorInfo>,
    query: Document,
    factory: Arc<ResourceFactory>,
    limit: Option<i64>,
}

impl PartitionedCursor {
    /// Create a partitioned cursor
    ///
    /// # Arguments
    /// * `options` - Version, resource type, partition cursors and query
    ///
    /// # Returns
    /// * `Result<Self>` - Cursor, or a validation error when `base_version`
    ///   or `resource_type` is empty. An empty cursor list is accepted.
    pub fn new(options: PartitionedCursorOptions) -> Result<Self> {
        let PartitionedCursorOptions {
            base_version,
            resource_type,
            cursors,
            query,
            factory,
        } = options;

        if base_version.is_empty() {
            return Err(ValidationError::Empty("base_version").into());
        }
        if resource_type.is_empty() {
            return Err(ValidationError::Empty("resource_type").into());
        }

        let cursor = Self {
            base_version,
            resource_type,
            cursors: cursors.into(),
            query,
            factory,
            limit: None,
        };

        debug!(
            resource_type = %cursor.resource_type,
            base_version = %cursor.base_version,
            collections = ?cursor.all_collections(),
            query = %cursor.query,
            "Created partitioned cursor"
        );
        metrics::record_partitions_opened(&cursor.resource_type, cursor.cursors.len());

        Ok(cursor)
    }

    /// Whether another document is available
    ///
    /// Exhausted partitions at the head are discarded until one reports a
    /// document or none remain.
    pub async fn has_next(&mut self) -> Result<bool> {
        trace!(
            resource_type = %self.resource_type,
            collections = ?self.all_collections(),
            "has_next"
        );

        while let Some(head) = self.cursors.front_mut() {
            let result = head.cursor.has_next().await;
            match result {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    self.cursors.pop_front();
                }
                Err(e) => return Err(self.rethrow("has_next", e)),
            }
        }
        Ok(false)
    }

    /// Next resource
    ///
    /// Call [`has_next`](Self::has_next) first. Returns `None` once every
    /// partition has been discarded.
    pub async fn next(&mut self) -> Result<Option<Resource>> {
        let Some(document) = self.next_document().await? else {
            return Ok(None);
        };

        match self
            .factory
            .create(&self.base_version, &self.resource_type, document)
        {
            Ok(resource) => Ok(Some(resource)),
            Err(e) => Err(self.rethrow("next", e)),
        }
    }

    /// Next raw document
    ///
    /// Reads from the head partition without advancing past it. Documents
    /// with neither `resourceType` nor a wrapped `resource` are stamped with
    /// the cursor's resource type. If the head
    /// has nothing to return it is discarded and an assertion error is raised,
    /// since `has_next` would have reported it exhausted.
    pub async fn next_document(&mut self) -> Result<Option<Document>> {
        trace!(
            resource_type = %self.resource_type,
            collections = ?self.all_collections(),
            "next"
        );

        let Some(head) = self.cursors.front_mut() else {
            return Ok(None);
        };

        let result = head.cursor.next().await;
        match result {
            Ok(Some(mut document)) => {
                // Projections can drop the type; history entries carry it inside `resource`
                if !document.contains_key("resourceType") && !document.contains_key("resource") {
                    document.insert("resourceType", self.resource_type.as_str());
                }
                Ok(Some(document))
            }
            Ok(None) => {
                let collection = self.first_collection().to_string();
                let err = self.rethrow(
                    "next",
                    DataLayerError::AssertionFailed(format!(
                        "cursor for {collection} returned no document"
                    )),
                );
                self.cursors.pop_front();
                Err(err)
            }
            Err(e) => Err(self.rethrow("next", e)),
        }
    }

    /// All remaining documents
    ///
    /// Every remaining partition is read concurrently; the result keeps
    /// partition order. A failure in any partition fails the whole call.
    pub async fn to_array(&mut self) -> Result<Vec<Document>> {
        trace!(
            resource_type = %self.resource_type,
            collections = ?self.all_collections(),
            "to_array"
        );

        let result = try_join_all(self.cursors.iter_mut().map(|info| info.cursor.to_array())).await;

        match result {
            Ok(batches) => Ok(batches.into_iter().flatten().collect()),
            Err(e) => Err(self.rethrow("to_array", e)),
        }
    }

    /// All remaining documents as resources
    pub async fn to_object_array(&mut self) -> Result<Vec<Resource>> {
        let documents = self.to_array().await?;
        let mut resources = Vec::with_capacity(documents.len());
        for document in documents {
            match self
                .factory
                .create(&self.base_version, &self.resource_type, document)
            {
                Ok(resource) => resources.push(resource),
                Err(e) => return Err(self.rethrow("to_array", e)),
            }
        }
        Ok(resources)
    }

    /// Query plan of the first remaining partition
    ///
    /// Returns an empty list when no partitions remain. Audit events are
    /// explained with `queryPlanner` only, as their archive store rejects
    /// execution verbosities.
    pub async fn explain(&mut self) -> Result<Vec<Document>> {
        trace!(
            resource_type = %self.resource_type,
            collections = ?self.all_collections(),
            "explain"
        );

        let verbosity = if self.resource_type == AUDIT_EVENT {
            ExplainVerbosity::QueryPlanner
        } else {
            ExplainVerbosity::AllPlansExecution
        };

        let Some(head) = self.cursors.front_mut() else {
            return Ok(Vec::new());
        };

        let result = head.cursor.explain(verbosity).await;
        match result {
            Ok(plan) => Ok(vec![plan]),
            Err(e) => Err(self.rethrow("explain", e)),
        }
    }

    pub fn max_time_ms(&mut self, millis: u64) -> &mut Self {
        for info in self.cursors.iter_mut() {
            info.cursor.max_time_ms(millis);
        }
        self
    }

    pub fn project(&mut self, projection: Document) -> &mut Self {
        for info in self.cursors.iter_mut() {
            info.cursor.project(projection.clone());
        }
        self
    }

    /// Transform every document returned from here on
    pub fn map(&mut self, mapping: DocumentMapper) -> &mut Self {
        for info in self.cursors.iter_mut() {
            info.cursor.map(Arc::clone(&mapping));
        }
        self
    }

    /// Sort within each partition; there is no merge across partitions
    pub fn sort(&mut self, sort: Document) -> &mut Self {
        for info in self.cursors.iter_mut() {
            info.cursor.sort(sort.clone());
        }
        self
    }

    pub fn batch_size(&mut self, size: u32) -> &mut Self {
        for info in self.cursors.iter_mut() {
            info.cursor.batch_size(size);
        }
        self
    }

    pub fn hint(&mut self, hint: IndexHint) -> &mut Self {
        for info in self.cursors.iter_mut() {
            info.cursor.hint(hint.clone());
        }
        self
    }

    /// Limit each partition to `count` documents
    ///
    /// The limit is per partition, so the combined result may hold up to
    /// `count` times the number of partitions.
    pub fn limit(&mut self, count: i64) -> &mut Self {
        for info in self.cursors.iter_mut() {
            info.cursor.limit(count);
        }
        self.limit = Some(count);
        self
    }

    /// Drop every partition without draining it
    pub fn clear(&mut self) {
        self.cursors.clear();
    }

    pub fn query(&self) -> &Document {
        &self.query
    }

    pub fn base_version(&self) -> &str {
        &self.base_version
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Collection of the head partition, or `""` when none remain
    pub fn first_collection(&self) -> &str {
        self.cursors
            .front()
            .map(|info| info.collection.as_str())
            .unwrap_or("")
    }

    /// Database of the head partition, or `""` when none remain
    pub fn first_database(&self) -> &str {
        self.cursors
            .front()
            .map(|info| info.db.as_str())
            .unwrap_or("")
    }

    pub fn all_collections(&self) -> Vec<String> {
        self.cursors.iter().map(|info| info.collection.clone()).collect()
    }

    pub fn all_databases(&self) -> Vec<String> {
        self.cursors.iter().map(|info| info.db.clone()).collect()
    }

    /// Number of partitions not yet discarded
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Last limit applied with [`limit`](Self::limit)
    pub fn limit_value(&self) -> Option<i64> {
        self.limit
    }

    fn rethrow(&self, operation: &'static str, source: DataLayerError) -> DataLayerError {
        metrics::record_cursor_error(&self.resource_type, operation);
        RethrownError::new(
            source,
            self.all_collections(),
            self.all_databases(),
            self.query.clone(),
        )
        .into()
    }
}

impl fmt::Debug for PartitionedCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedCursor")
            .field("base_version", &self.base_version)
            .field("resource_type", &self.resource_type)
            .field("cursors", &self.cursors)
            .field("query", &self.query)
            .field("limit", &self.limit)
            .finish()
    }
}
