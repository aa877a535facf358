//! Cursors over partitioned collections
//!
//! A resource type may be stored across several collections (partitions).
//! Each partition is read through its own driver cursor; [`PartitionedCursor`]
//! chains them into a single logical result stream, exhausting partitions in
//! the order they were supplied.
//!
//! The driver binding lives in [`mongo`]; anything implementing
//! [`PartitionCursor`] can be plugged in.

pub mod mongo;
pub mod partitioned;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::error::{Result, ValidationError};

pub use mongo::MongoPartitionCursor;
pub use partitioned::{PartitionedCursor, PartitionedCursorOptions};

/// Transformation applied to every document a cursor returns.
pub type DocumentMapper = Arc<dyn Fn(Document) -> Document + Send + Sync>;

/// Database and collection a cursor reads from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    pub db: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// Index selection passed to `hint`.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexHint {
    /// Index key pattern, e.g. `{ "id": 1 }`
    Keys(Document),
    /// Index name, e.g. `"id_1"`
    Name(String),
}

impl From<IndexHint> for mongodb::options::Hint {
    fn from(hint: IndexHint) -> Self {
        match hint {
            IndexHint::Keys(keys) => mongodb::options::Hint::Keys(keys),
            IndexHint::Name(name) => mongodb::options::Hint::Name(name),
        }
    }
}

impl From<IndexHint> for Bson {
    fn from(hint: IndexHint) -> Self {
        match hint {
            IndexHint::Keys(keys) => Bson::Document(keys),
            IndexHint::Name(name) => Bson::String(name),
        }
    }
}

/// Verbosity of an explain plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExplainVerbosity {
    QueryPlanner,
    ExecutionStats,
    #[default]
    AllPlansExecution,
}

impl ExplainVerbosity {
    /// Value sent in the `verbosity` field of the explain command
    pub fn as_str(&self) -> &'static str {
        match self {
            ExplainVerbosity::QueryPlanner => "queryPlanner",
            ExplainVerbosity::ExecutionStats => "executionStats",
            ExplainVerbosity::AllPlansExecution => "allPlansExecution",
        }
    }

    /// Parse a verbosity name as accepted by the server
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "queryPlanner" => Ok(ExplainVerbosity::QueryPlanner),
            "executionStats" => Ok(ExplainVerbosity::ExecutionStats),
            "allPlansExecution" => Ok(ExplainVerbosity::AllPlansExecution),
            other => Err(ValidationError::Invalid {
                field: "verbosity",
                value: other.to_string(),
            }
            .into()),
        }
    }
}

/// Driver-level cursor over a single partition.
///
/// Shaping methods (`project`, `sort`, `limit`, ...) configure the query and
/// take effect on the next fetch. Fetch methods may be called in any order;
/// `next` returning `None` means the partition is exhausted.
#[async_trait]
pub trait PartitionCursor: Send {
    /// Whether another document is available
    async fn has_next(&mut self) -> Result<bool>;

    /// Next document, or `None` once exhausted
    async fn next(&mut self) -> Result<Option<Document>>;

    /// All remaining documents
    async fn to_array(&mut self) -> Result<Vec<Document>>;

    /// Query plan for this partition
    async fn explain(&mut self, verbosity: ExplainVerbosity) -> Result<Document>;

    fn project(&mut self, projection: Document);

    fn map(&mut self, mapping: DocumentMapper);

    fn sort(&mut self, sort: Document);

    fn batch_size(&mut self, size: u32);

    fn hint(&mut self, hint: IndexHint);

    fn limit(&mut self, count: i64);

    fn max_time_ms(&mut self, millis: u64);

    /// Database and collection being read
    fn namespace(&self) -> Namespace;
}

/// A partition's cursor together with where it reads from.
pub struct CursorInfo {
    pub db: String,
    pub collection: String,
    pub cursor: Box<dyn PartitionCursor>,
}

impl CursorInfo {
    /// Wrap a cursor, taking db and collection from its namespace
    pub fn new(cursor: Box<dyn PartitionCursor>) -> Self {
        let Namespace { db, collection } = cursor.namespace();
        Self {
            db,
            collection,
            cursor,
        }
    }

    /// Wrap a cursor with an explicit db and collection
    pub fn with_namespace(
        db: impl Into<String>,
        collection: impl Into<String>,
        cursor: Box<dyn PartitionCursor>,
    ) -> Self {
        Self {
            db: db.into(),
            collection: collection.into(),
            cursor,
        }
    }
}

impl fmt::Debug for CursorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorInfo")
            .field("db", &self.db)
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}
