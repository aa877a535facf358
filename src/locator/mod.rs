//! Resource location
//!
//! Maps a resource type and FHIR version to the collections that hold it and
//! opens partitioned cursors over them:
//! - [`PartitioningManager`] names partitions and caches the partition list
//! - [`ResourceLocator`] binds one resource type to its database and collections
//! - [`QueryManager`] runs finds and counts across every partition

pub mod partitioning;
pub mod query;
pub mod resource_locator;

pub use partitioning::{PartitioningManager, collection_name, history_collection_name};
pub use query::QueryManager;
pub use resource_locator::ResourceLocator;
