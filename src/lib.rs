//! Partitioned FHIR data layer
//!
//! A FHIR resource type may be stored across several MongoDB collections
//! (partitions). This library reads them as one: callers get a single
//! cursor that drains each partition in turn, and never need to know how a
//! resource type is split.
//!
//! # Modules
//!
//! - `cli`: Command-line interface and argument parsing
//! - `config`: Configuration management
//! - `connection`: MongoDB connection management and database routing
//! - `cursor`: Partition cursor protocol and the partitioned cursor
//! - `error`: Error types and handling
//! - `locator`: Partition naming, caching and cross-partition queries
//! - `metrics`: Prometheus metrics
//! - `resource`: FHIR resource deserialization
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fhir_datalayer::config::Config;
//! use fhir_datalayer::connection::DatabaseManager;
//! use fhir_datalayer::cursor::mongo::CursorOptions;
//! use fhir_datalayer::locator::{PartitioningManager, QueryManager, ResourceLocator};
//! use fhir_datalayer::resource::{FHIR_R4, ResourceFactory};
//! use bson::doc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let mut databases = DatabaseManager::new(config.connection.clone());
//!     databases.connect().await?;
//!     let databases = Arc::new(databases);
//!
//!     let partitioning = Arc::new(PartitioningManager::new(
//!         &config.partitioning,
//!         Arc::clone(&databases),
//!     ));
//!     let locator = ResourceLocator::new("Patient", FHIR_R4, partitioning, databases)?;
//!     let queries = QueryManager::new(
//!         locator,
//!         Arc::new(ResourceFactory::with_fhir_r4()),
//!         config.query,
//!     );
//!
//!     let mut cursor = queries
//!         .find(doc! { "gender": "female" }, CursorOptions::default())
//!         .await?;
//!     while cursor.has_next().await? {
//!         if let Some(patient) = cursor.next().await? {
//!             println!("{:?}", patient.id);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod locator;
pub mod metrics;
pub mod resource;

// Re-export commonly used types
pub use config::Config;
pub use connection::DatabaseManager;
pub use cursor::{CursorInfo, PartitionCursor, PartitionedCursor, PartitionedCursorOptions};
pub use error::{DataLayerError, Result};
pub use locator::{PartitioningManager, QueryManager, ResourceLocator};
pub use resource::{Resource, ResourceFactory};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version string
pub fn version() -> &'static str {
    VERSION
}
