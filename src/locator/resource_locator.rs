use std::sync::Arc;

use bson::Document;
use mongodb::{Collection, Database};

use super::partitioning::{PartitioningManager, validate_resource_type};
use crate::connection::DatabaseManager;
use crate::error::{Result, ValidationError};

/// Finds the collections holding one resource type at one version.
#[derive(Clone)]
pub struct ResourceLocator {
    resource_type: String,
    base_version: String,
    partitioning: Arc<PartitioningManager>,
    databases: Arc<DatabaseManager>,
}

impl ResourceLocator {
    /// Create a locator
    ///
    /// # Arguments
    /// * `resource_type` - Resource type, e.g. `Patient`
    /// * `base_version` - FHIR version, e.g. `4_0_0`
    /// * `partitioning` - Partition naming and cache
    /// * `databases` - Connection used to open collections
    pub fn new(
        resource_type: impl Into<String>,
        base_version: impl Into<String>,
        partitioning: Arc<PartitioningManager>,
        databases: Arc<DatabaseManager>,
    ) -> Result<Self> {
        let resource_type = resource_type.into();
        let base_version = base_version.into();
        validate_resource_type(&resource_type)?;
        if base_version.is_empty() {
            return Err(ValidationError::Empty("base_version").into());
        }

        Ok(Self {
            resource_type,
            base_version,
            partitioning,
            databases,
        })
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn base_version(&self) -> &str {
        &self.base_version
    }

    /// Database this resource type is stored in
    pub fn database(&self) -> Result<Database> {
        self.databases.database_for_resource(&self.resource_type)
    }

    /// Collection names for a query, in read order
    pub async fn collection_names_for_query(&self, query: &Document) -> Result<Vec<String>> {
        self.partitioning
            .partition_names_for_query(&self.resource_type, &self.base_version, query)
            .await
    }

    /// History collection names for a query, in read order
    pub async fn history_collection_names_for_query(
        &self,
        query: &Document,
    ) -> Result<Vec<String>> {
        self.partitioning
            .history_partition_names_for_query(&self.resource_type, &self.base_version, query)
            .await
    }

    /// Collection handles for a query
    pub async fn collections_for_query(&self, query: &Document) -> Result<Vec<Collection<Document>>> {
        let database = self.database()?;
        Ok(self
            .collection_names_for_query(query)
            .await?
            .iter()
            .map(|name| database.collection(name))
            .collect())
    }

    /// Name of the first collection a query reads, or `""` if none
    ///
    /// Only meant for debug output.
    pub async fn first_collection_name_for_query(&self, query: &Document) -> Result<String> {
        Ok(self
            .collection_names_for_query(query)
            .await?
            .into_iter()
            .next()
            .unwrap_or_default())
    }
}
