//! Partition naming and the partition cache
//!
//! Unpartitioned resource types live in a single `{resourceType}_{version}`
//! collection. Partitioned types are spread over that collection and every
//! collection named `{resourceType}_{version}_*`; those names are read from
//! the database and cached for a configurable number of hours.

use std::collections::HashMap;
use std::sync::Arc;

use bson::Document;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::config::PartitioningConfig;
use crate::connection::DatabaseManager;
use crate::error::{Result, ValidationError};
use crate::resource::{AUDIT_EVENT, FHIR_R4};

/// Entry in `partition_resources` that partitions every resource type.
pub const ALL_RESOURCES: &str = "all";

/// Suffix of history collections.
pub const HISTORY_SUFFIX: &str = "_History";

/// Collection name for a resource type and version, e.g. `Patient_4_0_0`
pub fn collection_name(resource_type: &str, base_version: &str) -> String {
    format!("{resource_type}_{base_version}")
}

/// History collection for a partition, e.g. `Patient_4_0_0_History`
pub fn history_collection_name(partition: &str) -> String {
    format!("{partition}{HISTORY_SUFFIX}")
}

/// Reject empty resource types and ones that already carry a version suffix
pub fn validate_resource_type(resource_type: &str) -> Result<()> {
    if resource_type.is_empty() {
        return Err(ValidationError::Empty("resource_type").into());
    }
    if resource_type.ends_with(FHIR_R4) {
        return Err(ValidationError::Invalid {
            field: "resource_type",
            value: resource_type.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Partitions of `resource_type` among `collection_names`, sorted
///
/// A partition is the base collection or one named `{base}_*`, so
/// `MedicationRequest_4_0_0` is not a partition of `Medication`.
fn partitions_from_collection_names(
    resource_type: &str,
    base_version: &str,
    collection_names: &[String],
) -> Vec<String> {
    let base = collection_name(resource_type, base_version);
    let prefix = format!("{base}_");
    let mut partitions: Vec<String> = collection_names
        .iter()
        .filter(|name| {
            (**name == base || name.starts_with(&prefix)) && !name.ends_with(HISTORY_SUFFIX)
        })
        .cloned()
        .collect();
    partitions.sort();
    partitions
}

#[derive(Debug, Default)]
struct PartitionCache {
    partitions: HashMap<String, Vec<String>>,
    last_loaded: Option<DateTime<Utc>>,
}

impl PartitionCache {
    fn is_fresh(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        self.last_loaded.is_some_and(|loaded| now - loaded < ttl)
    }
}

/// Decides which collections hold a resource type.
pub struct PartitioningManager {
    partition_resources: Vec<String>,
    cache_ttl: TimeDelta,
    cache: RwLock<PartitionCache>,
    load_lock: Mutex<()>,
    databases: Arc<DatabaseManager>,
}

impl PartitioningManager {
    /// Create a manager
    ///
    /// # Arguments
    /// * `config` - Partitioned resource types and cache lifetime
    /// * `databases` - Used to list collections when the cache is reloaded
    pub fn new(config: &PartitioningConfig, databases: Arc<DatabaseManager>) -> Self {
        Self {
            partition_resources: config.partition_resources.clone(),
            cache_ttl: TimeDelta::try_hours(config.cache_ttl_hours).unwrap_or(TimeDelta::MAX),
            cache: RwLock::new(PartitionCache::default()),
            load_lock: Mutex::new(()),
            databases,
        }
    }

    /// Whether `resource_type` is spread over several collections
    pub fn is_resource_partitioned(&self, resource_type: &str) -> bool {
        self.partition_resources
            .iter()
            .any(|r| r == resource_type || r == ALL_RESOURCES)
    }

    /// Reload the partition cache if it has expired
    ///
    /// Concurrent callers wait on one reload; the freshness check is repeated
    /// after acquiring the lock.
    pub async fn load_partitions_from_database(&self) -> Result<()> {
        if self.cache.read().await.is_fresh(Utc::now(), self.cache_ttl) {
            return Ok(());
        }

        let _guard = self.load_lock.lock().await;
        if self.cache.read().await.is_fresh(Utc::now(), self.cache_ttl) {
            return Ok(());
        }

        let mut loaded = HashMap::new();
        for resource_type in &self.partition_resources {
            if resource_type == ALL_RESOURCES {
                continue;
            }
            let database = self.databases.database_for_resource(resource_type)?;
            let names = database.list_collection_names().await?;
            loaded.insert(
                resource_type.clone(),
                partitions_from_collection_names(resource_type, FHIR_R4, &names),
            );
        }

        let mut cache = self.cache.write().await;
        for (resource_type, partitions) in loaded {
            let entry = cache.partitions.entry(resource_type).or_default();
            for partition in partitions {
                if !entry.contains(&partition) {
                    entry.push(partition);
                }
            }
            entry.sort();
        }
        cache.last_loaded = Some(Utc::now());
        debug!(cache = ?cache.partitions, "Loaded partitions from database");
        Ok(())
    }

    /// Add a partition to the cache, keeping it sorted
    pub async fn add_partition_to_cache(&self, resource_type: &str, partition: &str) -> Result<()> {
        if resource_type.is_empty() {
            return Err(ValidationError::Empty("resource_type").into());
        }

        let mut cache = self.cache.write().await;
        let partitions = cache
            .partitions
            .entry(resource_type.to_string())
            .or_default();
        if !partitions.iter().any(|p| p == partition) {
            partitions.push(partition.to_string());
            partitions.sort();
        }
        Ok(())
    }

    /// Cached partitions for a resource type
    pub async fn cached_partitions(&self, resource_type: &str) -> Vec<String> {
        self.cache
            .read()
            .await
            .partitions
            .get(resource_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Collections to read for a query
    ///
    /// # Arguments
    /// * `resource_type` - Resource type, without version suffix
    /// * `base_version` - FHIR version, e.g. `4_0_0`
    /// * `query` - Filter of the logical query
    ///
    /// # Returns
    /// * `Result<Vec<String>>` - `[{resourceType}_{version}]` for unpartitioned
    ///   types; every cached partition otherwise
    pub async fn partition_names_for_query(
        &self,
        resource_type: &str,
        base_version: &str,
        query: &Document,
    ) -> Result<Vec<String>> {
        validate_resource_type(resource_type)?;
        let default_collection = collection_name(resource_type, base_version);

        if !self.is_resource_partitioned(resource_type) {
            return Ok(vec![default_collection]);
        }

        self.load_partitions_from_database().await?;
        let partitions = self.cached_partitions(resource_type).await;
        trace!(resource_type, query = %query, partitions = ?partitions, "Selected partitions");

        if partitions.is_empty() {
            Ok(vec![default_collection])
        } else {
            Ok(partitions)
        }
    }

    /// History collections to read for a query; audit events have none
    pub async fn history_partition_names_for_query(
        &self,
        resource_type: &str,
        base_version: &str,
        query: &Document,
    ) -> Result<Vec<String>> {
        validate_resource_type(resource_type)?;
        if resource_type == AUDIT_EVENT {
            return Ok(Vec::new());
        }

        let partitions = self
            .partition_names_for_query(resource_type, base_version, query)
            .await?;
        Ok(partitions
            .iter()
            .map(|p| history_collection_name(p))
            .collect())
    }

    /// Forget every cached partition
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.partitions.clear();
        cache.last_loaded = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::error::DataLayerError;
    use bson::doc;

    fn manager(partition_resources: &[&str]) -> PartitioningManager {
        let config = PartitioningConfig {
            partition_resources: partition_resources.iter().map(|r| r.to_string()).collect(),
            ..PartitioningConfig::default()
        };
        PartitioningManager::new(
            &config,
            Arc::new(DatabaseManager::new(ConnectionConfig::default())),
        )
    }

    #[test]
    fn test_collection_names() {
        assert_eq!(collection_name("Patient", FHIR_R4), "Patient_4_0_0");
        assert_eq!(
            history_collection_name("Patient_4_0_0"),
            "Patient_4_0_0_History"
        );
    }

    #[test]
    fn test_versioned_resource_type_rejected() {
        assert!(matches!(
            validate_resource_type("Patient_4_0_0"),
            Err(DataLayerError::Validation(ValidationError::Invalid { .. }))
        ));
        assert!(matches!(
            validate_resource_type(""),
            Err(DataLayerError::Validation(ValidationError::Empty(_)))
        ));
        assert!(validate_resource_type("Patient").is_ok());
    }

    #[test]
    fn test_partitions_filtered_and_sorted() {
        let names: Vec<String> = [
            "AuditEvent_4_0_0_2024_02",
            "AuditEvent_4_0_0_2024_01",
            "AuditEvent_4_0_0_2024_01_History",
            "Patient_4_0_0",
            "AuditEvent_4_0_0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(
            partitions_from_collection_names("AuditEvent", FHIR_R4, &names),
            vec![
                "AuditEvent_4_0_0",
                "AuditEvent_4_0_0_2024_01",
                "AuditEvent_4_0_0_2024_02"
            ]
        );
    }

    #[test]
    fn test_partitions_exclude_types_sharing_a_prefix() {
        let names: Vec<String> = [
            "MedicationRequest_4_0_0",
            "Medication_4_0_0",
            "MedicationStatement_4_0_0_2024_01",
            "Medication_4_0_0_2024_01",
            "Medication_4_0_0_History",
            "ObservationDefinition_4_0_0",
            "Observation_4_0_0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(
            partitions_from_collection_names("Medication", FHIR_R4, &names),
            vec!["Medication_4_0_0", "Medication_4_0_0_2024_01"]
        );
        assert_eq!(
            partitions_from_collection_names("Observation", FHIR_R4, &names),
            vec!["Observation_4_0_0"]
        );
    }

    #[test]
    fn test_cache_freshness() {
        let now = Utc::now();
        let ttl = TimeDelta::try_hours(24).unwrap();
        let mut cache = PartitionCache::default();
        assert!(!cache.is_fresh(now, ttl));

        cache.last_loaded = Some(now - TimeDelta::try_hours(1).unwrap());
        assert!(cache.is_fresh(now, ttl));

        cache.last_loaded = Some(now - TimeDelta::try_hours(25).unwrap());
        assert!(!cache.is_fresh(now, ttl));
    }

    #[test]
    fn test_partitioned_resources() {
        let m = manager(&["AuditEvent"]);
        assert!(m.is_resource_partitioned("AuditEvent"));
        assert!(!m.is_resource_partitioned("Patient"));

        let m = manager(&["all"]);
        assert!(m.is_resource_partitioned("Patient"));
    }

    #[tokio::test]
    async fn test_unpartitioned_resource_uses_single_collection() {
        let m = manager(&["AuditEvent"]);
        let names = m
            .partition_names_for_query("Patient", FHIR_R4, &doc! {})
            .await
            .unwrap();
        assert_eq!(names, vec!["Patient_4_0_0"]);

        let history = m
            .history_partition_names_for_query("Patient", FHIR_R4, &doc! {})
            .await
            .unwrap();
        assert_eq!(history, vec!["Patient_4_0_0_History"]);
    }

    #[tokio::test]
    async fn test_audit_event_has_no_history() {
        let m = manager(&["AuditEvent"]);
        let history = m
            .history_partition_names_for_query("AuditEvent", FHIR_R4, &doc! {})
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_add_partition_to_cache_is_sorted_and_idempotent() {
        let m = manager(&["AuditEvent"]);
        m.add_partition_to_cache("AuditEvent", "AuditEvent_4_0_0_2024_02")
            .await
            .unwrap();
        m.add_partition_to_cache("AuditEvent", "AuditEvent_4_0_0_2024_01")
            .await
            .unwrap();
        m.add_partition_to_cache("AuditEvent", "AuditEvent_4_0_0_2024_02")
            .await
            .unwrap();

        assert_eq!(
            m.cached_partitions("AuditEvent").await,
            vec!["AuditEvent_4_0_0_2024_01", "AuditEvent_4_0_0_2024_02"]
        );

        m.clear_cache().await;
        assert!(m.cached_partitions("AuditEvent").await.is_empty());
    }

    #[tokio::test]
    async fn test_partitioned_lookup_needs_connection() {
        let m = manager(&["AuditEvent"]);
        let result = m
            .partition_names_for_query("AuditEvent", FHIR_R4, &doc! {})
            .await;
        assert!(matches!(result, Err(DataLayerError::Connection(_))));
    }
}
