//! Resource factory
//!
//! Turns raw documents read from a partition into typed FHIR resources. The
//! factory is a registry keyed by `(base_version, resource_type)` and is
//! populated once at startup; lookups for unregistered pairs fail rather than
//! falling back to an untyped document.

use std::collections::HashMap;
use std::fmt;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::{DataLayerError, Result};

/// FHIR R4 base version string as used in collection names.
pub const FHIR_R4: &str = "4_0_0";

/// Audit events live in their own database and are never versioned.
pub const AUDIT_EVENT: &str = "AuditEvent";

/// Resource types served from the R4 store.
pub const R4_RESOURCE_TYPES: &[&str] = &[
    "Account",
    "AllergyIntolerance",
    "Appointment",
    "AuditEvent",
    "Binary",
    "CarePlan",
    "CareTeam",
    "Claim",
    "Communication",
    "Composition",
    "Condition",
    "Consent",
    "Coverage",
    "Device",
    "DiagnosticReport",
    "DocumentReference",
    "Encounter",
    "ExplanationOfBenefit",
    "Group",
    "Immunization",
    "List",
    "Location",
    "Medication",
    "MedicationDispense",
    "MedicationRequest",
    "MedicationStatement",
    "Observation",
    "Organization",
    "Patient",
    "Person",
    "Practitioner",
    "PractitionerRole",
    "Procedure",
    "Provenance",
    "Questionnaire",
    "QuestionnaireResponse",
    "RelatedPerson",
    "ServiceRequest",
    "Task",
];

/// Function turning a raw document into a resource.
pub type ResourceDeserializer = fn(Document) -> Result<Resource>;

/// A coding within `meta.security` or `meta.tag`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Coding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// Resource metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Bson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security: Vec<Coding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<Coding>,
}

/// A FHIR resource read from storage.
///
/// Elements common to every resource are typed; everything else is kept in
/// `elements` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(flatten)]
    pub elements: Document,
}

impl Resource {
    /// Security tags with the given system, e.g. owner or access tags.
    pub fn security_codes<'a>(&'a self, system: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.meta
            .iter()
            .flat_map(|m| m.security.iter())
            .filter(move |c| c.system.as_deref() == Some(system))
            .filter_map(|c| c.code.as_deref())
    }

    /// Convert back to a document.
    pub fn to_document(&self) -> Result<Document> {
        bson::to_document(self).map_err(|e| DataLayerError::Generic(e.to_string()))
    }
}

fn deserialize_resource(document: Document) -> Result<Resource> {
    Ok(bson::from_document(document)?)
}

/// Registry of deserializers keyed by `(base_version, resource_type)`.
#[derive(Clone, Default)]
pub struct ResourceFactory {
    registry: HashMap<(String, String), ResourceDeserializer>,
}

impl ResourceFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with every R4 resource type registered
    pub fn with_fhir_r4() -> Self {
        let mut factory = Self::new();
        for resource_type in R4_RESOURCE_TYPES {
            factory.register(FHIR_R4, resource_type, deserialize_resource);
        }
        factory
    }

    /// Register a deserializer, replacing any previous one for the same key
    pub fn register(
        &mut self,
        base_version: &str,
        resource_type: &str,
        deserializer: ResourceDeserializer,
    ) -> &mut Self {
        self.registry.insert(
            (base_version.to_string(), resource_type.to_string()),
            deserializer,
        );
        self
    }

    /// Whether a deserializer exists for the pair
    pub fn contains(&self, base_version: &str, resource_type: &str) -> bool {
        self.registry
            .contains_key(&(base_version.to_string(), resource_type.to_string()))
    }

    /// Look up the deserializer for a version and resource type
    ///
    /// # Arguments
    /// * `base_version` - FHIR version, e.g. `4_0_0`
    /// * `resource_type` - Resource type, e.g. `Patient`
    ///
    /// # Returns
    /// * `Result<ResourceDeserializer>` - Deserializer or `UnknownResourceType`
    pub fn get_resource(&self, base_version: &str, resource_type: &str) -> Result<ResourceDeserializer> {
        self.registry
            .get(&(base_version.to_string(), resource_type.to_string()))
            .copied()
            .ok_or_else(|| DataLayerError::UnknownResourceType {
                base_version: base_version.to_string(),
                resource_type: resource_type.to_string(),
            })
    }

    /// Deserialize `document` as `resource_type`
    ///
    /// History entries (`{ id, resource, request }`) are unwrapped to the
    /// resource they carry. Documents without `resourceType` get it filled in.
    pub fn create(
        &self,
        base_version: &str,
        resource_type: &str,
        mut document: Document,
    ) -> Result<Resource> {
        let deserializer = self.get_resource(base_version, resource_type)?;
        if !document.contains_key("resourceType") {
            if let Ok(inner) = document.get_document_mut("resource") {
                document = std::mem::take(inner);
            }
        }
        if !document.contains_key("resourceType") {
            document.insert("resourceType", resource_type);
        }
        deserializer(document)
    }
}

impl fmt::Debug for ResourceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceFactory")
            .field("registered", &self.registry.len())
            .finish()
    }
}
