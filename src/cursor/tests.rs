use super::*;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use bson::doc;

use crate::error::DataLayerError;
use crate::resource::{FHIR_R4, ResourceFactory};

type CallLog = Arc<Mutex<Vec<String>>>;

/// In-memory partition cursor that records every call made on it.
struct MockCursor {
    db: String,
    collection: String,
    documents: VecDeque<Document>,
    mappers: Vec<DocumentMapper>,
    log: CallLog,
    fail_has_next: bool,
    fail_to_array: bool,
    delay: Option<Duration>,
}

impl MockCursor {
    fn new(collection: &str, ids: &[&str], log: &CallLog) -> Self {
        Self {
            db: "fhir".to_string(),
            collection: collection.to_string(),
            documents: ids
                .iter()
                .map(|id| doc! { "resourceType": "Patient", "id": *id })
                .collect(),
            mappers: Vec::new(),
            log: Arc::clone(log),
            fail_has_next: false,
            fail_to_array: false,
            delay: None,
        }
    }

    fn failing_has_next(mut self) -> Self {
        self.fail_has_next = true;
        self
    }

    fn failing_to_array(mut self) -> Self {
        self.fail_to_array = true;
        self
    }

    fn delayed(mut self, millis: u64) -> Self {
        self.delay = Some(Duration::from_millis(millis));
        self
    }

    fn record(&self, call: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}.{}", self.collection, call));
    }

    fn mapped(&self, document: Document) -> Document {
        self.mappers.iter().fold(document, |d, m| m(d))
    }
}

#[async_trait]
impl PartitionCursor for MockCursor {
    async fn has_next(&mut self) -> Result<bool> {
        self.record("has_next");
        if self.fail_has_next {
            return Err(DataLayerError::Generic("connection reset".to_string()));
        }
        Ok(!self.documents.is_empty())
    }

    async fn next(&mut self) -> Result<Option<Document>> {
        self.record("next");
        let document = self.documents.pop_front();
        Ok(document.map(|d| self.mapped(d)))
    }

    async fn to_array(&mut self) -> Result<Vec<Document>> {
        self.record("to_array");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_to_array {
            return Err(DataLayerError::Generic("operation exceeded time limit".to_string()));
        }
        let documents: Vec<Document> = self.documents.drain(..).collect();
        Ok(documents.into_iter().map(|d| self.mapped(d)).collect())
    }

    async fn explain(&mut self, verbosity: ExplainVerbosity) -> Result<Document> {
        self.record("explain");
        Ok(doc! { "collection": self.collection.as_str(), "verbosity": verbosity.as_str() })
    }

    fn project(&mut self, _projection: Document) {
        self.record("project");
    }

    fn map(&mut self, mapping: DocumentMapper) {
        self.record("map");
        self.mappers.push(mapping);
    }

    fn sort(&mut self, _sort: Document) {
        self.record("sort");
    }

    fn batch_size(&mut self, _size: u32) {
        self.record("batch_size");
    }

    fn hint(&mut self, _hint: IndexHint) {
        self.record("hint");
    }

    fn limit(&mut self, count: i64) {
        self.record("limit");
        self.documents.truncate(count.max(0) as usize);
    }

    fn max_time_ms(&mut self, _millis: u64) {
        self.record("max_time_ms");
    }

    fn namespace(&self) -> Namespace {
        Namespace::new(self.db.as_str(), self.collection.as_str())
    }
}

fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn partitioned(resource_type: &str, partitions: Vec<MockCursor>) -> PartitionedCursor {
    PartitionedCursor::new(PartitionedCursorOptions {
        base_version: FHIR_R4.to_string(),
        resource_type: resource_type.to_string(),
        cursors: partitions
            .into_iter()
            .map(|c| CursorInfo::new(Box::new(c)))
            .collect(),
        query: doc! { "gender": "female" },
        factory: Arc::new(ResourceFactory::with_fhir_r4()),
    })
    .unwrap()
}

async fn drain_ids(cursor: &mut PartitionedCursor) -> Vec<String> {
    let mut ids = Vec::new();
    while cursor.has_next().await.unwrap() {
        let resource = cursor.next().await.unwrap().unwrap();
        ids.push(resource.id.unwrap());
    }
    ids
}

#[test]
fn test_construction_rejects_empty_base_version() {
    let result = PartitionedCursor::new(PartitionedCursorOptions {
        base_version: String::new(),
        resource_type: "Patient".to_string(),
        cursors: Vec::new(),
        query: doc! {},
        factory: Arc::new(ResourceFactory::new()),
    });
    assert!(matches!(
        result,
        Err(DataLayerError::Validation(ValidationError::Empty("base_version")))
    ));
}

#[test]
fn test_construction_rejects_empty_resource_type() {
    let result = PartitionedCursor::new(PartitionedCursorOptions {
        base_version: FHIR_R4.to_string(),
        resource_type: String::new(),
        cursors: Vec::new(),
        query: doc! {},
        factory: Arc::new(ResourceFactory::new()),
    });
    assert!(matches!(
        result,
        Err(DataLayerError::Validation(ValidationError::Empty("resource_type")))
    ));
}

#[test]
fn test_cursor_info_takes_namespace_from_cursor() {
    let log = new_log();
    let info = CursorInfo::new(Box::new(MockCursor::new("Patient_4_0_0", &[], &log)));
    assert_eq!(info.db, "fhir");
    assert_eq!(info.collection, "Patient_4_0_0");

    let info = CursorInfo::with_namespace(
        "archive",
        "Patient_4_0_0_2023",
        Box::new(MockCursor::new("x", &[], &log)),
    );
    assert_eq!(info.db, "archive");
    assert_eq!(info.collection, "Patient_4_0_0_2023");
}

#[tokio::test]
async fn test_partition_major_ordering() {
    let log = new_log();
    let mut cursor = partitioned(
        "Patient",
        vec![
            MockCursor::new("P0", &["a", "b", "c"], &log),
            MockCursor::new("P1", &["d"], &log),
            MockCursor::new("P2", &["e", "f"], &log),
        ],
    );

    let ids = drain_ids(&mut cursor).await;
    assert_eq!(ids, vec!["a", "b", "c", "d", "e", "f"]);
}

#[tokio::test]
async fn test_exhausted_partition_is_never_queried_again() {
    let log = new_log();
    let mut cursor = partitioned(
        "Patient",
        vec![
            MockCursor::new("P0", &["a"], &log),
            MockCursor::new("P1", &["b"], &log),
        ],
    );

    drain_ids(&mut cursor).await;
    assert!(!cursor.has_next().await.unwrap());

    let p0_calls: Vec<String> = calls(&log)
        .into_iter()
        .filter(|c| c.starts_with("P0."))
        .collect();
    // has_next -> true, next, has_next -> false, then nothing
    assert_eq!(p0_calls, vec!["P0.has_next", "P0.next", "P0.has_next"]);
}

#[tokio::test]
async fn test_exhausted_cursor_is_terminal() {
    let log = new_log();
    let mut cursor = partitioned("Patient", vec![MockCursor::new("P0", &["a"], &log)]);
    drain_ids(&mut cursor).await;

    for _ in 0..3 {
        assert!(!cursor.has_next().await.unwrap());
        assert!(cursor.next().await.unwrap().is_none());
    }
    assert!(cursor.is_empty());
}

#[tokio::test]
async fn test_next_on_drained_head_is_an_assertion() {
    let log = new_log();
    let mut cursor = partitioned(
        "Patient",
        vec![
            MockCursor::new("P0", &[], &log),
            MockCursor::new("P1", &["b"], &log),
        ],
    );

    let err = cursor.next().await.unwrap_err();
    match err {
        DataLayerError::Rethrown(rethrown) => {
            assert!(matches!(
                rethrown.root_cause(),
                DataLayerError::AssertionFailed(_)
            ));
            assert_eq!(rethrown.collections, vec!["P0", "P1"]);
        }
        other => panic!("expected rethrown assertion, got {other}"),
    }

    // the empty head was discarded
    assert_eq!(cursor.all_collections(), vec!["P1"]);
    assert!(cursor.has_next().await.unwrap());
    let resource = cursor.next().await.unwrap().unwrap();
    assert_eq!(resource.id.as_deref(), Some("b"));
}

#[tokio::test]
async fn test_shaping_reaches_every_partition_in_order() {
    let log = new_log();
    let mut cursor = partitioned(
        "Patient",
        vec![
            MockCursor::new("P0", &["a"], &log),
            MockCursor::new("P1", &["b"], &log),
            MockCursor::new("P2", &["c"], &log),
        ],
    );

    cursor.sort(doc! { "id": 1 }).limit(5);

    for partition in ["P0", "P1", "P2"] {
        let partition_calls: Vec<String> = calls(&log)
            .into_iter()
            .filter(|c| c.starts_with(&format!("{partition}.")))
            .collect();
        assert_eq!(
            partition_calls,
            vec![format!("{partition}.sort"), format!("{partition}.limit")]
        );
    }
    assert_eq!(cursor.limit_value(), Some(5));
}

#[tokio::test]
async fn test_every_shaping_operation_chains() {
    let log = new_log();
    let mut cursor = partitioned("Patient", vec![MockCursor::new("P0", &["a"], &log)]);

    cursor
        .max_time_ms(1000)
        .project(doc! { "id": 1 })
        .map(Arc::new(|d: Document| d))
        .sort(doc! { "id": -1 })
        .batch_size(50)
        .hint(IndexHint::Name("id_1".to_string()))
        .limit(10);

    assert_eq!(
        calls(&log),
        vec![
            "P0.max_time_ms",
            "P0.project",
            "P0.map",
            "P0.sort",
            "P0.batch_size",
            "P0.hint",
            "P0.limit"
        ]
    );
}

#[tokio::test]
async fn test_empty_construction() {
    let mut cursor = partitioned("Patient", Vec::new());

    assert!(!cursor.has_next().await.unwrap());
    assert!(cursor.next().await.unwrap().is_none());
    assert!(cursor.to_array().await.unwrap().is_empty());
    assert!(cursor.explain().await.unwrap().is_empty());
    assert_eq!(cursor.first_collection(), "");
    assert_eq!(cursor.first_database(), "");
    assert!(cursor.all_collections().is_empty());
}

#[tokio::test]
async fn test_to_array_keeps_partition_order() {
    let log = new_log();
    // P0 resolves last
    let mut cursor = partitioned(
        "Patient",
        vec![
            MockCursor::new("P0", &["a", "b"], &log).delayed(50),
            MockCursor::new("P1", &["c"], &log),
        ],
    );

    let documents = cursor.to_array().await.unwrap();
    let ids: Vec<&str> = documents.iter().map(|d| d.get_str("id").unwrap()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_to_array_fans_out_concurrently() {
    let log = new_log();
    let mut cursor = partitioned(
        "Patient",
        vec![
            MockCursor::new("P0", &["a"], &log).delayed(200),
            MockCursor::new("P1", &["b"], &log).delayed(200),
            MockCursor::new("P2", &["c"], &log).delayed(200),
        ],
    );

    let start = tokio::time::Instant::now();
    let documents = cursor.to_array().await.unwrap();
    assert_eq!(documents.len(), 3);
    assert!(start.elapsed() < Duration::from_millis(600));
}

#[tokio::test]
async fn test_to_array_fails_as_a_whole() {
    let log = new_log();
    let mut cursor = partitioned(
        "Patient",
        vec![
            MockCursor::new("P0", &["a"], &log),
            MockCursor::new("P1", &["b"], &log).failing_to_array(),
        ],
    );

    let err = cursor.to_array().await.unwrap_err();
    assert!(matches!(err, DataLayerError::Rethrown(_)));
    assert!(err.to_string().contains("operation exceeded time limit"));
}

#[tokio::test]
async fn test_to_object_array_builds_resources() {
    let log = new_log();
    let mut cursor = partitioned(
        "Patient",
        vec![
            MockCursor::new("P0", &["a"], &log),
            MockCursor::new("P1", &["b"], &log),
        ],
    );

    let resources = cursor.to_object_array().await.unwrap();
    let ids: Vec<&str> = resources.iter().filter_map(|r| r.id.as_deref()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(resources.iter().all(|r| r.resource_type == "Patient"));
}

#[tokio::test]
async fn test_has_next_error_carries_context() {
    let log = new_log();
    let mut cursor = partitioned(
        "Patient",
        vec![
            MockCursor::new("P0", &["a"], &log).failing_has_next(),
            MockCursor::new("P1", &["b"], &log),
        ],
    );

    let err = cursor.has_next().await.unwrap_err();
    let DataLayerError::Rethrown(rethrown) = err else {
        panic!("expected a rethrown error");
    };
    assert_eq!(rethrown.collections, vec!["P0", "P1"]);
    assert_eq!(rethrown.databases, vec!["fhir", "fhir"]);
    assert_eq!(rethrown.query, doc! { "gender": "female" });
    assert_eq!(rethrown.source.to_string(), "connection reset");
}

#[tokio::test]
async fn test_clear_detaches_without_draining() {
    let log = new_log();
    let mut cursor = partitioned(
        "Patient",
        vec![
            MockCursor::new("P0", &["a"], &log),
            MockCursor::new("P1", &["b"], &log),
        ],
    );

    cursor.clear();

    assert!(!cursor.has_next().await.unwrap());
    assert!(cursor.next().await.unwrap().is_none());
    // no partition was consulted after clear
    assert!(calls(&log).is_empty());
}

#[tokio::test]
async fn test_explain_uses_first_partition_only() {
    let log = new_log();
    let mut cursor = partitioned(
        "Patient",
        vec![
            MockCursor::new("P0", &["a"], &log),
            MockCursor::new("P1", &["b"], &log),
        ],
    );

    let plans = cursor.explain().await.unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].get_str("collection").unwrap(), "P0");
    assert_eq!(plans[0].get_str("verbosity").unwrap(), "allPlansExecution");
    assert_eq!(calls(&log), vec!["P0.explain"]);
}

#[tokio::test]
async fn test_explain_audit_event_uses_query_planner() {
    let log = new_log();
    let mut cursor = partitioned("AuditEvent", vec![MockCursor::new("A0", &["a"], &log)]);

    let plans = cursor.explain().await.unwrap();
    assert_eq!(plans[0].get_str("verbosity").unwrap(), "queryPlanner");
}

#[tokio::test]
async fn test_map_transforms_documents() {
    let log = new_log();
    let mut cursor = partitioned("Patient", vec![MockCursor::new("P0", &["a"], &log)]);

    cursor.map(Arc::new(|mut d: Document| {
        d.insert("active", true);
        d
    }));

    assert!(cursor.has_next().await.unwrap());
    let resource = cursor.next().await.unwrap().unwrap();
    assert!(resource.elements.get_bool("active").unwrap());
}

#[tokio::test]
async fn test_next_document_fills_missing_resource_type() {
    let log = new_log();
    let mut cursor = partitioned("Patient", vec![MockCursor::new("P0", &["a", "b"], &log)]);

    cursor.map(Arc::new(|mut d: Document| {
        d.remove("resourceType");
        if d.get_str("id").ok() == Some("b") {
            d = doc! { "id": "b", "resource": { "id": "b" } };
        }
        d
    }));

    assert!(cursor.has_next().await.unwrap());
    let projected = cursor.next_document().await.unwrap().unwrap();
    assert_eq!(projected, doc! { "id": "a", "resourceType": "Patient" });

    assert!(cursor.has_next().await.unwrap());
    let history = cursor.next_document().await.unwrap().unwrap();
    assert!(!history.contains_key("resourceType"));
}

#[tokio::test]
async fn test_unknown_resource_type_is_wrapped() {
    let log = new_log();
    let mut cursor = partitioned("Unregistered", vec![MockCursor::new("U0", &["a"], &log)]);

    assert!(cursor.has_next().await.unwrap());
    let err = cursor.next().await.unwrap_err();
    let DataLayerError::Rethrown(rethrown) = err else {
        panic!("expected a rethrown error");
    };
    assert!(matches!(
        rethrown.root_cause(),
        DataLayerError::UnknownResourceType { .. }
    ));
}

#[tokio::test]
async fn test_accessors_follow_remaining_partitions() {
    let log = new_log();
    let mut cursor = partitioned(
        "Patient",
        vec![
            MockCursor::new("P0", &["a"], &log),
            MockCursor::new("P1", &["b"], &log),
        ],
    );

    assert_eq!(cursor.first_collection(), "P0");
    assert_eq!(cursor.first_database(), "fhir");
    assert_eq!(cursor.len(), 2);
    assert_eq!(cursor.query(), &doc! { "gender": "female" });

    assert!(cursor.has_next().await.unwrap());
    cursor.next().await.unwrap();
    assert!(cursor.has_next().await.unwrap());

    assert_eq!(cursor.first_collection(), "P1");
    assert_eq!(cursor.all_collections(), vec!["P1"]);
    assert_eq!(cursor.all_databases(), vec!["fhir"]);
}

#[test]
fn test_explain_verbosity_names() {
    assert_eq!(ExplainVerbosity::QueryPlanner.as_str(), "queryPlanner");
    assert_eq!(
        ExplainVerbosity::parse("executionStats").unwrap(),
        ExplainVerbosity::ExecutionStats
    );
    assert!(ExplainVerbosity::parse("verbose").is_err());
}
