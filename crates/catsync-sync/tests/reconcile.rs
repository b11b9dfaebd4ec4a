use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use catsync_adapters::{AdapterError, CatalogFile, CodeHost, DiscoveryConfig};
use catsync_core::{
    ChildBlock, PropertyMap, PropertyValue, Repository, SchemaField, StoredRecord,
};
use catsync_storage::{FetchError, InMemoryStore, StoreCall, StoreError, WorkspaceStore};
use catsync_sync::links::{LINKS_TABLE, LINK_URL_FIELD};
use catsync_sync::{run_sync, FieldRegistry, SyncError, SyncSettings};

const TARGET: &str = "services";
const TEAMS: &str = "teams";

#[derive(Default)]
struct StaticHost {
    repositories: Vec<Repository>,
    files: Mutex<HashMap<String, String>>,
    reads: AtomicUsize,
}

impl StaticHost {
    fn with_repo(mut self, name: &str, catalog: Option<&str>) -> Self {
        self.repositories.push(Repository {
            name: name.to_string(),
            full_name: format!("acme/{name}"),
            html_url: format!("https://github.com/acme/{name}"),
            visibility: Some("internal".to_string()),
            language: Some("Rust".to_string()),
            description: None,
        });
        if let Some(catalog) = catalog {
            self.set_catalog(name, catalog);
        }
        self
    }

    fn set_catalog(&self, repo: &str, catalog: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(repo.to_string(), catalog.to_string());
    }
}

#[async_trait]
impl CodeHost for StaticHost {
    async fn list_repositories(
        &self,
        _owner: &str,
        _repository_type: &str,
    ) -> Result<Vec<Repository>, AdapterError> {
        Ok(self.repositories.clone())
    }

    async fn read_file(
        &self,
        repository: &Repository,
        path: &str,
    ) -> Result<Option<CatalogFile>, AdapterError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if path != "catalog-info.yaml" {
            return Ok(None);
        }
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(&repository.name)
            .map(|content| CatalogFile {
                path: path.to_string(),
                content: content.clone(),
                html_url: format!("{}/blob/main/{path}", repository.html_url),
            }))
    }
}

/// Store whose first child listing fails with a server error.
struct FlakyChildren {
    inner: InMemoryStore,
    failed_once: AtomicBool,
}

impl FlakyChildren {
    fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            failed_once: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl WorkspaceStore for FlakyChildren {
    async fn discover_schema(&self, database_id: &str) -> Result<Vec<SchemaField>, StoreError> {
        self.inner.discover_schema(database_id).await
    }

    async fn query_by_name(
        &self,
        database_id: &str,
        name: &str,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        self.inner.query_by_name(database_id, name).await
    }

    async fn list_records(&self, database_id: &str) -> Result<Vec<StoredRecord>, StoreError> {
        self.inner.list_records(database_id).await
    }

    async fn create_record(
        &self,
        database_id: &str,
        properties: &PropertyMap,
    ) -> Result<String, StoreError> {
        self.inner.create_record(database_id, properties).await
    }

    async fn update_record(
        &self,
        record_id: &str,
        properties: &PropertyMap,
    ) -> Result<(), StoreError> {
        self.inner.update_record(record_id, properties).await
    }

    async fn list_children(&self, record_id: &str) -> Result<Vec<ChildBlock>, StoreError> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(FetchError::HttpStatus {
                status: 502,
                url: format!("blocks/{record_id}/children"),
                message: "bad gateway".to_string(),
            }
            .into());
        }
        self.inner.list_children(record_id).await
    }

    async fn create_child_table(
        &self,
        record_id: &str,
        title: &str,
        columns: &[SchemaField],
    ) -> Result<String, StoreError> {
        self.inner.create_child_table(record_id, title, columns).await
    }
}

fn target_schema() -> Vec<SchemaField> {
    vec![
        SchemaField::new("Name", "title"),
        SchemaField::new("Description", "rich_text"),
        SchemaField::new("URL", "url"),
        SchemaField::new("Kind", "select"),
        SchemaField::new("Status", "select"),
        SchemaField::new("Tags", "multi_select"),
        SchemaField::new("Owner", "relation"),
        SchemaField::new("DependsOn", "relation"),
        SchemaField::new("DependencyOf", "relation"),
        SchemaField::new("Updated", "date"),
        SchemaField::new("Hash", "rich_text"),
    ]
}

fn settings(owner_database: Option<&str>) -> SyncSettings {
    SyncSettings {
        database_id: TARGET.to_string(),
        owner_database: owner_database.map(ToString::to_string),
        system_database: None,
        discovery: DiscoveryConfig::new("acme"),
    }
}

/// Target database plus a teams table with an `unknown` row and `team-a`.
fn workspace() -> (InMemoryStore, String, String) {
    let store = InMemoryStore::new();
    store.add_database(TARGET, target_schema());
    store.add_database(TEAMS, vec![SchemaField::new("Name", "title")]);
    let unknown = store.seed_named(TEAMS, "unknown");
    let team_a = store.seed_named(TEAMS, "team-a");
    (store, unknown, team_a)
}

const SVC_1: &str = "\
kind: Component
metadata:
  name: svc-1
spec:
  owner: team-a
  dependsOn: [svc-0]
";

#[tokio::test]
async fn new_service_resolves_owner_and_drops_missing_dependency() {
    let (store, _, team_a) = workspace();
    let host = Arc::new(StaticHost::default().with_repo("svc-1", Some(SVC_1)));

    let summary = run_sync(&store, host, &settings(Some(TEAMS)), &FieldRegistry::standard())
        .await
        .expect("sync");

    assert_eq!(summary.outcome.created, 1);
    assert_eq!(summary.outcome.errored, 0);
    let rows = store.records(TARGET);
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.title().as_deref(), Some("svc-1"));
    assert_eq!(row.properties["Owner"].relation_ids(), vec![team_a.as_str()]);
    assert_eq!(row.properties["DependsOn"], PropertyValue::Relation(Vec::new()));
    assert_eq!(row.properties["Kind"], PropertyValue::select("Component"));
    assert!(!row.properties.contains_key("DependencyOf"));
    assert_eq!(row.text("Hash").map(|h| h.len()), Some(64));
}

#[tokio::test]
async fn second_run_without_changes_writes_nothing() {
    let (store, _, _) = workspace();
    let host = Arc::new(
        StaticHost::default()
            .with_repo("svc-0", Some("kind: Component\nmetadata:\n  name: svc-0\n"))
            .with_repo("svc-1", Some(SVC_1))
            .with_repo("legacy", None),
    );
    let registry = FieldRegistry::standard();

    let first = run_sync(&store, host.clone(), &settings(Some(TEAMS)), &registry)
        .await
        .expect("first run");
    assert_eq!(first.outcome.created, 3);
    store.clear_calls();

    let second = run_sync(&store, host, &settings(Some(TEAMS)), &registry)
        .await
        .expect("second run");
    assert_eq!(second.outcome.skipped, 3);
    assert_eq!(second.outcome.created + second.outcome.updated, 0);
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn dependencies_created_earlier_in_the_run_are_linked() {
    let (store, _, _) = workspace();
    // Listed out of order; discovery sorts dependency-free services first.
    let host = Arc::new(
        StaticHost::default()
            .with_repo("svc-1", Some(SVC_1))
            .with_repo("svc-0", Some("kind: Component\nmetadata:\n  name: svc-0\n")),
    );

    run_sync(&store, host, &settings(Some(TEAMS)), &FieldRegistry::standard())
        .await
        .expect("sync");

    let rows = store.records(TARGET);
    let svc_0 = rows.iter().find(|r| r.title().as_deref() == Some("svc-0")).expect("svc-0");
    let svc_1 = rows.iter().find(|r| r.title().as_deref() == Some("svc-1")).expect("svc-1");
    assert_eq!(svc_1.properties["DependsOn"].relation_ids(), vec![svc_0.id.as_str()]);
}

#[tokio::test]
async fn unmatched_owner_falls_back_to_unknown_row() {
    let (store, unknown, _) = workspace();
    let host = Arc::new(StaticHost::default().with_repo(
        "svc-2",
        Some("kind: Component\nmetadata:\n  name: svc-2\nspec:\n  owner: team-z\n"),
    ));

    run_sync(&store, host, &settings(Some(TEAMS)), &FieldRegistry::standard())
        .await
        .expect("sync");

    let row = &store.records(TARGET)[0];
    assert_eq!(row.properties["Owner"].relation_ids(), vec![unknown.as_str()]);
}

#[tokio::test]
async fn owner_is_a_select_without_reference_table() {
    let (store, _, _) = workspace();
    let host = Arc::new(StaticHost::default().with_repo("svc-1", Some(SVC_1)));

    run_sync(&store, host, &settings(None), &FieldRegistry::standard())
        .await
        .expect("sync");

    let row = &store.records(TARGET)[0];
    assert_eq!(row.properties["Owner"], PropertyValue::select("team-a"));
}

#[tokio::test]
async fn reference_table_without_unknown_row_stops_the_run() {
    let store = InMemoryStore::new();
    store.add_database(TARGET, target_schema());
    store.add_database(TEAMS, vec![SchemaField::new("Name", "title")]);
    store.seed_named(TEAMS, "team-a");
    let host = Arc::new(StaticHost::default().with_repo("svc-1", Some(SVC_1)));

    let err = run_sync(&store, host.clone(), &settings(Some(TEAMS)), &FieldRegistry::standard())
        .await
        .expect_err("missing sentinel");

    assert!(matches!(err, SyncError::MissingSentinel { dimension: "owner", .. }));
    assert!(err.is_fatal());
    assert!(store.writes().is_empty());
    assert_eq!(host.reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn changed_links_converge_with_minimal_writes() {
    let (store, _, _) = workspace();
    let host = Arc::new(StaticHost::default().with_repo(
        "svc-1",
        Some("kind: Component\nmetadata:\n  name: svc-1\n  links:\n    A: https://one\n"),
    ));
    let registry = FieldRegistry::standard();

    run_sync(&store, host.clone(), &settings(None), &registry)
        .await
        .expect("first run");
    let parent = store.records(TARGET)[0].id.clone();
    let table = store
        .children(&parent)
        .into_iter()
        .find(|c| c.is_child_table(LINKS_TABLE))
        .expect("links table");
    assert_eq!(store.records(&table.id).len(), 1);

    host.set_catalog(
        "svc-1",
        "kind: Component\nmetadata:\n  name: svc-1\n  links:\n    A: https://two\n    B: https://three\n",
    );
    store.clear_calls();
    let second = run_sync(&store, host, &settings(None), &registry)
        .await
        .expect("second run");
    assert_eq!(second.outcome.updated, 1);

    let link_writes: Vec<StoreCall> = store
        .writes()
        .into_iter()
        .filter(|call| match call {
            StoreCall::CreateRecord { database_id, .. } => database_id == &table.id,
            StoreCall::UpdateRecord { record_id, .. } => record_id != &parent,
            StoreCall::CreateChildTable { .. } => true,
            _ => false,
        })
        .collect();
    assert_eq!(link_writes.len(), 2);

    let mut rows: Vec<(String, String)> = store
        .records(&table.id)
        .into_iter()
        .map(|r| {
            (
                r.title().unwrap_or_default(),
                r.url(LINK_URL_FIELD).unwrap_or_default().to_string(),
            )
        })
        .collect();
    rows.sort();
    assert_eq!(
        rows,
        vec![
            ("A".to_string(), "https://two".to_string()),
            ("B".to_string(), "https://three".to_string()),
        ]
    );
}

#[tokio::test]
async fn one_failing_record_does_not_stop_the_batch() {
    let (store, _, _) = workspace();
    store.fail_writes_titled("svc-b");
    let host = Arc::new(
        StaticHost::default()
            .with_repo("svc-a", Some("kind: Component\nmetadata:\n  name: svc-a\n"))
            .with_repo("svc-b", Some("kind: Component\nmetadata:\n  name: svc-b\n"))
            .with_repo("svc-c", Some("kind: Component\nmetadata:\n  name: svc-c\n")),
    );

    let summary = run_sync(&store, host, &settings(None), &FieldRegistry::standard())
        .await
        .expect("sync");

    assert_eq!(summary.outcome.created, 2);
    assert_eq!(summary.outcome.errored, 1);
    assert_eq!(summary.outcome.failures[0].identity, "svc-b");
}

#[tokio::test]
async fn malformed_catalog_files_count_as_errors() {
    let (store, _, _) = workspace();
    let host = Arc::new(
        StaticHost::default()
            .with_repo("svc-a", Some("kind: Component\nmetadata:\n  name: svc-a\n"))
            .with_repo("broken", Some("kind: [unterminated\n")),
    );

    let summary = run_sync(&store, host, &settings(None), &FieldRegistry::standard())
        .await
        .expect("sync");

    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.outcome.created, 1);
    assert_eq!(summary.outcome.errored, 1);
    assert!(summary.outcome.failures[0].identity.starts_with("broken:"));
}

#[tokio::test]
async fn missing_catalog_becomes_placeholder_record() {
    let (store, _, _) = workspace();
    let host = Arc::new(StaticHost::default().with_repo("legacy", None));

    run_sync(&store, host, &settings(None), &FieldRegistry::standard())
        .await
        .expect("sync");

    let row = &store.records(TARGET)[0];
    assert_eq!(row.title().as_deref(), Some("legacy"));
    assert_eq!(
        row.properties["Status"],
        PropertyValue::select("catalog-info.yaml missing")
    );
    assert_eq!(row.properties["Kind"], PropertyValue::select("Unknown"));
}

#[tokio::test]
async fn links_are_retried_after_a_failed_table_listing() {
    let (inner, _, _) = workspace();
    let store = FlakyChildren::new(inner);
    let host = Arc::new(StaticHost::default().with_repo(
        "svc-1",
        Some("kind: Component\nmetadata:\n  name: svc-1\n  links:\n    Docs: https://docs\n"),
    ));
    let registry = FieldRegistry::standard();

    let first = run_sync(&store, host.clone(), &settings(None), &registry)
        .await
        .expect("first run");
    assert_eq!((first.outcome.created, first.outcome.errored), (0, 1));
    let parent = store.inner.records(TARGET)[0].id.clone();
    assert!(store.inner.children(&parent).is_empty());

    let second = run_sync(&store, host.clone(), &settings(None), &registry)
        .await
        .expect("second run");
    assert_eq!((second.outcome.updated, second.outcome.errored), (1, 0));
    let table = store
        .inner
        .children(&parent)
        .into_iter()
        .find(|c| c.is_child_table(LINKS_TABLE))
        .expect("links table");
    assert_eq!(store.inner.records(&table.id).len(), 1);
    assert_eq!(
        store.inner.records(TARGET)[0].text("Hash").map(|h| h.len()),
        Some(64)
    );

    store.inner.clear_calls();
    let third = run_sync(&store, host, &settings(None), &registry)
        .await
        .expect("third run");
    assert_eq!(third.outcome.skipped, 1);
    assert!(store.inner.writes().is_empty());
}
