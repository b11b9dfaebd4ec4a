//! Per-record reconciliation against the target database.

use std::collections::HashMap;
use std::fmt;

use catsync_core::{PropertyMap, PropertyValue, SchemaField, SourceRecord, StoredRecord};
use catsync_storage::store::TITLE_PROPERTY;
use catsync_storage::{StoreError, WorkspaceStore};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::fingerprint::{fingerprint, should_write};
use crate::links::ensure_links;
use crate::mapping::{map_properties, FieldRegistry, MappingContext, HASH_FIELD};
use crate::resolve::{resolve_depends_on, ReferenceTables};
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingRecord {
    pub record_id: String,
    pub content_hash: Option<String>,
}

/// Target rows keyed by their title, loaded once before a run.
#[derive(Debug, Clone, Default)]
pub struct ExistingRecordIndex {
    entries: HashMap<String, ExistingRecord>,
}

impl ExistingRecordIndex {
    /// The first row seen for a title wins.
    pub fn from_records(records: Vec<StoredRecord>) -> Self {
        let mut entries = HashMap::new();
        for record in records {
            let Some(title) = record.text(TITLE_PROPERTY).filter(|t| !t.is_empty()) else {
                continue;
            };
            let content_hash = record.text(HASH_FIELD).filter(|h| !h.is_empty());
            entries.entry(title).or_insert(ExistingRecord {
                record_id: record.id,
                content_hash,
            });
        }
        Self { entries }
    }

    pub async fn load<S>(store: &S, database_id: &str) -> Result<Self, StoreError>
    where
        S: WorkspaceStore + ?Sized,
    {
        let index = Self::from_records(store.list_records(database_id).await?);
        info!(database_id, rows = index.len(), "indexed existing records");
        Ok(index)
    }

    pub fn get(&self, identity: &str) -> Option<&ExistingRecord> {
        self.entries.get(identity)
    }

    pub fn insert(&mut self, identity: impl Into<String>, record: ExistingRecord) {
        self.entries.insert(identity.into(), record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Created,
    Updated,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub identity: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errored: usize,
    pub failures: Vec<RecordFailure>,
}

impl ReconcileSummary {
    pub fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Created => self.created += 1,
            RecordOutcome::Updated => self.updated += 1,
            RecordOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn record_failure(&mut self, identity: impl Into<String>, message: impl Into<String>) {
        self.errored += 1;
        self.failures.push(RecordFailure {
            identity: identity.into(),
            message: message.into(),
        });
    }

    pub fn merge(&mut self, other: ReconcileSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errored += other.errored;
        self.failures.extend(other.failures);
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.skipped + self.errored
    }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} skipped={} errored={}",
            self.created, self.updated, self.skipped, self.errored
        )
    }
}

pub struct Reconciler<'a, S: WorkspaceStore + ?Sized> {
    store: &'a S,
    database_id: String,
    schema: Vec<SchemaField>,
    registry: &'a FieldRegistry,
    references: &'a ReferenceTables,
    index: ExistingRecordIndex,
    writes_hash: bool,
}

impl<'a, S: WorkspaceStore + ?Sized> Reconciler<'a, S> {
    pub fn new(
        store: &'a S,
        database_id: impl Into<String>,
        schema: Vec<SchemaField>,
        registry: &'a FieldRegistry,
        references: &'a ReferenceTables,
        index: ExistingRecordIndex,
    ) -> Self {
        let writes_hash = schema.iter().any(|field| field.name == HASH_FIELD);
        Self {
            store,
            database_id: database_id.into(),
            schema,
            registry,
            references,
            index,
            writes_hash,
        }
    }

    /// Discover the target schema and index its rows.
    pub async fn prepare(
        store: &'a S,
        database_id: &str,
        registry: &'a FieldRegistry,
        references: &'a ReferenceTables,
    ) -> Result<Self, SyncError> {
        let schema = store.discover_schema(database_id).await?;
        if !schema.iter().any(|field| field.name == HASH_FIELD) {
            warn!(
                database_id,
                "target database has no Hash field; every record will be rewritten"
            );
        }
        let index = ExistingRecordIndex::load(store, database_id).await?;
        Ok(Self::new(store, database_id, schema, registry, references, index))
    }

    /// Reconcile records one at a time in the given order.
    ///
    /// A failing record is logged and counted; the rest of the batch still runs.
    pub async fn reconcile_all(&mut self, records: &[SourceRecord]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for record in records {
            let identity = record.identity().to_string();
            let span = info_span!("reconcile_record", identity = %identity);
            match self.reconcile(record).instrument(span).await {
                Ok(outcome) => summary.record(outcome),
                Err(err) => {
                    error!(identity = %identity, error = %err, "failed to reconcile record");
                    summary.record_failure(identity, err.to_string());
                }
            }
        }
        summary
    }

    pub async fn reconcile(&mut self, record: &SourceRecord) -> Result<RecordOutcome, SyncError> {
        let identity = record.identity();
        let existing = self.index.get(identity).cloned();

        let depends_on =
            resolve_depends_on(self.store, &self.database_id, record.depends_on()).await?;
        let ctx = MappingContext {
            owners: self.references.owners.as_ref(),
            systems: self.references.systems.as_ref(),
            depends_on: &depends_on,
            now: Utc::now(),
        };
        let mut properties = map_properties(self.registry, &self.schema, record, &ctx);
        let hash = fingerprint(&properties, record.links())?;
        let links = record.links().filter(|links| !links.is_empty());
        // With links to sync, the hash is stored only once they are all in place.
        let deferred = self.writes_hash && links.is_some();
        if self.writes_hash {
            let stored = if deferred { "" } else { hash.as_str() };
            properties.insert(HASH_FIELD.to_string(), PropertyValue::rich_text(stored));
        }

        let (record_id, outcome) = match existing {
            None => {
                let record_id = self
                    .store
                    .create_record(&self.database_id, &properties)
                    .await?;
                info!(record_id = %record_id, "created record");
                (record_id, RecordOutcome::Created)
            }
            Some(existing) => {
                if !should_write(&hash, existing.content_hash.as_deref()) {
                    debug!(record_id = %existing.record_id, "record unchanged");
                    return Ok(RecordOutcome::Skipped);
                }
                self.store
                    .update_record(&existing.record_id, &properties)
                    .await?;
                info!(record_id = %existing.record_id, "updated record");
                (existing.record_id, RecordOutcome::Updated)
            }
        };

        self.index.insert(
            identity,
            ExistingRecord {
                record_id: record_id.clone(),
                content_hash: (self.writes_hash && !deferred).then(|| hash.clone()),
            },
        );

        if let Some(links) = links {
            let report = ensure_links(self.store, &record_id, links).await?;
            if report.failed > 0 {
                return Err(SyncError::Links {
                    failed: report.failed,
                });
            }
            if deferred {
                let mut stamp = PropertyMap::new();
                stamp.insert(HASH_FIELD.to_string(), PropertyValue::rich_text(&hash));
                self.store.update_record(&record_id, &stamp).await?;
                self.index.insert(
                    identity,
                    ExistingRecord {
                        record_id,
                        content_hash: Some(hash),
                    },
                );
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use catsync_core::{CatalogMetadata, LinkSpec, LinkTarget, Repository};
    use catsync_storage::{InMemoryStore, StoreCall};

    fn stored(id: &str, name: &str, hash: Option<&str>) -> StoredRecord {
        let mut properties = PropertyMap::new();
        properties.insert("Name".into(), PropertyValue::title(name));
        if let Some(hash) = hash {
            properties.insert(HASH_FIELD.into(), PropertyValue::rich_text(hash));
        }
        StoredRecord {
            id: id.to_string(),
            properties,
        }
    }

    fn source(repo: &str, name: Option<&str>) -> SourceRecord {
        let mut record = SourceRecord::missing(
            Repository {
                name: repo.to_string(),
                full_name: format!("acme/{repo}"),
                html_url: format!("https://github.com/acme/{repo}"),
                visibility: None,
                language: None,
                description: None,
            },
            "OK",
        );
        record.metadata = name.map(|n| CatalogMetadata {
            name: Some(n.to_string()),
            ..Default::default()
        });
        record
    }

    fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.add_database(
            "services",
            vec![
                SchemaField::new("Name", "title"),
                SchemaField::new("Kind", "select"),
                SchemaField::new(HASH_FIELD, "rich_text"),
            ],
        );
        store
    }

    #[test]
    fn index_keeps_first_duplicate_and_ignores_blank_titles() {
        let index = ExistingRecordIndex::from_records(vec![
            stored("a", "svc-1", Some("h1")),
            stored("b", "svc-1", None),
            stored("c", "", None),
        ]);
        assert_eq!(index.len(), 1);
        assert_eq!(
            index.get("svc-1"),
            Some(&ExistingRecord {
                record_id: "a".to_string(),
                content_hash: Some("h1".to_string()),
            })
        );
    }

    #[test]
    fn summaries_merge_and_display() {
        let mut total = ReconcileSummary::default();
        total.record(RecordOutcome::Created);
        let mut other = ReconcileSummary::default();
        other.record(RecordOutcome::Skipped);
        other.record_failure("svc-9", "boom");
        total.merge(other);

        assert_eq!(total.total(), 3);
        assert_eq!(total.failures.len(), 1);
        assert_eq!(total.to_string(), "created=1 updated=0 skipped=1 errored=1");
    }

    #[tokio::test]
    async fn duplicate_identities_in_one_run_do_not_duplicate_rows() {
        let store = store();
        let registry = FieldRegistry::standard();
        let references = ReferenceTables::default();
        let mut reconciler = Reconciler::prepare(&store, "services", &registry, &references)
            .await
            .expect("prepare");

        let mut second = source("svc-1-fork", Some("svc-1"));
        second.kind = Some("Library".to_string());
        let summary = reconciler
            .reconcile_all(&[source("svc-1", None), second])
            .await;

        assert_eq!((summary.created, summary.updated), (1, 1));
        assert_eq!(store.records("services").len(), 1);
    }

    #[tokio::test]
    async fn missing_hash_field_rewrites_every_run() {
        let store = InMemoryStore::new();
        store.add_database("services", vec![SchemaField::new("Name", "title")]);
        let registry = FieldRegistry::standard();
        let references = ReferenceTables::default();
        let records = [source("svc-1", None)];

        for expected in [RecordOutcome::Created, RecordOutcome::Updated] {
            let mut reconciler = Reconciler::prepare(&store, "services", &registry, &references)
                .await
                .expect("prepare");
            assert_eq!(reconciler.reconcile(&records[0]).await.expect("reconcile"), expected);
        }
        let record = &store.records("services")[0];
        assert!(!record.properties.contains_key(HASH_FIELD));
    }

    #[tokio::test]
    async fn failures_are_isolated_per_record() {
        let store = store();
        store.fail_writes_titled("svc-2");
        let registry = FieldRegistry::standard();
        let references = ReferenceTables::default();
        let mut reconciler = Reconciler::prepare(&store, "services", &registry, &references)
            .await
            .expect("prepare");

        let summary = reconciler
            .reconcile_all(&[source("svc-1", None), source("svc-2", None), source("svc-3", None)])
            .await;
        assert_eq!((summary.created, summary.errored), (2, 1));
        assert_eq!(summary.failures[0].identity, "svc-2");
        assert_eq!(store.records("services").len(), 2);
    }

    #[tokio::test]
    async fn hash_is_stored_only_after_every_link_syncs() {
        let store = store();
        store.fail_writes_titled("Runbook");
        let registry = FieldRegistry::standard();
        let references = ReferenceTables::default();
        let mut record = source("svc-1", None);
        record.metadata = Some(CatalogMetadata {
            name: Some("svc-1".to_string()),
            links: Some(LinkSpec::Map(BTreeMap::from([
                ("Docs".to_string(), LinkTarget::Url("https://docs".to_string())),
                ("Runbook".to_string(), LinkTarget::Url("https://runbook".to_string())),
            ]))),
            ..Default::default()
        });

        let mut reconciler = Reconciler::prepare(&store, "services", &registry, &references)
            .await
            .expect("prepare");
        let err = reconciler.reconcile(&record).await.expect_err("link failure");
        assert!(matches!(err, SyncError::Links { failed: 1 }));
        let row = &store.records("services")[0];
        assert_eq!(row.text(HASH_FIELD).filter(|h| !h.is_empty()), None);

        // The next run does not skip the row, so the failed link is retried.
        let mut reconciler = Reconciler::prepare(&store, "services", &registry, &references)
            .await
            .expect("prepare");
        store.clear_calls();
        assert!(reconciler.reconcile(&record).await.is_err());
        assert!(store.writes().iter().any(|call| matches!(
            call,
            StoreCall::UpdateRecord { record_id, .. } if record_id == &row.id
        )));
    }
}
