//! In-memory [`WorkspaceStore`] for tests and dry runs.
//!
//! Databases, rows and child blocks live behind a `std::sync::RwLock`.
//! Every call is appended to a call log so tests can assert on exactly
//! which reads and writes a sync performed.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use catsync_core::{ChildBlock, PropertyMap, PropertyValue, SchemaField, StoredRecord};

use crate::store::{StoreError, WorkspaceStore, TITLE_PROPERTY};
use crate::FetchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    DiscoverSchema {
        database_id: String,
    },
    QueryByName {
        database_id: String,
        name: String,
    },
    ListRecords {
        database_id: String,
    },
    CreateRecord {
        database_id: String,
        record_id: String,
        properties: PropertyMap,
    },
    UpdateRecord {
        record_id: String,
        properties: PropertyMap,
    },
    ListChildren {
        record_id: String,
    },
    CreateChildTable {
        record_id: String,
        table_id: String,
        title: String,
    },
}

impl StoreCall {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StoreCall::CreateRecord { .. }
                | StoreCall::UpdateRecord { .. }
                | StoreCall::CreateChildTable { .. }
        )
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    schemas: HashMap<String, Vec<SchemaField>>,
    rows: HashMap<String, Vec<StoredRecord>>,
    children: HashMap<String, Vec<ChildBlock>>,
    failing_titles: HashSet<String>,
    next_id: u64,
    calls: Vec<StoreCall>,
}

impl MemoryState {
    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn rows_of(&self, database_id: &str) -> Result<&Vec<StoredRecord>, StoreError> {
        self.rows
            .get(database_id)
            .ok_or_else(|| StoreError::NotFound(format!("database {database_id}")))
    }

    fn check_failure(&self, properties: &PropertyMap) -> Result<(), StoreError> {
        let title = properties
            .values()
            .find(|p| matches!(p, PropertyValue::Title(_)))
            .and_then(PropertyValue::plain_text);
        match title {
            Some(title) if self.failing_titles.contains(&title) => {
                Err(StoreError::Fetch(FetchError::HttpStatus {
                    status: 500,
                    url: "memory://pages".to_string(),
                    message: format!("injected failure for {title}"),
                }))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an empty database with the given columns.
    pub fn add_database(&self, database_id: &str, schema: Vec<SchemaField>) {
        let mut state = self.write();
        state.schemas.insert(database_id.to_string(), schema);
        state.rows.entry(database_id.to_string()).or_default();
    }

    /// Seed a row without logging a call; returns the new row id.
    pub fn seed_record(&self, database_id: &str, properties: PropertyMap) -> String {
        let mut state = self.write();
        let id = state.allocate_id("seed");
        state
            .rows
            .entry(database_id.to_string())
            .or_default()
            .push(StoredRecord {
                id: id.clone(),
                properties,
            });
        id
    }

    /// Seed a row whose only property is its `Name` title.
    pub fn seed_named(&self, database_id: &str, name: &str) -> String {
        let mut properties = PropertyMap::new();
        properties.insert(TITLE_PROPERTY.to_string(), PropertyValue::title(name));
        self.seed_record(database_id, properties)
    }

    /// Make every create/update of a row titled `title` fail with a server error.
    pub fn fail_writes_titled(&self, title: &str) {
        self.write().failing_titles.insert(title.to_string());
    }

    pub fn records(&self, database_id: &str) -> Vec<StoredRecord> {
        self.read()
            .rows
            .get(database_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn record(&self, record_id: &str) -> Option<StoredRecord> {
        self.read()
            .rows
            .values()
            .flatten()
            .find(|r| r.id == record_id)
            .cloned()
    }

    pub fn children(&self, record_id: &str) -> Vec<ChildBlock> {
        self.read()
            .children
            .get(record_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.read().calls.clone()
    }

    pub fn writes(&self) -> Vec<StoreCall> {
        self.read()
            .calls
            .iter()
            .filter(|c| c.is_write())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.write().calls.clear();
    }
}

#[async_trait]
impl WorkspaceStore for InMemoryStore {
    async fn discover_schema(&self, database_id: &str) -> Result<Vec<SchemaField>, StoreError> {
        let mut state = self.write();
        state.calls.push(StoreCall::DiscoverSchema {
            database_id: database_id.to_string(),
        });
        state
            .schemas
            .get(database_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("database {database_id}")))
    }

    async fn query_by_name(
        &self,
        database_id: &str,
        name: &str,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let mut state = self.write();
        state.calls.push(StoreCall::QueryByName {
            database_id: database_id.to_string(),
            name: name.to_string(),
        });
        Ok(state
            .rows_of(database_id)?
            .iter()
            .filter(|r| r.text(TITLE_PROPERTY).as_deref() == Some(name))
            .cloned()
            .collect())
    }

    async fn list_records(&self, database_id: &str) -> Result<Vec<StoredRecord>, StoreError> {
        let mut state = self.write();
        state.calls.push(StoreCall::ListRecords {
            database_id: database_id.to_string(),
        });
        Ok(state.rows_of(database_id)?.clone())
    }

    async fn create_record(
        &self,
        database_id: &str,
        properties: &PropertyMap,
    ) -> Result<String, StoreError> {
        let mut state = self.write();
        state.rows_of(database_id)?;
        state.check_failure(properties)?;
        let record_id = state.allocate_id("page");
        state.calls.push(StoreCall::CreateRecord {
            database_id: database_id.to_string(),
            record_id: record_id.clone(),
            properties: properties.clone(),
        });
        state
            .rows
            .entry(database_id.to_string())
            .or_default()
            .push(StoredRecord {
                id: record_id.clone(),
                properties: properties.clone(),
            });
        Ok(record_id)
    }

    async fn update_record(
        &self,
        record_id: &str,
        properties: &PropertyMap,
    ) -> Result<(), StoreError> {
        let mut state = self.write();
        let mut merged = state
            .rows
            .values()
            .flatten()
            .find(|r| r.id == record_id)
            .map(|r| r.properties.clone())
            .ok_or_else(|| StoreError::NotFound(format!("record {record_id}")))?;
        merged.extend(properties.clone());
        state.check_failure(&merged)?;

        state.calls.push(StoreCall::UpdateRecord {
            record_id: record_id.to_string(),
            properties: properties.clone(),
        });
        if let Some(record) = state
            .rows
            .values_mut()
            .flatten()
            .find(|r| r.id == record_id)
        {
            record.properties.extend(properties.clone());
        }
        Ok(())
    }

    async fn list_children(&self, record_id: &str) -> Result<Vec<ChildBlock>, StoreError> {
        let mut state = self.write();
        state.calls.push(StoreCall::ListChildren {
            record_id: record_id.to_string(),
        });
        Ok(state.children.get(record_id).cloned().unwrap_or_default())
    }

    async fn create_child_table(
        &self,
        record_id: &str,
        title: &str,
        columns: &[SchemaField],
    ) -> Result<String, StoreError> {
        let mut state = self.write();
        let table_id = state.allocate_id("table");
        state.calls.push(StoreCall::CreateChildTable {
            record_id: record_id.to_string(),
            table_id: table_id.clone(),
            title: title.to_string(),
        });
        state.schemas.insert(table_id.clone(), columns.to_vec());
        state.rows.insert(table_id.clone(), Vec::new());
        state
            .children
            .entry(record_id.to_string())
            .or_default()
            .push(ChildBlock {
                id: table_id.clone(),
                kind: "child_database".to_string(),
                title: Some(title.to_string()),
            });
        Ok(table_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<SchemaField> {
        vec![SchemaField::new("Name", "title"), SchemaField::new("Kind", "select")]
    }

    #[tokio::test]
    async fn create_then_query_by_name_finds_the_row() {
        let store = InMemoryStore::new();
        store.add_database("db", schema());

        let mut properties = PropertyMap::new();
        properties.insert("Name".into(), PropertyValue::title("svc-1"));
        let id = store.create_record("db", &properties).await.expect("create");

        let found = store.query_by_name("db", "svc-1").await.expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
        assert!(store.query_by_name("db", "svc-2").await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn update_patches_only_given_properties() {
        let store = InMemoryStore::new();
        store.add_database("db", schema());
        let id = store.seed_named("db", "svc-1");

        let mut patch = PropertyMap::new();
        patch.insert("Kind".into(), PropertyValue::select("Component"));
        store.update_record(&id, &patch).await.expect("update");

        let record = store.record(&id).expect("record");
        assert_eq!(record.title().as_deref(), Some("svc-1"));
        assert_eq!(
            record.properties.get("Kind"),
            Some(&PropertyValue::select("Component"))
        );
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_reject_matching_titles() {
        let store = InMemoryStore::new();
        store.add_database("db", schema());
        store.fail_writes_titled("broken");

        let mut properties = PropertyMap::new();
        properties.insert("Name".into(), PropertyValue::title("broken"));
        assert!(store.create_record("db", &properties).await.is_err());
        assert!(store.records("db").is_empty());
    }

    #[tokio::test]
    async fn unknown_database_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.list_records("missing").await.expect_err("missing db");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn child_tables_show_up_as_child_blocks() {
        let store = InMemoryStore::new();
        store.add_database("db", schema());
        let parent = store.seed_named("db", "svc-1");

        let table = store
            .create_child_table(&parent, "Links", &[SchemaField::new("Name", "title")])
            .await
            .expect("create table");
        let children = store.list_children(&parent).await.expect("children");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, table);
        assert!(children[0].is_child_table("Links"));
        assert!(store.list_records(&table).await.expect("rows").is_empty());
    }
}
