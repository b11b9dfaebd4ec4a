//! Storage abstraction over the workspace database.
//!
//! The reconciler only talks to a [`WorkspaceStore`]; the Notion REST client
//! and the in-memory store used by tests both implement it.

use async_trait::async_trait;
use catsync_core::{ChildBlock, PropertyMap, SchemaField, StoredRecord};
use thiserror::Error;

use crate::FetchError;

/// Title column every synchronized table is matched on.
pub const TITLE_PROPERTY: &str = "Name";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response from {context}: {message}")]
    Decode { context: String, message: String },
    #[error("{0} not found")]
    NotFound(String),
}

impl StoreError {
    pub fn decode(context: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Decode {
            context: context.into(),
            message: message.into(),
        }
    }
}

/// Operations the sync engine needs from the workspace database.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`discover_schema`](WorkspaceStore::discover_schema) | Columns of a database |
/// | [`query_by_name`](WorkspaceStore::query_by_name) | Rows whose title equals a name |
/// | [`list_records`](WorkspaceStore::list_records) | Every row, following cursors to the end |
/// | [`create_record`](WorkspaceStore::create_record) | Insert a row, returning its id |
/// | [`update_record`](WorkspaceStore::update_record) | Patch the given properties of a row |
/// | [`list_children`](WorkspaceStore::list_children) | Blocks nested under a row |
/// | [`create_child_table`](WorkspaceStore::create_child_table) | Nest a new table under a row |
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn discover_schema(&self, database_id: &str) -> Result<Vec<SchemaField>, StoreError>;

    async fn query_by_name(
        &self,
        database_id: &str,
        name: &str,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    async fn list_records(&self, database_id: &str) -> Result<Vec<StoredRecord>, StoreError>;

    async fn create_record(
        &self,
        database_id: &str,
        properties: &PropertyMap,
    ) -> Result<String, StoreError>;

    async fn update_record(
        &self,
        record_id: &str,
        properties: &PropertyMap,
    ) -> Result<(), StoreError>;

    async fn list_children(&self, record_id: &str) -> Result<Vec<ChildBlock>, StoreError>;

    async fn create_child_table(
        &self,
        record_id: &str,
        title: &str,
        columns: &[SchemaField],
    ) -> Result<String, StoreError>;
}
