//! Reference tables for the owner and system dimensions, and dependency lookups.

use std::collections::HashMap;

use catsync_core::{PropertyValue, RelationRef, StoredRecord, UNKNOWN};
use catsync_storage::{StoreError, WorkspaceStore};
use tracing::{debug, info};

use crate::SyncError;

/// Row every reference table must carry; unmatched names resolve to it.
pub const SENTINEL_KEY: &str = "unknown";

/// Lowercased row title -> row id for one reference database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceTable {
    entries: HashMap<String, String>,
    unknown_id: String,
}

impl ReferenceTable {
    /// Build a table from the rows of its database.
    ///
    /// Later rows win when two titles collide after lowercasing.
    pub fn from_records(
        dimension: &'static str,
        database_id: &str,
        records: &[StoredRecord],
    ) -> Result<Self, SyncError> {
        let mut entries = HashMap::new();
        for record in records {
            let Some(title) = record.title() else {
                continue;
            };
            let key = title.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            entries.insert(key, record.id.clone());
        }

        let unknown_id = entries
            .get(SENTINEL_KEY)
            .cloned()
            .ok_or_else(|| SyncError::MissingSentinel {
                dimension,
                database_id: database_id.to_string(),
            })?;

        Ok(Self {
            entries,
            unknown_id,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Id for `name`, falling back to the sentinel row.
    pub fn lookup(&self, name: Option<&str>) -> &str {
        name.map(|n| n.trim().to_lowercase())
            .and_then(|key| self.entries.get(&key))
            .map_or(self.unknown_id.as_str(), String::as_str)
    }
}

/// Turn a declared owner or system name into a property value.
///
/// Without a reference table the name is written as a select option.
pub fn resolve_reference(name: Option<&str>, table: Option<&ReferenceTable>) -> PropertyValue {
    match table {
        Some(table) => PropertyValue::relation([table.lookup(name)]),
        None => {
            let name = name.map(str::trim).filter(|n| !n.is_empty());
            PropertyValue::select(name.unwrap_or(UNKNOWN))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceTables {
    pub owners: Option<ReferenceTable>,
    pub systems: Option<ReferenceTable>,
}

impl ReferenceTables {
    /// Load both configured reference databases concurrently.
    ///
    /// Fails when either one lacks its `unknown` row.
    pub async fn load<S>(
        store: &S,
        owner_database: Option<&str>,
        system_database: Option<&str>,
    ) -> Result<Self, SyncError>
    where
        S: WorkspaceStore + ?Sized,
    {
        let (owners, systems) = tokio::try_join!(
            load_table(store, "owner", owner_database),
            load_table(store, "system", system_database),
        )?;
        Ok(Self { owners, systems })
    }
}

async fn load_table<S>(
    store: &S,
    dimension: &'static str,
    database_id: Option<&str>,
) -> Result<Option<ReferenceTable>, SyncError>
where
    S: WorkspaceStore + ?Sized,
{
    let Some(database_id) = database_id else {
        return Ok(None);
    };
    let records = store.list_records(database_id).await?;
    let table = ReferenceTable::from_records(dimension, database_id, &records)?;
    info!(dimension, database_id, entries = table.len(), "loaded reference table");
    Ok(Some(table))
}

/// Relation entries for the declared dependencies that exist in the target database.
pub async fn resolve_depends_on<S>(
    store: &S,
    database_id: &str,
    names: &[String],
) -> Result<Vec<RelationRef>, StoreError>
where
    S: WorkspaceStore + ?Sized,
{
    let mut relations = Vec::with_capacity(names.len());
    for name in names {
        match store.query_by_name(database_id, name).await?.into_iter().next() {
            Some(found) => relations.push(RelationRef { id: found.id }),
            None => debug!(dependency = %name, "dependency not in target database yet"),
        }
    }
    Ok(relations)
}
