//! Keeps the "Links" child table of a record in step with its declared links.

use std::collections::HashMap;

use catsync_core::{LinkSpec, PropertyMap, PropertyValue, SchemaField};
use catsync_storage::store::TITLE_PROPERTY;
use catsync_storage::{StoreError, WorkspaceStore};
use tracing::{debug, error};

pub const LINKS_TABLE: &str = "Links";
pub const LINK_URL_FIELD: &str = "URL";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSyncReport {
    pub table_id: String,
    pub table_created: bool,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

struct LinkRow {
    id: String,
    url: Option<String>,
}

/// Create or update one row per declared link under `parent_id`.
///
/// Rows are matched by lowercased title. Rows without a declared link are
/// left alone. A failing row write is logged and counted; failing to find,
/// create or list the table itself is returned as an error.
pub async fn ensure_links<S>(
    store: &S,
    parent_id: &str,
    links: &LinkSpec,
) -> Result<LinkSyncReport, StoreError>
where
    S: WorkspaceStore + ?Sized,
{
    let mut report = LinkSyncReport::default();

    let existing_table = store
        .list_children(parent_id)
        .await?
        .into_iter()
        .find(|block| block.is_child_table(LINKS_TABLE));
    report.table_id = match existing_table {
        Some(block) => block.id,
        None => {
            report.table_created = true;
            store
                .create_child_table(parent_id, LINKS_TABLE, &link_columns())
                .await?
        }
    };

    let mut rows: HashMap<String, LinkRow> = HashMap::new();
    if !report.table_created {
        for record in store.list_records(&report.table_id).await? {
            if let Some(title) = record.text(TITLE_PROPERTY) {
                let url = record.url(LINK_URL_FIELD).map(ToString::to_string);
                rows.entry(title.to_lowercase()).or_insert(LinkRow {
                    id: record.id,
                    url,
                });
            }
        }
    }

    for link in links.entries() {
        let key = link.title.to_lowercase();
        match rows.get_mut(&key) {
            Some(row) if row.url.as_deref() == Some(link.url.as_str()) => report.unchanged += 1,
            Some(row) => {
                let mut patch = PropertyMap::new();
                patch.insert(LINK_URL_FIELD.to_string(), PropertyValue::url(&link.url));
                match store.update_record(&row.id, &patch).await {
                    Ok(()) => {
                        row.url = Some(link.url.clone());
                        report.updated += 1;
                    }
                    Err(err) => {
                        error!(link = %link.title, error = %err, "failed to update link");
                        report.failed += 1;
                    }
                }
            }
            None => {
                let mut properties = PropertyMap::new();
                properties.insert(TITLE_PROPERTY.to_string(), PropertyValue::title(&link.title));
                properties.insert(LINK_URL_FIELD.to_string(), PropertyValue::url(&link.url));
                match store.create_record(&report.table_id, &properties).await {
                    Ok(id) => {
                        rows.insert(
                            key,
                            LinkRow {
                                id,
                                url: Some(link.url.clone()),
                            },
                        );
                        report.created += 1;
                    }
                    Err(err) => {
                        error!(link = %link.title, error = %err, "failed to create link");
                        report.failed += 1;
                    }
                }
            }
        }
    }

    debug!(
        parent_id,
        created = report.created,
        updated = report.updated,
        unchanged = report.unchanged,
        failed = report.failed,
        "links synchronized"
    );
    Ok(report)
}

fn link_columns() -> [SchemaField; 2] {
    [
        SchemaField::new(TITLE_PROPERTY, "title"),
        SchemaField::new(LINK_URL_FIELD, "url"),
    ]
}
