//! Notion REST implementation of [`WorkspaceStore`].

use std::time::Duration;

use async_trait::async_trait;
use catsync_core::{ChildBlock, PropertyMap, PropertyValue, SchemaField, StoredRecord};
use reqwest::Method;
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use crate::store::{StoreError, WorkspaceStore, TITLE_PROPERTY};
use crate::{HttpClientConfig, HttpFetcher, TokenBucketConfig};

pub const DEFAULT_BASE_URL: &str = "https://api.notion.com/v1";
pub const NOTION_VERSION: &str = "2022-06-28";
const PAGE_SIZE: usize = 100;

#[derive(Debug)]
pub struct NotionStore {
    http: HttpFetcher,
    base_url: String,
}

impl NotionStore {
    /// Build a client authenticated with an integration token.
    ///
    /// The default token bucket keeps requests near the API's average of
    /// three per second.
    pub fn new(token: &str, mut config: HttpClientConfig) -> anyhow::Result<Self> {
        config.bearer_token = Some(token.to_string());
        config
            .headers
            .push(("Notion-Version".to_string(), NOTION_VERSION.to_string()));
        if config.token_bucket.is_none() {
            config.token_bucket = Some(TokenBucketConfig {
                capacity: 3,
                refill_every: Duration::from_millis(350),
            });
        }
        Ok(Self {
            http: HttpFetcher::new(config)?,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point the client at another API root, such as a proxy.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn query_database(
        &self,
        database_id: &str,
        filter: Option<JsonValue>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let url = self.endpoint(&format!("databases/{database_id}/query"));
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = Map::new();
            body.insert("page_size".into(), json!(PAGE_SIZE));
            if let Some(filter) = &filter {
                body.insert("filter".into(), filter.clone());
            }
            if let Some(cursor) = &cursor {
                body.insert("start_cursor".into(), json!(cursor));
            }

            let page: JsonValue = self
                .http
                .send_json(Method::POST, &url, &JsonValue::Object(body))
                .await?
                .json()?;
            for row in results(&page, &url)? {
                records.push(decode_page(row, &url)?);
            }

            match next_cursor(&page) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(database_id, rows = records.len(), "queried database");
        Ok(records)
    }
}

#[async_trait]
impl WorkspaceStore for NotionStore {
    async fn discover_schema(&self, database_id: &str) -> Result<Vec<SchemaField>, StoreError> {
        let url = self.endpoint(&format!("databases/{database_id}"));
        let database: JsonValue = self.http.get(&url, &[]).await?.json()?;
        decode_schema(&database, &url)
    }

    async fn query_by_name(
        &self,
        database_id: &str,
        name: &str,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let filter = json!({
            "property": TITLE_PROPERTY,
            "title": { "equals": name },
        });
        self.query_database(database_id, Some(filter)).await
    }

    async fn list_records(&self, database_id: &str) -> Result<Vec<StoredRecord>, StoreError> {
        self.query_database(database_id, None).await
    }

    async fn create_record(
        &self,
        database_id: &str,
        properties: &PropertyMap,
    ) -> Result<String, StoreError> {
        let url = self.endpoint("pages");
        let body = json!({
            "parent": { "database_id": database_id },
            "properties": encode_properties(properties)?,
        });
        let page: JsonValue = self.http.send_json(Method::POST, &url, &body).await?.json()?;
        object_id(&page, &url)
    }

    async fn update_record(
        &self,
        record_id: &str,
        properties: &PropertyMap,
    ) -> Result<(), StoreError> {
        let url = self.endpoint(&format!("pages/{record_id}"));
        let body = json!({ "properties": encode_properties(properties)? });
        self.http.send_json(Method::PATCH, &url, &body).await?;
        Ok(())
    }

    async fn list_children(&self, record_id: &str) -> Result<Vec<ChildBlock>, StoreError> {
        let url = self.endpoint(&format!("blocks/{record_id}/children"));
        let page_size = PAGE_SIZE.to_string();
        let mut blocks = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![("page_size", page_size.as_str())];
            if let Some(cursor) = cursor.as_deref() {
                query.push(("start_cursor", cursor));
            }
            let page: JsonValue = self.http.get(&url, &query).await?.json()?;
            for block in results(&page, &url)? {
                blocks.push(decode_block(block, &url)?);
            }
            match next_cursor(&page) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(blocks)
    }

    async fn create_child_table(
        &self,
        record_id: &str,
        title: &str,
        columns: &[SchemaField],
    ) -> Result<String, StoreError> {
        let url = self.endpoint("databases");
        let properties: Map<String, JsonValue> = columns
            .iter()
            .map(|column| (column.name.clone(), json!({ column.field_type.clone(): {} })))
            .collect();
        let body = json!({
            "parent": { "type": "page_id", "page_id": record_id },
            "title": [{ "type": "text", "text": { "content": title } }],
            "properties": properties,
        });
        let database: JsonValue = self.http.send_json(Method::POST, &url, &body).await?.json()?;
        object_id(&database, &url)
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn results<'a>(page: &'a JsonValue, url: &str) -> Result<&'a Vec<JsonValue>, StoreError> {
    page.get("results")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| StoreError::decode(url, "missing results array"))
}

fn next_cursor(page: &JsonValue) -> Option<String> {
    let has_more = page
        .get("has_more")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    if !has_more {
        return None;
    }
    json_str(page, &["next_cursor"]).map(ToString::to_string)
}

fn object_id(value: &JsonValue, url: &str) -> Result<String, StoreError> {
    json_str(value, &["id"])
        .map(ToString::to_string)
        .ok_or_else(|| StoreError::decode(url, "response has no id"))
}

fn encode_properties(properties: &PropertyMap) -> Result<JsonValue, StoreError> {
    serde_json::to_value(properties)
        .map_err(|err| StoreError::decode("property encoding", err.to_string()))
}

/// Columns of a database object, in the order the API lists them.
fn decode_schema(database: &JsonValue, url: &str) -> Result<Vec<SchemaField>, StoreError> {
    let properties = database
        .get("properties")
        .and_then(JsonValue::as_object)
        .ok_or_else(|| StoreError::decode(url, "database has no properties"))?;
    Ok(properties
        .iter()
        .map(|(name, property)| {
            SchemaField::new(
                name.clone(),
                json_str(property, &["type"]).unwrap_or("unknown"),
            )
        })
        .collect())
}

/// Page properties of a type the sync understands; others (formulas, rollups, ...) are dropped.
fn decode_page(page: &JsonValue, url: &str) -> Result<StoredRecord, StoreError> {
    let id = object_id(page, url)?;
    let mut properties = PropertyMap::new();
    if let Some(raw) = page.get("properties").and_then(JsonValue::as_object) {
        for (name, property) in raw {
            if let Some(value) = decode_property(property) {
                properties.insert(name.clone(), value);
            }
        }
    }
    Ok(StoredRecord { id, properties })
}

fn decode_property(property: &JsonValue) -> Option<PropertyValue> {
    let kind = json_str(property, &["type"])?;
    let inner = property.get(kind)?.clone();
    serde_json::from_value(json!({ kind: inner })).ok()
}

fn decode_block(block: &JsonValue, url: &str) -> Result<ChildBlock, StoreError> {
    let kind = json_str(block, &["type"]).unwrap_or("unknown").to_string();
    let title = json_str(block, &[kind.as_str(), "title"]).map(ToString::to_string);
    Ok(ChildBlock {
        id: object_id(block, url)?,
        kind,
        title,
    })
}
