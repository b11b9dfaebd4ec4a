//! Core domain model for catalog sync: source records and store-native properties.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "catsync-core";

/// Display value used wherever a classification is absent.
pub const UNKNOWN: &str = "Unknown";

/// Maximum characters the workspace store accepts in one rich text segment.
pub const RICH_TEXT_SEGMENT_LIMIT: usize = 2000;

/// Repository as listed by the code host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub html_url: String,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Repository {
    /// Owner segment of `full_name` (`owner/name`).
    pub fn owner(&self) -> &str {
        self.full_name
            .split_once('/')
            .map(|(owner, _)| owner)
            .unwrap_or(self.full_name.as_str())
    }
}

/// `spec` block of a catalog file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatalogSpec {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub lifecycle: Option<String>,
    #[serde(default, rename = "dependsOn")]
    pub depends_on: Vec<String>,
    /// Only meaningful on location files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

/// `metadata` block of a catalog file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatalogMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub links: Option<LinkSpec>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Links as declared in catalog metadata.
///
/// Both the `title: url` mapping form and the list-of-entries form are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkSpec {
    Map(BTreeMap<String, LinkTarget>),
    List(Vec<LinkObject>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkTarget {
    Url(String),
    Entry(LinkObject),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkObject {
    #[serde(default)]
    pub title: Option<String>,
    pub url: String,
}

/// A named URL projected into a record's child link table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub title: String,
    pub url: String,
}

impl LinkSpec {
    pub fn entries(&self) -> Vec<LinkEntry> {
        match self {
            LinkSpec::Map(map) => map
                .iter()
                .map(|(key, target)| match target {
                    LinkTarget::Url(url) => LinkEntry {
                        title: key.clone(),
                        url: url.clone(),
                    },
                    LinkTarget::Entry(entry) => LinkEntry {
                        title: non_empty(entry.title.as_deref()).unwrap_or(key.as_str()).to_string(),
                        url: entry.url.clone(),
                    },
                })
                .collect(),
            LinkSpec::List(list) => list
                .iter()
                .map(|entry| LinkEntry {
                    title: non_empty(entry.title.as_deref())
                        .unwrap_or(entry.url.as_str())
                        .to_string(),
                    url: entry.url.clone(),
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            LinkSpec::Map(map) => map.is_empty(),
            LinkSpec::List(list) => list.is_empty(),
        }
    }
}

/// One logical catalog entry discovered on the code host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub repository: Repository,
    pub kind: Option<String>,
    pub spec: Option<CatalogSpec>,
    pub metadata: Option<CatalogMetadata>,
    pub status: String,
    /// Browser URL of the catalog file this record was read from.
    pub catalog_file_url: Option<String>,
    pub from_location: bool,
}

impl SourceRecord {
    /// Placeholder for a repository whose catalog file could not be found.
    pub fn missing(repository: Repository, status: impl Into<String>) -> Self {
        Self {
            repository,
            kind: None,
            spec: None,
            metadata: None,
            status: status.into(),
            catalog_file_url: None,
            from_location: false,
        }
    }

    /// Stable name used to match this record against existing target rows.
    pub fn identity(&self) -> &str {
        self.metadata
            .as_ref()
            .and_then(|m| non_empty(m.name.as_deref()))
            .unwrap_or(self.repository.name.as_str())
    }

    pub fn depends_on(&self) -> &[String] {
        self.spec
            .as_ref()
            .map(|s| s.depends_on.as_slice())
            .unwrap_or_default()
    }

    pub fn links(&self) -> Option<&LinkSpec> {
        self.metadata.as_ref().and_then(|m| m.links.as_ref())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.annotations.get(key))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextContent {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RichText {
    #[serde(default)]
    pub text: TextContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateValue {
    pub start: String,
}

/// A property value in the workspace store's native shape.
///
/// Serializes to the store's wire form, e.g. `{"select":{"name":"Go"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    Title(Vec<RichText>),
    RichText(Vec<RichText>),
    Url(Option<String>),
    Select(Option<SelectOption>),
    MultiSelect(Vec<SelectOption>),
    Relation(Vec<RelationRef>),
    Date(Option<DateValue>),
}

/// Schema-shaped property set, keyed by field name.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

impl PropertyValue {
    pub fn title(text: &str) -> Self {
        PropertyValue::Title(text_segments(text))
    }

    pub fn rich_text(text: &str) -> Self {
        PropertyValue::RichText(text_segments(text))
    }

    pub fn url(url: impl Into<String>) -> Self {
        PropertyValue::Url(Some(url.into()))
    }

    pub fn select(name: impl Into<String>) -> Self {
        PropertyValue::Select(Some(SelectOption { name: name.into() }))
    }

    pub fn multi_select<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PropertyValue::MultiSelect(
            names
                .into_iter()
                .map(|name| SelectOption { name: name.into() })
                .collect(),
        )
    }

    pub fn relation<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PropertyValue::Relation(ids.into_iter().map(|id| RelationRef { id: id.into() }).collect())
    }

    pub fn date(at: DateTime<Utc>) -> Self {
        PropertyValue::Date(Some(DateValue {
            start: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }))
    }

    /// Concatenated text of a title or rich text property.
    pub fn plain_text(&self) -> Option<String> {
        match self {
            PropertyValue::Title(parts) | PropertyValue::RichText(parts) => Some(
                parts
                    .iter()
                    .map(|p| p.text.content.as_str())
                    .collect::<String>(),
            ),
            _ => None,
        }
    }

    pub fn as_url(&self) -> Option<&str> {
        match self {
            PropertyValue::Url(url) => url.as_deref(),
            _ => None,
        }
    }

    pub fn relation_ids(&self) -> Vec<&str> {
        match self {
            PropertyValue::Relation(refs) => refs.iter().map(|r| r.id.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

fn text_segments(text: &str) -> Vec<RichText> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![RichText::default()];
    }
    chars
        .chunks(RICH_TEXT_SEGMENT_LIMIT)
        .map(|chunk| RichText {
            text: TextContent {
                content: chunk.iter().collect(),
            },
        })
        .collect()
}

/// A row read back from the workspace store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub properties: PropertyMap,
}

impl StoredRecord {
    /// Text of the record's title property, whatever it is named.
    pub fn title(&self) -> Option<String> {
        self.properties
            .values()
            .find(|p| matches!(p, PropertyValue::Title(_)))
            .and_then(PropertyValue::plain_text)
    }

    pub fn text(&self, property: &str) -> Option<String> {
        self.properties
            .get(property)
            .and_then(PropertyValue::plain_text)
    }

    pub fn url(&self, property: &str) -> Option<&str> {
        self.properties.get(property).and_then(PropertyValue::as_url)
    }
}

/// A child block listed under a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildBlock {
    pub id: String,
    pub kind: String,
    pub title: Option<String>,
}

impl ChildBlock {
    pub fn is_child_table(&self, title: &str) -> bool {
        self.kind == "child_database" && self.title.as_deref() == Some(title)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
