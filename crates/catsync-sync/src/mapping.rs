//! Schema-driven property mapping.
//!
//! A [`FieldRegistry`] pairs target field names with plain mapping functions.
//! [`map_properties`] walks the target schema and asks the registry for each
//! field, so columns the registry does not know about are left untouched.

use std::collections::HashMap;

use catsync_core::{PropertyMap, PropertyValue, RelationRef, SchemaField, SourceRecord, UNKNOWN};
use chrono::{DateTime, Utc};

use crate::resolve::{resolve_reference, ReferenceTable};

pub const HASH_FIELD: &str = "Hash";
pub const UPDATED_FIELD: &str = "Updated";

/// Inputs a mapping function may need beyond the record itself.
#[derive(Debug, Clone)]
pub struct MappingContext<'a> {
    pub owners: Option<&'a ReferenceTable>,
    pub systems: Option<&'a ReferenceTable>,
    pub depends_on: &'a [RelationRef],
    pub now: DateTime<Utc>,
}

pub type FieldFn = fn(&SourceRecord, &MappingContext<'_>) -> Option<PropertyValue>;

#[derive(Clone, Copy)]
pub enum FieldMapping {
    Map(FieldFn),
    /// Read-only columns the store maintains itself.
    Skip,
}

impl std::fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldMapping::Map(_) => f.write_str("Map(..)"),
            FieldMapping::Skip => f.write_str("Skip"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    fields: HashMap<String, FieldMapping>,
}

impl FieldRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry covering every column of the standard service catalog.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry
            .register("Name", name_field)
            .register("Description", description_field)
            .register("URL", url_field)
            .register("Kind", kind_field)
            .register("Status", status_field)
            .register("Language", language_field)
            .register("Visibility", visibility_field)
            .register("Tags", tags_field)
            .register("Lifecycle", lifecycle_field)
            .register("Deployment", deployment_field)
            .register("Environments", environments_field)
            .register("Owner", owner_field)
            .register("System", system_field)
            .register("DependsOn", depends_on_field)
            .register(UPDATED_FIELD, updated_field)
            .skip("DependencyOf");
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, map: FieldFn) -> &mut Self {
        self.fields.insert(name.into(), FieldMapping::Map(map));
        self
    }

    pub fn skip(&mut self, name: impl Into<String>) -> &mut Self {
        self.fields.insert(name.into(), FieldMapping::Skip);
        self
    }

    pub fn get(&self, name: &str) -> Option<FieldMapping> {
        self.fields.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Build the property set for `record` restricted to the columns in `schema`.
pub fn map_properties(
    registry: &FieldRegistry,
    schema: &[SchemaField],
    record: &SourceRecord,
    ctx: &MappingContext<'_>,
) -> PropertyMap {
    let mut properties = PropertyMap::new();
    for field in schema {
        if let Some(FieldMapping::Map(map)) = registry.get(&field.name) {
            if let Some(value) = map(record, ctx) {
                properties.insert(field.name.clone(), value);
            }
        }
    }
    properties
}

fn select_or_unknown(value: Option<&str>) -> PropertyValue {
    let value = value.map(str::trim).filter(|v| !v.is_empty());
    PropertyValue::select(value.unwrap_or(UNKNOWN))
}

fn name_field(record: &SourceRecord, _: &MappingContext<'_>) -> Option<PropertyValue> {
    Some(PropertyValue::title(record.identity()))
}

fn description_field(record: &SourceRecord, _: &MappingContext<'_>) -> Option<PropertyValue> {
    let declared = record
        .metadata
        .as_ref()
        .and_then(|m| m.description.as_deref());
    let description = [declared, record.repository.description.as_deref()]
        .into_iter()
        .flatten()
        .find(|d| !d.trim().is_empty())
        .unwrap_or(record.repository.name.as_str());
    Some(PropertyValue::rich_text(description))
}

fn url_field(record: &SourceRecord, _: &MappingContext<'_>) -> Option<PropertyValue> {
    let url = match (&record.catalog_file_url, record.from_location) {
        (Some(file_url), true) => file_url
            .rsplit_once('/')
            .map_or(file_url.as_str(), |(folder, _)| folder),
        _ => record.repository.html_url.as_str(),
    };
    Some(PropertyValue::url(url))
}

fn kind_field(record: &SourceRecord, _: &MappingContext<'_>) -> Option<PropertyValue> {
    Some(select_or_unknown(record.kind.as_deref()))
}

fn status_field(record: &SourceRecord, _: &MappingContext<'_>) -> Option<PropertyValue> {
    Some(select_or_unknown(Some(record.status.as_str())))
}

fn language_field(record: &SourceRecord, _: &MappingContext<'_>) -> Option<PropertyValue> {
    Some(select_or_unknown(record.repository.language.as_deref()))
}

fn visibility_field(record: &SourceRecord, _: &MappingContext<'_>) -> Option<PropertyValue> {
    Some(select_or_unknown(record.repository.visibility.as_deref()))
}

fn tags_field(record: &SourceRecord, _: &MappingContext<'_>) -> Option<PropertyValue> {
    let tags = record
        .metadata
        .as_ref()
        .map(|m| m.tags.as_slice())
        .unwrap_or_default();
    Some(PropertyValue::multi_select(tags.iter().map(String::as_str)))
}

fn lifecycle_field(record: &SourceRecord, _: &MappingContext<'_>) -> Option<PropertyValue> {
    let lifecycle = record.spec.as_ref().and_then(|s| s.lifecycle.as_deref());
    Some(select_or_unknown(lifecycle))
}

fn deployment_field(record: &SourceRecord, _: &MappingContext<'_>) -> Option<PropertyValue> {
    Some(select_or_unknown(record.annotation("deployment")))
}

fn environments_field(record: &SourceRecord, _: &MappingContext<'_>) -> Option<PropertyValue> {
    let environments = record.annotation("environments").unwrap_or_default();
    Some(PropertyValue::multi_select(
        environments
            .split(',')
            .map(str::trim)
            .filter(|env| !env.is_empty()),
    ))
}

fn owner_field(record: &SourceRecord, ctx: &MappingContext<'_>) -> Option<PropertyValue> {
    let owner = record.spec.as_ref().and_then(|s| s.owner.as_deref());
    Some(resolve_reference(owner, ctx.owners))
}

fn system_field(record: &SourceRecord, ctx: &MappingContext<'_>) -> Option<PropertyValue> {
    let system = record.spec.as_ref().and_then(|s| s.system.as_deref());
    Some(resolve_reference(system, ctx.systems))
}

fn depends_on_field(_: &SourceRecord, ctx: &MappingContext<'_>) -> Option<PropertyValue> {
    Some(PropertyValue::Relation(ctx.depends_on.to_vec()))
}

fn updated_field(_: &SourceRecord, ctx: &MappingContext<'_>) -> Option<PropertyValue> {
    Some(PropertyValue::date(ctx.now))
}
