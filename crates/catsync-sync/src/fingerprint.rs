//! Content fingerprints used to skip unchanged records.

use std::collections::BTreeMap;

use catsync_core::{LinkSpec, PropertyMap, PropertyValue};
use catsync_storage::sha256_hex;
use serde::Serialize;

use crate::mapping::{HASH_FIELD, UPDATED_FIELD};
use crate::SyncError;

/// Fields that change on every run and must not affect the fingerprint.
pub const EXCLUDED_FIELDS: [&str; 2] = [HASH_FIELD, UPDATED_FIELD];

#[derive(Serialize)]
struct FingerprintInput<'a> {
    properties: BTreeMap<&'a str, PropertyValue>,
    links: Option<&'a LinkSpec>,
}

/// SHA-256 hex digest of the canonical JSON form of a record's content.
///
/// Multi-select and relation values are sets, so their order is ignored.
pub fn fingerprint(
    properties: &PropertyMap,
    links: Option<&LinkSpec>,
) -> Result<String, SyncError> {
    let input = FingerprintInput {
        properties: properties
            .iter()
            .filter(|(name, _)| !EXCLUDED_FIELDS.contains(&name.as_str()))
            .map(|(name, value)| (name.as_str(), canonical(value)))
            .collect(),
        links,
    };
    let bytes = serde_json::to_vec(&input)?;
    Ok(sha256_hex(&bytes))
}

fn canonical(value: &PropertyValue) -> PropertyValue {
    match value {
        PropertyValue::MultiSelect(options) => {
            let mut options = options.clone();
            options.sort_by(|a, b| a.name.cmp(&b.name));
            PropertyValue::MultiSelect(options)
        }
        PropertyValue::Relation(refs) => {
            let mut refs = refs.clone();
            refs.sort_by(|a, b| a.id.cmp(&b.id));
            PropertyValue::Relation(refs)
        }
        other => other.clone(),
    }
}

pub fn should_write(new_hash: &str, previous: Option<&str>) -> bool {
    !new_hash.is_empty() && previous != Some(new_hash)
}
