//! Code-host contracts + catalog file discovery.

pub mod github;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use catsync_core::{CatalogMetadata, CatalogSpec, Repository, SourceRecord};
use catsync_storage::FetchError;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub use github::GitHubClient;

pub const CRATE_NAME: &str = "catsync-adapters";

pub const DEFAULT_CATALOG_FILE: &str = "catalog-info.yaml";
const DEFAULT_CATALOG_FALLBACK: &str = "catalog-info.yml";

/// Deepest chain of location files followed from a repository's root catalog file.
pub const MAX_LOCATION_DEPTH: usize = 8;

pub const STATUS_OK: &str = "OK";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("cannot decode {path}: {message}")]
    Decode { path: String, message: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A file read from a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFile {
    pub path: String,
    pub content: String,
    /// Browser URL of the file.
    pub html_url: String,
}

#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn list_repositories(
        &self,
        owner: &str,
        repository_type: &str,
    ) -> Result<Vec<Repository>, AdapterError>;

    /// `Ok(None)` when the file does not exist.
    async fn read_file(
        &self,
        repository: &Repository,
        path: &str,
    ) -> Result<Option<CatalogFile>, AdapterError>;
}

/// One YAML document of a catalog file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: Option<CatalogMetadata>,
    #[serde(default)]
    pub spec: Option<CatalogSpec>,
}

impl CatalogDocument {
    pub fn is_location(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|k| k.eq_ignore_ascii_case("location"))
    }

    pub fn targets(&self) -> Vec<String> {
        self.spec
            .as_ref()
            .map(|s| {
                s.targets
                    .iter()
                    .filter(|t| !t.trim().is_empty())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn into_record(
        self,
        repository: &Repository,
        file: &CatalogFile,
        from_location: bool,
    ) -> SourceRecord {
        SourceRecord {
            repository: repository.clone(),
            kind: self.kind,
            spec: self.spec,
            metadata: self.metadata,
            status: STATUS_OK.to_string(),
            catalog_file_url: Some(file.html_url.clone()),
            from_location,
        }
    }
}

/// Split a catalog file into its YAML documents, skipping empty ones.
pub fn parse_catalog_documents(text: &str) -> Result<Vec<CatalogDocument>, serde_yaml::Error> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        documents.push(serde_yaml::from_value(value)?);
    }
    Ok(documents)
}

/// Resolve a location target against the directory of the file declaring it.
pub fn resolve_target(location_path: &str, target: &str) -> String {
    let target = target.trim();
    let mut segments: Vec<&str> = if target.starts_with('/') {
        Vec::new()
    } else {
        let mut dir: Vec<&str> = location_path.split('/').filter(|s| !s.is_empty()).collect();
        dir.pop();
        dir
    };
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub owner: String,
    pub repository_type: String,
    /// `None` matches every repository.
    pub repository_filter: Option<Regex>,
    pub catalog_file: String,
    pub push_missing: bool,
    pub batch_size: usize,
}

impl DiscoveryConfig {
    pub fn matches(&self, repository: &Repository) -> bool {
        self.repository_filter
            .as_ref()
            .map_or(true, |filter| filter.is_match(&repository.name))
    }

    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repository_type: "all".to_string(),
            repository_filter: None,
            catalog_file: DEFAULT_CATALOG_FILE.to_string(),
            push_missing: true,
            batch_size: 10,
        }
    }
}

/// A catalog file that could not be turned into records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFailure {
    pub repository: String,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub records: Vec<SourceRecord>,
    pub failures: Vec<DiscoveryFailure>,
}

impl Discovery {
    fn merge(&mut self, other: Discovery) {
        self.records.extend(other.records);
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Clone)]
struct CatalogSettings {
    catalog_file: String,
    push_missing: bool,
}

struct PendingFile {
    path: String,
    depth: usize,
    from_location: bool,
}

/// List the owner's repositories and turn their catalog files into source records.
///
/// Repositories are fetched `batch_size` at a time, batches in series. The result is
/// ordered by dependency count and then repository name so that services without
/// dependencies land in the target before the services that point at them.
pub async fn discover_records(
    host: Arc<dyn CodeHost>,
    config: &DiscoveryConfig,
) -> Result<Discovery, AdapterError> {
    let repositories = host
        .list_repositories(&config.owner, &config.repository_type)
        .await?;
    info!(
        filter = config.repository_filter.as_ref().map_or(".*", Regex::as_str),
        found = repositories.len(),
        "listed repositories, reading catalog files for those matching the filter"
    );

    let matching: Vec<Repository> = repositories
        .into_iter()
        .filter(|r| config.matches(r))
        .collect();
    let settings = Arc::new(CatalogSettings {
        catalog_file: config.catalog_file.clone(),
        push_missing: config.push_missing,
    });

    let mut discovery = Discovery::default();
    info!(batch_size = config.batch_size.max(1), "fetching catalog files");
    for batch in matching.chunks(config.batch_size.max(1)) {
        debug!(repositories = batch.len(), "fetching batch");
        let mut tasks = JoinSet::new();
        for (index, repository) in batch.iter().cloned().enumerate() {
            let host = Arc::clone(&host);
            let settings = Arc::clone(&settings);
            tasks.spawn(async move {
                let found = collect_repository(host.as_ref(), &repository, &settings).await;
                (index, repository.name, found)
            });
        }

        let mut finished = Vec::with_capacity(batch.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => finished.push(result),
                Err(err) => discovery.failures.push(DiscoveryFailure {
                    repository: "<task>".to_string(),
                    path: settings.catalog_file.clone(),
                    message: format!("catalog fetch task failed: {err}"),
                }),
            }
        }
        finished.sort_by_key(|(index, _, _)| *index);
        for (_, name, found) in finished {
            debug!(repository = %name, records = found.records.len(), "completed repository");
            discovery.merge(found);
        }
    }

    sort_records(&mut discovery.records);
    info!(
        records = discovery.records.len(),
        failures = discovery.failures.len(),
        "processed matching repositories"
    );
    Ok(discovery)
}

/// Stable order: fewest dependencies first, then repository name.
pub fn sort_records(records: &mut [SourceRecord]) {
    records.sort_by(|a, b| {
        (a.depends_on().len(), a.repository.name.as_str())
            .cmp(&(b.depends_on().len(), b.repository.name.as_str()))
    });
}

/// Walk a repository's root catalog file and any location files it points at.
async fn collect_repository(
    host: &dyn CodeHost,
    repository: &Repository,
    settings: &CatalogSettings,
) -> Discovery {
    let mut found = Discovery::default();
    let mut visited = HashSet::new();
    let mut pending = vec![PendingFile {
        path: settings.catalog_file.clone(),
        depth: 0,
        from_location: false,
    }];

    while let Some(file) = pending.pop() {
        if file.depth > MAX_LOCATION_DEPTH {
            warn!(
                repository = %repository.name,
                path = %file.path,
                max_depth = MAX_LOCATION_DEPTH,
                "location files nest too deeply, not following"
            );
            continue;
        }
        if !visited.insert(file.path.clone()) {
            warn!(repository = %repository.name, path = %file.path, "location cycle, already processed");
            continue;
        }

        let is_root = file.depth == 0;
        debug!(repository = %repository.name, path = %file.path, "processing catalog file");
        let fetched = match read_catalog_file(host, repository, &file.path, is_root, settings).await {
            Ok(fetched) => fetched,
            Err(err) => {
                found.failures.push(DiscoveryFailure {
                    repository: repository.name.clone(),
                    path: file.path.clone(),
                    message: err.to_string(),
                });
                continue;
            }
        };

        let Some(catalog_file) = fetched else {
            if is_root && settings.push_missing {
                found.records.push(SourceRecord::missing(
                    repository.clone(),
                    format!("{} missing", settings.catalog_file),
                ));
            } else {
                warn!(repository = %repository.name, path = %file.path, "unable to find catalog file, not processing");
            }
            continue;
        };

        let documents = match parse_catalog_documents(&catalog_file.content) {
            Ok(documents) => documents,
            Err(err) => {
                found.failures.push(DiscoveryFailure {
                    repository: repository.name.clone(),
                    path: catalog_file.path.clone(),
                    message: format!("invalid catalog yaml: {err}"),
                });
                continue;
            }
        };

        let mut targets = Vec::new();
        for document in documents {
            if document.is_location() {
                let declared = document.targets();
                if declared.is_empty() {
                    warn!(
                        repository = %repository.name,
                        path = %catalog_file.path,
                        "location file has no valid spec.targets, skipping"
                    );
                }
                targets.extend(declared);
            } else {
                found
                    .records
                    .push(document.into_record(repository, &catalog_file, file.from_location));
            }
        }

        for target in targets.iter().rev() {
            pending.push(PendingFile {
                path: resolve_target(&catalog_file.path, target),
                depth: file.depth + 1,
                from_location: true,
            });
        }
    }

    found
}

async fn read_catalog_file(
    host: &dyn CodeHost,
    repository: &Repository,
    path: &str,
    is_root: bool,
    settings: &CatalogSettings,
) -> Result<Option<CatalogFile>, AdapterError> {
    if let Some(file) = host.read_file(repository, path).await? {
        return Ok(Some(file));
    }
    if is_root && settings.catalog_file == DEFAULT_CATALOG_FILE {
        return host.read_file(repository, DEFAULT_CATALOG_FALLBACK).await;
    }
    Ok(None)
}
