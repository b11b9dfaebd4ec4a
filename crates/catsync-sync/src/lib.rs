//! Sync pipeline orchestration: discovery, reference loading and reconciliation.

pub mod fingerprint;
pub mod links;
pub mod mapping;
pub mod reconcile;
pub mod resolve;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use catsync_adapters::{discover_records, AdapterError, CodeHost, DiscoveryConfig, GitHubClient};
use catsync_storage::{HttpClientConfig, NotionStore, StoreError, WorkspaceStore};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use mapping::{FieldMapping, FieldRegistry, MappingContext};
pub use reconcile::{ReconcileSummary, Reconciler, RecordFailure, RecordOutcome};
pub use resolve::{ReferenceTable, ReferenceTables};

pub const CRATE_NAME: &str = "catsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("the {dimension} table ({database_id}) has no \"unknown\" row")]
    MissingSentinel {
        dimension: &'static str,
        database_id: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("cannot fingerprint record: {0}")]
    Fingerprint(#[from] serde_json::Error),
    #[error("{failed} link(s) failed to sync")]
    Links { failed: usize },
}

impl SyncError {
    /// Errors that stop a run before any record is processed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Config(_) | SyncError::MissingSentinel { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub notion_token: Option<String>,
    pub github_token: Option<String>,
    pub database_id: Option<String>,
    pub owner_database: Option<String>,
    pub system_database: Option<String>,
    pub github_owner: Option<String>,
    /// API roots for GitHub Enterprise or a proxy in front of Notion.
    pub github_api_url: Option<String>,
    pub notion_api_url: Option<String>,
    pub repository_type: String,
    pub repository_filter: String,
    pub batch_size: usize,
    pub catalog_file: String,
    pub push_missing: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: Vec<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            notion_token: var("NOTION_TOKEN"),
            github_token: var("GITHUB_TOKEN"),
            database_id: var("NOTION_DATABASE"),
            owner_database: var("NOTION_OWNER_DATABASE"),
            system_database: var("NOTION_SYSTEM_DATABASE"),
            github_owner: var("GITHUB_OWNER"),
            github_api_url: var("GITHUB_API_URL"),
            notion_api_url: var("NOTION_API_URL"),
            repository_type: var("REPOSITORY_TYPE").unwrap_or_else(|| "all".to_string()),
            repository_filter: var("REPOSITORY_FILTER").unwrap_or_else(|| ".*".to_string()),
            batch_size: var("REPOSITORY_BATCH_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(10),
            catalog_file: var("CATALOG_FILE")
                .unwrap_or_else(|| catsync_adapters::DEFAULT_CATALOG_FILE.to_string()),
            push_missing: var("PUSH_MISSING").map_or(true, |v| parse_flag(&v)),
            user_agent: var("CATSYNC_USER_AGENT").unwrap_or_else(|| "catsync/0.1".to_string()),
            http_timeout_secs: var("CATSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            scheduler_enabled: var("CATSYNC_SCHEDULER_ENABLED").map_or(false, |v| parse_flag(&v)),
            sync_cron: var("SYNC_CRON")
                .map(|v| {
                    v.split(';')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_else(|| vec!["0 0 6 * * *".to_string()]),
        }
    }

    /// Check required values and compile the repository filter.
    pub fn validate(&self) -> Result<SyncSettings, SyncError> {
        required(&self.notion_token, "NOTION_TOKEN")?;
        required(&self.github_token, "GITHUB_TOKEN")?;
        let database_id = required(&self.database_id, "NOTION_DATABASE")?;
        let owner = required(&self.github_owner, "GITHUB_OWNER")?;

        if self.batch_size == 0 {
            return Err(SyncError::Config(
                "REPOSITORY_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        let filter = Regex::new(&self.repository_filter).map_err(|err| {
            SyncError::Config(format!(
                "REPOSITORY_FILTER {:?} is not a valid pattern: {err}",
                self.repository_filter
            ))
        })?;
        if self.scheduler_enabled && self.sync_cron.is_empty() {
            return Err(SyncError::Config(
                "SYNC_CRON must name at least one schedule".to_string(),
            ));
        }

        let mut discovery = DiscoveryConfig::new(owner);
        discovery.repository_type = self.repository_type.clone();
        discovery.repository_filter = Some(filter);
        discovery.catalog_file = self.catalog_file.clone();
        discovery.push_missing = self.push_missing;
        discovery.batch_size = self.batch_size;

        Ok(SyncSettings {
            database_id: database_id.to_string(),
            owner_database: self.owner_database.clone(),
            system_database: self.system_database.clone(),
            discovery,
        })
    }

    fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn required<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str, SyncError> {
    value
        .as_deref()
        .ok_or_else(|| SyncError::Config(format!("{key} is required")))
}

/// Validated settings for one sync run.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub database_id: String,
    pub owner_database: Option<String>,
    pub system_database: Option<String>,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovered: usize,
    pub outcome: ReconcileSummary,
}

impl fmt::Display for SyncRunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sync complete: run_id={} discovered={} {}",
            self.run_id, self.discovered, self.outcome
        )
    }
}

/// Run one full sync against the given store and code host.
///
/// Reference tables are loaded first, so a reference table without its
/// `unknown` row fails the run before any catalog file is read. Discovery
/// failures are folded into the summary as errored records.
pub async fn run_sync<S>(
    store: &S,
    host: Arc<dyn CodeHost>,
    settings: &SyncSettings,
    registry: &FieldRegistry,
) -> Result<SyncRunSummary, SyncError>
where
    S: WorkspaceStore + ?Sized,
{
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    info!(%run_id, database_id = %settings.database_id, "starting sync");

    let references = ReferenceTables::load(
        store,
        settings.owner_database.as_deref(),
        settings.system_database.as_deref(),
    )
    .await?;

    let discovery = discover_records(host, &settings.discovery).await?;
    let discovered = discovery.records.len();

    let mut reconciler =
        Reconciler::prepare(store, &settings.database_id, registry, &references).await?;
    let mut outcome = reconciler.reconcile_all(&discovery.records).await;

    let mut discovery_errors = ReconcileSummary::default();
    for failure in discovery.failures {
        discovery_errors.record_failure(
            format!("{}:{}", failure.repository, failure.path),
            failure.message,
        );
    }
    outcome.merge(discovery_errors);

    let summary = SyncRunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        discovered,
        outcome,
    };
    info!(%summary, "sync finished");
    Ok(summary)
}

pub struct SyncPipeline {
    settings: SyncSettings,
    scheduler_enabled: bool,
    sync_cron: Vec<String>,
    store: Arc<dyn WorkspaceStore>,
    host: Arc<dyn CodeHost>,
    registry: FieldRegistry,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let settings = config.validate()?;
        let notion_token = required(&config.notion_token, "NOTION_TOKEN")?;
        let github_token = required(&config.github_token, "GITHUB_TOKEN")?;

        let mut store = NotionStore::new(notion_token, config.http_config())
            .context("building workspace store client")?;
        if let Some(base_url) = &config.notion_api_url {
            store = store.with_base_url(base_url);
        }
        let mut host = GitHubClient::new(github_token, config.http_config())
            .context("building code host client")?;
        if let Some(api_url) = &config.github_api_url {
            host = host.with_api_url(api_url);
        }

        Ok(Self::from_parts(settings, Arc::new(store), Arc::new(host))
            .with_schedule(config.scheduler_enabled, config.sync_cron))
    }

    pub fn from_parts(
        settings: SyncSettings,
        store: Arc<dyn WorkspaceStore>,
        host: Arc<dyn CodeHost>,
    ) -> Self {
        Self {
            settings,
            scheduler_enabled: false,
            sync_cron: Vec::new(),
            store,
            host,
            registry: FieldRegistry::standard(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_schedule(mut self, enabled: bool, crons: Vec<String>) -> Self {
        self.scheduler_enabled = enabled;
        self.sync_cron = crons;
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run one sync; concurrent callers wait for the run in progress.
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let _running = self.run_lock.lock().await;
        run_sync(
            self.store.as_ref(),
            Arc::clone(&self.host),
            &self.settings,
            &self.registry,
        )
        .await
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in &self.sync_cron {
            let pipeline = Arc::clone(&self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(%summary, "scheduled sync finished"),
                        Err(err) => error!(error = %err, "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

/// Start the scheduler and keep it running until ctrl-c.
pub async fn run_scheduler_until_shutdown(mut sched: JobScheduler) -> Result<()> {
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    warn!("shutdown requested, stopping scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
