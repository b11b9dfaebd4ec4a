//! GitHub REST implementation of [`CodeHost`].

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use catsync_core::Repository;
use catsync_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use tracing::debug;

use crate::{AdapterError, CatalogFile, CodeHost};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const PER_PAGE: usize = 100;

#[derive(Debug)]
pub struct GitHubClient {
    http: HttpFetcher,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    html_url: String,
}

impl GitHubClient {
    pub fn new(token: &str, mut config: HttpClientConfig) -> anyhow::Result<Self> {
        config.bearer_token = Some(token.to_string());
        config
            .headers
            .push(("Accept".to_string(), "application/vnd.github+json".to_string()));
        config
            .headers
            .push(("X-GitHub-Api-Version".to_string(), "2022-11-28".to_string()));
        Ok(Self {
            http: HttpFetcher::new(config)?,
            api_url: DEFAULT_API_URL.to_string(),
        })
    }

    /// Use a GitHub Enterprise API root instead of the public one.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    async fn list_repositories(
        &self,
        owner: &str,
        repository_type: &str,
    ) -> Result<Vec<Repository>, AdapterError> {
        let url = format!("{}/orgs/{owner}/repos", self.api_url);
        let per_page = PER_PAGE.to_string();
        let mut repositories = Vec::new();

        for page in 1.. {
            let page_no = page.to_string();
            let query = [
                ("type", repository_type),
                ("sort", "full_name"),
                ("per_page", per_page.as_str()),
                ("page", page_no.as_str()),
            ];
            let batch: Vec<Repository> = self.http.get(&url, &query).await?.json()?;
            let done = batch.len() < PER_PAGE;
            repositories.extend(batch);
            if done {
                break;
            }
        }

        debug!(owner, count = repositories.len(), "listed repositories");
        Ok(repositories)
    }

    async fn read_file(
        &self,
        repository: &Repository,
        path: &str,
    ) -> Result<Option<CatalogFile>, AdapterError> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_url,
            repository.owner(),
            repository.name,
            path.trim_start_matches('/')
        );
        let response = match self.http.get(&url, &[]).await {
            Ok(response) => response,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        // A directory listing comes back as an array.
        let contents: ContentsResponse = match response.json() {
            Ok(contents) => contents,
            Err(FetchError::Decode { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let content = decode_content(&contents, path)?;
        Ok(Some(CatalogFile {
            path: path.to_string(),
            content,
            html_url: contents.html_url,
        }))
    }
}

fn decode_content(contents: &ContentsResponse, path: &str) -> Result<String, AdapterError> {
    let raw = contents.content.as_deref().unwrap_or_default();
    match contents.encoding.as_deref() {
        Some("base64") | None => {
            let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = STANDARD.decode(compact).map_err(|err| AdapterError::Decode {
                path: path.to_string(),
                message: format!("invalid base64 content: {err}"),
            })?;
            String::from_utf8(bytes).map_err(|err| AdapterError::Decode {
                path: path.to_string(),
                message: format!("content is not utf-8: {err}"),
            })
        }
        Some(other) => Err(AdapterError::Decode {
            path: path.to_string(),
            message: format!("unsupported content encoding {other}"),
        }),
    }
}
