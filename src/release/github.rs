//! GitHub-backed release index

use super::error::{ReleaseError, ReleaseResult};
use super::{Asset, Release, ReleaseIndex, RepositoryRef, HOST_OWNER, HOST_REPO};
use crate::core::progress::DownloadProgress;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const API_BASE: &str = "https://api.github.com";
const RAW_BASE: &str = "https://raw.githubusercontent.com";
const APPROVED_PLUGINS_PATH: &str = "main/approved_plugins";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Releases and assets served by the GitHub REST API
#[derive(Debug, Clone)]
pub struct GithubReleases {
    client: Client,
    api_base: String,
    raw_base: String,
}

impl GithubReleases {
    pub fn new() -> ReleaseResult<Self> {
        Self::with_base_urls(API_BASE, RAW_BASE)
    }

    /// Point at another API deployment (GitHub Enterprise, local mirrors)
    pub fn with_base_urls(
        api_base: impl Into<String>,
        raw_base: impl Into<String>,
    ) -> ReleaseResult<Self> {
        let api_base = api_base.into();
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|source| ReleaseError::Network {
                url: api_base.clone(),
                source,
            })?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            raw_base: raw_base.into().trim_end_matches('/').to_string(),
        })
    }

    fn get(&self, url: &str, auth_token: Option<&str>) -> RequestBuilder {
        let request = self
            .client
            .get(url)
            .header(USER_AGENT, format!("kaytu/{}", env!("CARGO_PKG_VERSION")));
        match auth_token.filter(|t| !t.is_empty()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, url: &str, request: RequestBuilder, what: &str) -> ReleaseResult<Response> {
        log::debug!("GithubReleases: GET {}", url);
        let response = request.send().await.map_err(|source| ReleaseError::Network {
            url: url.to_string(),
            source,
        })?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(ReleaseError::NotFound(what.to_string())),
            status => Err(ReleaseError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

#[async_trait]
impl ReleaseIndex for GithubReleases {
    async fn latest_release(
        &self,
        repo: &RepositoryRef,
        auth_token: Option<&str>,
    ) -> ReleaseResult<Release> {
        let url = format!(
            "{}/repos/{}/{}/releases/latest",
            self.api_base, repo.owner, repo.repo
        );
        let request = self
            .get(&url, auth_token)
            .header(ACCEPT, "application/vnd.github+json");
        let response = self
            .send(&url, request, &format!("latest release of {repo}"))
            .await?;
        response
            .json::<Release>()
            .await
            .map_err(|source| ReleaseError::Network { url, source })
    }

    async fn download_asset(
        &self,
        repo: &RepositoryRef,
        asset: &Asset,
        auth_token: Option<&str>,
        dest: &mut tokio::fs::File,
        progress: &mut DownloadProgress,
    ) -> ReleaseResult<u64> {
        let url = format!(
            "{}/repos/{}/{}/releases/assets/{}",
            self.api_base, repo.owner, repo.repo, asset.id
        );
        let request = self
            .get(&url, auth_token)
            .header(ACCEPT, "application/octet-stream");
        let mut response = self
            .send(&url, request, &format!("asset {}", asset.name))
            .await?;

        let mut written = 0u64;
        loop {
            let chunk = response
                .chunk()
                .await
                .map_err(|source| ReleaseError::Network {
                    url: url.clone(),
                    source,
                })?;
            let Some(chunk) = chunk else { break };
            dest.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.advance(chunk.len() as u64);
        }
        dest.flush().await?;
        Ok(written)
    }

    async fn approved_plugins(&self, auth_token: Option<&str>) -> ReleaseResult<Vec<String>> {
        let url = format!(
            "{}/{}/{}/{}",
            self.raw_base, HOST_OWNER, HOST_REPO, APPROVED_PLUGINS_PATH
        );
        let request = self.get(&url, auth_token);
        let response = self.send(&url, request, "approved plugins list").await?;
        let body = response
            .text()
            .await
            .map_err(|source| ReleaseError::Network { url, source })?;
        Ok(parse_approved_list(&body))
    }
}

/// One `owner/repo` per line; blanks and `#` comments are ignored
pub fn parse_approved_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
