//! Release Index
//!
//! Access to published releases of plugins and of the host itself, asset
//! selection for the running platform, and the periodic update check.

pub mod error;
pub mod github;
pub mod platform;
pub mod update;

pub use error::{ReleaseError, ReleaseResult};
pub use github::GithubReleases;
pub use platform::{Platform, SelectedAsset};
pub use update::{UpdateChecker, UpdateStatus};

use crate::core::progress::DownloadProgress;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Canonical host for plugin repositories
pub const DEFAULT_HOST: &str = "github.com";
/// Owner assumed for bare plugin names
pub const DEFAULT_OWNER: &str = "kaytu-io";
/// Repository-name convention for plugins
pub const PLUGIN_REPO_PREFIX: &str = "plugin-";
/// Repository of the host binary
pub const HOST_OWNER: &str = "kaytu-io";
pub const HOST_REPO: &str = "kaytu";

/// A downloadable file attached to a release
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub browser_download_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// `owner/repo` on a release host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryRef {
    pub owner: String,
    pub repo: String,
}

impl RepositoryRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Normalise a user-supplied plugin address
    ///
    /// `aws` becomes `kaytu-io/plugin-aws`; `github.com/acme/plugin-x` and
    /// `acme/plugin-x` are taken as given.
    pub fn from_plugin_address(address: &str) -> Option<Self> {
        let address = address.trim().trim_end_matches('/');
        let address = address
            .strip_prefix("https://")
            .or_else(|| address.strip_prefix("http://"))
            .unwrap_or(address);
        if address.is_empty() {
            return None;
        }

        let path = match address.strip_prefix(DEFAULT_HOST) {
            Some(rest) => rest.strip_prefix('/')?,
            None if address.contains('/') => address,
            None => {
                return Some(Self::new(
                    DEFAULT_OWNER,
                    format!("{PLUGIN_REPO_PREFIX}{address}"),
                ))
            }
        };

        let (owner, repo) = path.split_once('/')?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return None;
        }
        Some(Self::new(owner, repo))
    }

    /// Short plugin name: the repository without the `plugin-` prefix
    pub fn plugin_name(&self) -> &str {
        self.repo
            .strip_prefix(PLUGIN_REPO_PREFIX)
            .filter(|rest| !rest.is_empty())
            .unwrap_or(&self.repo)
    }

    /// `owner/repo`, the form used by the approved-plugins list
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl std::fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", DEFAULT_HOST, self.owner, self.repo)
    }
}

/// Source of releases and release assets
#[async_trait]
pub trait ReleaseIndex: Send + Sync {
    /// Latest published release of a repository
    async fn latest_release(
        &self,
        repo: &RepositoryRef,
        auth_token: Option<&str>,
    ) -> ReleaseResult<Release>;

    /// Stream an asset into `dest`, reporting bytes to `progress`
    async fn download_asset(
        &self,
        repo: &RepositoryRef,
        asset: &Asset,
        auth_token: Option<&str>,
        dest: &mut tokio::fs::File,
        progress: &mut DownloadProgress,
    ) -> ReleaseResult<u64>;

    /// `owner/repo` entries of plugins approved for install
    async fn approved_plugins(&self, auth_token: Option<&str>) -> ReleaseResult<Vec<String>>;
}
