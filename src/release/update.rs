//! Host update check
//!
//! Records the newest published host version in the config file at most once
//! per week and reports when it is ahead of the running binary.

use super::error::ReleaseResult;
use super::platform::Platform;
use super::{ReleaseIndex, RepositoryRef, HOST_OWNER, HOST_REPO};
use crate::config::ConfigStore;
use crate::core::version::is_newer;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Minimum time between two queries of the release index
pub const CHECK_INTERVAL_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate,
    Available { version: String },
    /// Checked recently; the index was not queried
    Skipped,
}

pub struct UpdateChecker {
    store: ConfigStore,
    index: Arc<dyn ReleaseIndex>,
    platform: Platform,
    current_version: String,
}

impl UpdateChecker {
    pub fn new(
        store: ConfigStore,
        index: Arc<dyn ReleaseIndex>,
        current_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            index,
            platform: Platform::current(),
            current_version: current_version.into(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub async fn check(&self, now: DateTime<Utc>) -> ReleaseResult<UpdateStatus> {
        let mut config = self.store.load_lenient().await?;

        if is_newer(&config.last_version, &self.current_version) {
            return Ok(UpdateStatus::Available {
                version: config.last_version,
            });
        }

        let recently_checked = config
            .last_update_check
            .is_some_and(|at| at > now - Duration::days(CHECK_INTERVAL_DAYS));
        if recently_checked {
            log::debug!("UpdateChecker: last check is recent, skipping");
            return Ok(UpdateStatus::Skipped);
        }

        let release = self
            .index
            .latest_release(&RepositoryRef::new(HOST_OWNER, HOST_REPO), None)
            .await?;
        let Some(selected) = self.platform.select_host_asset(&release.assets) else {
            log::debug!(
                "UpdateChecker: release {} has no asset for {}",
                release.tag_name,
                self.platform
            );
            return Ok(UpdateStatus::UpToDate);
        };

        config.last_version = selected.version.clone();
        config.last_update_check = Some(now);
        self.store.save(&config).await?;

        if is_newer(&selected.version, &self.current_version) {
            Ok(UpdateStatus::Available {
                version: selected.version,
            })
        } else {
            Ok(UpdateStatus::UpToDate)
        }
    }
}
