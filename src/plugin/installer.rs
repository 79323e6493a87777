//! Plugin Installer
//!
//! Resolves a plugin address to its latest release, downloads the asset for
//! this platform next to the previous executable, starts it and waits for it
//! to register before recording it in the config file. Any failure after the
//! download restores the previous executable.

use crate::config::PluginDescriptor;
use crate::core::progress::{spin_while, DownloadProgress};
use crate::core::retry::{retry_async, RetryPolicy};
use crate::plugin::error::{HostError, HostResult};
use crate::plugin::manager::HostShared;
use crate::plugin::session::{PluginSession, SessionId};
use crate::release::{Platform, ReleaseError, ReleaseIndex, RepositoryRef};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How long a freshly started plugin has to send `RegisterConfig`
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Always installable without consulting the approved list
pub const BUILTIN_APPROVED: &str = "kaytu-io/plugin-aws";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallRequest {
    pub address: String,
    /// Token for the release host, for private repositories and rate limits
    pub auth_token: Option<String>,
    pub allow_unapproved: bool,
    /// Record a plugin started by hand instead of downloading one
    pub debug_mode: bool,
}

impl InstallRequest {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstallOutcome {
    Installed(PluginDescriptor),
    /// The same version is already installed; nothing changed
    AlreadyInstalled(PluginDescriptor),
}

impl InstallOutcome {
    pub fn descriptor(&self) -> &PluginDescriptor {
        match self {
            InstallOutcome::Installed(d) | InstallOutcome::AlreadyInstalled(d) => d,
        }
    }
}

pub(crate) struct Installer {
    index: Arc<dyn ReleaseIndex>,
    platform: Platform,
    registration_timeout: Duration,
    retry: RetryPolicy,
}

fn is_transient(error: &ReleaseError) -> bool {
    match error {
        ReleaseError::Network { .. } => true,
        ReleaseError::Status { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl Installer {
    pub(crate) fn new(
        index: Arc<dyn ReleaseIndex>,
        platform: Platform,
        registration_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            index,
            platform,
            registration_timeout,
            retry,
        }
    }

    pub(crate) async fn install(
        &self,
        shared: &HostShared,
        server_addr: &str,
        request: &InstallRequest,
    ) -> HostResult<InstallOutcome> {
        let repo = RepositoryRef::from_plugin_address(&request.address)
            .ok_or_else(|| HostError::InvalidAddress(request.address.clone()))?;
        let auth = request.auth_token.as_deref();
        let name = repo.plugin_name().to_string();
        let full_name = repo.full_name();
        log::debug!("Installer: resolved '{}' to {} ({})", request.address, repo, name);

        if !request.allow_unapproved {
            self.ensure_approved(&full_name, auth).await?;
        }

        let mut config = shared.store.load_lenient().await?;

        if request.debug_mode {
            let session = self.await_registration(shared, &name, &full_name, 0).await?;
            let path = config
                .plugin(session.name())
                .map(|d| d.path.clone())
                .unwrap_or_default();
            let descriptor = PluginDescriptor::from_registration(session.config(), path);
            config.upsert_plugin(descriptor.clone());
            shared.store.save(&config).await?;
            log::info!("Installer: recorded debug plugin '{}'", descriptor.name);
            return Ok(InstallOutcome::Installed(descriptor));
        }

        let release = retry_async(
            "latest_release",
            self.retry.clone(),
            is_transient,
            || self.index.latest_release(&repo, auth),
        )
        .await?;
        let selected = self
            .platform
            .select_plugin_asset(&release.assets)
            .ok_or_else(|| HostError::PlatformUnsupported {
                plugin: full_name.clone(),
                platform: self.platform.to_string(),
            })?;

        let installed = config.plugin(&name).or_else(|| config.plugin(&full_name));
        if let Some(existing) = installed.filter(|d| d.version == selected.version) {
            log::info!(
                "Installer: {} {} is already installed",
                existing.name,
                existing.version
            );
            return Ok(InstallOutcome::AlreadyInstalled(existing.clone()));
        }

        let target = shared.paths.plugin_executable(&name, &selected.extension);
        log::info!("Installer: installing {} {}", full_name, selected.version);
        let staged = self
            .download(shared, &repo, selected.asset, auth, &target)
            .await?;

        let backup = sibling(&target, ".previous");
        let had_previous = swap_into_place(&staged, &target, &backup).await?;

        let launched = PluginDescriptor {
            name: name.clone(),
            version: selected.version.clone(),
            path: target.clone(),
            ..PluginDescriptor::default()
        };
        let session = match self.launch_and_wait(shared, server_addr, &launched, &full_name).await {
            Ok(session) => session,
            Err(e) => {
                restore_previous(&target, &backup, had_previous).await;
                return Err(e);
            }
        };

        let mut descriptor = PluginDescriptor::from_registration(session.config(), &target);
        descriptor.version = selected.version.clone();
        if descriptor.name != full_name {
            config.remove_plugin(&full_name);
        }
        config.upsert_plugin(descriptor.clone());
        if let Err(e) = shared.store.save(&config).await {
            shared.processes.stop(session.name()).await;
            restore_previous(&target, &backup, had_previous).await;
            return Err(e.into());
        }

        if had_previous {
            let _ = tokio::fs::remove_file(&backup).await;
        }
        log::info!(
            "Installer: installed {} {} at {}",
            descriptor.name,
            descriptor.version,
            target.display()
        );
        Ok(InstallOutcome::Installed(descriptor))
    }

    async fn ensure_approved(&self, full_name: &str, auth: Option<&str>) -> HostResult<()> {
        if full_name == BUILTIN_APPROVED {
            return Ok(());
        }
        let approved = retry_async(
            "approved_plugins",
            self.retry.clone(),
            is_transient,
            || self.index.approved_plugins(auth),
        )
        .await?;
        if approved.iter().any(|p| p == full_name) {
            Ok(())
        } else {
            Err(HostError::NotApproved(full_name.to_string()))
        }
    }

    /// Stream the asset to a staging file beside `target`
    async fn download(
        &self,
        shared: &HostShared,
        repo: &RepositoryRef,
        asset: &crate::release::Asset,
        auth: Option<&str>,
        target: &Path,
    ) -> HostResult<PathBuf> {
        let dir = shared.paths.plugins_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| HostError::io(format!("creating {}", dir.display()), e))?;

        let staged = sibling(target, ".download");
        let mut file = tokio::fs::File::create(&staged)
            .await
            .map_err(|e| HostError::io(format!("creating {}", staged.display()), e))?;
        let mut progress = DownloadProgress::new("Downloading the plugin", Some(asset.size));

        let result = self
            .index
            .download_asset(repo, asset, auth, &mut file, &mut progress)
            .await;
        progress.finish();
        let synced = file.sync_all().await;
        drop(file);

        let outcome = match (result, synced) {
            (Err(e), _) => Err(HostError::from(e)),
            (Ok(_), Err(e)) => Err(HostError::io(format!("writing {}", staged.display()), e)),
            (Ok(bytes), Ok(())) => {
                log::debug!("Installer: downloaded {} bytes of {}", bytes, asset.name);
                make_executable(&staged).await
            }
        };
        if let Err(e) = outcome {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }
        Ok(staged)
    }

    async fn launch_and_wait(
        &self,
        shared: &HostShared,
        server_addr: &str,
        launched: &PluginDescriptor,
        full_name: &str,
    ) -> HostResult<Arc<PluginSession>> {
        for known in [launched.name.as_str(), full_name] {
            shared.registry.clear_rejection(known).await;
            retire(shared, known).await;
        }
        let since = shared.registry.upcoming_session_id();
        shared.processes.start(launched, server_addr).await?;
        match self
            .await_registration(shared, &launched.name, full_name, since)
            .await
        {
            Ok(session) => {
                if session.name() != launched.name {
                    shared.processes.rekey(&launched.name, session.name()).await;
                }
                Ok(session)
            }
            Err(e) => {
                shared.processes.stop(&launched.name).await;
                Err(e)
            }
        }
    }

    async fn await_registration(
        &self,
        shared: &HostShared,
        name: &str,
        full_name: &str,
        since: SessionId,
    ) -> HostResult<Arc<PluginSession>> {
        let names = [name, full_name];
        let wait = shared
            .registry
            .wait_for_newer(&names, since, self.registration_timeout);
        spin_while("Waiting for plugin to load...", wait)
            .await
            .map_err(|e| HostError::registration_wait(name, self.registration_timeout, e))
    }

    /// Remove an installed plugin's descriptor and executable
    pub(crate) async fn uninstall(
        &self,
        shared: &HostShared,
        name: &str,
    ) -> HostResult<PluginDescriptor> {
        let mut config = shared.store.load_lenient().await?;
        let descriptor = config
            .remove_plugin(name)
            .ok_or_else(|| HostError::NotFound(format!("plugin {name}")))?;

        shared.processes.stop(&descriptor.name).await;
        if let Some(session) = shared.registry.get(&descriptor.name).await {
            session.terminate("plugin uninstalled");
        }

        let path = if descriptor.path.as_os_str().is_empty() {
            shared.paths.plugin_executable(&descriptor.name, "")
        } else {
            descriptor.path.clone()
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Installer: {} was already gone", path.display());
            }
            Err(e) => return Err(HostError::io(format!("removing {}", path.display()), e)),
        }

        shared.store.save(&config).await?;
        log::info!("Installer: uninstalled '{}'", descriptor.name);
        Ok(descriptor)
    }
}

/// Take the running instance of `name` out of service before its replacement starts
async fn retire(shared: &HostShared, name: &str) {
    if let Some(old) = shared.registry.get(name).await {
        if shared.registry.remove_if_same(name, old.id()).await.is_some() {
            log::debug!("Installer: retiring session {} of '{}'", old.id(), name);
            old.terminate("replaced by a new install");
        }
    }
    if let Some(jobs) = &shared.sinks().jobs {
        jobs.forget_plugin(name);
    }
    shared.processes.stop(name).await;
}

/// Move the staged file over `target`, keeping the old one at `backup`
async fn swap_into_place(staged: &Path, target: &Path, backup: &Path) -> HostResult<bool> {
    let had_previous = tokio::fs::try_exists(target).await.unwrap_or(false);
    if had_previous {
        tokio::fs::rename(target, backup)
            .await
            .map_err(|e| HostError::io(format!("backing up {}", target.display()), e))?;
    }
    if let Err(e) = tokio::fs::rename(staged, target).await {
        let _ = tokio::fs::remove_file(staged).await;
        restore_previous(target, backup, had_previous).await;
        return Err(HostError::io(format!("installing {}", target.display()), e));
    }
    Ok(had_previous)
}

async fn restore_previous(target: &Path, backup: &Path, had_previous: bool) {
    let result = if had_previous {
        tokio::fs::rename(backup, target).await
    } else {
        match tokio::fs::remove_file(target).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    };
    if let Err(e) = result {
        log::warn!("Installer: could not restore {}: {}", target.display(), e);
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> HostResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| HostError::io(format!("marking {} executable", path.display()), e))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> HostResult<()> {
    Ok(())
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("platform", &self.platform)
            .field("registration_timeout", &self.registration_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_swap_and_restore_previous_executable() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("aws");
        let staged = sibling(&target, ".download");
        let backup = sibling(&target, ".previous");
        std::fs::write(&target, b"old").unwrap();
        std::fs::write(&staged, b"new").unwrap();

        let had_previous = swap_into_place(&staged, &target, &backup).await.unwrap();
        assert!(had_previous);
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
        assert!(!staged.exists());

        restore_previous(&target, &backup, had_previous).await;
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
        assert!(!backup.exists());
    }

    #[tokio::test]
    async fn test_restore_without_previous_removes_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("gcp");
        let staged = sibling(&target, ".download");
        std::fs::write(&staged, b"new").unwrap();

        let had_previous = swap_into_place(&staged, &target, &sibling(&target, ".previous"))
            .await
            .unwrap();
        assert!(!had_previous);
        restore_previous(&target, &sibling(&target, ".previous"), had_previous).await;
        assert!(!target.exists());
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&ReleaseError::Status {
            url: "u".into(),
            status: 502
        }));
        assert!(!is_transient(&ReleaseError::Status {
            url: "u".into(),
            status: 403
        }));
        assert!(!is_transient(&ReleaseError::NotFound("x".into())));
    }

    #[test]
    fn test_outcome_exposes_descriptor() {
        let d = PluginDescriptor {
            name: "aws".into(),
            ..PluginDescriptor::default()
        };
        assert_eq!(InstallOutcome::AlreadyInstalled(d.clone()).descriptor(), &d);
    }
}
