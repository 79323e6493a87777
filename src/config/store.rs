//! Config file persistence

use super::error::{ConfigError, ConfigResult};
use super::paths::KaytuPaths;
use super::token;
use crate::protocol::{CommandDescriptor, RegisterConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persistable record of an installed plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub provider: String,
    pub path: PathBuf,
    pub commands: Vec<CommandDescriptor>,
}

impl PluginDescriptor {
    /// Descriptor for a plugin that registered with `config`
    pub fn from_registration(config: &RegisterConfig, path: impl Into<PathBuf>) -> Self {
        Self {
            name: config.name.clone(),
            version: config.version.clone(),
            provider: config.provider.clone(),
            path: path.into(),
            commands: config.commands.clone(),
        }
    }

    pub fn command(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.iter().find(|c| c.name == name)
    }
}

/// Contents of `kaytu-config.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "access-token", default)]
    pub access_token: String,

    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,

    #[serde(
        rename = "lastUpdateCheck",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_update_check: Option<DateTime<Utc>>,

    #[serde(rename = "lastVersion", default)]
    pub last_version: String,
}

impl Config {
    pub fn plugin(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|p| p.name == name)
    }

    /// First installed plugin that advertises `command`
    pub fn plugin_for_command(&self, command: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|p| p.command(command).is_some())
    }

    /// Insert or replace by name, keeping the position of a replaced entry
    pub fn upsert_plugin(&mut self, descriptor: PluginDescriptor) -> Option<PluginDescriptor> {
        match self.plugins.iter_mut().find(|p| p.name == descriptor.name) {
            Some(existing) => Some(std::mem::replace(existing, descriptor)),
            None => {
                self.plugins.push(descriptor);
                None
            }
        }
    }

    pub fn remove_plugin(&mut self, name: &str) -> Option<PluginDescriptor> {
        let index = self.plugins.iter().position(|p| p.name == name)?;
        Some(self.plugins.remove(index))
    }

    pub fn is_logged_in(&self) -> bool {
        !self.access_token.is_empty()
    }
}

/// Handle onto the on-disk config file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_paths(paths: &KaytuPaths) -> Self {
        Self::new(paths.config_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted config; a missing file yields the default
    ///
    /// An expired access token is reported as [`ConfigError::TokenExpired`]
    /// carrying the config with the token already cleared.
    pub async fn load(&self) -> ConfigResult<Config> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("ConfigStore: no config at {}", self.path.display());
                return Ok(Config::default());
            }
            Err(e) => return Err(ConfigError::io(&self.path, e)),
        };

        let mut config: Config =
            serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;

        if !config.access_token.is_empty() && token::is_expired(&config.access_token, Utc::now())? {
            log::info!("ConfigStore: access token has expired");
            config.access_token.clear();
            return Err(ConfigError::TokenExpired {
                config: Box::new(config),
            });
        }

        Ok(config)
    }

    /// Like [`load`](Self::load) but folds an expired token into the result
    pub async fn load_lenient(&self) -> ConfigResult<Config> {
        match self.load().await {
            Err(ConfigError::TokenExpired { config }) => Ok(*config),
            other => other,
        }
    }

    /// Atomically replace the persisted config
    pub async fn save(&self, config: &Config) -> ConfigResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::io(parent, e))?;
        }

        let data = serde_json::to_vec_pretty(config).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| ConfigError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ConfigError::io(&self.path, e))?;

        log::debug!(
            "ConfigStore: saved {} plugin(s) to {}",
            config.plugins.len(),
            self.path.display()
        );
        Ok(())
    }

    pub async fn remove(&self) -> ConfigResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ConfigError::NotFound(self.path.clone()))
            }
            Err(e) => Err(ConfigError::io(&self.path, e)),
        }
    }
}
