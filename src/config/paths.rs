//! Filesystem layout under `~/.kaytu`

use super::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};

const ROOT_DIR: &str = ".kaytu";
const PLUGINS_DIR: &str = "plugins";
const LOGS_DIR: &str = "logs";
const CONFIG_FILE: &str = "kaytu-config.json";

/// Resolves every location the host reads or writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KaytuPaths {
    root: PathBuf,
}

impl KaytuPaths {
    /// Layout rooted at an arbitrary directory (tests use a temp dir)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout rooted at `${home}/.kaytu`
    pub fn from_home() -> ConfigResult<Self> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDirectory)?;
        Ok(Self::new(home.join(ROOT_DIR)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join(PLUGINS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Plugin names may contain `/`; files are named with `_` instead
    pub fn file_stem(plugin_name: &str) -> String {
        plugin_name.replace('/', "_")
    }

    pub fn plugin_executable(&self, plugin_name: &str, extension: &str) -> PathBuf {
        let mut file = Self::file_stem(plugin_name);
        file.push_str(extension);
        self.plugins_dir().join(file)
    }

    pub fn stdout_log(&self, plugin_name: &str) -> PathBuf {
        self.logs_dir()
            .join(format!("{}.out.logs", Self::file_stem(plugin_name)))
    }

    pub fn stderr_log(&self, plugin_name: &str) -> PathBuf {
        self.logs_dir()
            .join(format!("{}.err.logs", Self::file_stem(plugin_name)))
    }
}
