//! Configuration error types

use super::store::Config;
use std::path::PathBuf;

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("config file {0} not found")]
    NotFound(PathBuf),

    /// The stored access token is past its `exp` claim. The carried config
    /// already has the token cleared.
    #[error("access token expired, please log in again")]
    TokenExpired { config: Box<Config> },

    #[error("access token is malformed: {0}")]
    MalformedToken(String),

    #[error("could not determine the home directory")]
    NoHomeDirectory,
}

impl ConfigError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.into(),
            source,
        }
    }
}
