//! Release index error types

pub type ReleaseResult<T> = std::result::Result<T, ReleaseError>;

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("failed to write download: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}
