//! Plugin SDK errors

use crate::protocol::TransportError;

pub type SdkResult<T> = std::result::Result<T, SdkError>;

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("could not connect to host at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no host address given; start the plugin with --server <host:port>")]
    MissingServerAddress,

    /// Failure reported by plugin code; becomes a job's failure message
    #[error("{0}")]
    Process(String),

    #[error("job queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("job queue is closed")]
    QueueClosed,
}

impl SdkError {
    pub fn process(message: impl Into<String>) -> Self {
        SdkError::Process(message.into())
    }
}

impl crate::core::error_handling::ContextualError for SdkError {
    fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            SdkError::MissingServerAddress | SdkError::Connect { .. }
        )
    }

    fn user_message(&self) -> Option<String> {
        self.is_user_actionable().then(|| self.to_string())
    }
}
