//! Transport error types

/// Result type alias for stream operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Failures on a single `Register` stream
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("stream I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("stream closed")]
    Closed,

    /// The outbound buffer is full; the peer is not draining its stream
    #[error("send buffer full ({capacity} messages pending)")]
    Backpressure { capacity: usize },

    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("unsupported stream method '{0}'")]
    UnknownMethod(String),
}

impl TransportError {
    /// True when the error means the peer went away rather than misbehaved
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Closed => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
