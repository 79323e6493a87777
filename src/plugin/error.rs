//! Plugin Host Error Handling
//!
//! One variant per failure kind the host surfaces. Session-scoped kinds
//! (transport, protocol, plugin) never affect other sessions.

use crate::config::ConfigError;
use crate::core::error_handling::ContextualError;
use crate::plugin::registry::WaitError;
use crate::protocol::TransportError;
use crate::release::ReleaseError;
use std::time::Duration;

/// Result type alias for plugin host operations
pub type HostResult<T> = std::result::Result<T, HostError>;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Stream to one plugin broke
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Plugin violated message ordering
    #[error("protocol error from '{plugin}': {message}")]
    Protocol { plugin: String, message: String },

    /// Release index or download failure
    #[error("network error: {0}")]
    Network(#[from] ReleaseError),

    #[error("no release asset of {plugin} matches platform {platform}")]
    PlatformUnsupported { plugin: String, platform: String },

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("VersionMismatch: plugin '{plugin}' requires host {required}, running {host}")]
    VersionMismatch {
        plugin: String,
        required: String,
        host: String,
    },

    #[error("failed to start plugin '{plugin}': {source}")]
    Spawn {
        plugin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Config store failure, including an expired access token
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Forwarded from a plugin's `Error` message
    #[error("plugin '{plugin}' reported: {message}")]
    Plugin { plugin: String, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("plugin {0} is not approved; use --unsafe or request approval on github.com/kaytu-io/kaytu")]
    NotApproved(String),

    #[error("command '{0}' requires login; please log in first")]
    LoginRequired(String),

    #[error("invalid plugin address '{0}'")]
    InvalidAddress(String),

    #[error("the plugin server is not listening; call start_server first")]
    NotListening,
}

impl HostError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        HostError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn protocol(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        HostError::Protocol {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Map a failed registration wait for `name`
    pub(crate) fn registration_wait(name: &str, waited: Duration, error: WaitError) -> Self {
        match error {
            WaitError::TimedOut => HostError::Timeout {
                what: format!("plugin '{name}' to register"),
                waited,
            },
            WaitError::Rejected(rejection) => HostError::VersionMismatch {
                plugin: rejection.plugin,
                required: rejection.required,
                host: rejection.host,
            },
        }
    }

    /// Short kind name, stable across message wording changes
    pub fn kind(&self) -> &'static str {
        match self {
            HostError::Transport(_) => "TransportError",
            HostError::Protocol { .. } => "ProtocolError",
            HostError::Network(_) => "NetworkError",
            HostError::PlatformUnsupported { .. } => "PlatformUnsupported",
            HostError::Timeout { .. } => "Timeout",
            HostError::VersionMismatch { .. } => "VersionMismatch",
            HostError::Spawn { .. } => "SpawnError",
            HostError::Io { .. } => "IOError",
            HostError::Config(ConfigError::TokenExpired { .. }) => "TokenExpired",
            HostError::Config(_) => "IOError",
            HostError::Plugin { .. } => "PluginError",
            HostError::NotFound(_) => "NotFound",
            HostError::NotApproved(_) => "NotApproved",
            HostError::LoginRequired(_) => "LoginRequired",
            HostError::InvalidAddress(_) => "InvalidAddress",
            HostError::NotListening => "NotListening",
        }
    }
}

impl ContextualError for HostError {
    fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            HostError::PlatformUnsupported { .. }
                | HostError::Timeout { .. }
                | HostError::VersionMismatch { .. }
                | HostError::Plugin { .. }
                | HostError::NotFound(_)
                | HostError::NotApproved(_)
                | HostError::LoginRequired(_)
                | HostError::InvalidAddress(_)
                | HostError::Config(ConfigError::TokenExpired { .. })
        )
    }

    fn user_message(&self) -> Option<String> {
        self.is_user_actionable().then(|| self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_version_mismatch_message_names_kind() {
        let err = HostError::VersionMismatch {
            plugin: "my-plugin".into(),
            required: "v9.9.9".into(),
            host: "v0.1.0".into(),
        };
        assert!(err.to_string().starts_with("VersionMismatch"));
        assert_eq!(err.kind(), "VersionMismatch");
        assert!(err.is_user_actionable());
    }

    #[test]
    fn test_token_expired_is_classified() {
        let err = HostError::from(ConfigError::TokenExpired {
            config: Box::new(Config::default()),
        });
        assert_eq!(err.kind(), "TokenExpired");
        assert!(err.user_message().is_some());
    }

    #[test]
    fn test_io_errors_are_not_user_actionable() {
        let err = HostError::io(
            "plugin log",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), "IOError");
        assert!(!err.is_user_actionable());
        assert_eq!(err.user_message(), None);
    }
}
