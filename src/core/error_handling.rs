//! Error reporting for the CLI boundary
//!
//! Errors the operator can act on (a missing plugin, an expired login) are
//! printed as they are; internal failures get a generic line with the detail
//! kept at debug level.

/// Errors that know whether their message is meant for the operator
///
/// When `is_user_actionable()` is true, `user_message()` must return `Some`.
pub trait ContextualError: std::error::Error {
    fn is_user_actionable(&self) -> bool;

    fn user_message(&self) -> Option<String>;
}

/// Log a fatal error with the level of detail its kind calls for
pub fn log_error_with_context<E: ContextualError + std::fmt::Debug>(
    error: &E,
    operation_context: &str,
) {
    match error.user_message().filter(|_| error.is_user_actionable()) {
        Some(message) => log::error!("FATAL: {}", message),
        None => log::error!("FATAL: {}: {}", operation_context, error),
    }
    log::debug!("DEBUG_DETAILS: {:?}", error);
}

/// Text shown to the operator on stderr for a failed command
pub fn operator_message<E: ContextualError>(error: &E, operation_context: &str) -> String {
    match error.user_message().filter(|_| error.is_user_actionable()) {
        Some(message) => message,
        None => format!("{operation_context}: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum SampleError {
        #[error("plugin not found")]
        Missing,
        #[error("socket reset")]
        Internal,
    }

    impl ContextualError for SampleError {
        fn is_user_actionable(&self) -> bool {
            matches!(self, SampleError::Missing)
        }

        fn user_message(&self) -> Option<String> {
            self.is_user_actionable().then(|| self.to_string())
        }
    }

    #[test]
    fn test_user_actionable_error_shows_specific_message() {
        assert_eq!(
            operator_message(&SampleError::Missing, "Install"),
            "plugin not found"
        );
    }

    #[test]
    fn test_system_error_gets_context() {
        assert_eq!(
            operator_message(&SampleError::Internal, "Running scan"),
            "Running scan: socket reset"
        );
    }
}
