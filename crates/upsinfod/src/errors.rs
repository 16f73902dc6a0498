//! Error types for the poller and the accessory registry.

use std::time::Duration;

/// Failures that end a poll cycle early.
///
/// Every variant is absorbed by the refresh loop: it is logged and the next
/// cycle is scheduled as usual.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("No SSH host configured")]
    MissingHost,

    #[error("Connection timed out after {}ms", .0.as_millis())]
    ConnectTimeout(Duration),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Authentication rejected for user '{0}'")]
    Authentication(String),

    #[error("Command failed: {0}")]
    Execution(String),

    #[error("Command timed out after {}ms", .0.as_millis())]
    CommandTimeout(Duration),
}

impl PollError {
    /// True for failures raised before a session existed.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            PollError::MissingHost
                | PollError::ConnectTimeout(_)
                | PollError::Connection(_)
                | PollError::Authentication(_)
        )
    }
}

impl From<russh::Error> for PollError {
    fn from(err: russh::Error) -> Self {
        PollError::Connection(err.to_string())
    }
}

/// Accessory registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Accessory '{accessory}' already registered by plugin '{plugin}'")]
    Duplicate { plugin: String, accessory: String },

    #[error("No plugin registered accessory '{0}'")]
    UnknownAccessory(String),

    #[error("Failed to construct accessory '{accessory}': {reason}")]
    Construction { accessory: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_in_millis() {
        let err = PollError::ConnectTimeout(Duration::from_millis(5000));
        assert_eq!(err.to_string(), "Connection timed out after 5000ms");
    }

    #[test]
    fn test_connection_vs_execution_classification() {
        assert!(PollError::MissingHost.is_connection_failure());
        assert!(PollError::Authentication("admin".into()).is_connection_failure());
        assert!(!PollError::Execution("broken pipe".into()).is_connection_failure());
        assert!(!PollError::CommandTimeout(Duration::from_secs(1)).is_connection_failure());
    }
}
