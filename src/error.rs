//! Crate-wide error type for the gateway.

use thiserror::Error;

/// Result type used throughout the gateway.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure modes the gateway can produce, one variant per abstract kind
/// in the error handling design plus the wrapper variants ambient code needs
/// when propagating filesystem and JSON failures with `?`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found: {0}")]
    ConfigNotFound(String),

    #[error("invalid JSON in {path}: {source}")]
    ConfigInvalidJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalidSchema(String),

    #[error("environment variable \"{0}\" referenced in configuration but not set")]
    EnvVarMissing(String),

    #[error("agent \"{0}\" is not recognized by the current rules")]
    UnknownAgent(String),

    #[error("access denied for agent \"{agent}\" on {resource}")]
    AccessDenied { agent: String, resource: String },

    #[error("missing required parameter agent_id")]
    MissingAgentId,

    #[error("server \"{0}\" not found in configured servers")]
    ServerNotFound(String),

    #[error("server \"{server}\" is unavailable: {reason}")]
    ServerUnavailable { server: String, reason: String },

    #[error("tool execution failed: {0}")]
    DownstreamFailure(String),

    #[error("execution timed out after {0}ms")]
    Timeout(u64),

    #[error("reload failed: {0}")]
    ReloadFailed(String),

    #[error("failed to write audit record: {0}")]
    AuditWriteFailed(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for the kinds that must terminate the process when they occur at
    /// startup (never during a reload, where the old config keeps running).
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound(_)
                | Error::ConfigInvalidJson { .. }
                | Error::ConfigInvalidSchema(_)
                | Error::EnvVarMissing(_)
        )
    }

    /// Single-line message suitable for a tool-level error or a structured
    /// `{error: ...}` response field.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_config_errors_are_fatal() {
        assert!(Error::ConfigNotFound("x".into()).is_fatal_at_startup());
        assert!(Error::EnvVarMissing("X".into()).is_fatal_at_startup());
        assert!(!Error::ServerNotFound("x".into()).is_fatal_at_startup());
        assert!(!Error::Timeout(100).is_fatal_at_startup());
    }

    #[test]
    fn user_message_is_human_readable() {
        let err = Error::ServerNotFound("postgres".into());
        assert_eq!(err.user_message(), "server \"postgres\" not found in configured servers");
    }
}
