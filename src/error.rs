use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainLensError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("CI server '{server}' is unavailable: {reason}")]
    UpstreamUnavailable { server: String, reason: String },

    #[error("No access to CI server '{0}' with the provided credentials")]
    Unauthorized(String),

    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChainLensError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn upstream(server: impl Into<String>, reason: impl ToString) -> Self {
        Self::UpstreamUnavailable {
            server: server.into(),
            reason: reason.to_string(),
        }
    }

    /// Copy of this error for another waiter on the same failed load.
    ///
    /// Wrapped library errors are not cloneable and become `Task` with the
    /// original message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::NotFound { entity, id } => Self::NotFound {
                entity: *entity,
                id: id.clone(),
            },
            Self::UpstreamUnavailable { server, reason } => Self::UpstreamUnavailable {
                server: server.clone(),
                reason: reason.clone(),
            },
            Self::Unauthorized(server) => Self::Unauthorized(server.clone()),
            Self::Api { status, message } => Self::Api {
                status: *status,
                message: message.clone(),
            },
            Self::Config(message) => Self::Config(message.clone()),
            Self::Task(message) => Self::Task(message.clone()),
            other => Self::Task(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainLensError>;

/// Data dropped from a result without failing it.
///
/// Recorded when a sub-build, a log-analysis step or a tracked entry could not
/// be loaded and the aggregate was completed without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialDataWarning {
    pub entity: String,
    pub reason: String,
}

impl PartialDataWarning {
    pub fn new(entity: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            entity: entity.into(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for PartialDataWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.entity, self.reason)
    }
}
