use crate::models::ProviderKind;
use thiserror::Error;

fn display_name(kind: &ProviderKind) -> &'static str {
    kind.display_name()
}

/// Convenience type alias for Results with WopaError
pub type Result<T> = std::result::Result<T, WopaError>;

/// Main error type for the WOPA orchestration core
///
/// Covers the tier-independent taxonomy: validation, transport,
/// provider availability/protocol failures, task-store violations,
/// cancellation, and internal faults.
#[derive(Error, Debug)]
pub enum WopaError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{} unavailable", display_name(.kind))]
    ProviderUnavailable { kind: ProviderKind },

    #[error("Provider protocol error: {0}")]
    ProviderProtocol(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Task already exists: {0}")]
    TaskExists(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl WopaError {
    /// Human-readable message safe to return to clients. Never leaks
    /// endpoints, payloads, or stack context.
    pub fn user_message(&self) -> String {
        match self {
            WopaError::Validation(msg) => msg.clone(),
            WopaError::ProviderUnavailable { kind } => {
                format!("{} unavailable", kind.display_name())
            }
            WopaError::Transport(_) | WopaError::Timeout { .. } => {
                "Analysis backend unavailable".to_string()
            }
            WopaError::ProviderProtocol(_) => "Analysis backend returned invalid data".to_string(),
            WopaError::TaskNotFound(_) => "Task not found".to_string(),
            WopaError::Cancelled => "cancelled".to_string(),
            WopaError::Worker { message } => message.clone(),
            _ => "Internal error occurred".to_string(),
        }
    }

    /// True for errors eligible for the single provider-boundary retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WopaError::Transport(_) | WopaError::Timeout { .. })
    }

    /// Short kind tag recorded on failed check records.
    pub fn kind(&self) -> &'static str {
        match self {
            WopaError::Validation(_) => "validation",
            WopaError::Transport(_) => "transport",
            WopaError::Timeout { .. } => "timeout",
            WopaError::ProviderUnavailable { .. } => "provider_unavailable",
            WopaError::ProviderProtocol(_) => "protocol",
            WopaError::Cancelled => "cancelled",
            _ => "internal",
        }
    }
}
