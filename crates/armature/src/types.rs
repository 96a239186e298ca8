use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No exact or arity-compatible method candidate was found.
    #[error("method not found: {signature}")]
    MethodNotFound { signature: String },

    /// The target method raised during execution. Captured and reported,
    /// never propagated as a crash of the processing loop.
    #[error("invocation of '{method}' failed: {reason}")]
    Invocation { method: String, reason: String },

    /// More than one registered method carries the same exact signature.
    #[error("ambiguous method match: {signature}")]
    AmbiguousMatch { signature: String },

    /// A blocking wait or mailbox take was unblocked by shutdown.
    #[error("cancelled")]
    Cancelled,

    /// A reservation merge hit conflicting non-null fields. Resolved by
    /// first-writer-wins; surfaced through logs, never fatal.
    #[error("reservation conflict at '{key}': '{field}' is already bound")]
    ReservationConflict { key: String, field: &'static str },

    /// A peer key has no reservation and no default type.
    #[error("peer resolution failed for '{key}': no reservation and no default type")]
    PeerResolution { key: String },

    /// The service registry collaborator rejected a request.
    #[error("registry error: {0}")]
    Registry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Severity of a published status event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

/// Structured status event. Per-message failures are surfaced to observers
/// through these rather than thrown across service boundaries, since callers
/// live on other tasks and cannot catch anything synchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    /// Name of the service that produced the status
    pub name: String,
    pub level: StatusLevel,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl Status {
    pub fn info(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, StatusLevel::Info, detail)
    }

    pub fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, StatusLevel::Warn, detail)
    }

    pub fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, StatusLevel::Error, detail)
    }

    fn new(name: impl Into<String>, level: StatusLevel, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            level,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == StatusLevel::Error
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}: {}", self.level, self.name, self.detail)
    }
}
