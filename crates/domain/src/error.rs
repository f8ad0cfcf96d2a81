use uuid::Uuid;

/// A short-ID prefix match reported back to the caller so it can retry with
/// a longer prefix or the full UUID.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PrefixCandidate {
    pub id: Uuid,
    #[serde(rename = "created-at")]
    pub created_at: u64,
}

/// Shared error type used across all Hi-Boss crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation: {0}")]
    Validation(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous prefix '{prefix}' matches {} records", candidates.len())]
    AmbiguousPrefix {
        prefix: String,
        candidates: Vec<PrefixCandidate>,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("adapter {platform}: {message}")]
    Adapter {
        platform: String,
        message: String,
        /// Platform-specific detail (e.g. a remote error payload).
        detail: Option<serde_json::Value>,
    },

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("storage: {0}")]
    Storage(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Stable kebab-case kind string, part of the RPC error contract.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation-error",
            Error::Auth(_) => "auth-error",
            Error::PermissionDenied(_) => "permission-denied",
            Error::NotFound(_) => "not-found",
            Error::AmbiguousPrefix { .. } => "ambiguous-prefix",
            Error::Conflict(_) => "conflict",
            Error::Invariant(_) => "invariant-violation",
            Error::Adapter { .. } => "adapter-error",
            Error::Provider { .. } => "provider-error",
            Error::Cancelled => "cancelled",
            Error::Io(_) | Error::Json(_) | Error::Storage(_) | Error::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
