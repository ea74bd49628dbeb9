use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Access denied")]
    Forbidden,

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Backend error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Malformed record: {0}")]
    InvalidRecord(String),

    #[error("JSON error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Realtime channel error: {0}")]
    Realtime(String),

    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Position unavailable: {0}")]
    PositionUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Missing-record failures that the upsert coordinator recovers from
    /// by falling back to a create.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }

    /// Authorization failures. Terminal for a sharing session.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Unauthorized | SyncError::Forbidden)
    }

    /// Teardown/abort signals. Never surfaced to the user.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Failures that the next scheduled tick retries implicitly.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Request(_) | SyncError::Realtime(_) => true,
            SyncError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(SyncError::NotFound("r1".into()).is_not_found());
        assert!(SyncError::Unauthorized.is_auth());
        assert!(SyncError::Forbidden.is_auth());
        assert!(SyncError::Cancelled.is_cancelled());
        assert!(SyncError::Api {
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());
        assert!(!SyncError::Api {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!SyncError::PermissionDenied.is_transient());
    }
}
