use thiserror::Error;

/// Errors from backing-store operations (used by the task store and its backends).
///
/// Every variant carries the diagnostic message of the underlying failure and
/// maps to a stable machine-readable code via [`RepositoryError::code`].
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("save failed: {0}")]
    SaveFailed(String),

    #[error("update failed: {0}")]
    UpdateFailed(String),

    #[error("delete failed: {0}")]
    DeleteFailed(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("backing store connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RepositoryError {
    /// Stable error code, suitable for logs and API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            RepositoryError::SaveFailed(_) => "SAVE_FAILED",
            RepositoryError::UpdateFailed(_) => "UPDATE_FAILED",
            RepositoryError::DeleteFailed(_) => "DELETE_FAILED",
            RepositoryError::Query(_) => "QUERY_FAILED",
            RepositoryError::Connection(_) => "CONNECTION_FAILED",
            RepositoryError::Serialization(_) => "SERIALIZATION_FAILED",
        }
    }
}
