use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("repository unavailable: {message}")]
    RepositoryUnavailable { message: String },
}

impl GraphError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::RepositoryUnavailable {
            message: message.into(),
        }
    }

    /// Only repository outages are worth retrying; every other kind is a
    /// statement about the request or the graph.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GraphError::RepositoryUnavailable { .. })
    }
}

pub type GraphResult<T> = Result<T, GraphError>;

impl From<serde_json::Error> for GraphError {
    fn from(value: serde_json::Error) -> Self {
        GraphError::unavailable(format!("payload codec: {value}"))
    }
}
