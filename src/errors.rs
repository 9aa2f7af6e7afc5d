use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("INVALID_ORDER: {0}")]
    InvalidOrder(String),
    #[error("NEIGHBOR_NOT_FOUND: {0}")]
    NeighborNotFound(String),
    #[error("STORE_UNAVAILABLE: {0}")]
    StoreUnavailable(String),
    #[error("INVALID_KEY: {0}")]
    InvalidKey(String),
    #[error("CANCELLED: {0}")]
    Cancelled(String),
    #[error("CONFIG: {0}")]
    Config(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl OrderError {
    /// Errors caused by stale or malformed request data. The API layer answers
    /// these with a client error so the caller refetches; everything else is a
    /// server error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidOrder(_) | Self::NeighborNotFound(_) | Self::InvalidKey(_)
        )
    }
}

impl From<std::io::Error> for OrderError {
    fn from(value: std::io::Error) -> Self {
        Self::StoreUnavailable(value.to_string())
    }
}

impl From<rusqlite::Error> for OrderError {
    fn from(value: rusqlite::Error) -> Self {
        Self::StoreUnavailable(value.to_string())
    }
}

impl From<serde_json::Error> for OrderError {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value.to_string())
    }
}

pub type OrderResult<T> = Result<T, OrderError>;

#[cfg(test)]
mod tests {
    use super::OrderError;

    #[test]
    fn display_carries_code_prefix() {
        let err = OrderError::NeighborNotFound("item 42".to_string());
        assert_eq!(err.to_string(), "NEIGHBOR_NOT_FOUND: item 42");
    }

    #[test]
    fn stale_request_errors_are_client_errors() {
        assert!(OrderError::InvalidOrder("x".to_string()).is_client_error());
        assert!(OrderError::NeighborNotFound("x".to_string()).is_client_error());
        assert!(OrderError::InvalidKey("x".to_string()).is_client_error());
        assert!(!OrderError::StoreUnavailable("x".to_string()).is_client_error());
        assert!(!OrderError::Cancelled("x".to_string()).is_client_error());
    }

    #[test]
    fn sqlite_failures_surface_as_store_unavailable() {
        let err: OrderError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, OrderError::StoreUnavailable(_)));
    }
}
