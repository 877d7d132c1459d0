//! Error taxonomy for the menu sync engine.
//!
//! Transport failures (connect, timeout, unexpected status) are retryable.
//! Validation and authorization failures surface immediately and need the
//! user to act. Referential-integrity violations are raised before any
//! network call is made.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("Cannot reach menu server at {url}")]
    Connect { url: String },

    #[error("Connection to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Network error communicating with {url}: {message}")]
    Network { url: String, message: String },

    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("Invalid menu data: {0}")]
    Validation(String),

    #[error("Admin session is missing or expired, sign in again")]
    Unauthorized,

    #[error("Category \"{category_id}\" is still used by {product_count} product(s)")]
    CategoryInUse {
        category_id: String,
        product_count: usize,
    },

    #[error("A category named \"{0}\" already exists")]
    DuplicateCategoryName(String),

    #[error("{entity} \"{id}\" not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Local cache error: {0}")]
    Cache(String),

    #[error("Credential store error: {0}")]
    Credentials(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Menu sync engine has been shut down")]
    ShutDown,
}

impl SyncError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Connect { .. }
                | SyncError::Timeout { .. }
                | SyncError::Network { .. }
                | SyncError::Status { .. }
        )
    }

    /// Errors that leave the client unable to write until the admin logs in again.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SyncError::Unauthorized)
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Cache(err.to_string())
    }
}

impl From<keyring::Error> for SyncError {
    fn from(err: keyring::Error) -> Self {
        SyncError::Credentials(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(SyncError::Connect {
            url: "https://menu.example".into()
        }
        .is_retryable());
        assert!(SyncError::Timeout {
            url: "https://menu.example".into(),
            timeout_ms: 5_000
        }
        .is_retryable());
        assert!(SyncError::Status {
            status: 503,
            message: "Menu server error".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_user_errors_are_not_retryable() {
        assert!(!SyncError::Validation("missing field `products`".into()).is_retryable());
        assert!(!SyncError::Unauthorized.is_retryable());
        assert!(!SyncError::CategoryInUse {
            category_id: "cat-1".into(),
            product_count: 2
        }
        .is_retryable());
        assert!(SyncError::Unauthorized.is_auth_failure());
    }

    #[test]
    fn test_messages_are_user_facing() {
        let err = SyncError::CategoryInUse {
            category_id: "cat-1".into(),
            product_count: 3,
        };
        assert_eq!(
            err.to_string(),
            "Category \"cat-1\" is still used by 3 product(s)"
        );
        assert_eq!(
            SyncError::DuplicateCategoryName("Pães".into()).to_string(),
            "A category named \"Pães\" already exists"
        );
    }
}
