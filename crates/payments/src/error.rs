//! Error types for the payment and quota subsystem

use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

/// Errors surfaced by the payment intent, reconciliation, and quota paths.
///
/// The retryable/non-retryable split drives two behaviors: the poll path's
/// bounded retry loop only retries retryable errors, and the webhook HTTP
/// handler maps retryable errors to a non-2xx status so the provider's own
/// redelivery mechanism compensates.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Bad input from the caller. Not retryable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Provider returned an error or an unusable response. Retryable.
    #[error("payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider or datastore call exceeded its deadline. Retryable.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Unknown invoice or report. Not retryable - an intent must exist
    /// before any completion signal can reference it, so this usually
    /// means an ordering or data-integrity bug.
    #[error("not found: {0}")]
    NotFound(String),

    /// Business rule: the user has no quota unit to spend.
    #[error("insufficient quota (balance: {balance})")]
    InsufficientQuota { balance: i64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    /// Whether a retry (with backoff) can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentError::ProviderUnavailable(_)
                | PaymentError::Timeout(_)
                | PaymentError::Database(_)
        )
    }
}

impl From<sqlx::Error> for PaymentError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => PaymentError::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut => {
                PaymentError::Timeout("database pool acquire timed out".to_string())
            }
            other => PaymentError::Database(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PaymentError::Timeout(err.to_string())
        } else {
            PaymentError::ProviderUnavailable(err.to_string())
        }
    }
}
