use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while synchronizing state with a provider.
///
/// The retry executor is the single place that decides whether an error
/// is worth another attempt; everything else just propagates these.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network-level error (DNS, connection, TLS, non-2xx status)
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// A single attempt exceeded its time box
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The service rejected our credentials or session token
    #[error("authentication rejected by the service")]
    Unauthorized,
    /// The operation was cancelled (account switch, shutdown)
    #[error("operation cancelled")]
    Cancelled,
    /// The service answered, but not in a shape we understand
    #[error("malformed provider response: {0}")]
    Protocol(String),
    /// Local database failure, reported through the sync surface
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Wrap a storage-layer failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Transient failures worth another attempt.
    ///
    /// Auth and protocol problems fail the same way on every retry, so
    /// the adapters exclude them; auth gets its own one-shot re-login
    /// underneath the retry layer instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_not_retryable() {
        assert!(SyncError::Cancelled.is_cancelled());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        assert!(SyncError::Timeout(Duration::from_secs(10)).is_retryable());
    }

    #[test]
    fn test_protocol_and_auth_are_not_retryable() {
        assert!(!SyncError::Protocol("bad json".into()).is_retryable());
        assert!(!SyncError::Unauthorized.is_retryable());
        assert!(!SyncError::Storage("locked".into()).is_retryable());
    }
}
