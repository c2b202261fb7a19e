//! Error Types

use thiserror::Error;

/// Result type alias for reconciliation operations
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Reconciliation error taxonomy
///
/// Every session, provider, and storage failure is translated into one of these
/// kinds at the coordinator boundary. Raw transport errors never leave the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// No user, or only a guest, after resolve + refresh
    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),

    /// Network failure or non-success HTTP status from the provider
    #[error("Provider unreachable: {0}")]
    ProviderUnreachable(String),

    /// Provider answered with a payload that does not match the expected shape
    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    /// Provider reachable but no completed order matches yet
    #[error("No matching order for purchase {0}")]
    NoMatchingOrder(String),

    /// Retry ceiling reached for this attempt cycle
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Credit collaborator rejected the grant for a confirmed order
    #[error("Applying credits for order {order_id} failed: {reason}")]
    ApplyFailed { order_id: String, reason: String },

    /// Another attempt for the same purchase is in flight
    #[error("Reconciliation already in progress for purchase {0}")]
    Busy(String),

    /// Purchase id unknown to the store
    #[error("Purchase not found: {0}")]
    PurchaseNotFound(String),

    /// Durable storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReconcileError {
    /// Check if the retry policy should be consulted for this error
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SessionUnavailable(_)
                | Self::ProviderUnreachable(_)
                | Self::MalformedResponse(_)
                | Self::NoMatchingOrder(_)
                | Self::ApplyFailed { .. }
                | Self::Storage(_)
        )
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::SessionUnavailable(_) => {
                "We couldn't confirm your sign-in yet. Please wait a moment.".into()
            }
            Self::ProviderUnreachable(_) | Self::MalformedResponse(_) => {
                "The payment service is not responding. We'll keep checking.".into()
            }
            Self::NoMatchingOrder(_) => "Your payment is still being processed.".into(),
            Self::RetriesExhausted { .. } => {
                "Payment processing is taking longer than expected. Please retry later.".into()
            }
            Self::ApplyFailed { .. } => {
                "Your payment was received but credits are not applied yet. We'll retry.".into()
            }
            Self::Busy(_) => "This purchase is already being checked.".into(),
            Self::PurchaseNotFound(_) => "We couldn't find that purchase.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<std::io::Error> for ReconcileError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
