//! Payment Error Types

use credits_core::ReconcileError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Payment-related errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Transport failure talking to the provider
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider answered with a non-success status
    #[error("Provider API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Provider payload did not match the expected shape
    #[error("Malformed provider response: {0}")]
    Malformed(String),

    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    WebhookSignature(String),

    /// Webhook payload parsing failed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Package id not present in the catalog
    #[error("Unknown credit package: {0}")]
    UnknownPackage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PaymentError {
    /// Check if this error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Api { .. } | Self::Malformed(_))
    }

    /// Get user-friendly message
    pub const fn user_message(&self) -> &str {
        match self {
            Self::Http(_) | Self::Api { .. } | Self::Malformed(_) => {
                "Payment processing failed. Please try again."
            }
            Self::UnknownPackage(_) => "That credit package is not available.",
            Self::Config(_) => "Service configuration error.",
            _ => "An error occurred processing your request.",
        }
    }
}

impl From<PaymentError> for ReconcileError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Malformed(msg) | PaymentError::WebhookParse(msg) => {
                Self::MalformedResponse(msg)
            }
            PaymentError::Config(msg) => Self::Config(msg),
            other => Self::ProviderUnreachable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_errors_map_to_unreachable() {
        let err: ReconcileError = PaymentError::Api {
            status: 502,
            body: "bad gateway".into(),
        }
        .into();
        assert!(matches!(err, ReconcileError::ProviderUnreachable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_malformed_maps_to_malformed() {
        let err: ReconcileError = PaymentError::Malformed("missing data".into()).into();
        assert!(matches!(err, ReconcileError::MalformedResponse(_)));
    }
}
