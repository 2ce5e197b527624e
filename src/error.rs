use crate::billing::{BillingError, WebhookError};

/// The main error type for subscription reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum SubsyncError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Message shown to customers when a remote request was rejected.
pub const CONTACT_SUPPORT_MESSAGE: &str =
    "Sorry, we could not process your subscription request. Please contact us for assistance.";

impl SubsyncError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        SubsyncError::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        SubsyncError::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        SubsyncError::Internal(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        SubsyncError::ServiceUnavailable(msg.into())
    }

    /// HTTP-like status code for this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            SubsyncError::NotFound(_) => 404,
            SubsyncError::BadRequest(_) => 400,
            SubsyncError::Internal(_) | SubsyncError::Anyhow(_) => 500,
            SubsyncError::ServiceUnavailable(_) => 503,
            SubsyncError::RequestTimeout => 408,
            SubsyncError::Webhook(e) => e.status_code,
            SubsyncError::Billing(e) => {
                if let BillingError::StripeApiError { http_status: Some(status), .. } = e {
                    *status
                } else if e.is_client_error() {
                    400
                } else {
                    500
                }
            }
        }
    }

    /// Whether an outer retry layer should try the operation again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SubsyncError::ServiceUnavailable(_) | SubsyncError::RequestTimeout => true,
            SubsyncError::Billing(e) => e.is_retryable(),
            SubsyncError::Webhook(e) => e.is_retry_later(),
            _ => false,
        }
    }

    /// Message that is safe to show to a customer.
    ///
    /// Validation failures carry their own wording. Rejected remote requests
    /// collapse into a generic support message; the raw error is only logged.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            SubsyncError::Billing(e) if e.is_user_facing() => e.to_string(),
            SubsyncError::Billing(BillingError::StripeApiError { .. }) => {
                CONTACT_SUPPORT_MESSAGE.to_string()
            }
            SubsyncError::BadRequest(msg) => msg.clone(),
            _ => CONTACT_SUPPORT_MESSAGE.to_string(),
        }
    }

    /// The typed billing error, if this wraps one.
    #[must_use]
    pub fn as_billing(&self) -> Option<&BillingError> {
        match self {
            SubsyncError::Billing(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SubsyncError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            SubsyncError::BadRequest(format!("JSON error: {}", err))
        } else {
            SubsyncError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

pub type Result<T> = std::result::Result<T, SubsyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(SubsyncError::not_found("x").status_code(), 404);
        assert_eq!(SubsyncError::bad_request("x").status_code(), 400);
        assert_eq!(SubsyncError::RequestTimeout.status_code(), 408);

        let err: SubsyncError = BillingError::MixedCurrency {
            expected: "usd".to_string(),
            found: "eur".to_string(),
        }
        .into();
        assert_eq!(err.status_code(), 400);

        let err: SubsyncError = BillingError::StripeApiError {
            operation: "create_subscription".to_string(),
            message: "No such customer".to_string(),
            code: Some("resource_missing".to_string()),
            http_status: Some(404),
        }
        .into();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_user_message_hides_remote_errors() {
        let err: SubsyncError = BillingError::StripeApiError {
            operation: "update_subscription".to_string(),
            message: "Invalid integer: abc".to_string(),
            code: Some("parameter_invalid_integer".to_string()),
            http_status: Some(400),
        }
        .into();
        assert_eq!(err.user_message(), CONTACT_SUPPORT_MESSAGE);
        assert!(!err.user_message().contains("abc"));
    }

    #[test]
    fn test_user_message_keeps_validation_wording() {
        let err: SubsyncError = BillingError::MustBuySeparately.into();
        assert_eq!(
            err.user_message(),
            "Subscriptions that do not renew together must be bought separately."
        );
    }

    #[test]
    fn test_retryable() {
        assert!(SubsyncError::RequestTimeout.is_retryable());
        assert!(!SubsyncError::bad_request("nope").is_retryable());

        let err: SubsyncError = BillingError::StripeApiError {
            operation: "retrieve_invoice".to_string(),
            message: "upstream".to_string(),
            code: None,
            http_status: Some(502),
        }
        .into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_json_error_classification() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(SubsyncError::from(err), SubsyncError::BadRequest(_)));
    }
}
