use axum::http::StatusCode;
use thiserror::Error;

use crate::infrastructure::xero::ProviderError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found")]
    NotFound,
    #[error("validation error: {0}")]
    Validation(String),
    /// No credential record exists; the user has never authorized.
    #[error("Xero is not connected. Please authorize first.")]
    NotConnected,
    /// Credentials exist but were rejected and refresh cannot recover;
    /// the user must re-run the OAuth flow.
    #[error("Xero connection is no longer valid: {0}")]
    RequiresReconnection(String),
    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),
    /// The linked invoice is in a terminal external state; refused with
    /// guidance data instead of silently double-billing.
    #[error("invoice {invoice_id} is {status} and can no longer be updated")]
    InvoiceLocked {
        invoice_id: String,
        status: String,
        url: String,
    },
    #[error("provider temporarily unreachable: {0}")]
    Transient(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotConnected => StatusCode::UNAUTHORIZED,
            ServiceError::RequiresReconnection(_) => StatusCode::UNAUTHORIZED,
            ServiceError::AuthorizationFailed(_) => StatusCode::BAD_REQUEST,
            ServiceError::InvoiceLocked { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Transient(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body for the HTTP layer. Locked invoices carry guidance data so
    /// the caller can link to the existing invoice; reconnection-class
    /// errors carry an explicit flag the UI keys its prompt off.
    pub fn body(&self) -> serde_json::Value {
        match self {
            ServiceError::InvoiceLocked {
                invoice_id,
                status,
                url,
            } => serde_json::json!({
                "success": false,
                "message": self.to_string(),
                "data": {
                    "invoiceId": invoice_id,
                    "status": status,
                    "xeroUrl": url,
                },
            }),
            ServiceError::NotConnected => serde_json::json!({
                "success": false,
                "message": self.to_string(),
                "requiresReconnection": false,
            }),
            ServiceError::RequiresReconnection(_) => serde_json::json!({
                "success": false,
                "message": self.to_string(),
                "requiresReconnection": true,
            }),
            other => serde_json::json!({
                "success": false,
                "message": other.to_string(),
            }),
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

/// Provider failures map onto the service taxonomy: auth-flavored errors
/// always become RequiresReconnection no matter where in the pipeline they
/// occurred, transport problems stay retryable, and remote 4xx validation
/// messages pass through to the caller.
impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth(message) => ServiceError::RequiresReconnection(message),
            ProviderError::Transient(message) => ServiceError::Transient(message),
            ProviderError::Remote { status, message } if (400..500).contains(&status) => {
                ServiceError::Validation(message)
            }
            ProviderError::Remote { message, .. } => ServiceError::Internal(message),
            ProviderError::Decode(message) => ServiceError::Internal(message),
            ProviderError::Url(message) => ServiceError::Internal(message),
        }
    }
}
