//! Error types for the licensing engine.

use crate::catalog::LimitKey;
use crate::license::LicenseState;

/// Convenience result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, LicensingError>;

/// Errors raised by licensing and billing operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LicensingError {
    // Lookup failures
    #[error("No license found for company {company_id}")]
    LicenseNotFound { company_id: String },

    #[error("Plan not found: {plan_id}")]
    PlanNotFound { plan_id: String },

    #[error("Add-on not found: {slug}")]
    AddOnNotFound { slug: String },

    #[error("Payment not found: {reference}")]
    PaymentNotFound { reference: String },

    // State machine violations
    #[error("License for company {company_id} is cancelled")]
    LicenseCancelled { company_id: String },

    #[error("Invalid license transition from {from} to {to}")]
    InvalidTransition { from: LicenseState, to: LicenseState },

    #[error("Add-on already active: {slug}")]
    AddOnAlreadyActive { slug: String },

    #[error("Add-on not active: {slug}")]
    AddOnNotActive { slug: String },

    #[error("A pending {kind} change already exists for this license")]
    PendingChangeExists { kind: &'static str },

    #[error("License is already on plan {plan_id}")]
    PlanUnchanged { plan_id: String },

    // Usage limits
    #[error("LIMIT_REACHED: {key} at {used}/{limit} ({percent:.0}%)")]
    LimitExceeded {
        key: LimitKey,
        used: i64,
        limit: i64,
        percent: f64,
    },

    // Gateway failures
    #[error("Invalid event signature from gateway {gateway}")]
    InvalidSignature { gateway: String },

    #[error("Malformed event payload from gateway {gateway}: {message}")]
    InvalidEventPayload { gateway: String, message: String },

    #[error("Gateway {gateway} error during {operation}: {message}")]
    GatewayApi {
        gateway: String,
        operation: String,
        message: String,
        retryable: bool,
    },

    #[error("Gateway {gateway} timed out during {operation}")]
    GatewayTimeout { gateway: String, operation: String },

    #[error("No adapter registered for gateway {gateway}")]
    AdapterNotRegistered { gateway: String },

    // Concurrency
    #[error("Concurrent modification detected for company {company_id}")]
    ReconciliationConflict { company_id: String },

    #[error("Retry limit exceeded for operation: {operation}")]
    RetryLimitExceeded { operation: String },

    // Infrastructure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LicensingError {
    /// Whether the error stems from the caller's request rather than the
    /// engine or a downstream system.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::LicenseNotFound { .. }
                | Self::PlanNotFound { .. }
                | Self::AddOnNotFound { .. }
                | Self::PaymentNotFound { .. }
                | Self::LicenseCancelled { .. }
                | Self::InvalidTransition { .. }
                | Self::AddOnAlreadyActive { .. }
                | Self::AddOnNotActive { .. }
                | Self::PendingChangeExists { .. }
                | Self::PlanUnchanged { .. }
                | Self::LimitExceeded { .. }
                | Self::InvalidSignature { .. }
                | Self::InvalidEventPayload { .. }
        )
    }

    /// Whether the error indicates an engine or downstream failure.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::GatewayApi { retryable, .. } => *retryable,
            Self::GatewayTimeout { .. }
            | Self::ReconciliationConflict { .. }
            | Self::Storage(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_exceeded_display() {
        let err = LicensingError::LimitExceeded {
            key: LimitKey::Users,
            used: 5,
            limit: 5,
            percent: 100.0,
        };
        assert_eq!(err.to_string(), "LIMIT_REACHED: users at 5/5 (100%)");
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_gateway_errors_classified_as_server() {
        let err = LicensingError::GatewayTimeout {
            gateway: "card_a".to_string(),
            operation: "initiate_purchase".to_string(),
        };
        assert!(err.is_server_error());
        assert!(err.is_retryable());

        let err = LicensingError::GatewayApi {
            gateway: "card_a".to_string(),
            operation: "query_payment".to_string(),
            message: "declined".to_string(),
            retryable: false,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_signature_is_client_error() {
        let err = LicensingError::InvalidSignature {
            gateway: "redirect_b".to_string(),
        };
        assert!(err.is_client_error());
    }
}
