//! Tracking error taxonomy
//!
//! Errors are reported to the caller of the failing operation only, as a
//! single `Error` event. They never reach other subscribers.

use crate::session::{ConnectionId, OrderId};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackingError {
    /// Identity could not be resolved for the connection
    #[error("authentication required")]
    AuthenticationMissing,
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    ValidationFailure(String),
    /// Downstream store error
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl TrackingError {
    pub fn unknown_session(conn_id: ConnectionId) -> Self {
        Self::AccessDenied(format!("connection {} has no session", conn_id))
    }

    pub fn unknown_order(order_id: OrderId) -> Self {
        Self::NotFound(format!("order {}", order_id))
    }

    /// Stable kind label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthenticationMissing => "authentication_missing",
            Self::AccessDenied(_) => "access_denied",
            Self::NotFound(_) => "not_found",
            Self::ValidationFailure(_) => "validation_failure",
            Self::PersistenceFailure(_) => "persistence_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            TrackingError::unknown_order(12).to_string(),
            "not found: order 12"
        );
        assert_eq!(
            TrackingError::AuthenticationMissing.to_string(),
            "authentication required"
        );
        assert_eq!(TrackingError::unknown_session(3).kind(), "access_denied");
    }
}
