//! # Gateway error taxonomy
//!
//! One variant per handling policy rather than a generic error hierarchy:
//! each corresponds to exactly one way `main` or a caller reacts to it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("edge reconciliation error: {0}")]
    Reconcile(String),
}
