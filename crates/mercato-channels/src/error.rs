use thiserror::Error;

/// Failures raised by a channel gateway send. Transient errors are retried
/// with backoff; permanent ones fail the delivery immediately.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transient gateway error: {0}")]
    Transient(String),

    #[error("permanent gateway error: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}
