//! Error types shared across the pipeline.
//!
//! Broker, pool, config and event errors live next to the code that raises
//! them. This module holds the one error every stage handler returns, since it
//! crosses the boundary between business logic and the scheduler.
//!
//! Handler errors never leave a worker loop: they are turned into a `nack`
//! and consumed by the retry policy.

use thiserror::Error;

/// Classification of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    /// Business logic or an external collaborator failed.
    Failed,
    /// The job payload did not match the stage it was delivered to.
    InvalidPayload,
    /// Enqueueing a downstream job failed after the handler succeeded.
    Downstream,
    /// The handler ran past the worker's job timeout.
    Timeout,
    /// Synthetic cause for a lease that ran out without ack or nack.
    LeaseExpired,
}

/// Failure reported by a stage handler.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    kind: HandlerErrorKind,
    message: String,
}

impl HandlerError {
    /// Creates a generic handler failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: HandlerErrorKind::Failed,
            message: message.into(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self {
            kind: HandlerErrorKind::InvalidPayload,
            message: message.into(),
        }
    }

    pub fn downstream(message: impl Into<String>) -> Self {
        Self {
            kind: HandlerErrorKind::Downstream,
            message: message.into(),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self {
            kind: HandlerErrorKind::Timeout,
            message: format!("handler timed out after {:?}", after),
        }
    }

    /// Synthetic error recorded when a worker crashed or hung past its lease.
    pub fn lease_expired() -> Self {
        Self {
            kind: HandlerErrorKind::LeaseExpired,
            message: "lease expired before ack".to_string(),
        }
    }

    pub fn kind(&self) -> HandlerErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_lease_expired(&self) -> bool {
        self.kind == HandlerErrorKind::LeaseExpired
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        // Alternate formatting keeps the whole context chain in the message.
        Self::new(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_handler_error_kinds() {
        assert_eq!(HandlerError::new("x").kind(), HandlerErrorKind::Failed);
        assert_eq!(
            HandlerError::invalid_payload("x").kind(),
            HandlerErrorKind::InvalidPayload
        );
        assert_eq!(
            HandlerError::downstream("x").kind(),
            HandlerErrorKind::Downstream
        );
        assert!(HandlerError::lease_expired().is_lease_expired());
        assert!(!HandlerError::new("boom").is_lease_expired());
    }

    #[test]
    fn test_handler_error_display() {
        let err = HandlerError::timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
        assert_eq!(HandlerError::new("supabase insert").message(), "supabase insert");
    }

    #[test]
    fn test_from_anyhow_keeps_context() {
        let err = anyhow::anyhow!("connection reset").context("fetching tweets");
        let handler_err = HandlerError::from(err);
        assert!(handler_err.message().contains("fetching tweets"));
        assert!(handler_err.message().contains("connection reset"));
    }
}
