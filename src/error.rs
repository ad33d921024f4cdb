//! Engine error taxonomy
//!
//! Every fallible boundary in the engine returns `EngineError` so callers can
//! route failures per class: validation errors surface immediately, venue
//! errors split into transient (retry / reconcile) and permanent (terminal
//! for the leg), concurrency errors retry once or defer to the next cycle.

use rust_decimal::Decimal;
use std::time::Duration;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed or rejected input (bad webhook shape, short signal,
    /// quantity below exchange minimums).
    #[error("validation error: {0}")]
    Validation(String),

    /// Bad webhook secret. No detail beyond the class on purpose.
    #[error("authentication failed")]
    Auth,

    /// A precondition is not met (pool full, precision rules missing).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Transient venue failure: timeout, 5xx, rate limit. The circuit
    /// breaker records it; the order stays `pending` for the reconciler.
    #[error("venue transient error: {0}")]
    VenueTransient(String),

    /// Permanent venue failure: invalid symbol, insufficient balance.
    /// Terminal for the affected leg.
    #[error("venue permanent error: {0}")]
    VenuePermanent(String),

    /// Circuit breaker is open for the venue; fail fast.
    #[error("circuit open for venue '{venue}', retry after {retry_after:?}")]
    CircuitOpen {
        venue: String,
        retry_after: Duration,
    },

    /// Market-close price drifted beyond the configured bound.
    #[error("slippage {actual}% exceeds maximum {max}%")]
    SlippageExceeded { actual: Decimal, max: Decimal },

    /// Lock contention or database deadlock.
    #[error("concurrency error: {0}")]
    Concurrency(String),

    /// Database failure outside the deadlock class.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Broken internal invariant (missing parent row, NULL where required).
    /// The owning group is marked `failed`; no automatic repair.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    /// True for failures worth a single immediate retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::VenueTransient(_) | EngineError::Concurrency(_)
        )
    }

    /// True when the error should count against the venue circuit breaker.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, EngineError::VenueTransient(_))
    }

    /// Classify a raw venue error message the way exchanges phrase them.
    pub fn from_venue_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("insufficient")
            || lower.contains("invalid symbol")
            || lower.contains("unknown symbol")
            || lower.contains("min notional")
        {
            EngineError::VenuePermanent(message.to_string())
        } else {
            EngineError::VenueTransient(message.to_string())
        }
    }

    /// True for "order not found" style responses, which cancel paths
    /// treat as a no-op and the reconciler treats as gone-from-venue.
    pub fn is_not_found(message: &str) -> bool {
        let lower = message.to_lowercase();
        lower.contains("not found") || lower.contains("order does not exist")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_message_classification() {
        assert!(matches!(
            EngineError::from_venue_message("Insufficient balance for SELL"),
            EngineError::VenuePermanent(_)
        ));
        assert!(matches!(
            EngineError::from_venue_message("gateway timeout"),
            EngineError::VenueTransient(_)
        ));
    }

    #[test]
    fn test_transient_flags() {
        assert!(EngineError::VenueTransient("x".into()).is_transient());
        assert!(EngineError::Concurrency("deadlock".into()).is_transient());
        assert!(!EngineError::Auth.is_transient());
        assert!(!EngineError::VenuePermanent("x".into()).counts_against_breaker());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(EngineError::is_not_found("Order does not exist"));
        assert!(EngineError::is_not_found("order not found on exchange"));
        assert!(!EngineError::is_not_found("rate limited"));
    }
}
