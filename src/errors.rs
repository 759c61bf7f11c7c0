//! Error taxonomy for the sync engine
//!
//! Every operation that touches the network or the ledger reports one of
//! these kinds. Connectivity and rate-limit errors are absorbed and retried
//! internally; validation errors and exhausted retries surface to the
//! caller; invariant violations indicate state corruption and are fatal for
//! the affected symbol.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// No network or socket closed; retried internally with backoff
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// 401-class; escalates to session invalidation above the engine
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Server rejected the mutation as malformed or rule-violating
    #[error("mutation rejected: {0}")]
    Validation(String),

    /// 429-class; retried like a connectivity error, honoring the
    /// server-specified delay when one is given
    #[error("rate limited by server")]
    RateLimited { retry_after: Option<Duration> },

    /// State corruption, e.g. ledger quantity underflow; a bug, not a
    /// user-facing condition
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl SyncError {
    /// Whether a queue drain should stop at this error instead of moving on
    /// to the next record
    ///
    /// Connectivity-flavored failures affect every record equally, so
    /// continuing would only burn through retry budgets while offline.
    /// Mutation-specific failures must not block the rest of the queue.
    pub fn halts_drain(&self) -> bool {
        matches!(
            self,
            SyncError::Connectivity(_) | SyncError::RateLimited { .. } | SyncError::Auth(_)
        )
    }

    /// Whether this failure can never succeed on retry
    pub fn is_permanent(&self) -> bool {
        matches!(self, SyncError::Validation(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Connectivity(err.to_string())
    }
}

impl From<crate::ws::WsError> for SyncError {
    fn from(err: crate::ws::WsError) -> Self {
        SyncError::Connectivity(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_halts_drain_validation_does_not() {
        assert!(SyncError::Connectivity("offline".into()).halts_drain());
        assert!(SyncError::RateLimited { retry_after: None }.halts_drain());
        assert!(SyncError::Auth("expired".into()).halts_drain());
        assert!(!SyncError::Validation("bad quantity".into()).halts_drain());
        assert!(!SyncError::InternalInvariant("underflow".into()).halts_drain());
    }

    #[test]
    fn only_validation_is_permanent() {
        assert!(SyncError::Validation("bad".into()).is_permanent());
        assert!(!SyncError::Connectivity("offline".into()).is_permanent());
    }
}
