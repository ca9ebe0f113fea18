//! Timeout escalation policy.
//!
//! Each deadline that fires moves a transaction one rung up the ladder:
//!
//! ```text
//! ack timeout       -> fail (NoAck)
//! callback timeout  -> send abort
//! abort timeout     -> soft reset
//! reset confirmed   -> retry (retryable, budget left) or fail (LinkRecovered)
//! reset timeout     -> fatal link error
//! ```

use crate::error::TransactionError;
use crate::link::transaction::Transaction;

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No synchronous response to the request.
    Ack,
    /// No transmit report after acceptance.
    Callback,
    /// No acknowledgment of the abort.
    Abort,
    /// No readiness announcement after a soft reset.
    SoftReset,
}

/// Next step after a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Resolve the transaction with this failure.
    Fail(TransactionError),
    /// Ask the controller to abort the transmission.
    Abort,
    /// Soft-reset the controller.
    SoftReset,
    /// The link can no longer be trusted.
    Fatal,
}

/// What to do with a transaction once the controller came back from a soft reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Send the same payload again as a fresh transaction.
    Retry,
    /// Resolve the transaction with this failure.
    Fail(TransactionError),
}

/// Decides how the supervisor reacts to timeouts.
#[derive(Debug, Clone, Copy)]
pub struct EscalationPolicy {
    retry_budget: u8,
}

impl EscalationPolicy {
    /// Creates a policy allowing `retry_budget` automatic retries.
    #[must_use]
    pub const fn new(retry_budget: u8) -> Self {
        Self { retry_budget }
    }

    /// Returns the configured retry budget.
    #[must_use]
    pub const fn retry_budget(&self) -> u8 {
        self.retry_budget
    }

    /// Decides the reaction to an expired deadline.
    #[must_use]
    pub const fn on_timeout(&self, kind: TimeoutKind) -> Escalation {
        match kind {
            TimeoutKind::Ack => Escalation::Fail(TransactionError::NoAck),
            TimeoutKind::Callback => Escalation::Abort,
            TimeoutKind::Abort => Escalation::SoftReset,
            TimeoutKind::SoftReset => Escalation::Fatal,
        }
    }

    /// Decides what happens to a transaction after a successful soft reset.
    ///
    /// Liveness probes and cancelled transactions are never retried.
    #[must_use]
    pub const fn after_recovery(&self, transaction: &Transaction) -> RecoveryDecision {
        let retries_used = transaction.retries_used;
        if transaction.request.retryable
            && !transaction.cancel_requested
            && retries_used < self.retry_budget
        {
            RecoveryDecision::Retry
        } else {
            RecoveryDecision::Fail(TransactionError::LinkRecovered { retries_used })
        }
    }
}
