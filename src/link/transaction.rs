//! Send-data transactions and their states.

use std::fmt;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::TransactionError;
use crate::timer::TimerHandle;
use crate::types::{CallbackId, NodeId, TransmitOutcome, TransmitStatus};

/// Result delivered to the caller of a transaction.
pub type TransactionResult = Result<TransmitOutcome, TransactionError>;

/// Identifies a caller's request across automatic retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub(crate) u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Protocol state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Not yet handed to the controller.
    Created,
    /// Request sent, waiting for the controller to accept it.
    AwaitingAck,
    /// Accepted, waiting for the transmit report.
    AwaitingCallback,
    /// Abort sent, waiting for the controller to acknowledge it.
    Aborting,
    /// Soft reset sent, waiting for the controller to restart.
    SoftResetting,
    /// Transmit report received.
    Completed(TransmitStatus),
    /// Resolved without a transmit report.
    Failed(TransactionError),
}

impl TransactionState {
    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// How far a transaction has escalated. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationStage {
    /// No timeout has fired yet.
    Normal,
    /// An abort was sent to the controller.
    AbortSent,
    /// A soft reset was sent to the controller.
    SoftResetSent,
}

/// What the caller asked to send.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Destination node.
    pub destination: NodeId,
    /// Opaque command bytes.
    pub payload: Bytes,
    /// Whether the payload may be sent again after a soft reset.
    pub retryable: bool,
}

/// One send-data exchange, owned by the supervisor driving it.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) id: TransactionId,
    pub(crate) request: SendRequest,
    pub(crate) callback_id: CallbackId,
    pub(crate) state: TransactionState,
    pub(crate) stage: EscalationStage,
    pub(crate) retries_used: u8,
    pub(crate) deadline: Option<TimerHandle>,
    pub(crate) cancel_requested: bool,
    pub(crate) late_report: Option<TransmitStatus>,
    responder: Option<oneshot::Sender<TransactionResult>>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        request: SendRequest,
        callback_id: CallbackId,
        responder: oneshot::Sender<TransactionResult>,
    ) -> Self {
        Self {
            id,
            request,
            callback_id,
            state: TransactionState::Created,
            stage: EscalationStage::Normal,
            retries_used: 0,
            deadline: None,
            cancel_requested: false,
            late_report: None,
            responder: Some(responder),
        }
    }

    /// Builds the fresh attempt that replaces this one after a soft reset.
    pub(crate) fn retry(mut self, callback_id: CallbackId) -> Self {
        Self {
            id: self.id,
            request: self.request.clone(),
            callback_id,
            state: TransactionState::Created,
            stage: EscalationStage::Normal,
            retries_used: self.retries_used + 1,
            deadline: None,
            cancel_requested: false,
            late_report: None,
            responder: self.responder.take(),
        }
    }

    /// Returns the caller-visible identifier.
    #[must_use]
    pub const fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the callback ID of the current attempt.
    #[must_use]
    pub const fn callback_id(&self) -> CallbackId {
        self.callback_id
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns the escalation stage.
    #[must_use]
    pub const fn stage(&self) -> EscalationStage {
        self.stage
    }

    /// Returns the number of automatic retries consumed.
    #[must_use]
    pub const fn retries_used(&self) -> u8 {
        self.retries_used
    }

    /// Moves to a non-terminal state. Ignored once resolved.
    pub(crate) fn transition(&mut self, state: TransactionState) {
        if self.state.is_terminal() {
            tracing::warn!(
                "{} ignoring transition {:?} -> {:?}",
                self.id,
                self.state,
                state
            );
            return;
        }
        tracing::debug!("{} {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    /// Advances the escalation stage. Backward moves are ignored.
    pub(crate) fn escalate(&mut self, stage: EscalationStage) {
        if stage > self.stage {
            self.stage = stage;
        }
    }

    /// Resolves the transaction and notifies the caller.
    ///
    /// Returns `false` if it was already resolved.
    pub(crate) fn resolve(&mut self, result: TransactionResult) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = match result {
            Ok(outcome) => TransactionState::Completed(outcome.status),
            Err(reason) => TransactionState::Failed(reason),
        };
        tracing::debug!("{} resolved: {:?}", self.id, self.state);

        if let Some(responder) = self.responder.take() {
            // Caller may have stopped waiting
            let _ = responder.send(result);
        }
        true
    }

    /// Builds the outcome for a transmit report of the current attempt.
    pub(crate) const fn outcome(&self, status: TransmitStatus) -> TransmitOutcome {
        TransmitOutcome {
            status,
            callback_id: self.callback_id,
            retries_used: self.retries_used,
        }
    }
}
