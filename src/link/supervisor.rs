//! Transaction supervisor: the send-data state machine.
//!
//! The supervisor owns the link state, the active transaction and the
//! callback-ID table. It is driven by three kinds of input (caller
//! commands, controller messages and timer expiries), all delivered by the
//! link actor one at a time. Messages for the controller are queued in an
//! outbox that the actor drains after every input.
//!
//! ```text
//! Created ──submit──▶ AwaitingAck ──accepted──▶ AwaitingCallback ──report──▶ Completed
//!                        │  │                         │
//!                rejected│  │ack timeout              │callback timeout / cancel
//!                        ▼  ▼                         ▼
//!                  Failed(NotSent|NoAck)           Aborting ──abort ack──▶ Failed(Aborted)
//!                                                     │  └──late report──▶ Completed
//!                                                     │abort timeout
//!                                                     ▼
//!                                              SoftResetting ──ready──▶ retry | Failed(LinkRecovered)
//!                                                     └──reset timeout──▶ Failed(LinkFailed), link fatal
//! ```

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};

use crate::config::LinkConfig;
use crate::error::{Error, FrameError, Result, TransactionError};
use crate::event::{Event, EventDispatcher};
use crate::link::allocator::CallbackIdAllocator;
use crate::link::escalation::{Escalation, EscalationPolicy, RecoveryDecision, TimeoutKind};
use crate::link::transaction::{
    EscalationStage, SendRequest, Transaction, TransactionId, TransactionResult, TransactionState,
};
use crate::protocol::{ControllerMessage, DEFAULT_TRANSMIT_OPTIONS, HostMessage, MAX_PAYLOAD_SIZE};
use crate::timer::{Fired, TimerHandle, TimerService};
use crate::types::{CallbackId, TransmitStatus};

/// Whether a send is in flight on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// A new send may be submitted.
    Idle,
    /// A transaction or a soft reset is in progress.
    Busy,
}

/// Snapshot of the link for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    /// Idle or busy.
    pub state: LinkState,
    /// Set after a soft reset went unconfirmed; cleared by a link reset.
    pub failed: bool,
    /// State of the active transaction, if any.
    pub active: Option<(TransactionId, CallbackId, TransactionState)>,
    /// Callback IDs awaiting a transmit report, including aborted ones.
    pub pending: usize,
}

/// Timer payloads used by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkTimer {
    /// Deadline of the active transaction or of the soft reset.
    Deadline(TimeoutKind),
    /// End of the grace period for late reports of an aborted send.
    Tombstone(CallbackId),
}

#[derive(Debug)]
enum PendingEntry {
    /// Reserved by the active transaction.
    Active(TransactionId),
    /// Aborted and acknowledged; late reports are discarded.
    Aborted { expiry: TimerHandle },
}

/// A soft reset in progress.
struct Recovery {
    timer: TimerHandle,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

/// Drives send-data transactions on one controller link.
pub(crate) struct Supervisor {
    config: LinkConfig,
    policy: EscalationPolicy,
    allocator: CallbackIdAllocator,
    timers: TimerService<LinkTimer>,
    active: Option<Transaction>,
    pending: HashMap<CallbackId, PendingEntry>,
    recovery: Option<Recovery>,
    failed: bool,
    next_id: u64,
    outbox: VecDeque<HostMessage>,
    events: EventDispatcher,
}

impl Supervisor {
    /// Creates a supervisor and the receiver its timer expiries arrive on.
    pub(crate) fn new(
        config: LinkConfig,
        events: EventDispatcher,
    ) -> (Self, mpsc::UnboundedReceiver<Fired<LinkTimer>>) {
        let (timers, fired) = TimerService::new();
        let supervisor = Self {
            config,
            policy: EscalationPolicy::new(config.retry_budget),
            allocator: CallbackIdAllocator::new(),
            timers,
            active: None,
            pending: HashMap::new(),
            recovery: None,
            failed: false,
            next_id: 0,
            outbox: VecDeque::new(),
            events,
        };
        (supervisor, fired)
    }

    /// Returns the current link state.
    pub(crate) const fn state(&self) -> LinkState {
        if self.active.is_some() || self.recovery.is_some() {
            LinkState::Busy
        } else {
            LinkState::Idle
        }
    }

    /// Returns a snapshot of the link.
    pub(crate) fn status(&self) -> LinkStatus {
        LinkStatus {
            state: self.state(),
            failed: self.failed,
            active: self
                .active
                .as_ref()
                .map(|txn| (txn.id(), txn.callback_id(), txn.state())),
            pending: self.pending.len(),
        }
    }

    /// Takes the next message to send to the controller.
    pub(crate) fn next_outbound(&mut self) -> Option<HostMessage> {
        self.outbox.pop_front()
    }

    // ==================== Caller Commands ====================

    /// Starts a new transaction.
    pub(crate) fn submit(
        &mut self,
        request: SendRequest,
        responder: oneshot::Sender<TransactionResult>,
    ) -> Result<TransactionId> {
        if self.failed {
            return Err(Error::LinkFailed);
        }
        if self.state() == LinkState::Busy {
            return Err(Error::LinkBusy);
        }
        if request.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::TooLarge {
                size: request.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }

        let callback_id = self.allocator.next()?;
        self.next_id += 1;
        let id = TransactionId(self.next_id);
        self.start(Transaction::new(id, request, callback_id, responder));
        Ok(id)
    }

    /// Requests cancellation of the active transaction.
    ///
    /// Cancellation takes the same path as a missing callback: the controller
    /// is told to abort rather than the state being dropped.
    pub(crate) fn cancel(&mut self, id: TransactionId) {
        let Some(txn) = self.active.as_mut().filter(|txn| txn.id() == id) else {
            tracing::debug!("{} is not active, nothing to cancel", id);
            return;
        };

        txn.cancel_requested = true;
        match txn.state() {
            TransactionState::AwaitingCallback => {
                tracing::info!("{} cancelled while awaiting callback", id);
                if let Some(deadline) = txn.deadline.take() {
                    self.timers.cancel(deadline);
                }
                self.begin_abort();
            }
            TransactionState::AwaitingAck => {
                tracing::info!("{} cancelled, aborting once accepted", id);
            }
            state => {
                tracing::debug!("{} cancelled in {:?}, already escalating", id, state);
            }
        }
    }

    /// Soft-resets the controller on request of the driver.
    pub(crate) fn soft_reset(&mut self, reply: oneshot::Sender<Result<()>>) {
        if let Some(recovery) = self.recovery.as_mut() {
            recovery.waiters.push(reply);
            return;
        }
        if self.active.is_some() {
            let _ = reply.send(Err(Error::LinkBusy));
            return;
        }
        self.begin_soft_reset(Some(reply));
    }

    /// Invalidates all transactions after the connection was re-established.
    pub(crate) fn on_link_reset(&mut self) {
        tracing::info!("controller link reset");
        self.timers.cancel_all();

        if let Some(txn) = self.active.take() {
            let result = match txn.late_report {
                Some(status) => Ok(txn.outcome(status)),
                None => Err(TransactionError::LinkReset),
            };
            self.resolve(txn, result);
        }
        self.pending.clear();
        self.allocator.release_all();
        self.outbox.clear();

        if let Some(recovery) = self.recovery.take() {
            for waiter in recovery.waiters {
                let _ = waiter.send(Ok(()));
            }
        }
        self.failed = false;
        self.events.dispatch(Event::LinkReset);
    }

    /// Handles a message the controller could not be sent.
    pub(crate) fn on_send_failed(&mut self, message: &HostMessage) {
        match message {
            HostMessage::SendDataRequest { callback_id, .. } => {
                let awaiting = self.active.as_ref().is_some_and(|txn| {
                    txn.callback_id() == *callback_id
                        && txn.state() == TransactionState::AwaitingAck
                });
                if awaiting {
                    self.resolve_active(Err(TransactionError::NotSent), false);
                }
            }
            // Their deadlines escalate further
            HostMessage::SendDataAbort { .. } | HostMessage::SoftResetRequest => {}
        }
    }

    // ==================== Controller Messages ====================

    /// Processes one message from the controller.
    pub(crate) fn on_inbound(&mut self, message: ControllerMessage) {
        tracing::trace!("<- {:?}", message);
        match message {
            ControllerMessage::SendDataResponse { was_sent } => {
                self.on_send_data_response(was_sent, message);
            }
            ControllerMessage::SendDataTransmitReport {
                callback_id,
                transmit_status,
            } => self.on_transmit_report(callback_id, transmit_status, message),
            ControllerMessage::SendDataAbortResponse => self.on_abort_acknowledged(message),
            ControllerMessage::SerialApiStarted { .. } => self.on_controller_started(),
            ControllerMessage::Unknown { .. } => self.discard(message),
        }
    }

    fn on_send_data_response(&mut self, was_sent: bool, message: ControllerMessage) {
        let Some(txn) = self
            .active
            .as_mut()
            .filter(|txn| txn.state() == TransactionState::AwaitingAck)
        else {
            self.discard(message);
            return;
        };

        if let Some(deadline) = txn.deadline.take() {
            self.timers.cancel(deadline);
        }

        if !was_sent {
            tracing::warn!("controller refused to send {}", txn.callback_id());
            self.resolve_active(Err(TransactionError::NotSent), false);
            return;
        }

        txn.transition(TransactionState::AwaitingCallback);
        if txn.cancel_requested {
            self.begin_abort();
        } else {
            let deadline = self.timers.arm(
                self.config.callback_timeout,
                LinkTimer::Deadline(TimeoutKind::Callback),
            );
            txn.deadline = Some(deadline);
        }
    }

    fn on_transmit_report(
        &mut self,
        callback_id: CallbackId,
        status: TransmitStatus,
        message: ControllerMessage,
    ) {
        match self.pending.get(&callback_id) {
            Some(PendingEntry::Active(_)) => {
                let Some(txn) = self
                    .active
                    .as_mut()
                    .filter(|txn| txn.callback_id() == callback_id)
                else {
                    self.discard(message);
                    return;
                };
                match txn.state() {
                    TransactionState::AwaitingCallback | TransactionState::Aborting => {
                        let outcome = txn.outcome(status);
                        self.resolve_active(Ok(outcome), false);
                    }
                    TransactionState::SoftResetting => {
                        tracing::info!(
                            "transmit report for {} arrived during soft reset: {:?}",
                            callback_id,
                            status
                        );
                        txn.late_report = Some(status);
                    }
                    _ => self.discard(message),
                }
            }
            Some(PendingEntry::Aborted { expiry }) => {
                tracing::debug!(
                    "discarding late transmit report for aborted {}: {:?}",
                    callback_id,
                    status
                );
                let expiry = *expiry;
                self.timers.cancel(expiry);
                self.pending.remove(&callback_id);
                self.allocator.release(callback_id);
                self.events.dispatch(Event::UnmatchedMessage(message));
            }
            None => self.discard(message),
        }
    }

    fn on_abort_acknowledged(&mut self, message: ControllerMessage) {
        let Some(callback_id) = self
            .active
            .as_ref()
            .filter(|txn| txn.state() == TransactionState::Aborting)
            .map(Transaction::callback_id)
        else {
            self.discard(message);
            return;
        };

        tracing::info!("controller acknowledged abort of {}", callback_id);
        self.resolve_active(Err(TransactionError::Aborted), true);

        let expiry = self.timers.arm(
            self.config.callback_timeout,
            LinkTimer::Tombstone(callback_id),
        );
        self.pending
            .insert(callback_id, PendingEntry::Aborted { expiry });
    }

    fn on_controller_started(&mut self) {
        let Some(recovery) = self.recovery.take() else {
            tracing::warn!("controller restarted unexpectedly");
            self.on_link_reset();
            return;
        };

        tracing::info!("controller ready after soft reset");
        self.timers.cancel(recovery.timer);
        self.failed = false;

        // The restarted controller forgot every callback ID
        for entry in self.pending.values() {
            if let PendingEntry::Aborted { expiry } = entry {
                self.timers.cancel(*expiry);
            }
        }
        self.pending.clear();
        self.allocator.release_all();
        self.events.dispatch(Event::LinkReady);

        for waiter in recovery.waiters {
            let _ = waiter.send(Ok(()));
        }

        if let Some(txn) = self.active.take() {
            self.recover(txn);
        }
    }

    // ==================== Timers ====================

    /// Processes a timer expiry.
    pub(crate) fn on_timer(&mut self, fired: Fired<LinkTimer>) {
        if !self.timers.acknowledge(fired.handle) {
            tracing::trace!("ignoring cancelled timer {:?}", fired.handle);
            return;
        }

        match fired.event {
            LinkTimer::Tombstone(callback_id) => {
                let expired = matches!(
                    self.pending.get(&callback_id),
                    Some(PendingEntry::Aborted { expiry }) if *expiry == fired.handle
                );
                if expired {
                    tracing::trace!("releasing aborted {}", callback_id);
                    self.pending.remove(&callback_id);
                    self.allocator.release(callback_id);
                }
            }
            LinkTimer::Deadline(kind) => self.on_deadline(kind, fired.handle),
        }
    }

    fn on_deadline(&mut self, kind: TimeoutKind, handle: TimerHandle) {
        let current = match kind {
            TimeoutKind::SoftReset => self.recovery.as_ref().map(|r| r.timer),
            _ => self.active.as_ref().and_then(|txn| txn.deadline),
        };
        if current != Some(handle) {
            tracing::trace!("ignoring stale {:?} deadline", kind);
            return;
        }
        if let Some(txn) = self
            .active
            .as_mut()
            .filter(|_| kind != TimeoutKind::SoftReset)
        {
            txn.deadline = None;
        }

        match self.policy.on_timeout(kind) {
            Escalation::Fail(reason) => {
                tracing::warn!("{:?} timeout elapsed, failing transaction", kind);
                self.resolve_active(Err(reason), false);
            }
            Escalation::Abort => {
                tracing::warn!("no transmit report within {:?}", self.config.callback_timeout);
                self.begin_abort();
            }
            Escalation::SoftReset => {
                tracing::warn!("abort not acknowledged within {:?}", self.config.abort_timeout);
                self.begin_soft_reset(None);
            }
            Escalation::Fatal => self.on_soft_reset_timeout(),
        }
    }

    fn on_soft_reset_timeout(&mut self) {
        tracing::error!(
            "controller did not restart within {:?} after soft reset",
            self.config.soft_reset_timeout
        );
        let recovery = self.recovery.take();
        self.failed = true;
        self.timers.cancel_all();

        if let Some(txn) = self.active.take() {
            let result = match txn.late_report {
                Some(status) => Ok(txn.outcome(status)),
                None => Err(TransactionError::LinkFailed),
            };
            self.resolve(txn, result);
        }
        self.pending.clear();
        self.allocator.release_all();

        if let Some(recovery) = recovery {
            for waiter in recovery.waiters {
                let _ = waiter.send(Err(Error::LinkFailed));
            }
        }
        self.events.dispatch(Event::FatalLinkError);
    }

    // ==================== Transitions ====================

    fn start(&mut self, mut txn: Transaction) {
        let callback_id = txn.callback_id();
        let destination = txn.request.destination;
        tracing::debug!(
            "{} sending to {} with {}: {}",
            txn.id(),
            destination,
            callback_id,
            hex::encode(&txn.request.payload)
        );

        self.pending
            .insert(callback_id, PendingEntry::Active(txn.id()));
        self.outbox.push_back(HostMessage::SendDataRequest {
            callback_id,
            destination,
            payload: txn.request.payload.clone(),
            transmit_options: DEFAULT_TRANSMIT_OPTIONS,
        });
        txn.transition(TransactionState::AwaitingAck);
        txn.deadline = Some(self.timers.arm(
            self.config.ack_timeout,
            LinkTimer::Deadline(TimeoutKind::Ack),
        ));
        self.active = Some(txn);

        self.events.dispatch(Event::TransactionStarted {
            destination,
            callback_id,
        });
    }

    fn begin_abort(&mut self) {
        let Some(txn) = self.active.as_mut() else {
            return;
        };
        if txn.stage() >= EscalationStage::AbortSent {
            return;
        }

        let callback_id = txn.callback_id();
        tracing::warn!("aborting {} to {}", callback_id, txn.request.destination);
        txn.transition(TransactionState::Aborting);
        txn.escalate(EscalationStage::AbortSent);
        txn.deadline = Some(self.timers.arm(
            self.config.abort_timeout,
            LinkTimer::Deadline(TimeoutKind::Abort),
        ));

        self.outbox
            .push_back(HostMessage::SendDataAbort { callback_id });
        self.events.dispatch(Event::AbortSent { callback_id });
    }

    fn begin_soft_reset(&mut self, waiter: Option<oneshot::Sender<Result<()>>>) {
        if let Some(txn) = self.active.as_mut() {
            txn.transition(TransactionState::SoftResetting);
            txn.escalate(EscalationStage::SoftResetSent);
        }
        tracing::warn!("soft-resetting controller");

        let timer = self.timers.arm(
            self.config.soft_reset_timeout,
            LinkTimer::Deadline(TimeoutKind::SoftReset),
        );
        self.recovery = Some(Recovery {
            timer,
            waiters: waiter.into_iter().collect(),
        });
        self.outbox.push_back(HostMessage::SoftResetRequest);
        self.events.dispatch(Event::SoftResetStarted);
    }

    /// Settles the transaction that triggered a soft reset, now that the
    /// controller is ready again.
    fn recover(&mut self, txn: Transaction) {
        if let Some(status) = txn.late_report {
            let outcome = txn.outcome(status);
            self.resolve(txn, Ok(outcome));
            return;
        }

        match self.policy.after_recovery(&txn) {
            RecoveryDecision::Retry => match self.allocator.next() {
                Ok(callback_id) => {
                    let next = txn.retry(callback_id);
                    tracing::info!(
                        "{} retrying after soft reset ({} of {})",
                        next.id(),
                        next.retries_used(),
                        self.policy.retry_budget()
                    );
                    self.events.dispatch(Event::Retrying {
                        destination: next.request.destination,
                        retries_used: next.retries_used(),
                    });
                    self.start(next);
                }
                Err(reason) => self.resolve(txn, Err(reason)),
            },
            RecoveryDecision::Fail(reason) => self.resolve(txn, Err(reason)),
        }
    }

    /// Resolves the active transaction and returns the link to idle.
    ///
    /// With `keep_reserved` the callback ID stays allocated so a late
    /// report can still be recognized.
    fn resolve_active(&mut self, result: TransactionResult, keep_reserved: bool) {
        let Some(mut txn) = self.active.take() else {
            return;
        };
        if let Some(deadline) = txn.deadline.take() {
            self.timers.cancel(deadline);
        }
        self.pending.remove(&txn.callback_id());
        if !keep_reserved {
            self.allocator.release(txn.callback_id());
        }
        self.resolve(txn, result);
    }

    fn resolve(&self, mut txn: Transaction, result: TransactionResult) {
        let destination = txn.request.destination;
        let retries_used = txn.retries_used();
        if !txn.resolve(result) {
            return;
        }

        let event = match result {
            Ok(outcome) => Event::TransactionCompleted {
                destination,
                outcome,
            },
            Err(reason) => Event::TransactionFailed {
                destination,
                reason,
                retries_used,
            },
        };
        self.events.dispatch(event);
    }

    fn discard(&self, message: ControllerMessage) {
        tracing::debug!("discarding unmatched {:?}", message);
        self.events.dispatch(Event::UnmatchedMessage(message));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::types::NodeId;

    const ACK: Duration = Duration::from_millis(750);
    const CALLBACK: Duration = Duration::from_secs(2);
    const ABORT: Duration = Duration::from_millis(500);

    fn cb(id: u8) -> CallbackId {
        CallbackId::new(id).unwrap()
    }

    struct Harness {
        supervisor: Supervisor,
        fired: mpsc::UnboundedReceiver<Fired<LinkTimer>>,
        events: EventDispatcher,
    }

    impl Harness {
        fn new(retry_budget: u8) -> Self {
            let events = EventDispatcher::new(64);
            let config = LinkConfig::new(ACK, CALLBACK, ABORT, retry_budget);
            let (supervisor, fired) = Supervisor::new(config, events.clone());
            Self {
                supervisor,
                fired,
                events,
            }
        }

        fn submit(&mut self, retryable: bool) -> oneshot::Receiver<TransactionResult> {
            let (tx, rx) = oneshot::channel();
            let request = SendRequest {
                destination: NodeId::new(2),
                payload: Bytes::from_static(&[0x00]),
                retryable,
            };
            self.supervisor.submit(request, tx).unwrap();
            rx
        }

        fn sent(&mut self) -> Vec<HostMessage> {
            std::iter::from_fn(|| self.supervisor.next_outbound()).collect()
        }

        /// Waits for the next timer and feeds it to the supervisor.
        async fn expire(&mut self) {
            let fired = self.fired.recv().await.unwrap();
            self.supervisor.on_timer(fired);
        }

        fn accept(&mut self) {
            self.supervisor
                .on_inbound(ControllerMessage::SendDataResponse { was_sent: true });
        }

        fn report(&mut self, id: u8, status: TransmitStatus) {
            self.supervisor
                .on_inbound(ControllerMessage::SendDataTransmitReport {
                    callback_id: cb(id),
                    transmit_status: status,
                });
        }

        fn active_state(&self) -> Option<TransactionState> {
            self.supervisor.status().active.map(|(_, _, state)| state)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_completes_on_report() {
        let mut h = Harness::new(1);
        let mut rx = h.submit(true);

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].callback_id(), Some(cb(1)));
        assert_eq!(h.supervisor.state(), LinkState::Busy);

        h.accept();
        assert_eq!(h.active_state(), Some(TransactionState::AwaitingCallback));
        h.report(1, TransmitStatus::Ok);

        let outcome = rx.try_recv().unwrap().unwrap();
        assert!(outcome.is_delivered());
        assert_eq!(outcome.retries_used, 0);
        assert_eq!(h.supervisor.state(), LinkState::Idle);
        assert_eq!(h.supervisor.status().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_fails_without_abort() {
        let mut h = Harness::new(1);
        let start = tokio::time::Instant::now();
        let mut rx = h.submit(true);
        h.sent();

        h.expire().await;
        assert!(start.elapsed() >= ACK);
        assert_eq!(rx.try_recv().unwrap(), Err(TransactionError::NoAck));
        assert!(h.sent().is_empty());
        assert_eq!(h.supervisor.state(), LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_submit_is_busy() {
        let mut h = Harness::new(1);
        let _rx = h.submit(true);

        let (tx, _rx2) = oneshot::channel();
        let request = SendRequest {
            destination: NodeId::new(3),
            payload: Bytes::from_static(&[0x01]),
            retryable: true,
        };
        assert!(matches!(
            h.supervisor.submit(request, tx),
            Err(Error::LinkBusy)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_payload_is_rejected() {
        let mut h = Harness::new(1);
        let (tx, _rx) = oneshot::channel();
        let request = SendRequest {
            destination: NodeId::new(3),
            payload: Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]),
            retryable: true,
        };
        assert!(matches!(
            h.supervisor.submit(request, tx),
            Err(Error::Frame(FrameError::TooLarge { .. }))
        ));
        assert_eq!(h.supervisor.state(), LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_timeout_aborts() {
        let mut h = Harness::new(1);
        let mut events = h.events.subscribe();
        let mut rx = h.submit(true);
        h.sent();
        h.accept();

        h.expire().await;
        assert_eq!(
            h.sent(),
            vec![HostMessage::SendDataAbort { callback_id: cb(1) }]
        );
        assert_eq!(h.active_state(), Some(TransactionState::Aborting));

        h.supervisor
            .on_inbound(ControllerMessage::SendDataAbortResponse);
        assert_eq!(rx.try_recv().unwrap(), Err(TransactionError::Aborted));
        assert_eq!(h.supervisor.state(), LinkState::Idle);
        // Still reserved for a late report
        assert_eq!(h.supervisor.status().pending, 1);

        h.report(1, TransmitStatus::NoAck);
        assert_eq!(h.supervisor.status().pending, 0);

        let mut saw_unmatched = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(1), events.recv()).await
        {
            assert_ne!(event.kind(), crate::event::EventKind::SoftResetStarted);
            saw_unmatched |= event.kind() == crate::event::EventKind::UnmatchedMessage;
        }
        assert!(saw_unmatched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tombstone_expires_after_callback_timeout() {
        let mut h = Harness::new(1);
        let _rx = h.submit(true);
        h.sent();
        h.accept();
        h.expire().await;
        h.supervisor
            .on_inbound(ControllerMessage::SendDataAbortResponse);
        assert_eq!(h.supervisor.status().pending, 1);

        h.expire().await;
        assert_eq!(h.supervisor.status().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_report_while_aborting_completes() {
        let mut h = Harness::new(1);
        let mut rx = h.submit(true);
        h.sent();
        h.accept();
        h.expire().await;
        h.sent();

        h.report(1, TransmitStatus::NoAck);
        let outcome = rx.try_recv().unwrap().unwrap();
        assert_eq!(outcome.status, TransmitStatus::NoAck);
        assert_eq!(h.supervisor.state(), LinkState::Idle);

        // Acknowledgment arriving afterwards matches nothing
        h.supervisor
            .on_inbound(ControllerMessage::SendDataAbortResponse);
        assert_eq!(h.supervisor.status().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_reset_then_retry() {
        let mut h = Harness::new(1);
        let mut rx = h.submit(true);
        h.sent();
        h.accept();
        h.expire().await; // callback
        h.sent();
        h.expire().await; // abort
        assert_eq!(h.sent(), vec![HostMessage::SoftResetRequest]);
        assert_eq!(h.active_state(), Some(TransactionState::SoftResetting));

        h.supervisor
            .on_inbound(ControllerMessage::SerialApiStarted { wake_up_reason: 0 });
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].callback_id(), Some(cb(2)));
        assert_eq!(h.active_state(), Some(TransactionState::AwaitingAck));

        h.accept();
        h.report(2, TransmitStatus::Ok);
        let outcome = rx.try_recv().unwrap().unwrap();
        assert_eq!(outcome.retries_used, 1);
        assert_eq!(outcome.callback_id, cb(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_reset_without_retry_for_probe() {
        let mut h = Harness::new(1);
        let mut rx = h.submit(false);
        h.sent();
        h.accept();
        h.expire().await;
        h.expire().await;
        h.sent();

        h.supervisor
            .on_inbound(ControllerMessage::SerialApiStarted { wake_up_reason: 0 });
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(TransactionError::LinkRecovered { retries_used: 0 })
        );
        assert!(h.sent().is_empty());
        assert_eq!(h.supervisor.state(), LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_during_soft_reset_is_used() {
        let mut h = Harness::new(1);
        let mut rx = h.submit(true);
        h.sent();
        h.accept();
        h.expire().await;
        h.expire().await;
        h.sent();

        h.report(1, TransmitStatus::Ok);
        assert!(rx.try_recv().is_err());

        h.supervisor
            .on_inbound(ControllerMessage::SerialApiStarted { wake_up_reason: 0 });
        let outcome = rx.try_recv().unwrap().unwrap();
        assert!(outcome.is_delivered());
        assert!(h.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_reset_keeps_report_received_during_soft_reset() {
        let mut h = Harness::new(1);
        let mut rx = h.submit(true);
        h.sent();
        h.accept();
        h.expire().await;
        h.expire().await;
        h.sent();

        h.report(1, TransmitStatus::NoAck);
        h.supervisor.on_link_reset();
        let outcome = rx.try_recv().unwrap().unwrap();
        assert_eq!(outcome.status, TransmitStatus::NoAck);
        assert_eq!(h.supervisor.state(), LinkState::Idle);

        // Without a report the reset fails the transaction
        let mut rx = h.submit(true);
        h.sent();
        h.accept();
        h.expire().await;
        h.expire().await;
        h.supervisor.on_link_reset();
        assert_eq!(rx.try_recv().unwrap(), Err(TransactionError::LinkReset));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_reset_timeout_is_fatal() {
        let mut h = Harness::new(1);
        let mut rx = h.submit(true);
        h.sent();
        h.accept();
        h.expire().await;
        h.expire().await;
        h.expire().await;

        assert_eq!(rx.try_recv().unwrap(), Err(TransactionError::LinkFailed));
        assert!(h.supervisor.status().failed);

        let (tx, _rx) = oneshot::channel();
        let request = SendRequest {
            destination: NodeId::new(2),
            payload: Bytes::from_static(&[0x00]),
            retryable: true,
        };
        assert!(matches!(
            h.supervisor.submit(request, tx),
            Err(Error::LinkFailed)
        ));

        h.supervisor.on_link_reset();
        assert!(!h.supervisor.status().failed);
        let _rx = h.submit(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_awaiting_callback_aborts() {
        let mut h = Harness::new(1);
        let (tx, mut rx) = oneshot::channel();
        let request = SendRequest {
            destination: NodeId::new(2),
            payload: Bytes::from_static(&[0x00]),
            retryable: true,
        };
        let id = h.supervisor.submit(request, tx).unwrap();
        h.sent();
        h.accept();

        h.supervisor.cancel(id);
        assert_eq!(
            h.sent(),
            vec![HostMessage::SendDataAbort { callback_id: cb(1) }]
        );
        h.supervisor
            .on_inbound(ControllerMessage::SendDataAbortResponse);
        assert_eq!(rx.try_recv().unwrap(), Err(TransactionError::Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_acceptance_aborts_after() {
        let mut h = Harness::new(1);
        let (tx, _rx) = oneshot::channel();
        let request = SendRequest {
            destination: NodeId::new(2),
            payload: Bytes::from_static(&[0x00]),
            retryable: true,
        };
        let id = h.supervisor.submit(request, tx).unwrap();
        h.sent();

        h.supervisor.cancel(id);
        assert!(h.sent().is_empty());
        h.accept();
        assert_eq!(
            h.sent(),
            vec![HostMessage::SendDataAbort { callback_id: cb(1) }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_restart_resets_link() {
        let mut h = Harness::new(1);
        let mut rx = h.submit(true);
        h.sent();
        h.accept();

        h.supervisor
            .on_inbound(ControllerMessage::SerialApiStarted { wake_up_reason: 1 });
        assert_eq!(rx.try_recv().unwrap(), Err(TransactionError::LinkReset));
        assert_eq!(h.supervisor.state(), LinkState::Idle);
        assert_eq!(h.supervisor.status().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_report_is_ignored() {
        let mut h = Harness::new(1);
        let mut rx = h.submit(true);
        h.sent();
        h.accept();

        h.report(77, TransmitStatus::Ok);
        assert!(rx.try_recv().is_err());
        assert_eq!(h.active_state(), Some(TransactionState::AwaitingCallback));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_and_unsendable_requests() {
        let mut h = Harness::new(1);
        let mut rx = h.submit(true);
        h.sent();
        h.supervisor
            .on_inbound(ControllerMessage::SendDataResponse { was_sent: false });
        assert_eq!(rx.try_recv().unwrap(), Err(TransactionError::NotSent));

        let mut rx = h.submit(true);
        let sent = h.sent();
        h.supervisor.on_send_failed(&sent[0]);
        assert_eq!(rx.try_recv().unwrap(), Err(TransactionError::NotSent));
        assert_eq!(h.supervisor.state(), LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_soft_reset() {
        let mut h = Harness::new(1);
        let (tx, mut rx) = oneshot::channel();
        h.supervisor.soft_reset(tx);
        assert_eq!(h.sent(), vec![HostMessage::SoftResetRequest]);
        assert_eq!(h.supervisor.state(), LinkState::Busy);

        h.supervisor
            .on_inbound(ControllerMessage::SerialApiStarted { wake_up_reason: 0 });
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(h.supervisor.state(), LinkState::Idle);
    }
}
