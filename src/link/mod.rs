//! Controller link: one serialized channel of send-data transactions.
//!
//! [`ControllerLink`] is a cheap handle to a background task that owns the
//! transaction supervisor. Every input (submissions, controller messages,
//! deadline expiries, resets) is processed by that task one at a time, so
//! the state machine never observes concurrent mutation.
//!
//! At most one transaction is in flight. Submitting while the link is busy
//! fails fast with [`Error::LinkBusy`]; queueing callers is left to the
//! layer above (see [`crate::Driver::send_data`]), which can use
//! [`ControllerLink::idle`] to wait for its turn.

mod actor;
pub mod allocator;
pub mod escalation;
mod supervisor;
pub mod transaction;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::LinkConfig;
use crate::error::{Error, Result, TransactionError};
use crate::event::EventDispatcher;
use crate::protocol::ControllerMessage;
use crate::transport::Transport;
use crate::types::NodeId;

use actor::{LinkActor, LinkCommand};

pub use allocator::CallbackIdAllocator;
pub use escalation::{Escalation, EscalationPolicy, RecoveryDecision, TimeoutKind};
pub use supervisor::{LinkState, LinkStatus};
pub use transaction::{
    EscalationStage, SendRequest, Transaction, TransactionId, TransactionResult, TransactionState,
};

/// Handle to a running controller link.
#[derive(Clone)]
pub struct ControllerLink {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl ControllerLink {
    /// Starts a link over `transport`.
    ///
    /// The link task runs until every `ControllerLink` clone and every
    /// [`TransactionHandle`] is dropped, or the returned task is aborted.
    /// In both cases outstanding transactions resolve with
    /// [`TransactionError::LinkReset`].
    pub fn spawn<T: Transport + 'static>(
        transport: Arc<Mutex<T>>,
        config: LinkConfig,
        events: EventDispatcher,
    ) -> Result<(Self, JoinHandle<()>)> {
        config.validate()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (supervisor, fired) = supervisor::Supervisor::new(config, events);
        let actor = LinkActor::new(transport, supervisor, command_rx, fired);
        let task = tokio::spawn(actor.run());

        tracing::debug!("controller link started: {:?}", config);
        Ok((Self { commands }, task))
    }

    /// Starts a send-data transaction.
    ///
    /// Returns once the link accepted the transaction; the handle resolves
    /// with its outcome. Liveness probes should pass `retryable = false`.
    pub async fn submit(
        &self,
        destination: NodeId,
        payload: impl Into<Bytes>,
        retryable: bool,
    ) -> Result<TransactionHandle> {
        let (responder, result) = oneshot::channel();
        let (reply, accepted) = oneshot::channel();
        self.send(LinkCommand::Submit {
            request: SendRequest {
                destination,
                payload: payload.into(),
                retryable,
            },
            responder,
            reply,
        })?;

        let id = accepted.await.map_err(|_| Error::ChannelClosed)??;
        Ok(TransactionHandle {
            id,
            result,
            resolved: false,
            commands: self.commands.clone(),
        })
    }

    /// Waits until no transaction or soft reset is in progress.
    ///
    /// This includes the escalation of a transaction whose caller stopped
    /// waiting.
    pub async fn idle(&self) -> Result<()> {
        let (reply, idle) = oneshot::channel();
        self.send(LinkCommand::WaitIdle { reply })?;
        idle.await.map_err(|_| Error::ChannelClosed)
    }

    /// Delivers a message received from the controller.
    pub fn on_inbound_message(&self, message: ControllerMessage) -> Result<()> {
        self.send(LinkCommand::Inbound(message))
    }

    /// Invalidates all transactions after the connection was re-established.
    pub fn on_link_reset(&self) -> Result<()> {
        self.send(LinkCommand::LinkReset)
    }

    /// Soft-resets the controller and waits until it announced readiness.
    ///
    /// Fails with [`Error::LinkBusy`] while a transaction is in flight and
    /// with [`Error::LinkFailed`] if the controller never comes back.
    pub async fn soft_reset(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.send(LinkCommand::SoftReset { reply })?;
        done.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Returns a snapshot of the link state.
    pub async fn status(&self) -> Result<LinkStatus> {
        let (reply, status) = oneshot::channel();
        self.send(LinkCommand::Status { reply })?;
        status.await.map_err(|_| Error::ChannelClosed)
    }

    fn send(&self, command: LinkCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::ChannelSend)
    }
}

/// A submitted transaction.
///
/// Dropping the handle before the transaction resolved cancels it, which
/// aborts the transmission on the controller.
pub struct TransactionHandle {
    id: TransactionId,
    result: oneshot::Receiver<TransactionResult>,
    resolved: bool,
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl TransactionHandle {
    /// Returns the transaction identifier.
    #[must_use]
    pub const fn id(&self) -> TransactionId {
        self.id
    }

    /// Asks the link to abort this transaction.
    ///
    /// The outcome is still delivered through [`wait`](Self::wait): a
    /// transmit report that wins the race completes the transaction.
    pub fn cancel(&self) {
        let _ = self.commands.send(LinkCommand::Cancel(self.id));
    }

    /// Waits for the transaction to resolve.
    pub async fn wait(mut self) -> TransactionResult {
        let result = (&mut self.result)
            .await
            .unwrap_or(Err(TransactionError::LinkReset));
        self.resolved = true;
        result
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::debug!("{} dropped before resolving, cancelling", self.id);
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event::{EventFilter, EventKind};
    use crate::mock::MockController;
    use crate::protocol::HostMessage;
    use crate::types::TransmitStatus;

    fn config() -> LinkConfig {
        LinkConfig::new(
            Duration::from_millis(750),
            Duration::from_secs(2),
            Duration::from_millis(500),
            1,
        )
    }

    async fn start(mock: &MockController) -> (ControllerLink, EventDispatcher) {
        let events = EventDispatcher::new(64);
        let mut transport = mock.clone();
        let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(64);
        transport.set_frame_sender(frame_tx);
        transport.connect().await.unwrap();

        let (link, _task) =
            ControllerLink::spawn(Arc::new(Mutex::new(transport)), config(), events.clone())
                .unwrap();
        let inbound = link.clone();
        tokio::spawn(async move {
            while let Some(body) = frame_rx.recv().await {
                let message = ControllerMessage::parse(&body).unwrap();
                if inbound.on_inbound_message(message).is_err() {
                    break;
                }
            }
        });
        (link, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_and_wait() {
        let mock = MockController::new();
        let (link, _events) = start(&mock).await;

        let handle = link
            .submit(NodeId::new(5), vec![0x20, 0x01, 0xff], true)
            .await
            .unwrap();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, TransmitStatus::Ok);

        mock.assert_received_host_message(|m| {
            matches!(m, HostMessage::SendDataRequest { destination, .. } if destination.get() == 5)
        });
        assert_eq!(link.status().await.unwrap().state, LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_while_busy() {
        let mock = MockController::new();
        let (link, _events) = start(&mock).await;

        let first = link.submit(NodeId::new(5), vec![0x00], true).await.unwrap();
        let second = link.submit(NodeId::new(6), vec![0x00], true).await;
        assert!(matches!(second, Err(Error::LinkBusy)));
        assert!(first.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_transmission() {
        let mock = MockController::new();
        // Accept but never report
        mock.add_behavior(|ctx: &crate::mock::MockContext, m: &HostMessage| {
            if let HostMessage::SendDataRequest { .. } = m {
                ctx.send_to_host(ControllerMessage::SendDataResponse { was_sent: true });
                return crate::mock::BehaviorResult::Intercept;
            }
            crate::mock::BehaviorResult::PassThrough
        });
        let (link, events) = start(&mock).await;
        let mut subscription = events.subscribe();

        let handle = link.submit(NodeId::new(5), vec![0x00], true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        assert_eq!(handle.wait().await, Err(TransactionError::Aborted));
        let filter = EventFilter::kinds(vec![EventKind::AbortSent]);
        let mut saw_abort = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(1), subscription.recv()).await
        {
            saw_abort |= filter.matches(&event);
        }
        assert!(saw_abort);
        assert_eq!(
            mock.count_received_host_messages(|m| matches!(m, HostMessage::SendDataAbort { .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_aborts_and_frees_link() {
        let mock = MockController::new();
        mock.add_behavior(|ctx: &crate::mock::MockContext, m: &HostMessage| {
            if let HostMessage::SendDataRequest { .. } = m {
                ctx.send_to_host(ControllerMessage::SendDataResponse { was_sent: true });
                return crate::mock::BehaviorResult::Intercept;
            }
            crate::mock::BehaviorResult::PassThrough
        });
        let (link, _events) = start(&mock).await;

        let handle = link.submit(NodeId::new(5), vec![0x00], true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(handle);

        // Well before the callback timeout
        tokio::time::timeout(Duration::from_millis(100), link.idle())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            mock.count_received_host_messages(|m| matches!(m, HostMessage::SendDataAbort { .. })),
            1
        );
        assert_eq!(link.status().await.unwrap().state, LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waited_handle_does_not_cancel() {
        let mock = MockController::new();
        let (link, _events) = start(&mock).await;

        let handle = link.submit(NodeId::new(5), vec![0x00], true).await.unwrap();
        assert!(handle.wait().await.is_ok());
        link.idle().await.unwrap();
        assert_eq!(
            mock.count_received_host_messages(|m| matches!(m, HostMessage::SendDataAbort { .. })),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_submissions_admit_one() {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        let mock = MockController::new();
        let (link, _events) = start(&mock).await;
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        for round in 0..50 {
            let attempts = rng.gen_range(1..=6u16);
            let tasks: Vec<_> = (0..attempts)
                .map(|n| {
                    let link = link.clone();
                    tokio::spawn(async move { link.submit(NodeId::new(n + 2), vec![0x00], true).await })
                })
                .collect();

            let mut admitted = Vec::new();
            for task in tasks {
                match task.await.unwrap() {
                    Ok(handle) => admitted.push(handle),
                    Err(Error::LinkBusy) => {}
                    Err(e) => panic!("round {round}: unexpected error {e}"),
                }
            }
            assert_eq!(admitted.len(), 1, "round {round}");
            for handle in admitted {
                assert!(handle.wait().await.is_ok());
            }
        }
        assert_eq!(
            mock.count_received_host_messages(|m| matches!(m, HostMessage::SendDataRequest { .. })),
            50
        );
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let transport = Arc::new(Mutex::new(MockController::new()));
        let config = config().ack_timeout(Duration::from_secs(5));
        let result = ControllerLink::spawn(transport, config, EventDispatcher::new(4));
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborting_link_resolves_with_reset() {
        let mock = MockController::new();
        // Swallow everything
        mock.add_behavior(|_: &crate::mock::MockContext, _: &HostMessage| {
            crate::mock::BehaviorResult::Intercept
        });
        let mut transport = mock.clone();
        let (frame_tx, _frame_rx) = mpsc::channel::<Bytes>(4);
        transport.set_frame_sender(frame_tx);
        transport.connect().await.unwrap();

        let events = EventDispatcher::new(4);
        let (link, task) =
            ControllerLink::spawn(Arc::new(Mutex::new(transport)), config(), events).unwrap();

        let handle = link.submit(NodeId::new(5), vec![0x00], true).await.unwrap();
        task.abort();
        assert_eq!(handle.wait().await, Err(TransactionError::LinkReset));
    }
}
