//! Scriptable controller behaviors.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::{ControllerMessage, HostMessage};
use crate::types::{CallbackId, TransmitStatus};

/// Delay between accepting a send and reporting it.
pub const DEFAULT_TRANSMIT_DELAY: Duration = Duration::from_millis(10);

/// Delay between a soft reset request and the readiness announcement.
pub const DEFAULT_SOFT_RESET_DELAY: Duration = Duration::from_millis(50);

/// Whether the radio of the simulated controller is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommunicationState {
    #[default]
    Idle,
    Sending,
}

/// State of the simulated controller, shared by all behaviors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockControllerState {
    pub communication: CommunicationState,
    /// Callback ID of the last accepted send.
    pub last_callback_id: Option<CallbackId>,
}

/// Outcome of offering a host message to a behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviorResult {
    /// The behavior handled the message; later behaviors are skipped.
    Intercept,
    /// Offer the message to the next behavior.
    PassThrough,
}

/// Reacts to messages the host sends to the simulated controller.
///
/// Behaviors are consulted in the order they were added. The first one
/// returning [`BehaviorResult::Intercept`] wins; if none does,
/// [`DefaultBehavior`] handles the message.
pub trait MockControllerBehavior: Send + Sync {
    fn on_host_message(&self, ctx: &MockContext, message: &HostMessage) -> BehaviorResult;
}

impl<F> MockControllerBehavior for F
where
    F: Fn(&MockContext, &HostMessage) -> BehaviorResult + Send + Sync,
{
    fn on_host_message(&self, ctx: &MockContext, message: &HostMessage) -> BehaviorResult {
        self(ctx, message)
    }
}

/// What a behavior can do to the simulated controller.
#[derive(Clone)]
pub struct MockContext {
    host: mpsc::Sender<Bytes>,
    state: Arc<Mutex<MockControllerState>>,
}

impl MockContext {
    pub(crate) const fn new(
        host: mpsc::Sender<Bytes>,
        state: Arc<Mutex<MockControllerState>>,
    ) -> Self {
        Self { host, state }
    }

    /// Sends a message to the host right away.
    pub fn send_to_host(&self, message: ControllerMessage) {
        tracing::trace!("mock <- {:?}", message);
        if self.host.try_send(message.encode()).is_err() {
            tracing::debug!("mock controller: host is not listening");
        }
    }

    /// Sends a message to the host after `delay`.
    pub fn send_to_host_after(&self, delay: Duration, message: ControllerMessage) {
        let ctx = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            ctx.send_to_host(message);
        });
    }

    /// Runs `f` with mutable access to the controller state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut MockControllerState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

/// A controller that accepts and delivers every send.
///
/// - Send data: accepted while idle and reported `Ok` after
///   [`DEFAULT_TRANSMIT_DELAY`]; refused while another send is running.
/// - Abort: stops the running send and acknowledges.
/// - Soft reset: clears the state and announces readiness after
///   [`DEFAULT_SOFT_RESET_DELAY`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBehavior;

impl MockControllerBehavior for DefaultBehavior {
    fn on_host_message(&self, ctx: &MockContext, message: &HostMessage) -> BehaviorResult {
        match message {
            HostMessage::SendDataRequest { callback_id, .. } => {
                let callback_id = *callback_id;
                let accepted = ctx.with_state(|state| {
                    if state.communication == CommunicationState::Sending {
                        return false;
                    }
                    state.communication = CommunicationState::Sending;
                    state.last_callback_id = Some(callback_id);
                    true
                });
                ctx.send_to_host(ControllerMessage::SendDataResponse { was_sent: accepted });
                if accepted {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(DEFAULT_TRANSMIT_DELAY).await;
                        let still_sending = ctx.with_state(|state| {
                            let sending = state.communication == CommunicationState::Sending
                                && state.last_callback_id == Some(callback_id);
                            if sending {
                                state.communication = CommunicationState::Idle;
                            }
                            sending
                        });
                        if still_sending {
                            ctx.send_to_host(ControllerMessage::SendDataTransmitReport {
                                callback_id,
                                transmit_status: TransmitStatus::Ok,
                            });
                        }
                    });
                }
            }
            HostMessage::SendDataAbort { .. } => {
                ctx.with_state(|state| state.communication = CommunicationState::Idle);
                ctx.send_to_host(ControllerMessage::SendDataAbortResponse);
            }
            HostMessage::SoftResetRequest => {
                ctx.with_state(|state| *state = MockControllerState::default());
                ctx.send_to_host_after(
                    DEFAULT_SOFT_RESET_DELAY,
                    ControllerMessage::SerialApiStarted { wake_up_reason: 0 },
                );
            }
        }
        BehaviorResult::Intercept
    }
}
