//! Diagnostic event system.
//!
//! Events describe what the driver and the controller link are doing:
//! transactions starting and resolving, escalation steps, discarded
//! messages. They are purely informational; the result of a send is
//! always delivered through its transaction handle.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::TransactionError;
use crate::protocol::ControllerMessage;
use crate::types::{CallbackId, NodeId, TransmitOutcome};

/// Event types that can be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Connection established.
    Connected,
    /// Connection closed.
    Disconnected,
    /// Controller announced readiness after a soft reset.
    LinkReady,
    /// A send request was handed to the controller.
    TransactionStarted {
        destination: NodeId,
        callback_id: CallbackId,
    },
    /// An abort was sent for an unanswered transmission.
    AbortSent { callback_id: CallbackId },
    /// The controller is being soft-reset.
    SoftResetStarted,
    /// A payload is being sent again after a soft reset.
    Retrying { destination: NodeId, retries_used: u8 },
    /// A transaction received its transmit report.
    TransactionCompleted {
        destination: NodeId,
        outcome: TransmitOutcome,
    },
    /// A transaction resolved without a transmit report.
    TransactionFailed {
        destination: NodeId,
        reason: TransactionError,
        retries_used: u8,
    },
    /// A controller message that matched no live transaction.
    UnmatchedMessage(ControllerMessage),
    /// All transactions were invalidated by a reconnect or controller restart.
    LinkReset,
    /// The controller did not come back after a soft reset.
    FatalLinkError,
}

/// Discriminant of an [`Event`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    LinkReady,
    TransactionStarted,
    AbortSent,
    SoftResetStarted,
    Retrying,
    TransactionCompleted,
    TransactionFailed,
    UnmatchedMessage,
    LinkReset,
    FatalLinkError,
}

impl Event {
    /// Returns the kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::LinkReady => EventKind::LinkReady,
            Self::TransactionStarted { .. } => EventKind::TransactionStarted,
            Self::AbortSent { .. } => EventKind::AbortSent,
            Self::SoftResetStarted => EventKind::SoftResetStarted,
            Self::Retrying { .. } => EventKind::Retrying,
            Self::TransactionCompleted { .. } => EventKind::TransactionCompleted,
            Self::TransactionFailed { .. } => EventKind::TransactionFailed,
            Self::UnmatchedMessage(_) => EventKind::UnmatchedMessage,
            Self::LinkReset => EventKind::LinkReset,
            Self::FatalLinkError => EventKind::FatalLinkError,
        }
    }

    /// Returns the callback ID the event refers to, if any.
    #[must_use]
    pub const fn callback_id(&self) -> Option<CallbackId> {
        match self {
            Self::TransactionStarted { callback_id, .. } | Self::AbortSent { callback_id } => {
                Some(*callback_id)
            }
            Self::TransactionCompleted { outcome, .. } => Some(outcome.callback_id),
            Self::UnmatchedMessage(msg) => msg.callback_id(),
            _ => None,
        }
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Receives the next event.
    ///
    /// Returns `None` once the dispatcher is gone. Events missed because the
    /// subscriber lagged behind are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Subscription filter for specific events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by event kinds.
    pub kinds: Option<Vec<EventKind>>,
    /// Filter by callback ID.
    pub callback_id: Option<CallbackId>,
}

impl EventFilter {
    /// Creates a filter for specific event kinds.
    #[must_use]
    pub const fn kinds(kinds: Vec<EventKind>) -> Self {
        Self {
            kinds: Some(kinds),
            callback_id: None,
        }
    }

    /// Restricts the filter to events about one callback ID.
    #[must_use]
    pub const fn with_callback_id(mut self, callback_id: CallbackId) -> Self {
        self.callback_id = Some(callback_id);
        self
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }

        if let Some(expected) = self.callback_id {
            if event.callback_id() != Some(expected) {
                return false;
            }
        }

        true
    }
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        tracing::trace!("event: {:?}", event);
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribes to all events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Waits for an event matching the filter with timeout.
    ///
    /// Returns `None` if the timeout expires or the channel is closed.
    pub async fn wait_for(
        &self,
        filter: EventFilter,
        timeout: std::time::Duration,
    ) -> Option<Event> {
        let mut subscription = self.subscribe();

        tokio::select! {
            biased;
            result = async {
                loop {
                    let event = subscription.recv().await?;
                    if filter.matches(&event) {
                        return Some(event);
                    }
                }
            } => result,
            () = tokio::time::sleep(timeout) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransmitStatus;

    fn cb(id: u8) -> CallbackId {
        CallbackId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_event_dispatch() {
        let dispatcher = EventDispatcher::new(16);
        let mut sub = dispatcher.subscribe();

        dispatcher.dispatch(Event::Connected);

        let event = tokio::time::timeout(std::time::Duration::from_millis(100), sub.recv())
            .await
            .unwrap();

        assert_eq!(event, Some(Event::Connected));
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::kinds(vec![EventKind::AbortSent, EventKind::SoftResetStarted]);

        assert!(filter.matches(&Event::AbortSent { callback_id: cb(1) }));
        assert!(filter.matches(&Event::SoftResetStarted));
        assert!(!filter.matches(&Event::Connected));
    }

    #[test]
    fn test_callback_id_filter() {
        let filter = EventFilter::default().with_callback_id(cb(9));
        let completed = Event::TransactionCompleted {
            destination: NodeId::new(2),
            outcome: TransmitOutcome {
                status: TransmitStatus::Ok,
                callback_id: cb(9),
                retries_used: 0,
            },
        };

        assert!(filter.matches(&completed));
        assert!(!filter.matches(&Event::AbortSent { callback_id: cb(8) }));
        assert!(!filter.matches(&Event::LinkReset));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out() {
        let dispatcher = EventDispatcher::new(16);
        let result = dispatcher
            .wait_for(
                EventFilter::kinds(vec![EventKind::LinkReady]),
                std::time::Duration::from_millis(500),
            )
            .await;
        assert_eq!(result, None);
    }
}
