//! A simulated controller for tests.
//!
//! [`MockController`] implements [`Transport`], so a [`crate::Driver`] or a
//! [`crate::ControllerLink`] runs against it unmodified. Every message the
//! host sends is parsed, recorded and offered to a chain of
//! [`MockControllerBehavior`]s that decide how the controller answers.
//! Requests for functions outside the controller's
//! [`MockControllerCapabilities`] are recorded but never answered.
//!
//! ```no_run
//! # async fn demo() -> meshhost::Result<()> {
//! use meshhost::mock::{BehaviorResult, MockContext, MockController};
//! use meshhost::protocol::HostMessage;
//! use meshhost::{Driver, DriverConfig, NodeId};
//!
//! let mock = MockController::new();
//! // A controller that never answers send requests
//! mock.add_behavior(|_: &MockContext, m: &HostMessage| match m {
//!     HostMessage::SendDataRequest { .. } => BehaviorResult::Intercept,
//!     _ => BehaviorResult::PassThrough,
//! });
//!
//! let mut driver = Driver::with_transport(mock.clone(), DriverConfig::default());
//! driver.connect().await?;
//! let alive = driver.ping(NodeId::new(2)).await?;
//! assert!(!alive);
//! mock.assert_received_host_message(|m| matches!(m, HostMessage::SendDataRequest { .. }));
//! # Ok(())
//! # }
//! ```

mod behavior;
mod capabilities;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{ControllerMessage, FunctionType, HostMessage};
use crate::transport::Transport;

pub use behavior::{
    BehaviorResult, CommunicationState, DEFAULT_SOFT_RESET_DELAY, DEFAULT_TRANSMIT_DELAY,
    DefaultBehavior, MockContext, MockControllerBehavior, MockControllerState,
};
pub use capabilities::{MockControllerCapabilities, default_supported_function_types};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Inner {
    state: Arc<Mutex<MockControllerState>>,
    capabilities: MockControllerCapabilities,
    behaviors: Mutex<Vec<Arc<dyn MockControllerBehavior>>>,
    received: Mutex<Vec<HostMessage>>,
    host: Mutex<Option<mpsc::Sender<Bytes>>>,
    connected: AtomicBool,
}

/// Simulated controller. Clones share the same controller.
#[derive(Clone, Default)]
pub struct MockController {
    inner: Arc<Inner>,
}

impl MockController {
    /// Creates a controller that only runs [`DefaultBehavior`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a controller with the given capabilities.
    #[must_use]
    pub fn with_capabilities(capabilities: MockControllerCapabilities) -> Self {
        Self {
            inner: Arc::new(Inner {
                capabilities,
                ..Inner::default()
            }),
        }
    }

    /// Returns the controller capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &MockControllerCapabilities {
        &self.inner.capabilities
    }

    /// Appends a behavior to the chain.
    pub fn add_behavior(&self, behavior: impl MockControllerBehavior + 'static) {
        lock(&self.inner.behaviors).push(Arc::new(behavior));
    }

    /// Removes every added behavior.
    pub fn clear_behaviors(&self) {
        lock(&self.inner.behaviors).clear();
    }

    /// Returns a copy of the controller state.
    #[must_use]
    pub fn state(&self) -> MockControllerState {
        lock(&self.inner.state).clone()
    }

    /// Sends an unsolicited message to the host.
    pub fn send_to_host(&self, message: ControllerMessage) {
        if let Some(ctx) = self.context() {
            ctx.send_to_host(message);
        }
    }

    /// Returns every message received from the host, oldest first.
    #[must_use]
    pub fn received_host_messages(&self) -> Vec<HostMessage> {
        lock(&self.inner.received).clone()
    }

    /// Counts received host messages matching `predicate`.
    pub fn count_received_host_messages(&self, predicate: impl Fn(&HostMessage) -> bool) -> usize {
        lock(&self.inner.received)
            .iter()
            .filter(|m| predicate(m))
            .count()
    }

    /// Panics unless a received host message matches `predicate`.
    pub fn assert_received_host_message(&self, predicate: impl Fn(&HostMessage) -> bool) {
        let received = lock(&self.inner.received);
        assert!(
            received.iter().any(|m| predicate(m)),
            "no matching host message, received: {received:?}"
        );
    }

    /// Forgets every received host message.
    pub fn clear_received_host_messages(&self) {
        lock(&self.inner.received).clear();
    }

    fn context(&self) -> Option<MockContext> {
        let host = lock(&self.inner.host).clone()?;
        Some(MockContext::new(host, Arc::clone(&self.inner.state)))
    }

    fn on_host_message(&self, message: &HostMessage) {
        lock(&self.inner.received).push(message.clone());
        let function = message.function_type();
        if !self.inner.capabilities.supports(function) {
            tracing::debug!("mock controller: {:?} is not supported", function);
            return;
        }
        let Some(ctx) = self.context() else {
            return;
        };

        let behaviors = lock(&self.inner.behaviors).clone();
        for behavior in behaviors {
            if behavior.on_host_message(&ctx, message) == BehaviorResult::Intercept {
                return;
            }
        }
        DefaultBehavior.on_host_message(&ctx, message);
    }
}

impl Transport for MockController {
    fn set_frame_sender(&mut self, tx: mpsc::Sender<Bytes>) {
        *lock(&self.inner.host) = Some(tx);
    }

    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if lock(&self.inner.host).is_none() {
                return Err(Error::Config {
                    reason: "no frame sender set before connect".into(),
                });
            }
            self.inner.connected.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.inner.connected.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn send(&mut self, body: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.inner.connected.load(Ordering::SeqCst) {
                return Err(Error::NotConnected);
            }
            match HostMessage::parse(&body) {
                Ok(message) => {
                    tracing::trace!("mock -> {:?}", message);
                    self.on_host_message(&message);
                }
                Err(e) => tracing::warn!("mock controller: unparseable frame: {}", e),
            }
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
