//! Main [`Driver`] implementation.
//!
//! The driver owns the transport, starts the controller link on connect and
//! feeds it every frame the transport receives. It serializes callers so
//! that `send_data` waits for its turn instead of failing with
//! [`Error::LinkBusy`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher, EventFilter, Subscription};
use crate::link::ControllerLink;
use crate::protocol::ControllerMessage;
use crate::transport::{SerialTransport, Transport, serial::SerialConfig};
use crate::types::{NodeId, TransmitOutcome};

/// Payload of a liveness probe: an empty no-operation command.
const NOP_PAYLOAD: &[u8] = &[0x00];

/// Capacity of the channel between the transport and the link.
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Host-side driver for one controller.
pub struct Driver<T> {
    transport: Arc<Mutex<T>>,
    config: DriverConfig,
    dispatcher: EventDispatcher,
    link: Option<ControllerLink>,
    send_lock: Mutex<()>,

    // Background tasks
    link_task: Option<JoinHandle<()>>,
    process_task: Option<JoinHandle<()>>,
}

impl Driver<SerialTransport> {
    /// Creates a new driver for a serial port.
    ///
    /// # Arguments
    ///
    /// * `port` - Serial port path (e.g., "/dev/ttyACM0")
    ///
    /// # Returns
    ///
    /// A new driver (not yet connected).
    #[must_use]
    pub fn serial(port: impl Into<String>) -> Self {
        Self::with_serial_config(SerialConfig::new(port), DriverConfig::default())
    }

    /// Creates a new driver with custom serial and driver configuration.
    #[must_use]
    pub fn with_serial_config(serial: SerialConfig, config: DriverConfig) -> Self {
        Self::with_transport(SerialTransport::new(serial), config)
    }
}

impl<T: Transport + 'static> Driver<T> {
    /// Creates a new driver with the given transport.
    #[must_use]
    pub fn with_transport(transport: T, config: DriverConfig) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            dispatcher: EventDispatcher::new(config.event_capacity),
            config,
            link: None,
            send_lock: Mutex::new(()),
            link_task: None,
            process_task: None,
        }
    }

    /// Connects to the controller and starts the link.
    ///
    /// This will:
    /// 1. Open the transport connection
    /// 2. Start the controller link and the inbound processing task
    /// 3. Soft-reset the controller if configured to
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the transport
    /// cannot be opened or the startup soft reset fails.
    pub async fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        self.config.link.validate()?;

        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(FRAME_CHANNEL_CAPACITY);
        {
            let mut transport = self.transport.lock().await;
            transport.set_frame_sender(frame_tx);
            transport.connect().await?;
        }

        let (link, link_task) = ControllerLink::spawn(
            Arc::clone(&self.transport),
            self.config.link,
            self.dispatcher.clone(),
        )?;
        self.process_task = Some(tokio::spawn(process_frames(frame_rx, link.clone())));
        self.link_task = Some(link_task);
        self.link = Some(link);

        if self.config.soft_reset_on_connect {
            tracing::info!("soft-resetting controller after connect");
            if let Err(e) = self.soft_reset().await {
                self.disconnect().await?;
                return Err(e);
            }
        }

        self.dispatcher.dispatch(Event::Connected);
        Ok(())
    }

    /// Disconnects from the controller.
    ///
    /// Transactions still in flight resolve with
    /// [`TransactionError::LinkReset`](crate::TransactionError::LinkReset).
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(task) = self.process_task.take() {
            task.abort();
        }
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        self.link = None;

        {
            let mut transport = self.transport.lock().await;
            transport.disconnect().await?;
        }

        self.dispatcher.dispatch(Event::Disconnected);
        Ok(())
    }

    /// Re-opens the transport and invalidates every transaction of the
    /// previous connection.
    pub async fn reconnect(&mut self) -> Result<()> {
        let Some(link) = self.link.clone() else {
            return self.connect().await;
        };

        {
            let mut transport = self.transport.lock().await;
            transport.disconnect().await?;
            transport.connect().await?;
        }
        link.on_link_reset()?;

        self.dispatcher.dispatch(Event::Connected);
        Ok(())
    }

    /// Returns true if connected.
    pub async fn is_connected(&self) -> bool {
        self.link.is_some() && self.transport.lock().await.is_connected()
    }

    /// Returns the controller link, if connected.
    #[must_use]
    pub const fn link(&self) -> Option<&ControllerLink> {
        self.link.as_ref()
    }

    /// Returns the driver configuration.
    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Subscribes to events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.dispatcher.subscribe()
    }

    /// Waits for an event matching `filter`.
    ///
    /// Returns `None` if no such event is dispatched within `timeout`.
    pub async fn wait_for(&self, filter: EventFilter, timeout: Duration) -> Option<Event> {
        self.dispatcher.wait_for(filter, timeout).await
    }

    fn connected_link(&self) -> Result<&ControllerLink> {
        self.link.as_ref().ok_or(Error::NotConnected)
    }

    // ==================== Sending ====================

    /// Sends `payload` to `destination` and waits for the transmit report.
    ///
    /// Concurrent callers are served one at a time. Pass `retryable = false`
    /// for payloads that must not be sent twice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] if the transaction failed, or a link
    /// error if it could not be started.
    pub async fn send_data(
        &self,
        destination: NodeId,
        payload: impl Into<Bytes>,
        retryable: bool,
    ) -> Result<TransmitOutcome> {
        let link = self.connected_link()?;
        let _turn = self.send_lock.lock().await;
        // A previous caller may have given up while its send is still escalating
        link.idle().await?;

        let handle = link.submit(destination, payload, retryable).await?;
        tracing::debug!("{} submitted to {}", handle.id(), destination);
        Ok(handle.wait().await?)
    }

    /// Checks whether `destination` acknowledges a no-operation frame.
    ///
    /// Returns `Ok(false)` for any failed transaction or a non-`Ok` transmit
    /// status. The probe is never retried after a soft reset.
    pub async fn ping(&self, destination: NodeId) -> Result<bool> {
        match self
            .send_data(destination, Bytes::from_static(NOP_PAYLOAD), false)
            .await
        {
            Ok(outcome) => Ok(outcome.is_delivered()),
            Err(Error::Transaction(reason)) => {
                tracing::debug!("ping to {} failed: {}", destination, reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Soft-resets the controller and waits until it is ready again.
    pub async fn soft_reset(&self) -> Result<()> {
        let link = self.connected_link()?;
        let _turn = self.send_lock.lock().await;
        link.idle().await?;
        link.soft_reset().await
    }
}

/// Parses frame bodies from the transport and hands them to the link.
async fn process_frames(mut frame_rx: mpsc::Receiver<Bytes>, link: ControllerLink) {
    while let Some(body) = frame_rx.recv().await {
        tracing::trace!("processing frame {}", hex::encode(&body));
        match ControllerMessage::parse(&body) {
            Ok(message) => {
                if link.on_inbound_message(message).is_err() {
                    tracing::debug!("controller link closed, stopping frame processing");
                    return;
                }
            }
            Err(e) => tracing::warn!("failed to parse controller message: {}", e),
        }
    }
    tracing::debug!("transport closed");
}

impl<T> Drop for Driver<T> {
    fn drop(&mut self) {
        if let Some(task) = self.process_task.take() {
            task.abort();
        }
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
    }
}
