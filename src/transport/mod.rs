//! Transport layer for the controller connection.
//!
//! A transport moves frame bodies (type, function, payload) between the host
//! and the controller. Framing, if any, is its own business: the serial
//! transport wraps bodies in data frames, the mock controller passes them
//! through untouched.

pub mod serial;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;

/// Trait for transport implementations.
pub trait Transport: Send + Sync {
    /// Sets the channel that received frame bodies are delivered to.
    ///
    /// Must be called before [`connect`](Self::connect).
    fn set_frame_sender(&mut self, tx: mpsc::Sender<Bytes>);

    /// Connects to the controller.
    fn connect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Disconnects from the controller.
    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Sends one frame body to the controller.
    fn send(&mut self, body: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Returns true if connected.
    fn is_connected(&self) -> bool;
}

pub use serial::SerialTransport;
