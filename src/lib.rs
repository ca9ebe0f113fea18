//! # meshhost
//!
//! A host-side driver for serial-attached mesh network radio controllers.
//!
//! The host asks the controller to transmit a command to a node and the
//! controller answers twice: once synchronously ("accepted") and once
//! asynchronously with a transmit report tagged by a callback ID. This crate
//! supervises that exchange, detects every way it can stall and recovers
//! by aborting the transmission, soft-resetting the controller and, for
//! payloads that allow it, sending again.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - One serialized state machine per controller link, with no shared locks
//! - Escalating recovery: abort, soft reset, bounded retry
//! - Diagnostic event stream for observing the link
//! - A scriptable mock controller for tests (`mock` feature)
//!
//! ## Quick Start
//!
//! ```no_run
//! use meshhost::{Driver, NodeId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), meshhost::Error> {
//!     let mut driver = Driver::serial("/dev/ttyACM0");
//!     driver.connect().await?;
//!
//!     // Switch a binary switch on (opaque command bytes)
//!     let outcome = driver
//!         .send_data(NodeId::new(5), vec![0x25, 0x01, 0xff], true)
//!         .await?;
//!     println!("delivered: {}", outcome.is_delivered());
//!
//!     println!("node 7 alive: {}", driver.ping(NodeId::new(7)).await?);
//!
//!     driver.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Wire format (frames, function types, messages)
//! - [`types`] - Node and callback identifiers, transmit outcomes
//! - [`transport`] - Transport implementations (currently USB/Serial)
//! - [`timer`] - Cancellable deadlines delivered into the link task
//! - [`link`] - Callback ID allocation, escalation policy and the
//!   transaction supervisor behind [`ControllerLink`]
//! - [`event`] - Async event system for diagnostics
//! - [`driver`] - High-level [`Driver`]

pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod link;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod protocol;
pub mod timer;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::{DriverConfig, LinkConfig};
pub use driver::Driver;
pub use error::{Error, FrameError, Result, TransactionError};
pub use event::{Event, EventDispatcher, EventFilter, EventKind, Subscription};
pub use link::{ControllerLink, LinkState, LinkStatus, TransactionHandle, TransactionId};
pub use protocol::{ControllerMessage, HostMessage};
pub use transport::{SerialTransport, Transport, serial::list_ports};
pub use types::{CallbackId, NodeId, TransmitOutcome, TransmitStatus};
