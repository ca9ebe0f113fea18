//! Data types shared across the driver.
//!
//! - Node and callback identifiers
//! - Transmit status and outcomes

pub mod node;
pub mod transmit;

pub use node::{CallbackId, NodeId};
pub use transmit::{TransmitOutcome, TransmitStatus};
