//! Protocol definitions for controller communication.
//!
//! This module contains the low-level protocol types including:
//! - Frame encoding/decoding
//! - Message kinds and function identifiers
//! - Send-data message codec

pub mod frame;
pub mod function;
pub mod message;

pub use frame::{FrameDecoder, MAX_FRAME_SIZE, SOF, encode as encode_frame};
pub use function::{FunctionType, MessageKind};
pub use message::{
    ControllerMessage, DEFAULT_TRANSMIT_OPTIONS, HostMessage, MAX_PAYLOAD_SIZE,
};
