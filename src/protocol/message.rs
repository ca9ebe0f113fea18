//! Send-data message codec.
//!
//! [`HostMessage`]s travel from the host to the controller and
//! [`ControllerMessage`]s the other way. Both encode to and parse from a
//! frame body: `<kind> <function> <fields...>`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, FrameError, Result};
use crate::protocol::function::{FunctionType, MessageKind};
use crate::types::{CallbackId, NodeId, TransmitStatus};

/// Transmit option: request an acknowledgment from the destination.
pub const TRANSMIT_OPTION_ACK: u8 = 0x01;
/// Transmit option: let the controller route automatically.
pub const TRANSMIT_OPTION_AUTO_ROUTE: u8 = 0x04;
/// Transmit option: fall back to explorer frames.
pub const TRANSMIT_OPTION_EXPLORE: u8 = 0x20;

/// Transmit options used for every send-data request.
pub const DEFAULT_TRANSMIT_OPTIONS: u8 =
    TRANSMIT_OPTION_ACK | TRANSMIT_OPTION_AUTO_ROUTE | TRANSMIT_OPTION_EXPLORE;

/// Largest payload that still fits a send-data frame.
pub const MAX_PAYLOAD_SIZE: usize = 247;

/// Messages sent from the host to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    /// Transmit `payload` to `destination`, reporting back with `callback_id`.
    SendDataRequest {
        callback_id: CallbackId,
        destination: NodeId,
        payload: Bytes,
        transmit_options: u8,
    },
    /// Stop the transmission identified by `callback_id`.
    SendDataAbort { callback_id: CallbackId },
    /// Reinitialize the controller's communication state.
    SoftResetRequest,
}

impl HostMessage {
    /// Returns the controller function this message invokes.
    #[must_use]
    pub const fn function_type(&self) -> FunctionType {
        match self {
            Self::SendDataRequest { .. } => FunctionType::SendData,
            Self::SendDataAbort { .. } => FunctionType::SendDataAbort,
            Self::SoftResetRequest => FunctionType::SoftReset,
        }
    }

    /// Returns the callback ID carried by this message, if any.
    #[must_use]
    pub const fn callback_id(&self) -> Option<CallbackId> {
        match self {
            Self::SendDataRequest { callback_id, .. } | Self::SendDataAbort { callback_id } => {
                Some(*callback_id)
            }
            Self::SoftResetRequest => None,
        }
    }

    /// Encodes the message into a frame body.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(MessageKind::Request.into());
        buf.put_u8(self.function_type().into());

        match self {
            Self::SendDataRequest {
                callback_id,
                destination,
                payload,
                transmit_options,
            } => {
                buf.put_u16(destination.get());
                // Length is bounded by MAX_PAYLOAD_SIZE at submission
                buf.put_u8(payload.len() as u8);
                buf.put_slice(payload);
                buf.put_u8(*transmit_options);
                buf.put_u8(callback_id.get());
            }
            Self::SendDataAbort { callback_id } => buf.put_u8(callback_id.get()),
            Self::SoftResetRequest => {}
        }

        buf.freeze()
    }

    /// Parses a host message from a frame body.
    ///
    /// Used by the controller side of the link (e.g. the mock controller).
    pub fn parse(body: &[u8]) -> Result<Self> {
        let (kind, function, data) = split_header(body)?;
        if kind != MessageKind::Request as u8 {
            return Err(protocol_error(format!(
                "host messages must be requests, got kind 0x{kind:02x}"
            )));
        }

        match FunctionType::from_byte(function) {
            Some(FunctionType::SendData) => {
                require(data, 3)?;
                let destination = NodeId::new(u16::from_be_bytes([data[0], data[1]]));
                let len = data[2] as usize;
                require(data, 3 + len + 2)?;
                let payload = Bytes::copy_from_slice(&data[3..3 + len]);
                let transmit_options = data[3 + len];
                let callback_id = callback_id(data[4 + len])?;
                Ok(Self::SendDataRequest {
                    callback_id,
                    destination,
                    payload,
                    transmit_options,
                })
            }
            Some(FunctionType::SendDataAbort) => {
                require(data, 1)?;
                Ok(Self::SendDataAbort {
                    callback_id: callback_id(data[0])?,
                })
            }
            Some(FunctionType::SoftReset) => Ok(Self::SoftResetRequest),
            _ => Err(protocol_error(format!(
                "unsupported host function 0x{function:02x}"
            ))),
        }
    }
}

/// Messages received from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerMessage {
    /// Synchronous answer to a send-data request.
    SendDataResponse { was_sent: bool },
    /// Asynchronous delivery report for an accepted send-data request.
    SendDataTransmitReport {
        callback_id: CallbackId,
        transmit_status: TransmitStatus,
    },
    /// Controller acknowledged an abort request.
    SendDataAbortResponse,
    /// Controller (re)started and is ready for commands.
    SerialApiStarted { wake_up_reason: u8 },
    /// Any message the driver does not interpret.
    Unknown {
        kind: MessageKind,
        function: u8,
        data: Bytes,
    },
}

impl ControllerMessage {
    /// Returns the callback ID carried by this message, if any.
    #[must_use]
    pub const fn callback_id(&self) -> Option<CallbackId> {
        match self {
            Self::SendDataTransmitReport { callback_id, .. } => Some(*callback_id),
            _ => None,
        }
    }

    /// Encodes the message into a frame body.
    ///
    /// Used by the controller side of the link (e.g. the mock controller).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6);
        match self {
            Self::SendDataResponse { was_sent } => {
                buf.put_u8(MessageKind::Response.into());
                buf.put_u8(FunctionType::SendData.into());
                buf.put_u8(u8::from(*was_sent));
            }
            Self::SendDataTransmitReport {
                callback_id,
                transmit_status,
            } => {
                buf.put_u8(MessageKind::Request.into());
                buf.put_u8(FunctionType::SendData.into());
                buf.put_u8(callback_id.get());
                buf.put_u8(transmit_status.to_byte());
            }
            Self::SendDataAbortResponse => {
                buf.put_u8(MessageKind::Response.into());
                buf.put_u8(FunctionType::SendDataAbort.into());
            }
            Self::SerialApiStarted { wake_up_reason } => {
                buf.put_u8(MessageKind::Request.into());
                buf.put_u8(FunctionType::SerialApiStarted.into());
                buf.put_u8(*wake_up_reason);
            }
            Self::Unknown {
                kind,
                function,
                data,
            } => {
                buf.put_u8((*kind).into());
                buf.put_u8(*function);
                buf.put_slice(data);
            }
        }
        buf.freeze()
    }

    /// Parses a controller message from a frame body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let (kind_byte, function, data) = split_header(body)?;
        let kind = MessageKind::from_byte(kind_byte).ok_or(FrameError::UnknownType(kind_byte))?;

        let message = match (kind, FunctionType::from_byte(function)) {
            (MessageKind::Response, Some(FunctionType::SendData)) => {
                require(data, 1)?;
                Self::SendDataResponse {
                    was_sent: data[0] != 0,
                }
            }
            (MessageKind::Request, Some(FunctionType::SendData)) => {
                // Trailing transmit-report statistics are not interpreted
                require(data, 2)?;
                Self::SendDataTransmitReport {
                    callback_id: callback_id(data[0])?,
                    transmit_status: TransmitStatus::from_byte(data[1]),
                }
            }
            (MessageKind::Response, Some(FunctionType::SendDataAbort)) => {
                Self::SendDataAbortResponse
            }
            (MessageKind::Request, Some(FunctionType::SerialApiStarted)) => {
                Self::SerialApiStarted {
                    wake_up_reason: data.first().copied().unwrap_or(0),
                }
            }
            _ => Self::Unknown {
                kind,
                function,
                data: Bytes::copy_from_slice(data),
            },
        };

        Ok(message)
    }
}

fn split_header(body: &[u8]) -> Result<(u8, u8, &[u8])> {
    if body.len() < 2 {
        return Err(FrameError::TooShort {
            need: 2,
            got: body.len(),
        }
        .into());
    }
    Ok((body[0], body[1], &body[2..]))
}

fn require(data: &[u8], need: usize) -> Result<()> {
    if data.len() < need {
        return Err(FrameError::Incomplete {
            expected: need,
            got: data.len(),
        }
        .into());
    }
    Ok(())
}

fn callback_id(byte: u8) -> Result<CallbackId> {
    CallbackId::new(byte).ok_or_else(|| protocol_error("callback ID 0 is reserved".into()))
}

fn protocol_error(message: String) -> Error {
    Error::Protocol { message }
}
