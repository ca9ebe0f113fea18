//! Message kinds and function identifiers of the controller protocol.
//!
//! The first two bytes of every frame body select the message kind
//! (request or response) and the controller function it belongs to.

/// Whether a frame is a request or the synchronous response to one.
///
/// Asynchronous callbacks from the controller are sent as requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Request (host → controller) or callback (controller → host).
    Request = 0x00,
    /// Synchronous response to a request.
    Response = 0x01,
}

impl MessageKind {
    /// Parses a message kind from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Request),
            0x01 => Some(Self::Response),
            _ => None,
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as Self
    }
}

/// Controller functions used by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionType {
    /// Reinitialize the controller's communication state.
    SoftReset = 0x08,
    /// Controller announces it is ready to accept commands.
    SerialApiStarted = 0x0A,
    /// Transmit a payload to a node.
    SendData = 0x13,
    /// Abort an ongoing transmission.
    SendDataAbort = 0x16,
}

impl FunctionType {
    /// Parses a function type from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x08 => Some(Self::SoftReset),
            0x0A => Some(Self::SerialApiStarted),
            0x13 => Some(Self::SendData),
            0x16 => Some(Self::SendDataAbort),
            _ => None,
        }
    }
}

impl From<FunctionType> for u8 {
    fn from(function: FunctionType) -> Self {
        function as Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_type_from_byte() {
        assert_eq!(FunctionType::from_byte(0x13), Some(FunctionType::SendData));
        assert_eq!(FunctionType::from_byte(0x0A), Some(FunctionType::SerialApiStarted));
        assert_eq!(FunctionType::from_byte(0x42), None);
        assert_eq!(u8::from(FunctionType::SendDataAbort), 0x16);
    }

    #[test]
    fn test_message_kind_from_byte() {
        assert_eq!(MessageKind::from_byte(0x00), Some(MessageKind::Request));
        assert_eq!(MessageKind::from_byte(0x01), Some(MessageKind::Response));
        assert_eq!(MessageKind::from_byte(0x02), None);
    }
}
