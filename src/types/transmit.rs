//! Transmit status and transaction outcome types.

use crate::types::node::CallbackId;

/// Delivery status carried by a transmit report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmitStatus {
    /// The destination acknowledged the frame.
    Ok,
    /// The destination did not acknowledge the frame.
    NoAck,
    /// Transmission failed (e.g. the channel was jammed).
    Fail,
    /// The controller was not idle and could not transmit.
    NotIdle,
    /// No route to the destination.
    NoRoute,
    /// Status byte not known to this library.
    Other(u8),
}

impl TransmitStatus {
    /// Parses a transmit status from its wire value.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Ok,
            0x01 => Self::NoAck,
            0x02 => Self::Fail,
            0x03 => Self::NotIdle,
            0x04 => Self::NoRoute,
            other => Self::Other(other),
        }
    }

    /// Returns the wire value.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::NoAck => 0x01,
            Self::Fail => 0x02,
            Self::NotIdle => 0x03,
            Self::NoRoute => 0x04,
            Self::Other(other) => other,
        }
    }

    /// Returns true if the destination acknowledged the transmission.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Final outcome of a transaction that received a transmit report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitOutcome {
    /// Status reported by the controller.
    pub status: TransmitStatus,
    /// Callback ID of the attempt that produced the report.
    pub callback_id: CallbackId,
    /// Automatic retries consumed before this outcome.
    pub retries_used: u8,
}

impl TransmitOutcome {
    /// Returns true if the destination acknowledged the transmission.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        self.status.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmit_status_bytes() {
        assert_eq!(TransmitStatus::from_byte(0x00), TransmitStatus::Ok);
        assert_eq!(TransmitStatus::from_byte(0x04), TransmitStatus::NoRoute);
        assert_eq!(TransmitStatus::from_byte(0x42), TransmitStatus::Other(0x42));
        assert_eq!(TransmitStatus::Other(0x42).to_byte(), 0x42);
        assert_eq!(TransmitStatus::NoAck.to_byte(), 0x01);
    }

    #[test]
    fn test_only_ok_is_delivered() {
        assert!(TransmitStatus::Ok.is_ok());
        assert!(!TransmitStatus::NoAck.is_ok());
        assert!(!TransmitStatus::Other(0).is_ok());
    }
}
