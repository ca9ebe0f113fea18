//! Node and callback identifiers.

use std::fmt;

/// Identifier of a node in the mesh network.
///
/// Opaque to the link layer; it is only carried to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u16);

impl NodeId {
    /// Creates a node identifier.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl From<u16> for NodeId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}", self.0)
    }
}

/// Correlation token echoed by the controller in a transmit report.
///
/// Valid IDs are `1..=255`; zero means "no callback requested" on the wire
/// and is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u8);

impl CallbackId {
    /// Smallest allocatable callback ID.
    pub const MIN: u8 = 1;
    /// Largest allocatable callback ID.
    pub const MAX: u8 = u8::MAX;

    /// Creates a callback ID, rejecting the reserved value zero.
    #[must_use]
    pub const fn new(id: u8) -> Option<Self> {
        if id == 0 { None } else { Some(Self(id)) }
    }

    /// Returns the raw wire value.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
