use std::fmt;

use serde::{Deserialize, Serialize};

/// Globally unique name of one end-to-end operation.
///
/// Combines the identifier of the transport that issued the operation with a
/// per-transport sequence number. Two ids only collide if two transports
/// share a `transport_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct OpId {
    /// Identifier of the transport instance that allocated this id.
    pub transport_id: u64,
    /// Monotonically increasing sequence number within that transport.
    pub sequence: u64,
}

impl OpId {
    #[must_use]
    pub const fn new(transport_id: u64, sequence: u64) -> Self {
        Self {
            transport_id,
            sequence,
        }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport_id, self.sequence)
    }
}

/// Position of a message within an operation's chain of hops.
///
/// `0` is the initial request, `u32::MAX` marks the ultimate response sent
/// back to the originator, and everything in between is a delegated stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct StageId(pub u32);

impl StageId {
    /// Stage carried by the request a client sends.
    pub const INITIAL_REQUEST: StageId = StageId(0);
    /// Stage carried by the final reply routed back to the originator.
    pub const ULTIMATE_RESPONSE: StageId = StageId(u32::MAX);

    #[must_use]
    pub fn is_initial_request(self) -> bool {
        self == Self::INITIAL_REQUEST
    }

    #[must_use]
    pub fn is_ultimate_response(self) -> bool {
        self == Self::ULTIMATE_RESPONSE
    }

    /// Stage used when delegating this stage to the next hop.
    ///
    /// Saturates one below the ultimate-response marker so that a delegated
    /// request can never be mistaken for a reply.
    #[must_use]
    pub fn next(self) -> StageId {
        debug_assert!(!self.is_ultimate_response(), "cannot delegate a response");
        StageId(self.0.saturating_add(1).min(u32::MAX - 1))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ultimate_response() {
            f.write_str("response")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Driver-level address of a transport endpoint.
///
/// Opaque to this layer; only the transport knows how to route it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Address(pub u64);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr:{:#x}", self.0)
    }
}

/// Size in bytes of a driver-encoded address on the wire.
pub const WIRE_ADDRESS_LEN: usize = 20;

/// An [`Address`] in the transport's wire encoding.
///
/// The first byte conventionally carries the address family and the rest the
/// family-specific payload; this layer never looks inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WireAddress(pub [u8; WIRE_ADDRESS_LEN]);

impl WireAddress {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; WIRE_ADDRESS_LEN] {
        &self.0
    }
}
