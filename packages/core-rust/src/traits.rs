//! Contracts the operation layer expects from the message transport.
//!
//! Framing, retransmission, congestion control and address resolution all
//! live behind these traits. Implementations are shared across threads, so
//! every method takes `&self` and synchronizes internally.

use crate::types::{Address, WireAddress};

/// Delivery status of an outbound message, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutMessageStatus {
    /// `send` has not been called yet.
    NotStarted,
    /// Handed to the transport; delivery not yet confirmed.
    Sent,
    /// The receiver confirmed it is done with the message.
    Completed,
    /// The transport gave up, or the receiver reported an error.
    Failed,
}

/// A message being built for transmission.
pub trait OutMessage: Send + Sync {
    /// Appends application bytes to the end of the message.
    fn append(&self, data: &[u8]);

    /// Inserts bytes in front of the message, consuming reserved headroom.
    fn prepend(&self, data: &[u8]);

    /// Reserves `count` bytes of headroom for a later [`prepend`](Self::prepend).
    fn reserve(&self, count: usize);

    /// Current message length in bytes, including anything prepended.
    fn length(&self) -> usize;

    /// Starts transmitting the message to `destination`.
    fn send(&self, destination: Address);

    /// Stops any further transmission and forgets pending delivery state.
    fn cancel(&self);

    fn status(&self) -> OutMessageStatus;

    /// Returns the message to the transport. Called exactly once.
    fn release(&self);
}

/// A message received from a peer.
pub trait InMessage: Send + Sync {
    /// Length in bytes of the not-yet-stripped portion.
    fn length(&self) -> usize;

    /// Copies up to `out.len()` bytes starting at `offset` into `out`,
    /// returning how many were copied.
    fn get(&self, offset: usize, out: &mut [u8]) -> usize;

    /// Removes `count` bytes from the front of the message.
    fn strip(&self, count: usize);

    /// Whether the sender abandoned this message.
    fn dropped(&self) -> bool;

    /// Tells the sender it may discard its retransmission state.
    fn acknowledge(&self);

    /// Tells the sender the message could not be processed.
    fn fail(&self);

    /// Returns the message to the transport. Called exactly once.
    fn release(&self);
}

/// A message-oriented transport instance.
pub trait Transport: Send + Sync {
    /// Allocates a fresh, empty outbound message.
    fn alloc(&self) -> Box<dyn OutMessage>;

    /// Advances the transport's internal state once.
    fn poll(&self);

    /// Returns the next fully received message, if any.
    fn receive(&self) -> Option<Box<dyn InMessage>>;

    /// Address peers should use to reach this transport.
    fn local_address(&self) -> Address;

    /// Decodes an address from its wire form.
    fn address(&self, wire: &WireAddress) -> Address;

    /// Encodes an address into its wire form.
    fn address_to_wire_format(&self, address: Address) -> WireAddress;
}
