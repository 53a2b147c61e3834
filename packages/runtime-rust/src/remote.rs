//! Client side of an operation.
//!
//! A [`RemoteOp`] owns one outbound request and, once the matching response
//! arrives, the inbound response. Its state lives in a [`RemoteSlot`] shared
//! with the manager's id map so that `poll()` on any thread can complete it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use stagerpc_core::{Address, MessageHeader, OpId, OutMessageStatus, StageId, HEADER_LEN};
use tracing::{debug, warn};

use crate::buffer::{InboundBuffer, OutboundBuffer};
use crate::manager::OpManager;

/// Lifecycle of a [`RemoteOp`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RemoteOpState {
    NotStarted = 0,
    InProgress = 1,
    Completed = 2,
    Failed = 3,
}

impl RemoteOpState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::InProgress,
            2 => Self::Completed,
            3 => Self::Failed,
            other => panic!("unknown RemoteOp state value {other}"),
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// State of one remote operation shared between its owner and the id map.
pub(crate) struct RemoteSlot {
    request: OutboundBuffer,
    response: Mutex<Option<InboundBuffer>>,
    state: AtomicU8,
}

impl RemoteSlot {
    fn new(request: OutboundBuffer) -> Self {
        Self {
            request,
            response: Mutex::new(None),
            state: AtomicU8::new(RemoteOpState::NotStarted as u8),
        }
    }

    pub(crate) fn state(&self) -> RemoteOpState {
        RemoteOpState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn advance(&self, from: RemoteOpState, to: RemoteOpState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Attaches `response` and marks the operation completed.
    ///
    /// Must be called with the registry lock held. Hands the message back if
    /// the operation is no longer waiting for it.
    pub(crate) fn complete(&self, response: InboundBuffer) -> Result<(), InboundBuffer> {
        if self.state() != RemoteOpState::InProgress {
            return Err(response);
        }
        *self.response.lock() = Some(response);
        self.request.cancel();
        if self.advance(RemoteOpState::InProgress, RemoteOpState::Completed) {
            Ok(())
        } else {
            // Lost the race against a concurrent failure observation.
            self.response.lock().take().map_or(Ok(()), Err)
        }
    }
}

/// Handle for one outstanding call issued through an [`OpManager`].
///
/// Dropping the handle abandons the call: it is deregistered, both buffers
/// are released, and any response that arrives later is discarded.
pub struct RemoteOp<'m> {
    manager: &'m OpManager,
    slot: Arc<RemoteSlot>,
    op_id: Option<OpId>,
}

impl<'m> RemoteOp<'m> {
    /// Creates an unsent operation with header space reserved in its request.
    #[must_use]
    pub fn new(manager: &'m OpManager) -> Self {
        let request = OutboundBuffer::new(manager.transport().alloc());
        request.reserve(HEADER_LEN);
        Self {
            manager,
            slot: Arc::new(RemoteSlot::new(request)),
            op_id: None,
        }
    }

    /// Request buffer; append the payload here before calling [`send`](Self::send).
    #[must_use]
    pub fn request(&self) -> &OutboundBuffer {
        &self.slot.request
    }

    /// The response, once the operation has completed.
    #[must_use]
    pub fn response(&self) -> Option<MappedMutexGuard<'_, InboundBuffer>> {
        MutexGuard::try_map(self.slot.response.lock(), Option::as_mut).ok()
    }

    /// Moves the response out of the operation.
    pub fn take_response(&mut self) -> Option<InboundBuffer> {
        self.slot.response.lock().take()
    }

    #[must_use]
    pub fn state(&self) -> RemoteOpState {
        self.slot.state()
    }

    /// Id assigned by [`send`](Self::send); `None` before the first send.
    #[must_use]
    pub fn op_id(&self) -> Option<OpId> {
        self.op_id
    }

    /// Registers the operation and transmits its request to `destination`.
    ///
    /// Failures are not reported here; they surface later through
    /// [`is_ready`](Self::is_ready) and [`state`](Self::state).
    pub fn send(&mut self, destination: Address) {
        if !self.slot.advance(RemoteOpState::NotStarted, RemoteOpState::InProgress) {
            warn!(op_id = ?self.op_id, "send() on a RemoteOp that was already sent; ignoring");
            return;
        }
        let transport = self.manager.transport();
        let reply_address = transport.address_to_wire_format(transport.local_address());
        let op_id = self.manager.register_remote(&self.slot);
        self.op_id = Some(op_id);

        let header = MessageHeader::new(op_id, StageId::INITIAL_REQUEST, reply_address);
        self.slot.request.prepend(&header.encode());
        debug!(%op_id, %destination, "sending request");
        self.slot.request.send(destination);
    }

    /// Returns `true` once the operation has completed or failed.
    ///
    /// Never blocks. While in progress, a transport-reported failure of the
    /// request is observed here and moves the operation to `Failed`.
    pub fn is_ready(&self) -> bool {
        match self.slot.state() {
            RemoteOpState::NotStarted => false,
            RemoteOpState::InProgress => {
                if self.slot.request.status() == OutMessageStatus::Failed
                    && self.slot.advance(RemoteOpState::InProgress, RemoteOpState::Failed)
                {
                    debug!(op_id = ?self.op_id, "request failed in transport");
                    return true;
                }
                self.slot.state().is_terminal()
            }
            RemoteOpState::Completed | RemoteOpState::Failed => true,
        }
    }

    /// Polls the manager until the operation is ready.
    ///
    /// Returns immediately on an operation that was never sent, since no
    /// amount of polling could make it ready.
    pub fn wait(&self) {
        if self.state() == RemoteOpState::NotStarted {
            warn!("wait() on a RemoteOp that was never sent; returning immediately");
            return;
        }
        while !self.is_ready() {
            self.poll_once();
        }
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    ///
    /// Returns whether the operation became ready.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_ready() {
            if self.state() == RemoteOpState::NotStarted || Instant::now() >= deadline {
                return false;
            }
            self.poll_once();
        }
        true
    }

    fn poll_once(&self) {
        self.manager.poll();
        if self.manager.config().wait_yield {
            std::thread::yield_now();
        }
    }
}

impl Drop for RemoteOp<'_> {
    fn drop(&mut self) {
        if let Some(op_id) = self.op_id {
            self.manager.deregister_remote(op_id);
        }
    }
}

impl std::fmt::Debug for RemoteOp<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteOp")
            .field("op_id", &self.op_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use stagerpc_core::Address;

    use super::*;
    use crate::memory::MemoryNetwork;

    const CLIENT: Address = Address(1);
    const SERVER: Address = Address(2);

    #[test]
    fn state_decoding_covers_every_variant() {
        for state in [
            RemoteOpState::NotStarted,
            RemoteOpState::InProgress,
            RemoteOpState::Completed,
            RemoteOpState::Failed,
        ] {
            assert_eq!(RemoteOpState::from_u8(state as u8), state);
        }
    }

    #[test]
    #[should_panic(expected = "unknown RemoteOp state")]
    fn unknown_state_value_panics() {
        let _ = RemoteOpState::from_u8(9);
    }

    #[test]
    fn new_op_is_not_started_and_not_ready() {
        let network = MemoryNetwork::new();
        let manager = OpManager::new(Box::new(network.bind(CLIENT).unwrap()), 1);
        let op = RemoteOp::new(&manager);
        assert_eq!(op.state(), RemoteOpState::NotStarted);
        assert!(op.op_id().is_none());
        assert!(!op.is_ready());
        assert!(op.response().is_none());
    }

    #[test]
    fn send_assigns_id_and_registers() {
        let network = MemoryNetwork::new();
        let _server = network.bind(SERVER).unwrap();
        let manager = OpManager::new(Box::new(network.bind(CLIENT).unwrap()), 7);

        let mut op = RemoteOp::new(&manager);
        op.request().append(b"ping");
        op.send(SERVER);

        assert_eq!(op.state(), RemoteOpState::InProgress);
        assert_eq!(op.op_id().map(|id| id.transport_id), Some(7));
        assert_eq!(manager.stats().remote_ops, 1);
        assert!(!op.is_ready());
        assert_eq!(network.in_flight(SERVER), 1);
    }

    #[test]
    fn ids_increase_per_send() {
        let network = MemoryNetwork::new();
        let _server = network.bind(SERVER).unwrap();
        let manager = OpManager::new(Box::new(network.bind(CLIENT).unwrap()), 3);

        let mut first = RemoteOp::new(&manager);
        let mut second = RemoteOp::new(&manager);
        first.send(SERVER);
        second.send(SERVER);

        let a = first.op_id().unwrap();
        let b = second.op_id().unwrap();
        assert!(a.sequence < b.sequence);
        assert_eq!(manager.stats().remote_ops, 2);
    }

    #[test]
    fn second_send_is_ignored() {
        let network = MemoryNetwork::new();
        let _server = network.bind(SERVER).unwrap();
        let manager = OpManager::new(Box::new(network.bind(CLIENT).unwrap()), 1);

        let mut op = RemoteOp::new(&manager);
        op.send(SERVER);
        let id = op.op_id();
        op.send(SERVER);

        assert_eq!(op.op_id(), id);
        assert_eq!(network.in_flight(SERVER), 1);
        assert_eq!(manager.stats().remote_ops, 1);
    }

    #[test]
    fn transport_failure_is_observed_lazily() {
        let network = MemoryNetwork::new();
        let manager = OpManager::new(Box::new(network.bind(CLIENT).unwrap()), 1);

        let mut op = RemoteOp::new(&manager);
        // Nothing is bound at SERVER, so the transport fails the request.
        op.send(SERVER);
        assert_eq!(op.state(), RemoteOpState::InProgress);
        assert!(op.is_ready());
        assert_eq!(op.state(), RemoteOpState::Failed);
        // Still ready, still failed.
        assert!(op.is_ready());
        assert_eq!(op.state(), RemoteOpState::Failed);
    }

    #[test]
    fn drop_deregisters_and_releases_buffers() {
        let network = MemoryNetwork::new();
        let _server = network.bind(SERVER).unwrap();
        let manager = OpManager::new(Box::new(network.bind(CLIENT).unwrap()), 1);

        {
            let mut op = RemoteOp::new(&manager);
            op.send(SERVER);
            assert_eq!(manager.stats().remote_ops, 1);
        }

        assert_eq!(manager.stats().remote_ops, 0);
        let counters = network.counters();
        assert_eq!(counters.out_allocated, 1);
        assert_eq!(counters.out_released, 1);
    }

    #[test]
    fn drop_unsent_op_releases_request() {
        let network = MemoryNetwork::new();
        let manager = OpManager::new(Box::new(network.bind(CLIENT).unwrap()), 1);
        drop(RemoteOp::new(&manager));
        assert_eq!(network.counters().out_released, 1);
        assert_eq!(manager.stats().remote_ops, 0);
    }

    #[test]
    fn wait_on_unsent_op_returns() {
        let network = MemoryNetwork::new();
        let manager = OpManager::new(Box::new(network.bind(CLIENT).unwrap()), 1);
        let op = RemoteOp::new(&manager);
        op.wait();
        assert!(!op.wait_timeout(Duration::from_millis(1)));
        assert_eq!(op.state(), RemoteOpState::NotStarted);
    }

    #[test]
    fn wait_timeout_expires_without_response() {
        let network = MemoryNetwork::new();
        let _server = network.bind(SERVER).unwrap();
        let manager = OpManager::new(Box::new(network.bind(CLIENT).unwrap()), 1);

        let mut op = RemoteOp::new(&manager);
        op.send(SERVER);
        assert!(!op.wait_timeout(Duration::from_millis(5)));
        assert_eq!(op.state(), RemoteOpState::InProgress);
    }
}
