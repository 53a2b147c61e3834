//! Server side of an operation.
//!
//! A [`ServerOp`] represents one received request at one stage of an
//! operation. The application claims it from the manager, fills in the
//! response buffer, and either replies to the originator or delegates the
//! operation to another server. [`ServerOp::make_progress`] then drives it to
//! a terminal state.
//!
//! An op dropped before it is finished is not lost: it is handed back to the
//! manager, which keeps driving it from `poll()` until it terminates.

use std::fmt;

use stagerpc_core::{Address, MessageHeader, OpId, OutMessageStatus, StageId, Transport};
use tracing::{debug, warn};

use crate::buffer::{InboundBuffer, OutboundBuffer};
use crate::manager::OpManager;

/// Lifecycle of a [`ServerOp`].
///
/// `Completed`, `Dropped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOpState {
    /// Empty op, or not yet claimed.
    NotStarted,
    InProgress,
    /// The response was delivered (or, for a final reply, handed to the transport).
    Completed,
    /// The sender abandoned the request; no reply is possible.
    Dropped,
    /// The transport failed to deliver the response.
    Failed,
}

impl ServerOpState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Dropped | Self::Failed)
    }
}

/// A received request waiting in the manager's FIFO to be claimed.
pub(crate) struct PendingRequest {
    pub(crate) request: InboundBuffer,
    pub(crate) op_id: OpId,
    pub(crate) stage_id: StageId,
    pub(crate) reply_address: Address,
}

/// A claimed request together with its response buffer.
///
/// Owned by the application through [`ServerOp`], or by the manager once
/// detached.
pub(crate) struct ActiveOp {
    request: InboundBuffer,
    response: OutboundBuffer,
    op_id: OpId,
    stage_id: StageId,
    reply_address: Address,
    state: ServerOpState,
    detached: bool,
    delegated: bool,
    request_failed: bool,
}

impl ActiveOp {
    pub(crate) fn claim(pending: PendingRequest, response: OutboundBuffer) -> Self {
        Self {
            request: pending.request,
            response,
            op_id: pending.op_id,
            stage_id: pending.stage_id,
            reply_address: pending.reply_address,
            state: ServerOpState::InProgress,
            detached: false,
            delegated: false,
            request_failed: false,
        }
    }

    pub(crate) fn op_id(&self) -> OpId {
        self.op_id
    }

    pub(crate) fn state(&self) -> ServerOpState {
        self.state
    }

    /// Whether dropping the owning handle should hand this op to the manager.
    pub(crate) fn needs_detach(&self) -> bool {
        !self.detached && self.state != ServerOpState::NotStarted
    }

    pub(crate) fn mark_detached(&mut self) {
        self.detached = true;
    }

    pub(crate) fn make_progress(&mut self) -> ServerOpState {
        if self.state == ServerOpState::InProgress {
            let out_status = self.response.status();
            if self.request.dropped() {
                self.state = ServerOpState::Dropped;
            } else if out_status == OutMessageStatus::Completed
                || (out_status == OutMessageStatus::Sent && !self.delegated)
            {
                self.state = ServerOpState::Completed;
                if !self.stage_id.is_initial_request() {
                    self.request.acknowledge();
                }
            } else if out_status == OutMessageStatus::Failed {
                self.state = ServerOpState::Failed;
                // Forget the failed delivery so the response can be retried.
                self.response.cancel();
            }
        }

        // Nobody will ever reply to an abandoned failed op; tell the caller.
        if self.state == ServerOpState::Failed && self.detached && !self.request_failed {
            self.request_failed = true;
            self.request.fail();
        }
        self.state
    }

    fn reply(&mut self, transport: &dyn Transport) {
        let header = MessageHeader::new(
            self.op_id,
            StageId::ULTIMATE_RESPONSE,
            transport.address_to_wire_format(self.reply_address),
        );
        self.response.prepend(&header.encode());
        debug!(op_id = %self.op_id, stage = %self.stage_id, reply_to = %self.reply_address, "replying");
        self.response.send(self.reply_address);
    }

    fn delegate(&mut self, transport: &dyn Transport, destination: Address) {
        self.delegated = true;
        let next = self.stage_id.next();
        if next == self.stage_id {
            warn!(
                op_id = %self.op_id,
                stage = %next,
                "delegation chain exhausted stage ids; reusing the last stage"
            );
        }
        let header = MessageHeader::new(
            self.op_id,
            next,
            transport.address_to_wire_format(self.reply_address),
        );
        self.response.prepend(&header.encode());
        debug!(op_id = %self.op_id, stage = %next, %destination, "delegating");
        self.response.send(destination);
    }
}

struct Claimed<'m> {
    manager: &'m OpManager,
    op: ActiveOp,
}

/// Handle for one received request at one stage of an operation.
///
/// Obtained from [`OpManager::receive_server_op`]; a default-constructed or
/// moved-from handle is empty and holds no buffers.
#[derive(Default)]
pub struct ServerOp<'m> {
    claimed: Option<Claimed<'m>>,
}

impl<'m> ServerOp<'m> {
    pub(crate) fn claimed(manager: &'m OpManager, op: ActiveOp) -> Self {
        Self {
            claimed: Some(Claimed { manager, op }),
        }
    }

    /// Whether this handle holds no request.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claimed.is_none()
    }

    /// Moves the op out, leaving an empty handle behind.
    #[must_use]
    pub fn take(&mut self) -> ServerOp<'m> {
        std::mem::take(self)
    }

    #[must_use]
    pub fn state(&self) -> ServerOpState {
        self.claimed
            .as_ref()
            .map_or(ServerOpState::NotStarted, |c| c.op.state)
    }

    #[must_use]
    pub fn op_id(&self) -> Option<OpId> {
        self.claimed.as_ref().map(|c| c.op.op_id)
    }

    /// Stage of the request this op answers.
    #[must_use]
    pub fn stage_id(&self) -> Option<StageId> {
        self.claimed.as_ref().map(|c| c.op.stage_id)
    }

    /// Address of the operation's originator.
    #[must_use]
    pub fn reply_address(&self) -> Option<Address> {
        self.claimed.as_ref().map(|c| c.op.reply_address)
    }

    #[must_use]
    pub fn is_delegated(&self) -> bool {
        self.claimed.as_ref().is_some_and(|c| c.op.delegated)
    }

    /// The received request, with the header already stripped.
    #[must_use]
    pub fn request(&self) -> Option<&InboundBuffer> {
        self.claimed.as_ref().map(|c| &c.op.request)
    }

    /// Buffer to fill with the reply, or with the request forwarded to the
    /// next stage.
    #[must_use]
    pub fn response(&self) -> Option<&OutboundBuffer> {
        self.claimed.as_ref().map(|c| &c.op.response)
    }

    /// Advances the op and returns its resulting state.
    ///
    /// Non-blocking. Calling it again on a terminal op has no further side
    /// effects.
    pub fn make_progress(&mut self) -> ServerOpState {
        self.claimed
            .as_mut()
            .map_or(ServerOpState::NotStarted, |c| c.op.make_progress())
    }

    /// Sends the response buffer back to the operation's originator.
    pub fn reply(&mut self) {
        match self.claimed.as_mut() {
            Some(c) => c.op.reply(c.manager.transport()),
            None => warn!("reply() on empty ServerOp; nothing will be sent"),
        }
    }

    /// Forwards the response buffer to `destination` as the next stage.
    ///
    /// A delegated op only completes once the next hop confirms delivery.
    pub fn delegate(&mut self, destination: Address) {
        match self.claimed.as_mut() {
            Some(c) => c.op.delegate(c.manager.transport(), destination),
            None => warn!(%destination, "delegate() on empty ServerOp; nothing will be sent"),
        }
    }
}

impl Drop for ServerOp<'_> {
    fn drop(&mut self) {
        if let Some(Claimed { manager, op }) = self.claimed.take() {
            if op.needs_detach() {
                manager.detach(op);
            }
        }
    }
}

impl fmt::Debug for ServerOp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.claimed {
            None => f.write_str("ServerOp(empty)"),
            Some(c) => f
                .debug_struct("ServerOp")
                .field("op_id", &c.op.op_id)
                .field("stage_id", &c.op.stage_id)
                .field("state", &c.op.state)
                .field("delegated", &c.op.delegated)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use stagerpc_core::{InMessage, OutMessage, WireAddress};

    use super::*;

    // -- Scripted collaborator doubles --

    #[derive(Default)]
    struct Probe {
        dropped: AtomicBool,
        out_status: Mutex<Option<OutMessageStatus>>,
        acknowledged: AtomicUsize,
        failed: AtomicUsize,
        cancelled: AtomicUsize,
        released: AtomicUsize,
    }

    impl Probe {
        fn set_status(&self, status: OutMessageStatus) {
            *self.out_status.lock() = Some(status);
        }
    }

    struct ScriptedIn(Arc<Probe>);

    impl InMessage for ScriptedIn {
        fn length(&self) -> usize {
            0
        }
        fn get(&self, _offset: usize, _out: &mut [u8]) -> usize {
            0
        }
        fn strip(&self, _count: usize) {}
        fn dropped(&self) -> bool {
            self.0.dropped.load(Ordering::SeqCst)
        }
        fn acknowledge(&self) {
            self.0.acknowledged.fetch_add(1, Ordering::SeqCst);
        }
        fn fail(&self) {
            self.0.failed.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&self) {
            self.0.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedOut(Arc<Probe>);

    impl OutMessage for ScriptedOut {
        fn append(&self, _data: &[u8]) {}
        fn prepend(&self, _data: &[u8]) {}
        fn reserve(&self, _count: usize) {}
        fn length(&self) -> usize {
            0
        }
        fn send(&self, _destination: Address) {
            self.0.set_status(OutMessageStatus::Sent);
        }
        fn cancel(&self) {
            self.0.cancelled.fetch_add(1, Ordering::SeqCst);
        }
        fn status(&self) -> OutMessageStatus {
            let status = *self.0.out_status.lock();
            status.unwrap_or(OutMessageStatus::NotStarted)
        }
        fn release(&self) {
            self.0.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NullTransport;

    impl Transport for NullTransport {
        fn alloc(&self) -> Box<dyn OutMessage> {
            Box::new(ScriptedOut(Arc::new(Probe::default())))
        }
        fn poll(&self) {}
        fn receive(&self) -> Option<Box<dyn InMessage>> {
            None
        }
        fn local_address(&self) -> Address {
            Address(0)
        }
        fn address(&self, _wire: &WireAddress) -> Address {
            Address(0)
        }
        fn address_to_wire_format(&self, _address: Address) -> WireAddress {
            WireAddress::default()
        }
    }

    fn active(stage: StageId) -> (ActiveOp, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let pending = PendingRequest {
            request: InboundBuffer::new(Box::new(ScriptedIn(Arc::clone(&probe)))),
            op_id: OpId::new(1, 1),
            stage_id: stage,
            reply_address: Address(9),
        };
        let response = OutboundBuffer::new(Box::new(ScriptedOut(Arc::clone(&probe))));
        (ActiveOp::claim(pending, response), probe)
    }

    // -- Transition table --

    #[test]
    fn claimed_op_starts_in_progress() {
        let (mut op, _probe) = active(StageId::INITIAL_REQUEST);
        assert_eq!(op.state(), ServerOpState::InProgress);
        assert_eq!(op.make_progress(), ServerOpState::InProgress);
    }

    #[test]
    fn dropped_request_wins_over_everything() {
        let (mut op, probe) = active(StageId(1));
        probe.set_status(OutMessageStatus::Completed);
        probe.dropped.store(true, Ordering::SeqCst);

        assert_eq!(op.make_progress(), ServerOpState::Dropped);
        assert_eq!(probe.acknowledged.load(Ordering::SeqCst), 0);
        assert_eq!(probe.cancelled.load(Ordering::SeqCst), 0);
        assert_eq!(probe.failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sent_reply_completes_without_ack_on_initial_stage() {
        let (mut op, probe) = active(StageId::INITIAL_REQUEST);
        op.reply(&NullTransport);
        assert_eq!(op.make_progress(), ServerOpState::Completed);
        assert_eq!(probe.acknowledged.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sent_reply_acknowledges_delegated_stage() {
        let (mut op, probe) = active(StageId(2));
        op.reply(&NullTransport);
        assert_eq!(op.make_progress(), ServerOpState::Completed);
        assert_eq!(probe.acknowledged.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delegated_op_waits_for_full_delivery() {
        let (mut op, probe) = active(StageId::INITIAL_REQUEST);
        op.delegate(&NullTransport, Address(5));
        assert_eq!(probe.out_status.lock().as_ref(), Some(&OutMessageStatus::Sent));
        assert_eq!(op.make_progress(), ServerOpState::InProgress);

        probe.set_status(OutMessageStatus::Completed);
        assert_eq!(op.make_progress(), ServerOpState::Completed);
    }

    #[test]
    fn failed_response_is_cancelled_once() {
        let (mut op, probe) = active(StageId(1));
        probe.set_status(OutMessageStatus::Failed);

        assert_eq!(op.make_progress(), ServerOpState::Failed);
        assert_eq!(op.make_progress(), ServerOpState::Failed);
        assert_eq!(probe.cancelled.load(Ordering::SeqCst), 1);
        // Not detached: the request is left alone.
        assert_eq!(probe.failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn terminal_progress_is_idempotent() {
        let (mut op, probe) = active(StageId(3));
        op.reply(&NullTransport);
        for _ in 0..5 {
            assert_eq!(op.make_progress(), ServerOpState::Completed);
        }
        assert_eq!(probe.acknowledged.load(Ordering::SeqCst), 1);
        assert_eq!(probe.cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn detached_failure_fails_request_exactly_once() {
        let (mut op, probe) = active(StageId::INITIAL_REQUEST);
        probe.set_status(OutMessageStatus::Failed);
        assert_eq!(op.make_progress(), ServerOpState::Failed);
        assert_eq!(probe.failed.load(Ordering::SeqCst), 0);

        op.mark_detached();
        for _ in 0..3 {
            assert_eq!(op.make_progress(), ServerOpState::Failed);
        }
        assert_eq!(probe.failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detached_op_failing_later_fails_request_once() {
        let (mut op, probe) = active(StageId::INITIAL_REQUEST);
        op.mark_detached();
        assert_eq!(op.make_progress(), ServerOpState::InProgress);

        probe.set_status(OutMessageStatus::Failed);
        assert_eq!(op.make_progress(), ServerOpState::Failed);
        assert_eq!(op.make_progress(), ServerOpState::Failed);
        assert_eq!(probe.failed.load(Ordering::SeqCst), 1);
        assert_eq!(probe.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn needs_detach_only_once() {
        let (mut op, _probe) = active(StageId::INITIAL_REQUEST);
        assert!(op.needs_detach());
        op.mark_detached();
        assert!(!op.needs_detach());
    }

    #[test]
    fn dropping_active_op_releases_both_buffers() {
        let (op, probe) = active(StageId::INITIAL_REQUEST);
        drop(op);
        assert_eq!(probe.released.load(Ordering::SeqCst), 2);
    }

    // -- Empty handle --

    #[test]
    fn default_op_is_empty() {
        let mut op = ServerOp::default();
        assert!(op.is_empty());
        assert_eq!(op.state(), ServerOpState::NotStarted);
        assert_eq!(op.make_progress(), ServerOpState::NotStarted);
        assert!(op.op_id().is_none());
        assert!(op.request().is_none());
        assert!(op.response().is_none());
        assert!(!op.is_delegated());
    }

    #[test]
    fn reply_and_delegate_on_empty_op_are_no_ops() {
        let mut op = ServerOp::default();
        op.reply();
        op.delegate(Address(4));
        assert!(op.is_empty());
        assert!(!op.is_delegated());
    }

    #[test]
    fn terminal_states() {
        assert!(!ServerOpState::NotStarted.is_terminal());
        assert!(!ServerOpState::InProgress.is_terminal());
        assert!(ServerOpState::Completed.is_terminal());
        assert!(ServerOpState::Dropped.is_terminal());
        assert!(ServerOpState::Failed.is_terminal());
    }
}
