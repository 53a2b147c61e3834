//! Operation manager: the shared registry and the polling loop.
//!
//! All progress happens inside [`OpManager::poll`]. There is no background
//! thread; applications call `poll()` themselves, directly or through
//! [`RemoteOp::wait`](crate::RemoteOp::wait). Any number of threads may call
//! into the same manager at once.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use stagerpc_core::{MessageHeader, OpId, Transport, HEADER_LEN};
use tracing::{debug, trace, warn};

use crate::buffer::{InboundBuffer, OutboundBuffer};
use crate::config::ManagerConfig;
use crate::registry::Registry;
use crate::remote::RemoteSlot;
use crate::server::{ActiveOp, PendingRequest, ServerOp, ServerOpState};

/// Point-in-time sizes of the manager's registries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Sent remote ops still registered for a response.
    pub remote_ops: usize,
    /// Received requests not yet claimed.
    pub pending_server_ops: usize,
    /// Abandoned server ops still being driven to a terminal state.
    pub detached_server_ops: usize,
}

/// Multiplexes remote and server operations over one transport.
pub struct OpManager {
    transport: Box<dyn Transport>,
    config: ManagerConfig,
    registry: Mutex<Registry>,
}

impl OpManager {
    /// Creates a manager whose operation ids are scoped to `transport_id`.
    #[must_use]
    pub fn new(transport: Box<dyn Transport>, transport_id: u64) -> Self {
        Self::with_config(transport, ManagerConfig::new(transport_id))
    }

    #[must_use]
    pub fn with_config(transport: Box<dyn Transport>, config: ManagerConfig) -> Self {
        debug!(
            transport_id = config.transport_id,
            local_address = %transport.local_address(),
            "operation manager created"
        );
        Self {
            transport,
            config,
            registry: Mutex::new(Registry::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        self.registry.lock().stats()
    }

    /// Claims the oldest received request.
    ///
    /// Returns an empty [`ServerOp`] when nothing is pending. A non-empty op
    /// comes back `InProgress` with a response buffer ready to fill.
    pub fn receive_server_op(&self) -> ServerOp<'_> {
        let Some(pending) = self.registry.lock().pending.pop_front() else {
            return ServerOp::default();
        };
        let response = OutboundBuffer::new(self.transport.alloc());
        response.reserve(HEADER_LEN);
        let op = ActiveOp::claim(pending, response);
        debug!(op_id = %op.op_id(), "server op claimed");
        ServerOp::claimed(self, op)
    }

    /// Pumps the transport once and advances every registered operation.
    ///
    /// 1. polls the transport;
    /// 2. routes each received message: responses complete the matching
    ///    remote op, requests join the pending FIFO;
    /// 3. drives detached server ops, retiring those that terminated.
    ///
    /// # Panics
    ///
    /// Panics if a detached server op is found in `NotStarted`, which can
    /// only happen through a bug in this crate.
    pub fn poll(&self) {
        self.transport.poll();

        let mut received = 0usize;
        while self
            .config
            .receive_batch_limit
            .map_or(true, |limit| received < limit.get())
        {
            let Some(message) = self.transport.receive() else {
                break;
            };
            received += 1;
            self.dispatch(InboundBuffer::new(message));
        }

        let retired = self.progress_detached();
        if received > 0 || retired > 0 {
            trace!(received, retired, "poll");
        }
    }

    fn dispatch(&self, message: InboundBuffer) {
        let mut raw = [0u8; HEADER_LEN];
        let copied = message.get(0, &mut raw);
        let header = match MessageHeader::decode(&raw[..copied]) {
            Ok(header) => header,
            Err(error) => {
                warn!(%error, "discarding malformed inbound message");
                return;
            }
        };
        message.strip(HEADER_LEN);

        if header.stage_id.is_ultimate_response() {
            self.complete_remote(header.op_id, message);
        } else {
            let pending = PendingRequest {
                request: message,
                op_id: header.op_id,
                stage_id: header.stage_id,
                reply_address: self.transport.address(&header.reply_address),
            };
            debug!(op_id = %header.op_id, stage = %header.stage_id, "request queued");
            self.registry.lock().pending.push_back(pending);
            metrics::counter!("stagerpc_server_ops_queued_total").increment(1);
        }
    }

    fn complete_remote(&self, op_id: OpId, response: InboundBuffer) {
        let registry = self.registry.lock();
        let Some(slot) = registry.remote_ops.get(&op_id) else {
            debug!(%op_id, "discarding response for unknown operation");
            metrics::counter!("stagerpc_responses_discarded_total").increment(1);
            return;
        };
        match slot.complete(response) {
            Ok(()) => {
                debug!(%op_id, "response matched");
                metrics::counter!("stagerpc_responses_matched_total").increment(1);
            }
            Err(_late) => {
                debug!(%op_id, state = ?slot.state(), "discarding response for finished operation");
                metrics::counter!("stagerpc_responses_discarded_total").increment(1);
            }
        }
    }

    fn progress_detached(&self) -> usize {
        let mut registry = self.registry.lock();
        if registry.detached.is_empty() {
            return 0;
        }
        let before = registry.detached.len();
        registry.detached.retain_mut(|op| {
            let state = op.make_progress();
            assert!(
                state != ServerOpState::NotStarted,
                "detached server op {} found in NotStarted state",
                op.op_id()
            );
            if state == ServerOpState::InProgress {
                true
            } else {
                debug!(op_id = %op.op_id(), ?state, "detached server op retired");
                false
            }
        });
        let retired = before - registry.detached.len();
        metrics::counter!("stagerpc_detached_ops_retired_total").increment(retired as u64);
        retired
    }

    pub(crate) fn register_remote(&self, slot: &Arc<RemoteSlot>) -> OpId {
        let op_id = self
            .registry
            .lock()
            .register_remote(self.config.transport_id, Arc::clone(slot));
        metrics::counter!("stagerpc_requests_sent_total").increment(1);
        op_id
    }

    pub(crate) fn deregister_remote(&self, op_id: OpId) {
        // Bind the removed slot so it drops after the lock is released.
        let removed = self.registry.lock().remote_ops.remove(&op_id);
        drop(removed);
    }

    /// Takes ownership of a server op its application abandoned.
    pub(crate) fn detach(&self, mut op: ActiveOp) {
        op.mark_detached();
        debug!(op_id = %op.op_id(), state = ?op.state(), "server op detached");
        self.registry.lock().detached.push(op);
        metrics::counter!("stagerpc_server_ops_detached_total").increment(1);
    }
}

impl Drop for OpManager {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        let stats = registry.stats();
        if stats != ManagerStats::default() {
            debug!(?stats, "dropping operation manager with live registry entries");
        }
        registry.clear();
    }
}

impl std::fmt::Debug for OpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
