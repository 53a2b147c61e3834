//! Shared registry guarded by the manager's single mutex.
//!
//! Holds every structure that `poll()`, `send()`, `receive_server_op()` and
//! op destruction mutate concurrently. Per-operation state is not kept here;
//! remote op state is atomic and server op state is owned by its handle.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use stagerpc_core::OpId;

use crate::manager::ManagerStats;
use crate::remote::RemoteSlot;
use crate::server::{ActiveOp, PendingRequest};

pub(crate) struct Registry {
    /// Sent remote ops awaiting a response. Entries are removed by the
    /// owning handle, never by the response path.
    pub(crate) remote_ops: HashMap<OpId, Arc<RemoteSlot>>,
    /// Received requests in arrival order.
    pub(crate) pending: VecDeque<PendingRequest>,
    /// Server ops abandoned by the application before reaching a terminal state.
    pub(crate) detached: Vec<ActiveOp>,
    next_sequence: u64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            remote_ops: HashMap::new(),
            pending: VecDeque::new(),
            detached: Vec::new(),
            // Sequence 0 is left unused so a default `OpId` never names a real op.
            next_sequence: 1,
        }
    }

    pub(crate) fn allocate_op_id(&mut self, transport_id: u64) -> OpId {
        let id = OpId::new(transport_id, self.next_sequence);
        self.next_sequence += 1;
        id
    }

    pub(crate) fn register_remote(&mut self, transport_id: u64, slot: Arc<RemoteSlot>) -> OpId {
        let op_id = self.allocate_op_id(transport_id);
        let previous = self.remote_ops.insert(op_id, slot);
        debug_assert!(previous.is_none(), "operation id {op_id} registered twice");
        op_id
    }

    pub(crate) fn stats(&self) -> ManagerStats {
        ManagerStats {
            remote_ops: self.remote_ops.len(),
            pending_server_ops: self.pending.len(),
            detached_server_ops: self.detached.len(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.remote_ops.clear();
        self.pending.clear();
        self.detached.clear();
    }
}
