//! In-process message fabric implementing the transport contracts.
//!
//! Every [`MemoryTransport`] bound on a [`MemoryNetwork`] can reach every
//! other one by [`Address`]. Delivery is immediate and lossless, which makes
//! the fabric the reference transport for tests and embedding:
//!
//! - `send` to a bound address enqueues a copy at the receiver and reports
//!   `Sent`; sending to an unbound address reports `Failed` at once.
//! - the receiver's `acknowledge` moves the sender's status to `Completed`,
//!   its `fail` to `Failed`. A cancelled sender ignores both.
//! - [`MemoryNetwork::mark_dropped`] simulates the sender abandoning every
//!   message currently held at an endpoint.
//!
//! [`MemoryNetwork::counters`] exposes allocation and release counts so tests
//! can assert that no buffer leaks.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use stagerpc_core::{
    Address, InMessage, OutMessage, OutMessageStatus, Transport, WireAddress, WIRE_ADDRESS_LEN,
};

/// Family tag written in the first byte of a memory wire address.
const MEMORY_ADDRESS_FAMILY: u8 = 0x4d;

/// Errors from binding endpoints on a [`MemoryNetwork`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("address {0} is already bound")]
    AddressInUse(Address),
}

/// Snapshot of the fabric's message accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryCounters {
    /// Outbound messages handed out by `alloc`.
    pub out_allocated: u64,
    /// Outbound messages returned through `release`.
    pub out_released: u64,
    /// Inbound messages handed out by `receive`.
    pub in_delivered: u64,
    /// Inbound messages returned through `release`.
    pub in_released: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct Counters {
    out_allocated: AtomicU64,
    out_released: AtomicU64,
    in_delivered: AtomicU64,
    in_released: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MemoryCounters {
        MemoryCounters {
            out_allocated: self.out_allocated.load(Ordering::Relaxed),
            out_released: self.out_released.load(Ordering::Relaxed),
            in_delivered: self.in_delivered.load(Ordering::Relaxed),
            in_released: self.in_released.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Sender-side delivery state, shared with every copy handed to a receiver.
struct Delivery {
    status: Mutex<OutMessageStatus>,
    cancelled: AtomicBool,
}

impl Delivery {
    fn new(status: OutMessageStatus) -> Self {
        Self {
            status: Mutex::new(status),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Moves a `Sent` delivery to `to`, unless the sender cancelled it.
    fn settle(&self, to: OutMessageStatus) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let mut status = self.status.lock();
        if *status == OutMessageStatus::Sent {
            *status = to;
        }
    }
}

struct InState {
    data: Mutex<Bytes>,
    dropped: AtomicBool,
    released: AtomicBool,
    delivery: Arc<Delivery>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Endpoint {
    inbox: Mutex<VecDeque<Arc<InState>>>,
    /// Every message delivered here that may still be alive.
    delivered: Mutex<Vec<Weak<InState>>>,
}

struct Fabric {
    endpoints: DashMap<Address, Arc<Endpoint>>,
    counters: Arc<Counters>,
}

impl Fabric {
    fn endpoint(&self, address: Address) -> Option<Arc<Endpoint>> {
        self.endpoints.get(&address).map(|e| Arc::clone(e.value()))
    }

    fn deliver(&self, destination: Address, data: Bytes, delivery: Arc<Delivery>) -> bool {
        let Some(endpoint) = self.endpoint(destination) else {
            return false;
        };
        let state = Arc::new(InState {
            data: Mutex::new(data),
            dropped: AtomicBool::new(false),
            released: AtomicBool::new(false),
            delivery,
            counters: Arc::clone(&self.counters),
        });
        {
            let mut delivered = endpoint.delivered.lock();
            delivered.retain(|weak| weak.strong_count() > 0);
            delivered.push(Arc::downgrade(&state));
        }
        endpoint.inbox.lock().push_back(state);
        true
    }
}

/// Shared in-process network. Cloning yields another handle to the same fabric.
#[derive(Clone)]
pub struct MemoryNetwork {
    fabric: Arc<Fabric>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fabric: Arc::new(Fabric {
                endpoints: DashMap::new(),
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    /// Binds a transport at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::AddressInUse`] if a live transport already holds
    /// the address.
    pub fn bind(&self, address: Address) -> Result<MemoryTransport, MemoryError> {
        match self.fabric.endpoints.entry(address) {
            Entry::Occupied(_) => Err(MemoryError::AddressInUse(address)),
            Entry::Vacant(vacant) => {
                let endpoint = Arc::new(Endpoint::default());
                vacant.insert(Arc::clone(&endpoint));
                Ok(MemoryTransport {
                    address,
                    endpoint,
                    fabric: Arc::clone(&self.fabric),
                })
            }
        }
    }

    /// Number of messages queued at `address` and not yet received.
    #[must_use]
    pub fn in_flight(&self, address: Address) -> usize {
        self.fabric
            .endpoint(address)
            .map_or(0, |endpoint| endpoint.inbox.lock().len())
    }

    /// Marks every live message delivered to `address` as dropped by its
    /// sender. Returns how many messages were marked.
    pub fn mark_dropped(&self, address: Address) -> usize {
        let Some(endpoint) = self.fabric.endpoint(address) else {
            return 0;
        };
        let delivered = endpoint.delivered.lock();
        let mut marked = 0;
        for state in delivered.iter().filter_map(Weak::upgrade) {
            state.dropped.store(true, Ordering::Release);
            marked += 1;
        }
        marked
    }

    /// Delivers raw bytes to `address` with no sender behind them.
    ///
    /// Returns `false` if nothing is bound there.
    pub fn inject(&self, address: Address, payload: &[u8]) -> bool {
        self.fabric.deliver(
            address,
            Bytes::copy_from_slice(payload),
            Arc::new(Delivery::new(OutMessageStatus::Sent)),
        )
    }

    #[must_use]
    pub fn counters(&self) -> MemoryCounters {
        self.fabric.counters.snapshot()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("endpoints", &self.fabric.endpoints.len())
            .field("counters", &self.counters())
            .finish()
    }
}

/// One endpoint on a [`MemoryNetwork`]. Unbinds its address when dropped.
pub struct MemoryTransport {
    address: Address,
    endpoint: Arc<Endpoint>,
    fabric: Arc<Fabric>,
}

impl Transport for MemoryTransport {
    fn alloc(&self) -> Box<dyn OutMessage> {
        Counters::bump(&self.fabric.counters.out_allocated);
        Box::new(MemoryOutMessage {
            body: Mutex::new(OutBody::default()),
            delivery: Arc::new(Delivery::new(OutMessageStatus::NotStarted)),
            fabric: Arc::clone(&self.fabric),
        })
    }

    fn poll(&self) {}

    fn receive(&self) -> Option<Box<dyn InMessage>> {
        let state = self.endpoint.inbox.lock().pop_front()?;
        Counters::bump(&self.fabric.counters.in_delivered);
        Some(Box::new(MemoryInMessage(state)))
    }

    fn local_address(&self) -> Address {
        self.address
    }

    fn address(&self, wire: &WireAddress) -> Address {
        let mut raw = &wire.as_bytes()[1..9];
        Address(raw.get_u64_le())
    }

    fn address_to_wire_format(&self, address: Address) -> WireAddress {
        let mut bytes = [0u8; WIRE_ADDRESS_LEN];
        bytes[0] = MEMORY_ADDRESS_FAMILY;
        (&mut bytes[1..9]).put_u64_le(address.0);
        WireAddress(bytes)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.fabric.endpoints.remove(&self.address);
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct OutBody {
    head: Vec<u8>,
    tail: BytesMut,
}

struct MemoryOutMessage {
    body: Mutex<OutBody>,
    delivery: Arc<Delivery>,
    fabric: Arc<Fabric>,
}

impl OutMessage for MemoryOutMessage {
    fn append(&self, data: &[u8]) {
        self.body.lock().tail.extend_from_slice(data);
    }

    fn prepend(&self, data: &[u8]) {
        self.body.lock().head.splice(0..0, data.iter().copied());
    }

    fn reserve(&self, count: usize) {
        self.body.lock().head.reserve(count);
    }

    fn length(&self) -> usize {
        let body = self.body.lock();
        body.head.len() + body.tail.len()
    }

    fn send(&self, destination: Address) {
        let data = {
            let body = self.body.lock();
            let mut out = BytesMut::with_capacity(body.head.len() + body.tail.len());
            out.put_slice(&body.head);
            out.put_slice(&body.tail);
            out.freeze()
        };
        // Sent must be visible before the receiver can acknowledge.
        *self.delivery.status.lock() = OutMessageStatus::Sent;
        if !self.fabric.deliver(destination, data, Arc::clone(&self.delivery)) {
            *self.delivery.status.lock() = OutMessageStatus::Failed;
        }
    }

    fn cancel(&self) {
        Counters::bump(&self.fabric.counters.cancelled);
        self.delivery.cancelled.store(true, Ordering::Release);
    }

    fn status(&self) -> OutMessageStatus {
        *self.delivery.status.lock()
    }

    fn release(&self) {
        Counters::bump(&self.fabric.counters.out_released);
    }
}

struct MemoryInMessage(Arc<InState>);

impl InMessage for MemoryInMessage {
    fn length(&self) -> usize {
        self.0.data.lock().len()
    }

    fn get(&self, offset: usize, out: &mut [u8]) -> usize {
        let data = self.0.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let count = out.len().min(data.len() - offset);
        out[..count].copy_from_slice(&data[offset..offset + count]);
        count
    }

    fn strip(&self, count: usize) {
        let mut data = self.0.data.lock();
        let count = count.min(data.len());
        data.advance(count);
    }

    fn dropped(&self) -> bool {
        self.0.dropped.load(Ordering::Acquire)
    }

    fn acknowledge(&self) {
        Counters::bump(&self.0.counters.acknowledged);
        self.0.delivery.settle(OutMessageStatus::Completed);
    }

    fn fail(&self) {
        Counters::bump(&self.0.counters.failed);
        self.0.delivery.settle(OutMessageStatus::Failed);
    }

    fn release(&self) {
        let already = self.0.released.swap(true, Ordering::AcqRel);
        debug_assert!(!already, "inbound message released twice");
        Counters::bump(&self.0.counters.in_released);
    }
}
