//! Owning handles over transport message buffers.
//!
//! Each handle wraps one boxed collaborator message and returns it to the
//! transport exactly once, on drop. Handles are move-only; `cancel`,
//! `acknowledge` and `fail` are explicit calls rather than drop side effects.

use std::fmt;

use stagerpc_core::{Address, InMessage, OutMessage, OutMessageStatus};

/// Owned outbound message. Releases the underlying buffer when dropped.
pub struct OutboundBuffer {
    inner: Box<dyn OutMessage>,
}

impl OutboundBuffer {
    pub(crate) fn new(inner: Box<dyn OutMessage>) -> Self {
        Self { inner }
    }

    /// Appends application payload.
    pub fn append(&self, data: &[u8]) {
        self.inner.append(data);
    }

    pub(crate) fn prepend(&self, data: &[u8]) {
        self.inner.prepend(data);
    }

    pub(crate) fn reserve(&self, count: usize) {
        self.inner.reserve(count);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.length()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn send(&self, destination: Address) {
        self.inner.send(destination);
    }

    /// Stops retransmission and drops pending delivery state.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    #[must_use]
    pub fn status(&self) -> OutMessageStatus {
        self.inner.status()
    }
}

impl Drop for OutboundBuffer {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl fmt::Debug for OutboundBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundBuffer")
            .field("len", &self.inner.length())
            .field("status", &self.inner.status())
            .finish()
    }
}

/// Owned inbound message. Releases the underlying buffer when dropped.
pub struct InboundBuffer {
    inner: Box<dyn InMessage>,
}

impl InboundBuffer {
    pub(crate) fn new(inner: Box<dyn InMessage>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.length()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies bytes starting at `offset` into `out`; returns the count copied.
    pub fn get(&self, offset: usize, out: &mut [u8]) -> usize {
        self.inner.get(offset, out)
    }

    /// Copies the whole remaining payload into a fresh vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        let copied = self.get(0, &mut out);
        out.truncate(copied);
        out
    }

    pub(crate) fn strip(&self, count: usize) {
        self.inner.strip(count);
    }

    #[must_use]
    pub fn dropped(&self) -> bool {
        self.inner.dropped()
    }

    /// Tells the previous hop it may release its retransmission state.
    pub fn acknowledge(&self) {
        self.inner.acknowledge();
    }

    /// Reports to the sender that this message will never be answered.
    pub fn fail(&self) {
        self.inner.fail();
    }
}

impl Drop for InboundBuffer {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl fmt::Debug for InboundBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundBuffer")
            .field("len", &self.inner.length())
            .field("dropped", &self.inner.dropped())
            .finish()
    }
}
