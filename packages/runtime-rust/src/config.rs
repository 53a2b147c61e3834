use std::num::NonZeroUsize;

/// Configuration for an [`OpManager`](crate::OpManager).
///
/// Controls id scoping and how much work a single `poll()` performs.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Identifier of the owning transport; scopes every generated `OpId`.
    pub transport_id: u64,
    /// Maximum inbound messages drained per `poll()`. `None` drains
    /// everything the transport reports as received.
    pub receive_batch_limit: Option<NonZeroUsize>,
    /// Whether `RemoteOp::wait` yields the thread between polls instead of
    /// spinning.
    pub wait_yield: bool,
}

impl ManagerConfig {
    #[must_use]
    pub fn new(transport_id: u64) -> Self {
        Self {
            transport_id,
            ..Self::default()
        }
    }

    /// Caps the messages drained per `poll()`. A limit of 0 removes the cap.
    #[must_use]
    pub fn with_receive_batch_limit(mut self, limit: usize) -> Self {
        self.receive_batch_limit = NonZeroUsize::new(limit);
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            transport_id: 0,
            receive_batch_limit: None,
            wait_yield: false,
        }
    }
}
