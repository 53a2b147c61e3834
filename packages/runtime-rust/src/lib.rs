//! `stagerpc` runtime: correlated request/response operations over a
//! message transport.
//!
//! A [`RemoteOp`] is one outstanding call on the client side. A [`ServerOp`]
//! is one received request at one stage of an operation on the serving side;
//! it can be answered with [`ServerOp::reply`] or forwarded to another server
//! with [`ServerOp::delegate`]. Both are multiplexed over a single transport
//! by an [`OpManager`], whose [`poll`](OpManager::poll) is the only thing that
//! moves operations forward.

pub mod buffer;
pub mod config;
pub mod manager;
pub mod memory;
pub mod remote;
pub mod server;

mod registry;

pub use buffer::{InboundBuffer, OutboundBuffer};
pub use config::ManagerConfig;
pub use manager::{ManagerStats, OpManager};
pub use memory::{MemoryCounters, MemoryError, MemoryNetwork, MemoryTransport};
pub use remote::{RemoteOp, RemoteOpState};
pub use server::{ServerOp, ServerOpState};
