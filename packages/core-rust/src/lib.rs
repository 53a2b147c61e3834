//! `stagerpc` core: operation ids, the message header wire format, and the
//! transport contracts the operation layer is built on.

pub mod header;
pub mod traits;
pub mod types;

pub use header::{HeaderError, MessageHeader, HEADER_LEN};
pub use traits::{InMessage, OutMessage, OutMessageStatus, Transport};
pub use types::{Address, OpId, StageId, WireAddress, WIRE_ADDRESS_LEN};
