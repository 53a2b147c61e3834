//! Message header prepended to every message the operation layer sends.
//!
//! The header is the only wire contract this layer owns. Peers must agree on
//! the exact layout, so it is encoded field by field rather than through a
//! self-describing format.
//!
//! # Layout
//!
//! ```text
//! Offset  Size  Field
//! 0       8     op_id.transport_id   (u64, little-endian)
//! 8       8     op_id.sequence       (u64, little-endian)
//! 16      4     stage_id             (u32, little-endian)
//! 20      20    reply_address        (driver wire format)
//! ```

use bytes::{Buf, BufMut};

use crate::types::{OpId, StageId, WireAddress, WIRE_ADDRESS_LEN};

/// Encoded size of a [`MessageHeader`] in bytes.
pub const HEADER_LEN: usize = 8 + 8 + 4 + WIRE_ADDRESS_LEN;

/// Errors from decoding a [`MessageHeader`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("message too short for header: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

/// Routing metadata carried in front of every request, delegated stage, and
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Operation this message belongs to.
    pub op_id: OpId,
    /// Which hop of the operation this message is.
    pub stage_id: StageId,
    /// Wire address of the party expecting the eventual reply.
    pub reply_address: WireAddress,
}

impl MessageHeader {
    #[must_use]
    pub fn new(op_id: OpId, stage_id: StageId, reply_address: WireAddress) -> Self {
        Self {
            op_id,
            stage_id,
            reply_address,
        }
    }

    /// Encodes the header into its fixed-size wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_u64_le(self.op_id.transport_id);
        buf.put_u64_le(self.op_id.sequence);
        buf.put_u32_le(self.stage_id.0);
        buf.put_slice(self.reply_address.as_bytes());
        out
    }

    /// Decodes a header from the first [`HEADER_LEN`] bytes of `bytes`.
    ///
    /// Trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::Truncated`] if fewer than [`HEADER_LEN`] bytes
    /// are available.
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < HEADER_LEN {
            return Err(HeaderError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        let mut buf = &bytes[..HEADER_LEN];
        let transport_id = buf.get_u64_le();
        let sequence = buf.get_u64_le();
        let stage_id = StageId(buf.get_u32_le());
        let mut reply_address = [0u8; WIRE_ADDRESS_LEN];
        buf.copy_to_slice(&mut reply_address);
        Ok(Self {
            op_id: OpId::new(transport_id, sequence),
            stage_id,
            reply_address: WireAddress(reply_address),
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn header_len_is_forty_bytes() {
        assert_eq!(HEADER_LEN, 40);
    }

    #[test]
    fn encode_layout_is_little_endian() {
        let mut wire = [0u8; WIRE_ADDRESS_LEN];
        wire[0] = 0xAA;
        wire[19] = 0xBB;
        let header = MessageHeader::new(
            OpId::new(0x0102_0304_0506_0708, 0x1112_1314_1516_1718),
            StageId(0x2122_2324),
            WireAddress(wire),
        );
        let bytes = header.encode();
        assert_eq!(&bytes[0..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..16], &[0x18, 0x17, 0x16, 0x15, 0x14, 0x13, 0x12, 0x11]);
        assert_eq!(&bytes[16..20], &[0x24, 0x23, 0x22, 0x21]);
        assert_eq!(bytes[20], 0xAA);
        assert_eq!(bytes[39], 0xBB);
    }

    #[test]
    fn ultimate_response_marker_is_all_ones() {
        let header = MessageHeader::new(OpId::default(), StageId::ULTIMATE_RESPONSE, WireAddress::default());
        assert_eq!(&header.encode()[16..20], &[0xFF; 4]);
    }

    #[test]
    fn decode_rejects_short_input() {
        let err = MessageHeader::decode(&[0u8; 12]).unwrap_err();
        assert_eq!(
            err,
            HeaderError::Truncated {
                needed: HEADER_LEN,
                available: 12
            }
        );
    }

    #[test]
    fn decode_ignores_trailing_payload() {
        let header = MessageHeader::new(OpId::new(4, 5), StageId(2), WireAddress([9; WIRE_ADDRESS_LEN]));
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(b"payload");
        assert_eq!(MessageHeader::decode(&bytes).unwrap(), header);
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            transport_id in any::<u64>(),
            sequence in any::<u64>(),
            stage in any::<u32>(),
            wire in any::<[u8; WIRE_ADDRESS_LEN]>(),
        ) {
            let header = MessageHeader::new(OpId::new(transport_id, sequence), StageId(stage), WireAddress(wire));
            prop_assert_eq!(MessageHeader::decode(&header.encode()).unwrap(), header);
        }
    }
}
