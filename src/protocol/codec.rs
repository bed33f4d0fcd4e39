//! Frame-level codec: header + payload + trailing CRC-8.

use bytes::BufMut;

use crate::core::{CRC_SIZE, MAX_FRAME_SIZE, MESSAGE_HEADER_SIZE, MIN_FRAME_SIZE};
use crate::util::crc8_le;

use super::message::MessageHeader;

/// Stateless frame codec for the radio link.
///
/// A frame is `header ‖ payload ‖ crc8` where the CRC covers everything
/// before it. The codec holds no state and is safe to clone freely.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// Creates a new message codec
    pub fn new() -> Self {
        MessageCodec
    }

    /// Encodes a complete frame from a header and payload bytes.
    ///
    /// Returns `None` when the frame would exceed the radio MTU.
    pub fn encode(&self, header: &MessageHeader, payload: &[u8]) -> Option<Vec<u8>> {
        let total_len = MESSAGE_HEADER_SIZE + payload.len() + CRC_SIZE;
        if total_len > MAX_FRAME_SIZE {
            return None;
        }

        let mut buffer = Vec::with_capacity(total_len);
        header.write_to(&mut buffer);
        buffer.put_slice(payload);
        let crc = crc8_le(0, &buffer);
        buffer.push(crc);

        Some(buffer)
    }

    /// Decodes the header of a frame.
    ///
    /// Requires at least a full header plus the CRC byte; the payload is
    /// left to type-specific parsers.
    pub fn decode_header(&self, data: &[u8]) -> Option<MessageHeader> {
        if data.len() < MIN_FRAME_SIZE {
            return None;
        }
        MessageHeader::read_from(data)
    }

    /// Checks the trailing CRC of a frame against its contents.
    pub fn validate_crc(&self, data: &[u8]) -> bool {
        if data.len() < CRC_SIZE {
            return false;
        }
        let received = data[data.len() - 1];
        received == self.calculate_crc(&data[..data.len() - 1])
    }

    /// Computes the frame CRC over `data`.
    pub fn calculate_crc(&self, data: &[u8]) -> u8 {
        crc8_le(0, data)
    }

    /// Returns the payload slice of a validated frame.
    pub fn payload_of<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        if data.len() < MIN_FRAME_SIZE {
            return &[];
        }
        &data[MESSAGE_HEADER_SIZE..data.len() - CRC_SIZE]
    }
}
