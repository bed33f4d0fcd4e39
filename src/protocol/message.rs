//! Protocol message definitions and their wire codecs.
//!
//! Every structure here has a fixed, packed little-endian layout. The radio
//! link is shared with nodes built from other toolchains, so the byte
//! layouts are load-bearing: change them and the network partitions.

use bytes::{Buf, BufMut};

use crate::core::{NodeId, NodeType, PayloadType, MESSAGE_HEADER_SIZE};

/// Protocol-level message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Initial request from a node to pair with a hub
    PairRequest = 0x00,
    /// Response from the hub to a pairing request
    PairResponse = 0x01,
    /// Periodic keep-alive message from node to hub
    Heartbeat = 0x02,
    /// Acknowledgement of a heartbeat from hub to node
    HeartbeatResponse = 0x03,
    /// Standard application data packet
    Data = 0x10,
    /// Logical acknowledgement for DATA or COMMAND packets
    Ack = 0x11,
    /// Control command sent from hub to node
    Command = 0x20,
    /// Broadcast probe sent during channel discovery
    ChannelScanProbe = 0x30,
    /// Response to a scan probe identifying an active hub
    ChannelScanResponse = 0x31,
}

impl MessageType {
    /// Decodes a wire byte; unknown values yield `None` and the frame is
    /// dropped upstream.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(MessageType::PairRequest),
            0x01 => Some(MessageType::PairResponse),
            0x02 => Some(MessageType::Heartbeat),
            0x03 => Some(MessageType::HeartbeatResponse),
            0x10 => Some(MessageType::Data),
            0x11 => Some(MessageType::Ack),
            0x20 => Some(MessageType::Command),
            0x30 => Some(MessageType::ChannelScanProbe),
            0x31 => Some(MessageType::ChannelScanResponse),
            _ => None,
        }
    }

    /// Whether frames of this type are consumed by the protocol worker
    /// rather than the application.
    pub fn is_protocol(&self) -> bool {
        !matches!(self, MessageType::Data | MessageType::Command)
    }
}

/// Status codes for the pairing process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PairStatus {
    /// Pairing successful; the node is registered
    Accepted = 0x00,
    /// Pairing failed; registration not permitted
    RejectedNotAllowed = 0x01,
}

impl PairStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(PairStatus::Accepted),
            0x01 => Some(PairStatus::RejectedNotAllowed),
            _ => None,
        }
    }
}

/// Logical acknowledgement status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    /// Message received and processed successfully
    Ok = 0x00,
    /// Message received but the payload data is invalid
    ErrorInvalidData = 0x01,
    /// Message received but processing failed internally
    ErrorProcessing = 0x02,
}

impl AckStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(AckStatus::Ok),
            0x01 => Some(AckStatus::ErrorInvalidData),
            0x02 => Some(AckStatus::ErrorProcessing),
            _ => None,
        }
    }
}

/// Standard control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    /// Start an over-the-air update
    StartOta = 0x01,
    /// Perform a system reset
    Reboot = 0x02,
    /// Change the data reporting frequency
    SetReportInterval = 0x03,
}

/// Universal header included at the beginning of every frame.
///
/// Wire layout (16 bytes, little-endian):
/// msg_type(1) seq(2) sender_type(1) sender_id(1) payload_type(1)
/// requires_ack(1) dest_id(1) timestamp_ms(8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Type identifier for the message
    pub msg_type: MessageType,
    /// Sequence number, assigned by the TX engine at send time
    pub sequence_number: u16,
    /// Role of the sending node
    pub sender_type: NodeType,
    /// Id of the sending node
    pub sender_node_id: NodeId,
    /// Content format identifier for DATA/COMMAND
    pub payload_type: PayloadType,
    /// If true, the receiver should send a logical ACK
    pub requires_ack: bool,
    /// Id of the destination node (or broadcast)
    pub dest_node_id: NodeId,
    /// Millisecond timestamp of when the message was sent
    pub timestamp_ms: u64,
}

impl MessageHeader {
    /// Encoded size on the wire.
    pub const WIRE_SIZE: usize = MESSAGE_HEADER_SIZE;

    /// Creates a header for an internally generated protocol frame.
    pub fn protocol(
        msg_type: MessageType,
        sender_type: NodeType,
        sender_node_id: NodeId,
        dest_node_id: NodeId,
        timestamp_ms: u64,
    ) -> Self {
        MessageHeader {
            msg_type,
            sequence_number: 0,
            sender_type,
            sender_node_id,
            payload_type: 0,
            requires_ack: false,
            dest_node_id,
            timestamp_ms,
        }
    }

    /// Serializes the header into `buf` in wire order.
    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.msg_type as u8);
        buf.put_u16_le(self.sequence_number);
        buf.put_u8(self.sender_type);
        buf.put_u8(self.sender_node_id);
        buf.put_u8(self.payload_type);
        buf.put_u8(self.requires_ack as u8);
        buf.put_u8(self.dest_node_id);
        buf.put_u64_le(self.timestamp_ms);
    }

    /// Deserializes a header from the first 16 bytes of `data`.
    ///
    /// Returns `None` when the slice is too short or the message type is
    /// unknown.
    pub fn read_from(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        let mut buf = &data[..Self::WIRE_SIZE];
        let msg_type = MessageType::from_u8(buf.get_u8())?;
        Some(MessageHeader {
            msg_type,
            sequence_number: buf.get_u16_le(),
            sender_type: buf.get_u8(),
            sender_node_id: buf.get_u8(),
            payload_type: buf.get_u8(),
            requires_ack: buf.get_u8() != 0,
            dest_node_id: buf.get_u8(),
            timestamp_ms: buf.get_u64_le(),
        })
    }
}

/// Payload of a PAIR_REQUEST frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairRequestPayload {
    /// Firmware version of the requesting node (major, minor, patch)
    pub firmware_version: [u8; 3],
    /// Uptime of the requesting node in milliseconds
    pub uptime_ms: u64,
    /// Human-readable device name, zero-padded
    pub device_name: [u8; 16],
    /// Heartbeat interval the node intends to use
    pub heartbeat_interval_ms: u32,
}

impl PairRequestPayload {
    pub const WIRE_SIZE: usize = 3 + 8 + 16 + 4;

    /// Builds a payload, truncating `name` to the 16-byte wire field.
    pub fn new(
        firmware_version: [u8; 3],
        uptime_ms: u64,
        name: &str,
        heartbeat_interval_ms: u32,
    ) -> Self {
        let mut device_name = [0u8; 16];
        let bytes = name.as_bytes();
        let n = bytes.len().min(16);
        device_name[..n].copy_from_slice(&bytes[..n]);
        PairRequestPayload {
            firmware_version,
            uptime_ms,
            device_name,
            heartbeat_interval_ms,
        }
    }

    /// The device name with trailing padding stripped.
    pub fn device_name(&self) -> &str {
        let end = self
            .device_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.device_name.len());
        std::str::from_utf8(&self.device_name[..end]).unwrap_or("")
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.firmware_version);
        buf.put_u64_le(self.uptime_ms);
        buf.put_slice(&self.device_name);
        buf.put_u32_le(self.heartbeat_interval_ms);
    }

    pub fn read_from(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        let mut buf = data;
        let mut firmware_version = [0u8; 3];
        buf.copy_to_slice(&mut firmware_version);
        let uptime_ms = buf.get_u64_le();
        let mut device_name = [0u8; 16];
        buf.copy_to_slice(&mut device_name);
        Some(PairRequestPayload {
            firmware_version,
            uptime_ms,
            device_name,
            heartbeat_interval_ms: buf.get_u32_le(),
        })
    }
}

/// Payload of a PAIR_RESPONSE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairResponsePayload {
    /// Acceptance or rejection status
    pub status: PairStatus,
    /// Node id assigned by the hub (echoes the requester's id)
    pub assigned_id: NodeId,
    /// Heartbeat interval authorized by the hub
    pub heartbeat_interval_ms: u32,
    /// Suggested reporting interval for application data
    pub report_interval_ms: u32,
    /// Radio channel the hub is operating on
    pub wifi_channel: u8,
}

impl PairResponsePayload {
    pub const WIRE_SIZE: usize = 1 + 1 + 4 + 4 + 1;

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.status as u8);
        buf.put_u8(self.assigned_id);
        buf.put_u32_le(self.heartbeat_interval_ms);
        buf.put_u32_le(self.report_interval_ms);
        buf.put_u8(self.wifi_channel);
    }

    pub fn read_from(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        let mut buf = data;
        let status = PairStatus::from_u8(buf.get_u8())?;
        Some(PairResponsePayload {
            status,
            assigned_id: buf.get_u8(),
            heartbeat_interval_ms: buf.get_u32_le(),
            report_interval_ms: buf.get_u32_le(),
            wifi_channel: buf.get_u8(),
        })
    }
}

/// Payload of a HEARTBEAT frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPayload {
    /// Battery voltage in millivolts; 0 when unknown
    pub battery_mv: u16,
    /// RSSI of the hub as last seen by the node
    pub rssi: i8,
    /// Uptime of the node in milliseconds
    pub uptime_ms: u64,
}

impl HeartbeatPayload {
    pub const WIRE_SIZE: usize = 2 + 1 + 8;

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.battery_mv);
        buf.put_i8(self.rssi);
        buf.put_u64_le(self.uptime_ms);
    }

    pub fn read_from(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        let mut buf = data;
        Some(HeartbeatPayload {
            battery_mv: buf.get_u16_le(),
            rssi: buf.get_i8(),
            uptime_ms: buf.get_u64_le(),
        })
    }
}

/// Payload of a HEARTBEAT_RESPONSE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponsePayload {
    /// Hub-side time in milliseconds, for coarse synchronization
    pub server_time_ms: u64,
    /// Current radio channel of the hub; 0 means "no channel advice"
    pub wifi_channel: u8,
}

impl HeartbeatResponsePayload {
    pub const WIRE_SIZE: usize = 8 + 1;

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.server_time_ms);
        buf.put_u8(self.wifi_channel);
    }

    pub fn read_from(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        let mut buf = data;
        Some(HeartbeatResponsePayload {
            server_time_ms: buf.get_u64_le(),
            wifi_channel: buf.get_u8(),
        })
    }
}

/// Payload of an ACK frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    /// Sequence number of the message being acknowledged
    pub ack_sequence: u16,
    /// Processing status of the acknowledged message
    pub status: AckStatus,
    /// Time the receiver took to process the message, in microseconds
    pub processing_time_us: u32,
}

impl AckPayload {
    pub const WIRE_SIZE: usize = 2 + 1 + 4;

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.ack_sequence);
        buf.put_u8(self.status as u8);
        buf.put_u32_le(self.processing_time_us);
    }

    pub fn read_from(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        let mut buf = data;
        let ack_sequence = buf.get_u16_le();
        let status = AckStatus::from_u8(buf.get_u8())?;
        Some(AckPayload {
            ack_sequence,
            status,
            processing_time_us: buf.get_u32_le(),
        })
    }
}

/// Payload of an OTA COMMAND frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaCommandPayload {
    /// OTA sub-command
    pub cmd_type: CommandType,
    /// URL where the node can download the new firmware, zero-padded
    pub firmware_url: [u8; 128],
    /// Expected size of the firmware binary in bytes
    pub firmware_size: u32,
    /// SHA-256 hash of the firmware binary
    pub firmware_hash: [u8; 32],
}

impl OtaCommandPayload {
    pub const WIRE_SIZE: usize = 1 + 128 + 4 + 32;

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.cmd_type as u8);
        buf.put_slice(&self.firmware_url);
        buf.put_u32_le(self.firmware_size);
        buf.put_slice(&self.firmware_hash);
    }

    pub fn read_from(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        let mut buf = data;
        let cmd_type = match buf.get_u8() {
            0x01 => CommandType::StartOta,
            0x02 => CommandType::Reboot,
            0x03 => CommandType::SetReportInterval,
            _ => return None,
        };
        let mut firmware_url = [0u8; 128];
        buf.copy_to_slice(&mut firmware_url);
        let firmware_size = buf.get_u32_le();
        let mut firmware_hash = [0u8; 32];
        buf.copy_to_slice(&mut firmware_hash);
        Some(OtaCommandPayload {
            cmd_type,
            firmware_url,
            firmware_size,
            firmware_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MAX_PAYLOAD_SIZE;
    use bytes::BytesMut;

    fn sample_header() -> MessageHeader {
        MessageHeader {
            msg_type: MessageType::Data,
            sequence_number: 0x1234,
            sender_type: 0x02,
            sender_node_id: 0x0A,
            payload_type: 0x07,
            requires_ack: true,
            dest_node_id: 0x01,
            timestamp_ms: 0x0102_0304_0506_0708,
        }
    }

    #[test]
    fn test_header_wire_layout_is_exact() {
        let mut buf = BytesMut::new();
        sample_header().write_to(&mut buf);

        assert_eq!(buf.len(), MessageHeader::WIRE_SIZE);
        assert_eq!(
            &buf[..],
            &[
                0x10, // msg_type
                0x34, 0x12, // sequence_number LE
                0x02, // sender_type
                0x0A, // sender_node_id
                0x07, // payload_type
                0x01, // requires_ack
                0x01, // dest_node_id
                0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // timestamp LE
            ]
        );
    }

    #[test]
    fn test_header_round_trip() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(MessageHeader::read_from(&buf), Some(header));
    }

    #[test]
    fn test_header_rejects_short_input() {
        let mut buf = BytesMut::new();
        sample_header().write_to(&mut buf);
        assert!(MessageHeader::read_from(&buf[..15]).is_none());
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        let mut buf = BytesMut::new();
        sample_header().write_to(&mut buf);
        let mut bytes = buf.to_vec();
        bytes[0] = 0x7F;
        assert!(MessageHeader::read_from(&bytes).is_none());
    }

    #[test]
    fn test_message_type_classification() {
        assert!(MessageType::PairRequest.is_protocol());
        assert!(MessageType::Heartbeat.is_protocol());
        assert!(MessageType::Ack.is_protocol());
        assert!(MessageType::ChannelScanResponse.is_protocol());
        assert!(!MessageType::Data.is_protocol());
        assert!(!MessageType::Command.is_protocol());
    }

    #[test]
    fn test_pair_request_round_trip() {
        let payload = PairRequestPayload::new([1, 4, 2], 98_765, "tank-sensor", 5000);
        let mut buf = BytesMut::new();
        payload.write_to(&mut buf);

        assert_eq!(buf.len(), PairRequestPayload::WIRE_SIZE);
        let decoded = PairRequestPayload::read_from(&buf).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.device_name(), "tank-sensor");
    }

    #[test]
    fn test_pair_request_truncates_long_name() {
        let payload = PairRequestPayload::new([0, 0, 1], 0, "a-device-name-well-past-the-field", 0);
        assert_eq!(payload.device_name().len(), 16);
    }

    #[test]
    fn test_pair_response_round_trip() {
        let payload = PairResponsePayload {
            status: PairStatus::Accepted,
            assigned_id: 10,
            heartbeat_interval_ms: 5000,
            report_interval_ms: 30_000,
            wifi_channel: 6,
        };
        let mut buf = BytesMut::new();
        payload.write_to(&mut buf);
        assert_eq!(buf.len(), PairResponsePayload::WIRE_SIZE);
        assert_eq!(PairResponsePayload::read_from(&buf), Some(payload));
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let payload = HeartbeatPayload {
            battery_mv: 3300,
            rssi: -61,
            uptime_ms: 42_000,
        };
        let mut buf = BytesMut::new();
        payload.write_to(&mut buf);
        assert_eq!(buf.len(), HeartbeatPayload::WIRE_SIZE);
        assert_eq!(HeartbeatPayload::read_from(&buf), Some(payload));
    }

    #[test]
    fn test_heartbeat_response_round_trip() {
        let payload = HeartbeatResponsePayload {
            server_time_ms: 1_234_567,
            wifi_channel: 11,
        };
        let mut buf = BytesMut::new();
        payload.write_to(&mut buf);
        assert_eq!(buf.len(), HeartbeatResponsePayload::WIRE_SIZE);
        assert_eq!(HeartbeatResponsePayload::read_from(&buf), Some(payload));
    }

    #[test]
    fn test_ack_round_trip() {
        let payload = AckPayload {
            ack_sequence: 0xBEEF,
            status: AckStatus::Ok,
            processing_time_us: 1500,
        };
        let mut buf = BytesMut::new();
        payload.write_to(&mut buf);
        assert_eq!(buf.len(), AckPayload::WIRE_SIZE);
        assert_eq!(AckPayload::read_from(&buf), Some(payload));
    }

    #[test]
    fn test_truncated_payloads_rejected() {
        let heartbeat = HeartbeatPayload { battery_mv: 0, rssi: 0, uptime_ms: 0 };
        let mut buf = BytesMut::new();
        heartbeat.write_to(&mut buf);
        assert!(HeartbeatPayload::read_from(&buf[..buf.len() - 1]).is_none());

        let ack = AckPayload {
            ack_sequence: 1,
            status: AckStatus::Ok,
            processing_time_us: 0,
        };
        let mut buf = BytesMut::new();
        ack.write_to(&mut buf);
        assert!(AckPayload::read_from(&buf[..3]).is_none());
    }

    #[test]
    fn test_all_payloads_fit_one_frame() {
        assert!(PairRequestPayload::WIRE_SIZE <= MAX_PAYLOAD_SIZE);
        assert!(PairResponsePayload::WIRE_SIZE <= MAX_PAYLOAD_SIZE);
        assert!(HeartbeatPayload::WIRE_SIZE <= MAX_PAYLOAD_SIZE);
        assert!(HeartbeatResponsePayload::WIRE_SIZE <= MAX_PAYLOAD_SIZE);
        assert!(AckPayload::WIRE_SIZE <= MAX_PAYLOAD_SIZE);
        assert!(OtaCommandPayload::WIRE_SIZE <= MAX_PAYLOAD_SIZE);
    }
}
