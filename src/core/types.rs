use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{DEFAULT_ACK_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_WIFI_CHANNEL};

/// Logical node identifier (0x01 = hub, 0xFF = broadcast)
pub type NodeId = u8;
/// Node role tag (0x00 = unknown, 0x01 = hub, 0x02+ application-defined)
pub type NodeType = u8;
/// Application-defined payload identifier carried in the header
pub type PayloadType = u8;

/// Six-byte radio hardware address
pub type Mac = [u8; 6];

/// Every device receives frames addressed to this mac.
pub const BROADCAST_MAC: Mac = [0xFF; 6];

/// Reserved node ids with special meaning
pub mod reserved_ids {
    use super::NodeId;

    /// Send-to-all destination id
    pub const BROADCAST: NodeId = 0xFF;
    /// Central hub default id
    pub const HUB: NodeId = 0x01;
}

/// Reserved node types for core functionality
pub mod reserved_types {
    use super::NodeType;

    /// Nodes that have not yet identified themselves
    pub const UNKNOWN: NodeType = 0x00;
    /// The central hub
    pub const HUB: NodeType = 0x01;
}

/// Identity of the local node, fixed at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Local node id
    pub node_id: NodeId,
    /// Local role tag
    pub node_type: NodeType,
}

impl NodeIdentity {
    /// Whether the local node plays the hub role
    pub fn is_hub(&self) -> bool {
        self.node_type == reserved_types::HUB
    }
}

/// A frame as received from the radio driver.
#[derive(Debug, Clone, Default)]
pub struct RxPacket {
    /// Hardware address of the sender
    pub src_mac: Mac,
    /// Raw frame bytes (header + payload + crc)
    pub data: bytes::Bytes,
    /// Receive signal strength reported by the driver
    pub rssi: i8,
    /// Driver receive timestamp in microseconds
    pub timestamp_us: i64,
}

impl RxPacket {
    /// An empty packet, used as a shutdown sentinel for the receive queues.
    pub fn sentinel() -> Self {
        RxPacket::default()
    }

    /// Whether this packet is the shutdown sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.data.is_empty()
    }
}

/// An encoded frame waiting in the transmit queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPacket {
    /// Hardware address of the destination
    pub dest_mac: Mac,
    /// Encoded frame bytes (header + payload + crc)
    pub data: Vec<u8>,
    /// Whether the receiver is expected to send a logical ACK
    pub requires_ack: bool,
}

/// Retry context for an in-flight packet awaiting its logical ACK.
///
/// Holds a full copy of the packet so retransmission needs no caller
/// cooperation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    /// Sequence number assigned at send time
    pub sequence_number: u16,
    /// Monotonic timestamp of the original send (ms)
    pub timestamp_ms: u64,
    /// Remaining retransmissions before the packet is dropped
    pub retries_left: u8,
    /// The packet to retransmit
    pub packet: TxPacket,
    /// Destination node id, for diagnostics
    pub node_id: NodeId,
}

/// Public information about a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Hardware address
    pub mac: Mac,
    /// Role tag
    pub node_type: NodeType,
    /// Logical id
    pub node_id: NodeId,
    /// Radio channel the peer was last seen on
    pub channel: u8,
    /// Monotonic ms of the last heartbeat from this peer (0 = never)
    pub last_seen_ms: u64,
    /// Whether the peer completed pairing
    pub paired: bool,
    /// Expected heartbeat period; 0 disables offline detection
    pub heartbeat_interval_ms: u32,
}

/// Peer fields that survive reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentPeer {
    /// Hardware address
    pub mac: Mac,
    /// Role tag
    pub node_type: NodeType,
    /// Logical id
    pub node_id: NodeId,
    /// Radio channel
    pub channel: u8,
    /// Whether the peer completed pairing
    pub paired: bool,
    /// Expected heartbeat period
    pub heartbeat_interval_ms: u32,
}

impl From<&PeerInfo> for PersistentPeer {
    fn from(info: &PeerInfo) -> Self {
        PersistentPeer {
            mac: info.mac,
            node_type: info.node_type,
            node_id: info.node_id,
            channel: info.channel,
            paired: info.paired,
            heartbeat_interval_ms: info.heartbeat_interval_ms,
        }
    }
}

impl From<&PersistentPeer> for PeerInfo {
    fn from(stored: &PersistentPeer) -> Self {
        PeerInfo {
            mac: stored.mac,
            node_type: stored.node_type,
            node_id: stored.node_id,
            channel: stored.channel,
            // Last-seen does not survive reboot; peers start unseen.
            last_seen_ms: 0,
            paired: stored.paired,
            heartbeat_interval_ms: stored.heartbeat_interval_ms,
        }
    }
}

/// Configuration for a [`crate::NowLink`](crate::NowLink) instance.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Logical id of the local node
    pub node_id: NodeId,
    /// Role tag of the local node
    pub node_type: NodeType,
    /// Queue receiving DATA/COMMAND frames for the application (required)
    pub app_rx_queue: Option<mpsc::Sender<RxPacket>>,
    /// Radio channel to start on; overridden by persisted state when valid
    pub wifi_channel: u8,
    /// Logical acknowledgement timeout
    pub ack_timeout_ms: u32,
    /// Heartbeat period for leaves; 0 disables the heartbeat timer
    pub heartbeat_interval_ms: u32,
    /// Human-readable device name advertised during pairing
    pub device_name: String,
    /// Firmware version advertised during pairing (major, minor, patch)
    pub firmware_version: [u8; 3],
    /// Depth of the receive dispatcher queue
    pub rx_queue_capacity: usize,
    /// Depth of the protocol worker queue
    pub worker_queue_capacity: usize,
    /// Depth of the transmit queue
    pub tx_queue_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            node_id: reserved_ids::HUB,
            node_type: reserved_types::UNKNOWN,
            app_rx_queue: None,
            wifi_channel: DEFAULT_WIFI_CHANNEL,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            device_name: String::new(),
            firmware_version: [0, 0, 0],
            rx_queue_capacity: 30,
            worker_queue_capacity: 20,
            tx_queue_capacity: 20,
        }
    }
}
