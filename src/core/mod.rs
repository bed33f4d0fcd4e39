//! Core types and constants for the nowlink runtime
//!
//! This module contains the fundamental building blocks used throughout the
//! library: the error type, shared data types and protocol constants.

pub mod error;
pub mod types;

pub use self::error::{Error, Result};
pub use self::types::{
    LinkConfig,
    Mac,
    NodeId,
    NodeIdentity,
    NodeType,
    PayloadType,
    PeerInfo,
    PendingAck,
    PersistentPeer,
    RxPacket,
    TxPacket,
    BROADCAST_MAC,
};

/// Size of the universal message header on the wire
pub const MESSAGE_HEADER_SIZE: usize = 16;

/// Size of the trailing CRC field
pub const CRC_SIZE: usize = 1;

/// Largest frame the radio accepts in one send
pub const MAX_FRAME_SIZE: usize = 250;

/// Smallest valid frame: header plus CRC, no payload
pub const MIN_FRAME_SIZE: usize = MESSAGE_HEADER_SIZE + CRC_SIZE;

/// Maximum payload size once header and CRC are accounted for
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - MESSAGE_HEADER_SIZE - CRC_SIZE;

/// Default logical acknowledgement timeout in milliseconds
pub const DEFAULT_ACK_TIMEOUT_MS: u32 = 500;

/// Default interval between heartbeat messages in milliseconds
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u32 = 60_000;

/// Default radio channel used when none is configured or persisted
pub const DEFAULT_WIFI_CHANNEL: u8 = 1;

/// Multiplier applied to a peer's heartbeat interval to declare it offline
pub const HEARTBEAT_OFFLINE_MULTIPLIER: f32 = 2.5;

/// Maximum number of logical retransmissions for unacknowledged packets
pub const MAX_LOGICAL_RETRIES: u8 = 3;

/// Consecutive physical send failures tolerated before scanning for the hub
pub const MAX_PHYSICAL_FAILURES: u8 = 3;

/// Time spent listening on a single channel during discovery (ms)
pub const SCAN_CHANNEL_TIMEOUT_MS: u64 = 50;

/// Probe attempts per channel during discovery
pub const SCAN_CHANNEL_ATTEMPTS: u8 = 2;

/// Upper bound for a full channel sweep (ms)
pub const MAX_SCAN_TIME_MS: u64 = 2_000;

/// Lowest valid radio channel
pub const WIFI_CHANNEL_MIN: u8 = 1;

/// Highest valid radio channel
pub const WIFI_CHANNEL_MAX: u8 = 13;

/// Number of selectable radio channels
pub const WIFI_CHANNEL_COUNT: u8 = 13;

/// Maximum number of peers the table holds before evicting
pub const MAX_PEERS: usize = 19;

/// Submission timeout for the transmit queue (ms)
pub const TX_QUEUE_TIMEOUT_MS: u64 = 100;

/// Resend period for pairing requests while pairing is active (ms)
pub const PAIRING_RESEND_INTERVAL_MS: u64 = 5_000;
