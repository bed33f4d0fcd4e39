//! nowlink: a star-topology wireless messaging runtime.
//!
//! One hub and up to eighteen leaves exchange small framed messages over a
//! connectionless, channel-hopping radio link (250-byte MTU datagrams
//! addressed by hardware mac). The runtime provides at-most-once logical
//! delivery with retries and logical ACKs, a persisted LRU peer table,
//! hub discovery by channel sweep, and heartbeat-based liveness tracking.
//!
//! The radio driver, the non-volatile store and the application payloads
//! stay outside: the host implements [`Radio`] and the persistence
//! backends, bridges the driver callbacks into [`NowLink`], and receives
//! application frames on the queue it passes in [`LinkConfig`].

pub mod core;
pub mod managers;
pub mod network;
pub mod peers;
pub mod protocol;
pub mod storage;
pub mod util;

mod link;

pub use crate::core::{
    Error,
    LinkConfig,
    Mac,
    NodeId,
    NodeType,
    PayloadType,
    PeerInfo,
    Result,
    RxPacket,
    BROADCAST_MAC,
};
pub use crate::link::NowLink;
pub use crate::network::{Radio, ScanResult};
pub use crate::protocol::{AckStatus, CommandType, MessageHeader, MessageType};
pub use crate::storage::{FileBackend, MemoryBackend, PersistenceBackend, Storage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
