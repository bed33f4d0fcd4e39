//! Two-tier persistence for the peer table and channel state.
//!
//! A fixed-size versioned blob carries the radio channel and the peer list.
//! Saves hit the fast tier every time and the slow tier only when something
//! actually changed, sparing the non-volatile store's write endurance.

pub mod backends;

pub use self::backends::{FileBackend, MemoryBackend, PersistenceBackend};

use bytes::{Buf, BufMut};
use tracing::{debug, warn};

use crate::core::{Error, PersistentPeer, Result, MAX_PEERS};
use crate::util::crc32_le;

/// Identifies a nowlink blob ("ESPN" in ASCII).
pub const BLOB_MAGIC: u32 = 0x4553_504E;

/// Current blob layout version; a bump invalidates prior data.
pub const BLOB_VERSION: u32 = 1;

/// Wire size of one persisted peer record.
pub const PERSISTENT_PEER_SIZE: usize = 6 + 1 + 1 + 1 + 1 + 4;

/// Total blob size: magic, version, channel, count, fixed peer array, crc.
pub const BLOB_SIZE: usize = 4 + 4 + 1 + 1 + MAX_PEERS * PERSISTENT_PEER_SIZE + 4;

fn write_peer(buf: &mut impl BufMut, peer: &PersistentPeer) {
    buf.put_slice(&peer.mac);
    buf.put_u8(peer.node_type);
    buf.put_u8(peer.node_id);
    buf.put_u8(peer.channel);
    buf.put_u8(peer.paired as u8);
    buf.put_u32_le(peer.heartbeat_interval_ms);
}

fn read_peer(buf: &mut impl Buf) -> PersistentPeer {
    let mut mac = [0u8; 6];
    buf.copy_to_slice(&mut mac);
    PersistentPeer {
        mac,
        node_type: buf.get_u8(),
        node_id: buf.get_u8(),
        channel: buf.get_u8(),
        paired: buf.get_u8() != 0,
        heartbeat_interval_ms: buf.get_u32_le(),
    }
}

/// Serializes channel + peers into the fixed blob layout.
///
/// At most [`MAX_PEERS`] records are stored; unused slots are zeroed so the
/// blob compares byte-equal across saves of the same state.
fn encode_blob(wifi_channel: u8, peers: &[PersistentPeer]) -> Vec<u8> {
    let count = peers.len().min(MAX_PEERS);
    let mut buf = Vec::with_capacity(BLOB_SIZE);
    buf.put_u32_le(BLOB_MAGIC);
    buf.put_u32_le(BLOB_VERSION);
    buf.put_u8(wifi_channel);
    buf.put_u8(count as u8);
    for peer in &peers[..count] {
        write_peer(&mut buf, peer);
    }
    buf.resize(BLOB_SIZE - 4, 0);
    let crc = crc32_le(0, &buf);
    buf.put_u32_le(crc);
    buf
}

/// Validates and deserializes a blob.
///
/// Magic, version and CRC must all match; anything else is treated as
/// absent data.
fn decode_blob(data: &[u8]) -> Option<(u8, Vec<PersistentPeer>)> {
    if data.len() != BLOB_SIZE {
        return None;
    }

    let stored_crc = (&data[BLOB_SIZE - 4..]).get_u32_le();
    if crc32_le(0, &data[..BLOB_SIZE - 4]) != stored_crc {
        return None;
    }

    let mut buf = data;
    if buf.get_u32_le() != BLOB_MAGIC || buf.get_u32_le() != BLOB_VERSION {
        return None;
    }

    let wifi_channel = buf.get_u8();
    let num_peers = (buf.get_u8() as usize).min(MAX_PEERS);
    let mut peers = Vec::with_capacity(num_peers);
    for _ in 0..num_peers {
        peers.push(read_peer(&mut buf));
    }
    Some((wifi_channel, peers))
}

/// Composes the fast and slow persistence tiers.
pub struct Storage {
    fast: Box<dyn PersistenceBackend>,
    slow: Box<dyn PersistenceBackend>,
}

impl Storage {
    /// Creates a storage composer over the two tiers.
    pub fn new(fast: Box<dyn PersistenceBackend>, slow: Box<dyn PersistenceBackend>) -> Self {
        Storage { fast, slow }
    }

    /// Creates an in-memory storage, useful for tests and ephemeral nodes.
    pub fn ephemeral() -> Self {
        Storage::new(Box::new(MemoryBackend::new()), Box::new(MemoryBackend::new()))
    }

    /// Loads the persisted channel and peer list.
    ///
    /// The fast tier wins when valid; otherwise the slow tier is consulted
    /// and, on a hit, mirrored back into the fast tier so the next load is
    /// cheap. Returns `NotFound` when neither tier holds a valid blob.
    pub fn load(&self) -> Result<(u8, Vec<PersistentPeer>)> {
        let mut buf = vec![0u8; BLOB_SIZE];

        if self.fast.load(&mut buf).is_ok() {
            if let Some((channel, peers)) = decode_blob(&buf) {
                debug!(channel, peers = peers.len(), "loaded state from fast tier");
                return Ok((channel, peers));
            }
        }

        if self.slow.load(&mut buf).is_ok() {
            if let Some((channel, peers)) = decode_blob(&buf) {
                debug!(channel, peers = peers.len(), "loaded state from slow tier");
                if let Err(err) = self.fast.save(&buf) {
                    warn!(%err, "failed to mirror state into fast tier");
                }
                return Ok((channel, peers));
            }
        }

        Err(Error::not_found("no valid persisted state"))
    }

    /// Persists the channel and peer list.
    ///
    /// The fast tier is written unconditionally (failures are logged, not
    /// fatal). The slow tier is written when the blob differs from what the
    /// fast tier held before this save, or when `force` is set.
    pub fn save(&self, wifi_channel: u8, peers: &[PersistentPeer], force: bool) -> Result<()> {
        let blob = encode_blob(wifi_channel, peers);

        let mut previous = vec![0u8; BLOB_SIZE];
        let dirty = match self.fast.load(&mut previous) {
            Ok(()) => previous != blob,
            Err(_) => true,
        };

        if let Err(err) = self.fast.save(&blob) {
            warn!(%err, "failed to save state to fast tier");
        }

        if !dirty && !force {
            return Ok(());
        }

        self.slow.save(&blob).map_err(|err| {
            warn!(%err, "failed to save state to slow tier");
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn peer(id: u8) -> PersistentPeer {
        PersistentPeer {
            mac: [id, 2, 3, 4, 5, 6],
            node_type: 2,
            node_id: id,
            channel: 1,
            paired: true,
            heartbeat_interval_ms: 5000,
        }
    }

    /// Backend wrapper counting writes, for slow-tier endurance checks.
    struct CountingBackend {
        inner: MemoryBackend,
        saves: Arc<AtomicUsize>,
    }

    impl PersistenceBackend for CountingBackend {
        fn load(&self, buf: &mut [u8]) -> Result<()> {
            self.inner.load(buf)
        }

        fn save(&self, buf: &[u8]) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(buf)
        }
    }

    /// Backend that always fails.
    struct BrokenBackend;

    impl PersistenceBackend for BrokenBackend {
        fn load(&self, _buf: &mut [u8]) -> Result<()> {
            Err(Error::storage("broken"))
        }

        fn save(&self, _buf: &[u8]) -> Result<()> {
            Err(Error::storage("broken"))
        }
    }

    #[test]
    fn test_blob_size_is_fixed() {
        assert_eq!(BLOB_SIZE, 280);
        assert_eq!(encode_blob(1, &[]).len(), BLOB_SIZE);
        assert_eq!(encode_blob(13, &[peer(1), peer(2)]).len(), BLOB_SIZE);
    }

    #[test]
    fn test_blob_wire_layout_prefix() {
        let blob = encode_blob(6, &[peer(10)]);
        // magic "NPSE" little-endian, version 1, channel, count.
        assert_eq!(&blob[..4], &[0x4E, 0x50, 0x53, 0x45]);
        assert_eq!(&blob[4..8], &[1, 0, 0, 0]);
        assert_eq!(blob[8], 6);
        assert_eq!(blob[9], 1);
        // First peer record starts right after the count byte.
        assert_eq!(&blob[10..16], &[10, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_blob_round_trip_preserves_order() {
        let peers = vec![peer(3), peer(1), peer(2)];
        let blob = encode_blob(11, &peers);
        let (channel, decoded) = decode_blob(&blob).unwrap();
        assert_eq!(channel, 11);
        assert_eq!(decoded, peers);
    }

    #[test]
    fn test_blob_rejects_corruption() {
        let blob = encode_blob(1, &[peer(1)]);

        let mut bad_crc = blob.clone();
        bad_crc[20] ^= 0x01;
        assert!(decode_blob(&bad_crc).is_none());

        let mut bad_magic = blob.clone();
        bad_magic[0] ^= 0xFF;
        // Re-seal the CRC so only the magic is wrong.
        let crc = crc32_le(0, &bad_magic[..BLOB_SIZE - 4]);
        bad_magic[BLOB_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        assert!(decode_blob(&bad_magic).is_none());

        let mut bad_version = blob.clone();
        bad_version[4] = 2;
        let crc = crc32_le(0, &bad_version[..BLOB_SIZE - 4]);
        bad_version[BLOB_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        assert!(decode_blob(&bad_version).is_none());

        assert!(decode_blob(&blob[..BLOB_SIZE - 1]).is_none());
    }

    #[test]
    fn test_load_prefers_fast_tier() {
        let fast = MemoryBackend::new();
        let slow = MemoryBackend::new();
        fast.save(&encode_blob(6, &[peer(1)])).unwrap();
        slow.save(&encode_blob(2, &[peer(9)])).unwrap();

        let storage = Storage::new(Box::new(fast), Box::new(slow));
        let (channel, peers) = storage.load().unwrap();
        assert_eq!(channel, 6);
        assert_eq!(peers[0].node_id, 1);
    }

    #[test]
    fn test_load_falls_back_to_slow_and_mirrors() {
        let fast = MemoryBackend::new();
        let slow = MemoryBackend::new();
        slow.save(&encode_blob(9, &[peer(4)])).unwrap();

        let storage = Storage::new(Box::new(fast.clone()), Box::new(slow));
        let (channel, peers) = storage.load().unwrap();
        assert_eq!(channel, 9);
        assert_eq!(peers.len(), 1);

        // The slow hit was mirrored into the fast tier.
        let mut buf = vec![0u8; BLOB_SIZE];
        fast.load(&mut buf).unwrap();
        assert_eq!(decode_blob(&buf).unwrap().0, 9);
    }

    #[test]
    fn test_load_with_nothing_valid_is_not_found() {
        let storage = Storage::ephemeral();
        assert!(matches!(storage.load(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_save_skips_slow_tier_when_unchanged() {
        let saves = Arc::new(AtomicUsize::new(0));
        let counting = CountingBackend {
            inner: MemoryBackend::new(),
            saves: saves.clone(),
        };
        let storage = Storage::new(Box::new(MemoryBackend::new()), Box::new(counting));

        let peers = vec![peer(1)];
        storage.save(1, &peers, false).unwrap();
        storage.save(1, &peers, false).unwrap();
        storage.save(1, &peers, false).unwrap();
        assert_eq!(saves.load(Ordering::SeqCst), 1);

        // A content change writes again.
        storage.save(2, &peers, false).unwrap();
        assert_eq!(saves.load(Ordering::SeqCst), 2);

        // Force writes even without a change.
        storage.save(2, &peers, true).unwrap();
        assert_eq!(saves.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_fast_tier_failure_is_not_fatal() {
        let storage = Storage::new(Box::new(BrokenBackend), Box::new(MemoryBackend::new()));
        assert!(storage.save(3, &[peer(1)], false).is_ok());

        // State is still recoverable through the slow tier.
        let (channel, peers) = storage.load().unwrap();
        assert_eq!(channel, 3);
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn test_slow_tier_failure_propagates() {
        let storage = Storage::new(Box::new(MemoryBackend::new()), Box::new(BrokenBackend));
        assert!(storage.save(3, &[peer(1)], false).is_err());
    }
}
