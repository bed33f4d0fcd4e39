//! Peer table.
//!
//! Maps logical node ids to peer records, most-recently-touched first so
//! eviction always takes the stalest entry. Structural changes are kept
//! atomic with the matching driver peer-filter call, and every mutation
//! persists a snapshot through the two-tier storage.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::core::{
    Error, Mac, NodeId, NodeType, PeerInfo, PersistentPeer, Result, HEARTBEAT_OFFLINE_MULTIPLIER,
    MAX_PEERS,
};
use crate::network::radio::Radio;
use crate::storage::Storage;

/// Thread-safe LRU-ordered peer table.
pub struct PeerTable {
    peers: Mutex<Vec<PeerInfo>>,
    storage: Storage,
    radio: Arc<dyn Radio>,
}

impl PeerTable {
    /// Creates an empty table over the given radio and storage.
    pub fn new(radio: Arc<dyn Radio>, storage: Storage) -> Self {
        PeerTable {
            peers: Mutex::new(Vec::new()),
            storage,
            radio,
        }
    }

    /// Adds or updates a peer and moves it to the front of the table.
    ///
    /// For an existing id: a mac change re-registers the peer with the
    /// driver (old mac removed first), a channel change modifies it in
    /// place. For a new id the stalest peer is evicted when the table is
    /// full. Driver errors abort the mutation; the table is only changed
    /// once the driver accepted the corresponding call.
    pub fn add(
        &self,
        id: NodeId,
        mac: &Mac,
        channel: u8,
        node_type: NodeType,
        heartbeat_interval_ms: u32,
    ) -> Result<()> {
        let mut peers = self.peers.lock().expect("peer table lock poisoned");

        if let Some(pos) = peers.iter().position(|p| p.node_id == id) {
            let mac_changed = peers[pos].mac != *mac;
            let channel_changed = peers[pos].channel != channel;

            if mac_changed {
                self.radio.remove_peer(&peers[pos].mac)?;
                self.radio.add_peer(mac, channel)?;
            } else if channel_changed {
                self.radio.modify_peer(mac, channel)?;
            }

            let mut updated = peers.remove(pos);
            updated.mac = *mac;
            updated.node_type = node_type;
            updated.channel = channel;
            updated.heartbeat_interval_ms = heartbeat_interval_ms;
            peers.insert(0, updated);
            info!(id, channel, "updated peer");
        } else {
            if peers.len() >= MAX_PEERS {
                // The last position is the least recently touched record.
                let victim = peers.pop().expect("full table has a last entry");
                warn!(victim = victim.node_id, "peer table full, evicting stalest peer");
                if let Err(err) = self.radio.remove_peer(&victim.mac) {
                    warn!(%err, "driver failed to forget evicted peer");
                }
            }

            self.radio.add_peer(mac, channel)?;
            peers.insert(
                0,
                PeerInfo {
                    mac: *mac,
                    node_type,
                    node_id: id,
                    channel,
                    last_seen_ms: 0,
                    paired: true,
                    heartbeat_interval_ms,
                },
            );
            info!(id, channel, "added peer");
        }

        self.save_locked(&peers, channel);
        Ok(())
    }

    /// Removes a peer from the table and from the driver's filter.
    pub fn remove(&self, id: NodeId) -> Result<()> {
        let mut peers = self.peers.lock().expect("peer table lock poisoned");

        let pos = peers
            .iter()
            .position(|p| p.node_id == id)
            .ok_or_else(|| Error::not_found(format!("peer {} is not in the table", id)))?;

        let removed = peers.remove(pos);
        let result = self.radio.remove_peer(&removed.mac);

        self.save_locked(&peers, removed.channel);
        info!(id, "removed peer");
        result
    }

    /// Looks up the hardware address for a node id.
    pub fn find_mac(&self, id: NodeId) -> Option<Mac> {
        self.peers
            .lock()
            .expect("peer table lock poisoned")
            .iter()
            .find(|p| p.node_id == id)
            .map(|p| p.mac)
    }

    /// Snapshot of all peers in current most-recent-first order.
    pub fn get_all(&self) -> Vec<PeerInfo> {
        self.peers.lock().expect("peer table lock poisoned").clone()
    }

    /// Ids of peers whose heartbeats have gone quiet.
    ///
    /// A peer is offline once it has been heard at least once and then
    /// silent for more than 2.5 heartbeat intervals. Peers with a zero
    /// interval opted out of offline detection.
    pub fn get_offline(&self, now_ms: u64) -> Vec<NodeId> {
        self.peers
            .lock()
            .expect("peer table lock poisoned")
            .iter()
            .filter(|p| {
                p.heartbeat_interval_ms > 0 && p.last_seen_ms > 0 && {
                    let timeout =
                        (p.heartbeat_interval_ms as f64 * HEARTBEAT_OFFLINE_MULTIPLIER as f64) as u64;
                    now_ms.saturating_sub(p.last_seen_ms) > timeout
                }
            })
            .map(|p| p.node_id)
            .collect()
    }

    /// Marks a peer as heard now. Does not change the table order.
    pub fn update_last_seen(&self, id: NodeId, now_ms: u64) {
        let mut peers = self.peers.lock().expect("peer table lock poisoned");
        if let Some(peer) = peers.iter_mut().find(|p| p.node_id == id) {
            peer.last_seen_ms = now_ms;
        }
    }

    /// Replaces the table contents from persisted state.
    ///
    /// Returns the persisted radio channel. On `NotFound` the table is left
    /// untouched.
    pub fn load_from_storage(&self) -> Result<u8> {
        let (channel, stored) = self.storage.load()?;
        let mut peers = self.peers.lock().expect("peer table lock poisoned");
        peers.clear();
        peers.extend(stored.iter().map(PeerInfo::from));
        info!(channel, peers = peers.len(), "restored peer table from storage");
        Ok(channel)
    }

    /// Persists the current table alongside `wifi_channel`.
    pub fn persist(&self, wifi_channel: u8) -> Result<()> {
        let peers = self.peers.lock().expect("peer table lock poisoned");
        let snapshot: Vec<PersistentPeer> = peers.iter().map(PersistentPeer::from).collect();
        self.storage.save(wifi_channel, &snapshot, false)
    }

    /// Persists while already holding the table lock; failures are logged
    /// and never roll back the in-memory mutation.
    fn save_locked(&self, peers: &[PeerInfo], wifi_channel: u8) {
        let snapshot: Vec<PersistentPeer> = peers.iter().map(PersistentPeer::from).collect();
        if let Err(err) = self.storage.save(wifi_channel, &snapshot, false) {
            warn!(%err, "failed to persist peer table");
        }
    }
}
