//! Heartbeat manager.
//!
//! Leaves emit a periodic HEARTBEAT carrying uptime, battery level and the
//! last observed RSSI; the hub answers each one with HEARTBEAT_RESPONSE,
//! stamps the peer as seen, and advertises its current channel so drifted
//! leaves can follow.

use std::sync::atomic::{AtomicI8, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{
    types::reserved_ids, Mac, NodeIdentity, TxPacket, BROADCAST_MAC, WIFI_CHANNEL_MAX,
    WIFI_CHANNEL_MIN,
};
use crate::network::tx::TxHandle;
use crate::network::ChannelState;
use crate::peers::PeerTable;
use crate::protocol::{
    HeartbeatPayload, HeartbeatResponsePayload, MessageCodec, MessageHeader, MessageType,
};
use crate::util::Uptime;

/// Emits keep-alives (leaf) and answers them (hub).
pub struct HeartbeatManager {
    tx: TxHandle,
    peers: Arc<PeerTable>,
    codec: MessageCodec,
    identity: NodeIdentity,
    channel: Arc<ChannelState>,
    clock: Uptime,
    battery_mv: AtomicU16,
    last_rssi: AtomicI8,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatManager {
    /// Creates a heartbeat manager; no timer runs until [`start`](Self::start).
    pub fn new(
        tx: TxHandle,
        peers: Arc<PeerTable>,
        codec: MessageCodec,
        identity: NodeIdentity,
        channel: Arc<ChannelState>,
        clock: Uptime,
    ) -> Self {
        HeartbeatManager {
            tx,
            peers,
            codec,
            identity,
            channel,
            clock,
            battery_mv: AtomicU16::new(0),
            last_rssi: AtomicI8::new(0),
            timer: Mutex::new(None),
        }
    }

    /// Starts the periodic keep-alive. Hubs and nodes with a zero interval
    /// send nothing.
    pub fn start(self: &Arc<Self>, interval_ms: u32) {
        if self.identity.is_hub() || interval_ms == 0 {
            debug!("heartbeat timer disabled");
            return;
        }

        let manager = Arc::clone(self);
        let period = Duration::from_millis(u64::from(interval_ms));
        let task = tokio::spawn(async move {
            let mut ticks =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticks.tick().await;
                manager.send_heartbeat().await;
            }
        });

        let mut timer = self.timer.lock().expect("heartbeat timer lock poisoned");
        if let Some(previous) = timer.replace(task) {
            previous.abort();
        }
        info!(interval_ms, "heartbeat timer started");
    }

    /// Stops the periodic keep-alive.
    pub fn stop(&self) {
        if let Some(task) = self.timer.lock().expect("heartbeat timer lock poisoned").take() {
            task.abort();
        }
    }

    /// Records the battery level advertised in subsequent heartbeats.
    pub fn set_battery_mv(&self, battery_mv: u16) {
        self.battery_mv.store(battery_mv, Ordering::SeqCst);
    }

    /// Records the signal strength of the latest received frame.
    pub fn note_rssi(&self, rssi: i8) {
        self.last_rssi.store(rssi, Ordering::SeqCst);
    }

    /// Builds and queues one HEARTBEAT frame.
    ///
    /// Unicast to the hub when its mac is known, broadcast otherwise (a
    /// freshly booted leaf may not have met the hub yet).
    pub async fn send_heartbeat(&self) {
        let dest_mac: Mac = self
            .peers
            .find_mac(reserved_ids::HUB)
            .unwrap_or(BROADCAST_MAC);

        let now_ms = self.clock.now_ms();
        let header = MessageHeader::protocol(
            MessageType::Heartbeat,
            self.identity.node_type,
            self.identity.node_id,
            reserved_ids::HUB,
            now_ms,
        );
        let payload = HeartbeatPayload {
            battery_mv: self.battery_mv.load(Ordering::SeqCst),
            rssi: self.last_rssi.load(Ordering::SeqCst),
            uptime_ms: now_ms,
        };

        let mut buf = Vec::with_capacity(HeartbeatPayload::WIRE_SIZE);
        payload.write_to(&mut buf);
        let Some(frame) = self.codec.encode(&header, &buf) else {
            return;
        };

        if let Err(err) = self
            .tx
            .queue_packet(TxPacket {
                dest_mac,
                data: frame,
                requires_ack: false,
            })
            .await
        {
            warn!(%err, "failed to queue heartbeat");
        }
    }

    /// Hub side: a leaf checked in. Stamp it and answer with our channel.
    pub async fn handle_heartbeat(
        &self,
        header: &MessageHeader,
        src_mac: Mac,
        payload: &HeartbeatPayload,
    ) {
        let now_ms = self.clock.now_ms();
        self.peers.update_last_seen(header.sender_node_id, now_ms);
        debug!(
            from = header.sender_node_id,
            uptime_ms = payload.uptime_ms,
            battery_mv = payload.battery_mv,
            "heartbeat received"
        );

        let response_header = MessageHeader::protocol(
            MessageType::HeartbeatResponse,
            self.identity.node_type,
            self.identity.node_id,
            header.sender_node_id,
            now_ms,
        );
        let response = HeartbeatResponsePayload {
            server_time_ms: now_ms,
            wifi_channel: self.channel.get(),
        };

        let mut buf = Vec::with_capacity(HeartbeatResponsePayload::WIRE_SIZE);
        response.write_to(&mut buf);
        let Some(frame) = self.codec.encode(&response_header, &buf) else {
            return;
        };

        if let Err(err) = self
            .tx
            .queue_packet(TxPacket {
                dest_mac: src_mac,
                data: frame,
                requires_ack: false,
            })
            .await
        {
            warn!(%err, "failed to queue heartbeat response");
        }
    }

    /// Leaf side: the hub answered. Proof of life, and possibly a new
    /// channel to follow.
    pub async fn handle_response(
        &self,
        header: &MessageHeader,
        response: &HeartbeatResponsePayload,
    ) {
        debug!(
            hub = header.sender_node_id,
            channel = response.wifi_channel,
            "heartbeat response received"
        );

        self.tx.notify_link_alive();

        // Channel 0 means the hub had no advice (it may itself be scanning).
        let channel = response.wifi_channel;
        if !(WIFI_CHANNEL_MIN..=WIFI_CHANNEL_MAX).contains(&channel) {
            return;
        }

        if let Some(mac) = self.peers.find_mac(header.sender_node_id) {
            if let Err(err) = self.peers.add(
                header.sender_node_id,
                &mac,
                channel,
                header.sender_type,
                0,
            ) {
                warn!(%err, "failed to update hub channel in peer table");
            }
        }
    }
}
