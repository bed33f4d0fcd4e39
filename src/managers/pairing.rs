//! Pairing manager.
//!
//! A leaf opens a pairing window, broadcasts PAIR_REQUEST immediately and
//! then every five seconds until the hub answers or the window closes. The
//! hub, with its own window open, registers the requester and replies
//! accepted; requests from another hub are refused.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{
    types::{reserved_ids, reserved_types},
    Error, Mac, NodeIdentity, Result, TxPacket, BROADCAST_MAC, PAIRING_RESEND_INTERVAL_MS,
    WIFI_CHANNEL_MAX, WIFI_CHANNEL_MIN,
};
use crate::network::tx::TxHandle;
use crate::network::ChannelState;
use crate::peers::PeerTable;
use crate::protocol::{
    MessageCodec, MessageHeader, MessageType, PairRequestPayload, PairResponsePayload, PairStatus,
};
use crate::util::Uptime;

/// Identity details a leaf advertises when asking to pair.
#[derive(Debug, Clone, Default)]
pub struct PairingAdvert {
    /// Firmware version (major, minor, patch)
    pub firmware_version: [u8; 3],
    /// Human-readable device name
    pub device_name: String,
    /// Heartbeat interval the node intends to use
    pub heartbeat_interval_ms: u32,
}

#[derive(Default)]
struct PairingState {
    active: bool,
    timeout_task: Option<JoinHandle<()>>,
    periodic_task: Option<JoinHandle<()>>,
}

impl PairingState {
    fn abort_timers(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        if let Some(task) = self.periodic_task.take() {
            task.abort();
        }
    }
}

/// Runs the request/accept/reject pairing dance.
pub struct PairingManager {
    tx: TxHandle,
    peers: Arc<PeerTable>,
    codec: MessageCodec,
    identity: NodeIdentity,
    channel: Arc<ChannelState>,
    clock: Uptime,
    advert: PairingAdvert,
    state: Mutex<PairingState>,
}

impl PairingManager {
    /// Creates a pairing manager; no window is open until
    /// [`start`](Self::start).
    pub fn new(
        tx: TxHandle,
        peers: Arc<PeerTable>,
        codec: MessageCodec,
        identity: NodeIdentity,
        channel: Arc<ChannelState>,
        clock: Uptime,
        advert: PairingAdvert,
    ) -> Self {
        PairingManager {
            tx,
            peers,
            codec,
            identity,
            channel,
            clock,
            advert,
            state: Mutex::new(PairingState::default()),
        }
    }

    /// Whether a pairing window is currently open.
    pub fn is_active(&self) -> bool {
        self.state.lock().expect("pairing state lock poisoned").active
    }

    /// Opens a pairing window for `timeout_ms`.
    ///
    /// Leaves additionally broadcast a request immediately and keep
    /// re-broadcasting every [`PAIRING_RESEND_INTERVAL_MS`] until the
    /// window closes.
    pub async fn start(self: &Arc<Self>, timeout_ms: u32) -> Result<()> {
        {
            let mut state = self.state.lock().expect("pairing state lock poisoned");
            if state.active {
                return Err(Error::invalid_state("pairing is already active"));
            }
            state.active = true;

            let manager = Arc::clone(self);
            state.timeout_task = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(u64::from(timeout_ms))).await;
                manager.on_timeout();
            }));

            if !self.identity.is_hub() {
                let manager = Arc::clone(self);
                let period = Duration::from_millis(PAIRING_RESEND_INTERVAL_MS);
                state.periodic_task = Some(tokio::spawn(async move {
                    let mut ticks =
                        tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                    loop {
                        ticks.tick().await;
                        manager.send_pair_request().await;
                    }
                }));
            }
        }

        info!(timeout_ms, "pairing window opened");
        if !self.identity.is_hub() {
            self.send_pair_request().await;
        }
        Ok(())
    }

    /// Closes the window and stops both timers.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("pairing state lock poisoned");
        state.active = false;
        state.abort_timers();
    }

    fn on_timeout(&self) {
        let mut state = self.state.lock().expect("pairing state lock poisoned");
        if state.active {
            info!("pairing window timed out");
        }
        state.active = false;
        if let Some(task) = state.periodic_task.take() {
            task.abort();
        }
        state.timeout_task = None;
    }

    /// Builds and queues one broadcast PAIR_REQUEST.
    async fn send_pair_request(&self) {
        let header = MessageHeader::protocol(
            MessageType::PairRequest,
            self.identity.node_type,
            self.identity.node_id,
            reserved_ids::HUB,
            self.clock.now_ms(),
        );
        let payload = PairRequestPayload::new(
            self.advert.firmware_version,
            self.clock.now_ms(),
            &self.advert.device_name,
            self.advert.heartbeat_interval_ms,
        );

        let mut buf = Vec::with_capacity(PairRequestPayload::WIRE_SIZE);
        payload.write_to(&mut buf);
        let Some(frame) = self.codec.encode(&header, &buf) else {
            return;
        };

        if let Err(err) = self
            .tx
            .queue_packet(TxPacket {
                dest_mac: BROADCAST_MAC,
                data: frame,
                requires_ack: false,
            })
            .await
        {
            warn!(%err, "failed to queue pair request");
        }
    }

    /// Hub side: a node asked to pair.
    pub async fn handle_request(&self, header: &MessageHeader, src_mac: Mac, payload: &[u8]) {
        if !self.is_active() || !self.identity.is_hub() {
            debug!(from = header.sender_node_id, "pair request outside an open window, dropped");
            return;
        }

        let Some(request) = PairRequestPayload::read_from(payload) else {
            return;
        };

        let channel = self.channel.get();
        let status = if header.sender_type == reserved_types::HUB {
            // Two hubs must not pair with each other.
            warn!(from = header.sender_node_id, "refusing pair request from another hub");
            PairStatus::RejectedNotAllowed
        } else {
            info!(
                from = header.sender_node_id,
                name = request.device_name(),
                "pair request accepted"
            );
            if let Err(err) = self.peers.add(
                header.sender_node_id,
                &src_mac,
                channel,
                header.sender_type,
                request.heartbeat_interval_ms,
            ) {
                warn!(%err, "failed to register pairing peer");
            }
            PairStatus::Accepted
        };

        let response_header = MessageHeader::protocol(
            MessageType::PairResponse,
            self.identity.node_type,
            self.identity.node_id,
            header.sender_node_id,
            self.clock.now_ms(),
        );
        let response = PairResponsePayload {
            status,
            assigned_id: header.sender_node_id,
            heartbeat_interval_ms: request.heartbeat_interval_ms,
            report_interval_ms: 0,
            wifi_channel: channel,
        };

        let mut buf = Vec::with_capacity(PairResponsePayload::WIRE_SIZE);
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
            warn!(%err, "failed to queue pair response");
        }
    }

    /// Leaf side: the hub answered our request.
    pub async fn handle_response(&self, header: &MessageHeader, src_mac: Mac, payload: &[u8]) {
        if !self.is_active() || self.identity.is_hub() {
            return;
        }

        let Some(response) = PairResponsePayload::read_from(payload) else {
            return;
        };

        match response.status {
            PairStatus::Accepted => {
                let channel = if (WIFI_CHANNEL_MIN..=WIFI_CHANNEL_MAX)
                    .contains(&response.wifi_channel)
                {
                    response.wifi_channel
                } else {
                    self.channel.get()
                };

                info!(hub = header.sender_node_id, channel, "pairing accepted by hub");
                if let Err(err) = self.peers.add(
                    header.sender_node_id,
                    &src_mac,
                    channel,
                    header.sender_type,
                    0,
                ) {
                    warn!(%err, "failed to register hub after pairing");
                }

                let mut state = self.state.lock().expect("pairing state lock poisoned");
                state.active = false;
                state.abort_timers();
            }
            PairStatus::RejectedNotAllowed => {
                // Stay active: the window timeout or a later response
                // decides the outcome.
                warn!(hub = header.sender_node_id, "pairing rejected");
            }
        }
    }
}
