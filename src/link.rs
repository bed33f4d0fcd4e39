//! Runtime facade.
//!
//! [`NowLink`] owns every component: the peer table, the TX engine, the
//! receive pipeline and the protocol managers. The host wires the radio
//! driver's callbacks to [`NowLink::on_frame_received`] and
//! [`NowLink::on_send_result`] and talks to the network through the public
//! API below.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{info, warn};

use crate::core::{
    Error, LinkConfig, Mac, NodeId, NodeIdentity, PayloadType, PeerInfo, Result, RxPacket,
    TxPacket, BROADCAST_MAC, MAX_FRAME_SIZE, WIFI_CHANNEL_MAX, WIFI_CHANNEL_MIN,
};
use crate::managers::{HeartbeatManager, PairingAdvert, PairingManager};
use crate::network::dispatch::{AckSlot, RxPipeline};
use crate::network::notify::{Notifier, NOTIFY_STOP};
use crate::network::router::Router;
use crate::network::{ChannelScanner, ChannelState, Radio, TxEngine, TxHandle};
use crate::peers::PeerTable;
use crate::protocol::{
    AckPayload, AckStatus, CommandType, MessageCodec, MessageHeader, MessageType,
};
use crate::storage::Storage;
use crate::util::Uptime;

/// The peer-to-peer messaging runtime.
///
/// Constructed by [`init`](Self::init) and torn down by
/// [`shutdown`](Self::shutdown); all methods take `&self` so the facade can
/// be shared behind an `Arc`.
pub struct NowLink {
    identity: NodeIdentity,
    radio: Arc<dyn Radio>,
    codec: MessageCodec,
    clock: Uptime,
    channel: Arc<ChannelState>,
    peers: Arc<PeerTable>,
    heartbeat: Arc<HeartbeatManager>,
    pairing: Arc<PairingManager>,
    engine: TxEngine,
    tx: TxHandle,
    pipeline: RxPipeline,
    ack_slot: AckSlot,
    initialized: AtomicBool,
}

impl NowLink {
    /// Brings the runtime up: restores persisted state, registers the
    /// broadcast peer, spawns the three tasks and starts the heartbeat.
    ///
    /// A persisted radio channel overrides `config.wifi_channel`.
    pub async fn init(
        config: LinkConfig,
        radio: Arc<dyn Radio>,
        storage: Storage,
    ) -> Result<NowLink> {
        let app_queue = config
            .app_rx_queue
            .clone()
            .ok_or_else(|| Error::invalid_arg("an application rx queue is required"))?;
        if !(WIFI_CHANNEL_MIN..=WIFI_CHANNEL_MAX).contains(&config.wifi_channel) {
            return Err(Error::invalid_arg(format!(
                "wifi channel {} is out of range",
                config.wifi_channel
            )));
        }
        // A driver that cannot even report its channel is not usable.
        radio
            .get_channel()
            .map_err(|err| Error::invalid_arg(format!("radio is not ready: {}", err)))?;

        let identity = NodeIdentity {
            node_id: config.node_id,
            node_type: config.node_type,
        };
        let codec = MessageCodec::new();
        let clock = Uptime::new();

        let peers = Arc::new(PeerTable::new(radio.clone(), storage));
        let wifi_channel = match peers.load_from_storage() {
            Ok(stored) if (WIFI_CHANNEL_MIN..=WIFI_CHANNEL_MAX).contains(&stored) => stored,
            Ok(_) | Err(Error::NotFound(_)) => config.wifi_channel,
            Err(err) => return Err(err),
        };

        radio.set_channel(wifi_channel)?;
        radio.add_peer(&BROADCAST_MAC, wifi_channel)?;
        for peer in peers.get_all() {
            if let Err(err) = radio.add_peer(&peer.mac, peer.channel) {
                warn!(id = peer.node_id, %err, "failed to re-register stored peer");
            }
        }

        let channel = Arc::new(ChannelState::new(wifi_channel));
        let notifier = Arc::new(Notifier::new());
        let scanner = ChannelScanner::new(radio.clone(), notifier.clone(), codec, identity);
        let engine = TxEngine::start(
            radio.clone(),
            scanner,
            codec,
            notifier,
            clock.clone(),
            config.ack_timeout_ms,
            config.tx_queue_capacity,
        );
        let tx = engine.handle();

        let heartbeat = Arc::new(HeartbeatManager::new(
            tx.clone(),
            peers.clone(),
            codec,
            identity,
            channel.clone(),
            clock.clone(),
        ));
        let pairing = Arc::new(PairingManager::new(
            tx.clone(),
            peers.clone(),
            codec,
            identity,
            channel.clone(),
            clock.clone(),
            PairingAdvert {
                firmware_version: config.firmware_version,
                device_name: config.device_name.clone(),
                heartbeat_interval_ms: config.heartbeat_interval_ms,
            },
        ));

        let router = Arc::new(Router::new(
            codec,
            identity,
            tx.clone(),
            peers.clone(),
            heartbeat.clone(),
            pairing.clone(),
            radio.clone(),
            channel.clone(),
            clock.clone(),
        ));

        let ack_slot: AckSlot = Arc::new(Mutex::new(None));
        let pipeline = RxPipeline::start(
            codec,
            router,
            app_queue,
            ack_slot.clone(),
            clock.clone(),
            config.rx_queue_capacity,
            config.worker_queue_capacity,
        );

        heartbeat.start(config.heartbeat_interval_ms);

        info!(
            node_id = identity.node_id,
            node_type = identity.node_type,
            channel = wifi_channel,
            "nowlink runtime initialized"
        );

        Ok(NowLink {
            identity,
            radio,
            codec,
            clock,
            channel,
            peers,
            heartbeat,
            pairing,
            engine,
            tx,
            pipeline,
            ack_slot,
            initialized: AtomicBool::new(true),
        })
    }

    /// Stops the timers and the three tasks, and forgets every driver
    /// peer. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!("shutting down nowlink runtime");
        self.heartbeat.stop();
        self.pairing.stop();
        self.pipeline.shutdown().await;
        self.engine.shutdown().await;

        for peer in self.peers.get_all() {
            if let Err(err) = self.radio.remove_peer(&peer.mac) {
                warn!(id = peer.node_id, %err, "failed to forget driver peer");
            }
        }
        if let Err(err) = self.radio.remove_peer(&BROADCAST_MAC) {
            warn!(%err, "failed to forget broadcast peer");
        }

        self.ack_slot.lock().expect("ack slot lock poisoned").take();
        info!("nowlink runtime shut down");
        Ok(())
    }

    /// Whether [`init`](Self::init) completed and
    /// [`shutdown`](Self::shutdown) has not run.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Queues an application DATA message to `dest`.
    ///
    /// Returns once the packet is accepted by the transmit queue; delivery
    /// is observed through the peer's own ACK traffic.
    pub async fn send_data(
        &self,
        dest: NodeId,
        payload_type: PayloadType,
        payload: &[u8],
        require_ack: bool,
    ) -> Result<()> {
        self.send_frame(MessageType::Data, dest, payload_type, payload, require_ack)
            .await
    }

    /// Queues a COMMAND message to `dest`.
    pub async fn send_command(
        &self,
        dest: NodeId,
        command_type: CommandType,
        payload: &[u8],
        require_ack: bool,
    ) -> Result<()> {
        self.send_frame(
            MessageType::Command,
            dest,
            command_type as PayloadType,
            payload,
            require_ack,
        )
        .await
    }

    async fn send_frame(
        &self,
        msg_type: MessageType,
        dest: NodeId,
        payload_type: PayloadType,
        payload: &[u8],
        require_ack: bool,
    ) -> Result<()> {
        self.ensure_initialized()?;

        let dest_mac = self
            .peers
            .find_mac(dest)
            .ok_or_else(|| Error::not_found(format!("node {} is not a known peer", dest)))?;

        let header = MessageHeader {
            msg_type,
            sequence_number: 0,
            sender_type: self.identity.node_type,
            sender_node_id: self.identity.node_id,
            payload_type,
            requires_ack: require_ack,
            dest_node_id: dest,
            timestamp_ms: self.clock.now_ms(),
        };
        let frame = self
            .codec
            .encode(&header, payload)
            .ok_or_else(|| Error::invalid_arg("payload exceeds the radio mtu"))?;

        self.tx
            .queue_packet(TxPacket {
                dest_mac,
                data: frame,
                requires_ack: require_ack,
            })
            .await
    }

    /// Acknowledges the last received frame that asked for a logical ACK.
    ///
    /// Fails `InvalidState` when no such frame is pending. The captured
    /// header is consumed either way.
    pub async fn confirm_reception(&self, status: AckStatus) -> Result<()> {
        self.ensure_initialized()?;

        let captured = self
            .ack_slot
            .lock()
            .expect("ack slot lock poisoned")
            .take()
            .ok_or_else(|| Error::invalid_state("no frame is awaiting confirmation"))?;

        let dest = captured.header.sender_node_id;
        let dest_mac = self
            .peers
            .find_mac(dest)
            .ok_or_else(|| Error::not_found(format!("node {} is not a known peer", dest)))?;

        let header = MessageHeader::protocol(
            MessageType::Ack,
            self.identity.node_type,
            self.identity.node_id,
            dest,
            self.clock.now_ms(),
        );
        let elapsed_us = self.clock.now_us().saturating_sub(captured.received_us);
        let payload = AckPayload {
            ack_sequence: captured.header.sequence_number,
            status,
            processing_time_us: elapsed_us.clamp(0, i64::from(u32::MAX)) as u32,
        };

        let mut buf = Vec::with_capacity(AckPayload::WIRE_SIZE);
        payload.write_to(&mut buf);
        let frame = self
            .codec
            .encode(&header, &buf)
            .ok_or_else(|| Error::fail("failed to encode ack frame"))?;

        self.tx
            .queue_packet(TxPacket {
                dest_mac,
                data: frame,
                requires_ack: false,
            })
            .await
    }

    /// Registers a peer explicitly (outside pairing).
    pub fn add_peer(&self, id: NodeId, mac: &Mac, channel: u8, node_type: u8) -> Result<()> {
        self.ensure_initialized()?;
        self.peers.add(id, mac, channel, node_type, 0)
    }

    /// Forgets a peer.
    pub fn remove_peer(&self, id: NodeId) -> Result<()> {
        self.ensure_initialized()?;
        self.peers.remove(id)
    }

    /// Snapshot of the peer table, most recently touched first.
    pub fn get_peers(&self) -> Vec<PeerInfo> {
        self.peers.get_all()
    }

    /// Ids of peers whose heartbeats have gone quiet.
    pub fn get_offline_peers(&self) -> Vec<NodeId> {
        self.peers.get_offline(self.clock.now_ms())
    }

    /// Opens a pairing window for `timeout_ms`.
    pub async fn start_pairing(&self, timeout_ms: u32) -> Result<()> {
        self.ensure_initialized()?;
        self.pairing.start(timeout_ms).await
    }

    /// Whether a pairing window is currently open.
    pub fn is_pairing_active(&self) -> bool {
        self.pairing.is_active()
    }

    /// Records the battery level advertised in heartbeats.
    pub fn set_battery_mv(&self, battery_mv: u16) {
        self.heartbeat.set_battery_mv(battery_mv);
    }

    /// The radio channel the runtime currently operates on.
    pub fn wifi_channel(&self) -> u8 {
        self.channel.get()
    }

    /// Bridge for the driver's receive callback.
    ///
    /// Copies the frame into the dispatcher queue; never blocks.
    pub fn on_frame_received(&self, src_mac: &Mac, data: &[u8], rssi: i8, timestamp_us: i64) {
        if !self.is_initialized() || data.is_empty() || data.len() > MAX_FRAME_SIZE {
            return;
        }
        self.heartbeat.note_rssi(rssi);
        self.pipeline.submit(RxPacket {
            src_mac: *src_mac,
            data: Bytes::copy_from_slice(data),
            rssi,
            timestamp_us,
        });
    }

    /// Bridge for the driver's send-completion callback.
    pub fn on_send_result(&self, _dest_mac: &Mac, ok: bool) {
        if !self.is_initialized() {
            return;
        }
        if !ok {
            self.tx.notify_physical_fail();
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::invalid_state("runtime is not initialized"))
        }
    }
}

impl Drop for NowLink {
    fn drop(&mut self) {
        // Best-effort teardown when the host forgot to call shutdown: stop
        // the timers and ask the tasks to exit without awaiting them.
        if self.initialized.swap(false, Ordering::SeqCst) {
            self.heartbeat.stop();
            self.pairing.stop();
            self.tx.notifier().post(NOTIFY_STOP);
            self.pipeline.request_stop();
        }
    }
}
