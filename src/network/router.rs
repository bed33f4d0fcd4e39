//! Protocol frame router.
//!
//! The worker stage of the receive path: every validated protocol frame
//! lands here and is dispatched to the manager that owns its message type.
//! Any valid frame is also proof the link works, so the TX engine's
//! failure counters are forgiven before dispatching.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::{NodeIdentity, RxPacket, TxPacket, WIFI_CHANNEL_MAX, WIFI_CHANNEL_MIN};
use crate::managers::{HeartbeatManager, PairingManager};
use crate::peers::PeerTable;
use crate::protocol::{
    HeartbeatPayload, HeartbeatResponsePayload, MessageCodec, MessageHeader, MessageType,
};
use crate::util::Uptime;

use super::radio::Radio;
use super::tx::TxHandle;
use super::ChannelState;

/// Routes protocol frames to the pairing/heartbeat managers and the TX
/// engine, and keeps the channel state in sync with what the hub reports.
pub struct Router {
    codec: MessageCodec,
    identity: NodeIdentity,
    tx: TxHandle,
    peers: Arc<PeerTable>,
    heartbeat: Arc<HeartbeatManager>,
    pairing: Arc<PairingManager>,
    radio: Arc<dyn Radio>,
    channel: Arc<ChannelState>,
    clock: Uptime,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        codec: MessageCodec,
        identity: NodeIdentity,
        tx: TxHandle,
        peers: Arc<PeerTable>,
        heartbeat: Arc<HeartbeatManager>,
        pairing: Arc<PairingManager>,
        radio: Arc<dyn Radio>,
        channel: Arc<ChannelState>,
        clock: Uptime,
    ) -> Self {
        Router {
            codec,
            identity,
            tx,
            peers,
            heartbeat,
            pairing,
            radio,
            channel,
            clock,
        }
    }

    /// Dispatches one validated protocol frame.
    pub async fn handle_frame(&self, packet: &RxPacket) {
        let Some(header) = self.codec.decode_header(&packet.data) else {
            return;
        };

        // Whatever it says, a valid frame proves somebody is out there.
        self.tx.notify_link_alive();

        let payload = self.codec.payload_of(&packet.data);
        match header.msg_type {
            MessageType::PairRequest => {
                self.pairing
                    .handle_request(&header, packet.src_mac, payload)
                    .await;
            }

            MessageType::PairResponse => {
                self.pairing
                    .handle_response(&header, packet.src_mac, payload)
                    .await;
            }

            MessageType::Heartbeat => match HeartbeatPayload::read_from(payload) {
                Some(heartbeat) => {
                    self.heartbeat
                        .handle_heartbeat(&header, packet.src_mac, &heartbeat)
                        .await;
                }
                None => debug!("truncated heartbeat dropped"),
            },

            MessageType::HeartbeatResponse => {
                match HeartbeatResponsePayload::read_from(payload) {
                    Some(response) => {
                        self.heartbeat.handle_response(&header, &response).await;
                        self.apply_channel_update(response.wifi_channel);
                    }
                    None => debug!("truncated heartbeat response dropped"),
                }
            }

            MessageType::Ack => {
                self.tx.notify_logical_ack();
            }

            MessageType::ChannelScanProbe => {
                self.handle_scan_probe(&header, packet.src_mac).await;
            }

            MessageType::ChannelScanResponse => {
                // Whoever answers a probe is the hub on this channel.
                let channel = self.radio.get_channel().unwrap_or_else(|_| self.channel.get());
                if let Err(err) = self.peers.add(
                    header.sender_node_id,
                    &packet.src_mac,
                    channel,
                    header.sender_type,
                    0,
                ) {
                    warn!(%err, "failed to register scan responder");
                }
                self.tx.notify_hub_found();
                self.apply_channel_update(channel);
            }

            // Application frames never reach the worker stage.
            MessageType::Data | MessageType::Command => {}
        }
    }

    /// Hubs answer scan probes so lost leaves can find the channel.
    async fn handle_scan_probe(&self, header: &MessageHeader, src_mac: crate::core::Mac) {
        if !self.identity.is_hub() {
            return;
        }

        debug!(from = header.sender_node_id, "answering channel scan probe");
        let response = MessageHeader::protocol(
            MessageType::ChannelScanResponse,
            self.identity.node_type,
            self.identity.node_id,
            header.sender_node_id,
            self.clock.now_ms(),
        );
        let Some(frame) = self.codec.encode(&response, &[]) else {
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
            warn!(%err, "failed to queue scan response");
        }
    }

    /// Follows an observed hub channel: updates the broadcast peer in the
    /// driver and persists, once per distinct channel.
    fn apply_channel_update(&self, channel: u8) {
        if !(WIFI_CHANNEL_MIN..=WIFI_CHANNEL_MAX).contains(&channel) {
            return;
        }
        if !self.channel.replace_if_changed(channel) {
            return;
        }

        debug!(channel, "following hub to a new channel");
        if let Err(err) = self.radio.modify_peer(&crate::core::BROADCAST_MAC, channel) {
            warn!(%err, "failed to retune broadcast peer");
        }
        if let Err(err) = self.peers.persist(channel) {
            warn!(%err, "failed to persist channel change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{types::reserved_ids, BROADCAST_MAC};
    use crate::managers::PairingAdvert;
    use crate::network::notify::{NOTIFY_HUB_FOUND, NOTIFY_LINK_ALIVE, NOTIFY_LOGICAL_ACK};
    use crate::network::radio::mock::{MockRadio, RadioCall};
    use crate::storage::Storage;
    use tokio::sync::mpsc;

    struct Fixture {
        router: Router,
        radio: Arc<MockRadio>,
        peers: Arc<PeerTable>,
        pairing: Arc<PairingManager>,
        tx_rx: mpsc::Receiver<TxPacket>,
        tx: TxHandle,
    }

    fn fixture(identity: NodeIdentity, channel: u8) -> Fixture {
        let radio = Arc::new(MockRadio::new());
        let (tx, tx_rx) = TxHandle::test_pair(16);
        let peers = Arc::new(PeerTable::new(radio.clone(), Storage::ephemeral()));
        let codec = MessageCodec::new();
        let channel_state = Arc::new(ChannelState::new(channel));
        let clock = Uptime::new();

        let heartbeat = Arc::new(HeartbeatManager::new(
            tx.clone(),
            peers.clone(),
            codec,
            identity,
            channel_state.clone(),
            clock.clone(),
        ));
        let pairing = Arc::new(PairingManager::new(
            tx.clone(),
            peers.clone(),
            codec,
            identity,
            channel_state.clone(),
            clock.clone(),
            PairingAdvert::default(),
        ));

        let router = Router::new(
            codec,
            identity,
            tx.clone(),
            peers.clone(),
            heartbeat,
            pairing.clone(),
            radio.clone(),
            channel_state,
            clock,
        );

        Fixture {
            router,
            radio,
            peers,
            pairing,
            tx_rx,
            tx,
        }
    }

    fn frame(header: MessageHeader, payload: &[u8], src_mac: [u8; 6]) -> RxPacket {
        let data = MessageCodec::new().encode(&header, payload).unwrap();
        RxPacket {
            src_mac,
            data: data.into(),
            rssi: -50,
            timestamp_us: 0,
        }
    }

    fn hub() -> NodeIdentity {
        NodeIdentity { node_id: 1, node_type: 1 }
    }

    fn leaf() -> NodeIdentity {
        NodeIdentity { node_id: 10, node_type: 2 }
    }

    #[tokio::test]
    async fn test_any_protocol_frame_feeds_link_alive() {
        let mut fx = fixture(leaf(), 1);
        let header = MessageHeader::protocol(MessageType::Ack, 1, 1, 10, 0);
        let mut payload = Vec::new();
        crate::protocol::AckPayload {
            ack_sequence: 1,
            status: crate::protocol::AckStatus::Ok,
            processing_time_us: 0,
        }
        .write_to(&mut payload);

        fx.router.handle_frame(&frame(header, &payload, [9; 6])).await;

        let bits = fx.tx.notifier().peek();
        assert_ne!(bits & NOTIFY_LINK_ALIVE, 0);
        assert_ne!(bits & NOTIFY_LOGICAL_ACK, 0);
        assert!(fx.tx_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hub_answers_scan_probe() {
        let mut fx = fixture(hub(), 1);
        let header = MessageHeader::protocol(MessageType::ChannelScanProbe, 2, 10, 1, 0);

        fx.router.handle_frame(&frame(header, &[], [0xAB; 6])).await;

        let packet = fx.tx_rx.recv().await.unwrap();
        assert_eq!(packet.dest_mac, [0xAB; 6]);
        let codec = MessageCodec::new();
        let response = codec.decode_header(&packet.data).unwrap();
        assert_eq!(response.msg_type, MessageType::ChannelScanResponse);
        assert_eq!(response.dest_node_id, 10);
        assert!(!packet.requires_ack);
    }

    #[tokio::test]
    async fn test_leaf_ignores_scan_probe() {
        let mut fx = fixture(leaf(), 1);
        let header = MessageHeader::protocol(MessageType::ChannelScanProbe, 2, 11, 1, 0);

        fx.router.handle_frame(&frame(header, &[], [0xAB; 6])).await;
        assert!(fx.tx_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scan_response_registers_hub_and_notifies() {
        let fx = fixture(leaf(), 1);
        fx.radio.set_channel(6).unwrap();
        let header = MessageHeader::protocol(MessageType::ChannelScanResponse, 1, 1, 10, 0);

        fx.router.handle_frame(&frame(header, &[], [0xDD; 6])).await;

        let registered = fx.peers.get_all();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].node_id, 1);
        assert_eq!(registered[0].channel, 6);
        assert_ne!(fx.tx.notifier().peek() & NOTIFY_HUB_FOUND, 0);

        // The broadcast peer followed the discovered channel.
        assert!(fx
            .radio
            .calls()
            .contains(&RadioCall::ModifyPeer { mac: BROADCAST_MAC, channel: 6 }));
    }

    #[tokio::test]
    async fn test_heartbeat_response_updates_channel_once_per_change() {
        let fx = fixture(leaf(), 1);
        let hub_mac = [0xDD; 6];
        fx.peers.add(reserved_ids::HUB, &hub_mac, 1, 1, 0).unwrap();

        let response = HeartbeatResponsePayload { server_time_ms: 0, wifi_channel: 9 };
        let mut payload = Vec::new();
        response.write_to(&mut payload);
        let header = MessageHeader::protocol(MessageType::HeartbeatResponse, 1, 1, 10, 0);

        // The same channel observed twice: one driver update, one persist.
        fx.router
            .handle_frame(&frame(header, &payload, hub_mac))
            .await;
        fx.router
            .handle_frame(&frame(header, &payload, hub_mac))
            .await;

        let broadcast_updates = fx
            .radio
            .calls()
            .into_iter()
            .filter(|c| *c == RadioCall::ModifyPeer { mac: BROADCAST_MAC, channel: 9 })
            .count();
        assert_eq!(broadcast_updates, 1);
    }

    #[tokio::test]
    async fn test_truncated_heartbeat_is_dropped_silently() {
        let mut fx = fixture(hub(), 1);
        fx.peers.add(10, &[0xAB; 6], 1, 2, 5000).unwrap();

        let header = MessageHeader::protocol(MessageType::Heartbeat, 2, 10, 1, 0);
        // Payload shorter than a heartbeat body.
        fx.router
            .handle_frame(&frame(header, &[1, 2, 3], [0xAB; 6]))
            .await;

        // No response generated, peer not stamped.
        assert!(fx.tx_rx.try_recv().is_err());
        assert_eq!(fx.peers.get_all()[0].last_seen_ms, 0);
    }

    #[tokio::test]
    async fn test_pair_request_routed_to_pairing_manager() {
        let mut fx = fixture(hub(), 1);
        fx.pairing.start(60_000).await.unwrap();

        let header = MessageHeader::protocol(MessageType::PairRequest, 2, 10, 1, 0);
        let payload_struct =
            crate::protocol::PairRequestPayload::new([1, 0, 0], 0, "leaf", 5000);
        let mut payload = Vec::new();
        payload_struct.write_to(&mut payload);

        fx.router
            .handle_frame(&frame(header, &payload, [0xAB; 6]))
            .await;

        assert_eq!(fx.peers.get_all().len(), 1);
        let response = fx.tx_rx.recv().await.unwrap();
        let codec = MessageCodec::new();
        assert_eq!(
            codec.decode_header(&response.data).unwrap().msg_type,
            MessageType::PairResponse
        );
        fx.pairing.stop();
    }
}
