//! Channel scanner.
//!
//! When the link goes quiet the TX engine sweeps all thirteen radio
//! channels, broadcasting a probe on each and listening briefly for any
//! sign of the hub. The sweep starts at the current channel so an
//! unchanged hub is found on the first hop.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::{
    NodeIdentity, types::reserved_ids, BROADCAST_MAC, MAX_SCAN_TIME_MS, SCAN_CHANNEL_ATTEMPTS,
    SCAN_CHANNEL_TIMEOUT_MS, WIFI_CHANNEL_COUNT, WIFI_CHANNEL_MAX, WIFI_CHANNEL_MIN,
};
use crate::protocol::{MessageCodec, MessageHeader, MessageType};

use super::notify::{Notifier, NOTIFY_HUB_FOUND, NOTIFY_LINK_ALIVE};
use super::radio::Radio;

/// Outcome of a channel sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Channel the hub answered on; the start channel when nothing did
    pub channel: u8,
    /// Whether any hub response was heard
    pub hub_found: bool,
}

/// Sweeps radio channels probing for the hub.
pub struct ChannelScanner {
    radio: Arc<dyn Radio>,
    notifier: Arc<Notifier>,
    codec: MessageCodec,
    identity: NodeIdentity,
}

impl ChannelScanner {
    /// Creates a scanner probing as the given local identity.
    pub fn new(
        radio: Arc<dyn Radio>,
        notifier: Arc<Notifier>,
        codec: MessageCodec,
        identity: NodeIdentity,
    ) -> Self {
        ChannelScanner {
            radio,
            notifier,
            codec,
            identity,
        }
    }

    /// Sweeps channels starting at `start_channel`.
    ///
    /// Visits each channel once in ring order, probing up to
    /// [`SCAN_CHANNEL_ATTEMPTS`] times and listening
    /// [`SCAN_CHANNEL_TIMEOUT_MS`] after each probe. The whole sweep is
    /// bounded by [`MAX_SCAN_TIME_MS`]. A hub answering a probe surfaces as
    /// a HUB_FOUND or LINK_ALIVE notification posted by the protocol
    /// worker.
    pub async fn scan(&self, start_channel: u8) -> ScanResult {
        let start = if (WIFI_CHANNEL_MIN..=WIFI_CHANNEL_MAX).contains(&start_channel) {
            start_channel
        } else {
            WIFI_CHANNEL_MIN
        };

        info!(start, "scanning channels for the hub");
        let deadline = Instant::now() + Duration::from_millis(MAX_SCAN_TIME_MS);

        let header = MessageHeader::protocol(
            MessageType::ChannelScanProbe,
            self.identity.node_type,
            self.identity.node_id,
            reserved_ids::HUB,
            0,
        );
        let probe = match self.codec.encode(&header, &[]) {
            Some(frame) => frame,
            None => {
                // A bare header always fits one frame.
                return ScanResult { channel: start, hub_found: false };
            }
        };

        for offset in 0..WIFI_CHANNEL_COUNT {
            if Instant::now() >= deadline {
                warn!("channel sweep exceeded its time budget, aborting");
                break;
            }

            let channel = ((start - 1 + offset) % WIFI_CHANNEL_COUNT) + 1;
            if let Err(err) = self.radio.set_channel(channel) {
                warn!(channel, %err, "failed to tune channel, skipping");
                continue;
            }

            for _ in 0..SCAN_CHANNEL_ATTEMPTS {
                if let Err(err) = self.radio.send_one(&BROADCAST_MAC, &probe) {
                    debug!(channel, %err, "probe send failed");
                }

                let bits = self
                    .notifier
                    .wait(
                        NOTIFY_HUB_FOUND | NOTIFY_LINK_ALIVE,
                        Some(Duration::from_millis(SCAN_CHANNEL_TIMEOUT_MS)),
                    )
                    .await;
                if bits & (NOTIFY_HUB_FOUND | NOTIFY_LINK_ALIVE) != 0 {
                    info!(channel, "hub found");
                    return ScanResult { channel, hub_found: true };
                }
            }
        }

        debug!("sweep finished without a hub response");
        ScanResult { channel: start, hub_found: false }
    }
}
