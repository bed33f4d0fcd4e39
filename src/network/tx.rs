//! Transmit engine.
//!
//! One task owns the transmit queue and drives the state machine: it
//! assigns sequence numbers at send time, hands frames to the radio,
//! arms the logical-ACK timer, retransmits on timeout and falls back to a
//! channel scan when the link looks dead. Producers interact with it only
//! through [`TxHandle`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{
    Error, PendingAck, Result, TxPacket, DEFAULT_WIFI_CHANNEL, MAX_LOGICAL_RETRIES,
    MIN_FRAME_SIZE, TX_QUEUE_TIMEOUT_MS,
};
use crate::protocol::{MessageCodec, TxState, TxStateMachine};
use crate::util::Uptime;

use super::notify::{
    Notifier, NOTIFY_ACK_TIMEOUT, NOTIFY_ALL, NOTIFY_DATA, NOTIFY_HUB_FOUND, NOTIFY_LINK_ALIVE,
    NOTIFY_LOGICAL_ACK, NOTIFY_PHYSICAL_FAIL, NOTIFY_STOP,
};
use super::radio::Radio;
use super::scanner::ChannelScanner;

/// Grace period for the engine task to exit after a STOP.
const SHUTDOWN_WAIT_MS: u64 = 200;

/// Producer-side handle to the TX engine.
///
/// Cheap to clone; the managers, the router and the facade all hold one.
#[derive(Clone)]
pub struct TxHandle {
    queue: mpsc::Sender<TxPacket>,
    notifier: Arc<Notifier>,
}

impl TxHandle {
    /// Submits a packet for transmission.
    ///
    /// Fails with `Timeout` when the queue stays full for
    /// [`TX_QUEUE_TIMEOUT_MS`].
    pub async fn queue_packet(&self, packet: TxPacket) -> Result<()> {
        self.queue
            .send_timeout(packet, Duration::from_millis(TX_QUEUE_TIMEOUT_MS))
            .await
            .map_err(|_| Error::timeout("transmit queue is full"))?;
        self.notifier.post(NOTIFY_DATA);
        Ok(())
    }

    /// The driver reported a failed physical send.
    pub fn notify_physical_fail(&self) {
        self.notifier.post(NOTIFY_PHYSICAL_FAIL);
    }

    /// A valid frame was received; the link works.
    pub fn notify_link_alive(&self) {
        self.notifier.post(NOTIFY_LINK_ALIVE);
    }

    /// The logical ACK for the in-flight packet arrived.
    pub fn notify_logical_ack(&self) {
        self.notifier.post(NOTIFY_LOGICAL_ACK);
    }

    /// A channel-scan response identified the hub.
    pub fn notify_hub_found(&self) {
        self.notifier.post(NOTIFY_HUB_FOUND);
    }

    /// The shared notifier, for wiring up the scanner.
    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    /// Builds a detached handle plus the consumer end of its queue, so
    /// manager tests can inspect what would have been transmitted.
    #[cfg(test)]
    pub(crate) fn test_pair(capacity: usize) -> (TxHandle, mpsc::Receiver<TxPacket>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = TxHandle {
            queue: tx,
            notifier: Arc::new(Notifier::new()),
        };
        (handle, rx)
    }
}

/// One-shot timer posting [`NOTIFY_ACK_TIMEOUT`] when it expires.
struct AckTimer {
    notifier: Arc<Notifier>,
    handle: Option<JoinHandle<()>>,
}

impl AckTimer {
    fn new(notifier: Arc<Notifier>) -> Self {
        AckTimer { notifier, handle: None }
    }

    /// (Re)arms the timer; a previously armed expiry is cancelled.
    fn arm(&mut self, timeout: Duration) {
        self.stop();
        let notifier = self.notifier.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            notifier.post(NOTIFY_ACK_TIMEOUT);
        }));
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// The transmit engine: owns the queue, the state machine and one task.
pub struct TxEngine {
    handle: TxHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TxEngine {
    /// Spawns the engine task.
    pub fn start(
        radio: Arc<dyn Radio>,
        scanner: ChannelScanner,
        codec: MessageCodec,
        notifier: Arc<Notifier>,
        clock: Uptime,
        ack_timeout_ms: u32,
        queue_capacity: usize,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
        let handle = TxHandle {
            queue: queue_tx,
            notifier: notifier.clone(),
        };

        let mut task = EngineTask {
            radio,
            scanner,
            codec,
            queue: queue_rx,
            ack_timer: AckTimer::new(notifier.clone()),
            notifier,
            fsm: TxStateMachine::new(),
            sequence: 0,
            ack_timeout: Duration::from_millis(u64::from(ack_timeout_ms)),
            clock,
        };
        let join = tokio::spawn(async move {
            info!("tx engine task started");
            task.run().await;
            info!("tx engine task exiting");
        });

        TxEngine {
            handle,
            task: Mutex::new(Some(join)),
        }
    }

    /// A producer-side handle to this engine.
    pub fn handle(&self) -> TxHandle {
        self.handle.clone()
    }

    /// Stops the engine task, abandoning any in-flight packet.
    pub async fn shutdown(&self) {
        self.handle.notifier.post(NOTIFY_STOP);
        let join = self.task.lock().expect("tx task lock poisoned").take();
        if let Some(join) = join {
            let abort = join.abort_handle();
            if tokio::time::timeout(Duration::from_millis(SHUTDOWN_WAIT_MS), join)
                .await
                .is_err()
            {
                warn!("tx engine task did not stop in time, aborting it");
                abort.abort();
            }
        }
    }
}

struct EngineTask {
    radio: Arc<dyn Radio>,
    scanner: ChannelScanner,
    codec: MessageCodec,
    notifier: Arc<Notifier>,
    queue: mpsc::Receiver<TxPacket>,
    fsm: TxStateMachine,
    ack_timer: AckTimer,
    sequence: u16,
    ack_timeout: Duration,
    clock: Uptime,
}

impl EngineTask {
    async fn run(&mut self) {
        loop {
            match self.fsm.state() {
                TxState::Idle => {
                    if let Ok(packet) = self.queue.try_recv() {
                        self.transmit(packet);
                        continue;
                    }

                    let bits = self.notifier.wait(NOTIFY_ALL, None).await;
                    if bits & NOTIFY_STOP != 0 {
                        break;
                    }
                    if bits & NOTIFY_LINK_ALIVE != 0 {
                        self.fsm.on_link_alive();
                    }
                    if bits & NOTIFY_PHYSICAL_FAIL != 0 {
                        self.fsm.on_physical_fail();
                    }
                    // NOTIFY_DATA needs no handling here: the next loop
                    // iteration polls the queue.
                }

                TxState::WaitingForAck => {
                    let bits = self.notifier.wait(NOTIFY_ALL, None).await;
                    if bits & NOTIFY_STOP != 0 {
                        break;
                    }
                    if bits & NOTIFY_LINK_ALIVE != 0 {
                        self.fsm.on_link_alive();
                    }
                    if bits & NOTIFY_LOGICAL_ACK != 0 {
                        self.fsm.on_ack_received();
                        self.ack_timer.stop();
                    } else if bits & NOTIFY_PHYSICAL_FAIL != 0 {
                        if self.fsm.on_physical_fail() == TxState::Scanning {
                            self.ack_timer.stop();
                        }
                    } else if bits & NOTIFY_ACK_TIMEOUT != 0 {
                        self.fsm.on_ack_timeout();
                    }
                }

                TxState::Retrying => {
                    let pending = self
                        .fsm
                        .pending_ack()
                        .filter(|p| p.retries_left > 0)
                        .cloned();
                    match pending {
                        Some(mut pending) => {
                            pending.retries_left -= 1;
                            debug!(
                                seq = pending.sequence_number,
                                retries_left = pending.retries_left,
                                "retransmitting unacknowledged packet"
                            );
                            if let Err(err) = self
                                .radio
                                .send_one(&pending.packet.dest_mac, &pending.packet.data)
                            {
                                debug!(%err, "retransmission send failed");
                            }
                            self.fsm.set_pending_ack(pending);
                            self.ack_timer.arm(self.ack_timeout);
                            self.fsm.on_tx_success(true);
                        }
                        None => {
                            warn!("dropping packet after exhausting retries");
                            self.fsm.on_max_retries();
                        }
                    }
                }

                TxState::Scanning => {
                    let start = self.radio.get_channel().unwrap_or(DEFAULT_WIFI_CHANNEL);
                    let result = self.scanner.scan(start).await;
                    if result.hub_found {
                        if let Err(err) = self.radio.set_channel(result.channel) {
                            warn!(%err, "failed to settle on the discovered channel");
                        }
                        self.fsm.on_link_alive();
                    }
                    self.fsm.reset();
                }

                // Transient bookkeeping state; the transition functions
                // never leave the machine here between loop iterations.
                TxState::Sending => {}
            }
        }

        self.ack_timer.stop();
    }

    /// Sends one packet: stamps the sequence number, reseals the CRC and
    /// feeds the outcome to the state machine.
    fn transmit(&mut self, mut packet: TxPacket) {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        if packet.data.len() >= MIN_FRAME_SIZE {
            packet.data[1..3].copy_from_slice(&sequence.to_le_bytes());
            let len = packet.data.len();
            packet.data[len - 1] = self.codec.calculate_crc(&packet.data[..len - 1]);
        }

        let send_result = self.radio.send_one(&packet.dest_mac, &packet.data);
        if let Err(err) = &send_result {
            debug!(%err, "driver rejected send");
        }

        let requires_ack = packet.requires_ack && send_result.is_ok();
        let dest_node_id = packet.data.get(7).copied().unwrap_or(0);

        if self.fsm.on_tx_success(requires_ack) == TxState::WaitingForAck {
            self.fsm.set_pending_ack(PendingAck {
                sequence_number: sequence,
                timestamp_ms: self.clock.now_ms(),
                retries_left: MAX_LOGICAL_RETRIES,
                packet,
                node_id: dest_node_id,
            });
            self.ack_timer.arm(self.ack_timeout);
        }
    }
}
