//! Receive pipeline: dispatcher and protocol worker tasks.
//!
//! The driver receive callback pushes raw frames into the dispatcher
//! queue. The dispatcher validates length and CRC, decodes the header and
//! splits traffic: protocol frames go to the worker task (which runs the
//! router), application frames go straight to the host queue. Headers of
//! application frames that want a logical ACK are parked in a shared slot
//! until the host confirms reception.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::core::{RxPacket, MIN_FRAME_SIZE};
use crate::protocol::{MessageCodec, MessageHeader};
use crate::util::Uptime;

use super::router::Router;

/// Grace period for the pipeline tasks to exit after a stop request.
const SHUTDOWN_WAIT_MS: u64 = 200;

/// Header of the latest application frame that asked for a logical ACK,
/// together with its arrival time for the processing-time telemetry.
#[derive(Debug, Clone, Copy)]
pub struct CapturedAck {
    /// Header to acknowledge
    pub header: MessageHeader,
    /// Monotonic arrival timestamp, microseconds
    pub received_us: i64,
}

/// Shared slot holding the header awaiting confirmation.
pub type AckSlot = Arc<Mutex<Option<CapturedAck>>>;

/// The two receive-path tasks and their queues.
pub struct RxPipeline {
    ingress: mpsc::Sender<RxPacket>,
    worker_queue: mpsc::Sender<RxPacket>,
    stop: Arc<AtomicBool>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    worker_task: Mutex<Option<JoinHandle<()>>>,
}

impl RxPipeline {
    /// Spawns the dispatcher and worker tasks.
    pub fn start(
        codec: MessageCodec,
        router: Arc<Router>,
        app_queue: mpsc::Sender<RxPacket>,
        ack_slot: AckSlot,
        clock: Uptime,
        rx_capacity: usize,
        worker_capacity: usize,
    ) -> Self {
        let (ingress_tx, mut ingress_rx) = mpsc::channel::<RxPacket>(rx_capacity);
        let (worker_tx, mut worker_rx) = mpsc::channel::<RxPacket>(worker_capacity);
        let stop = Arc::new(AtomicBool::new(false));

        let dispatch_stop = stop.clone();
        let dispatch_worker_tx = worker_tx.clone();
        let dispatch_task = tokio::spawn(async move {
            info!("rx dispatcher task started");
            while let Some(packet) = ingress_rx.recv().await {
                if packet.is_sentinel() {
                    if dispatch_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    continue;
                }

                if packet.data.len() < MIN_FRAME_SIZE {
                    trace!(len = packet.data.len(), "runt frame dropped");
                    continue;
                }
                if !codec.validate_crc(&packet.data) {
                    warn!("frame with bad crc dropped");
                    continue;
                }
                let Some(header) = codec.decode_header(&packet.data) else {
                    warn!(msg_type = packet.data[0], "frame with unknown type dropped");
                    continue;
                };

                if header.msg_type.is_protocol() {
                    if dispatch_worker_tx.try_send(packet).is_err() {
                        warn!("protocol worker queue full, frame dropped");
                    }
                } else {
                    if header.requires_ack {
                        let captured = CapturedAck {
                            header,
                            received_us: clock.now_us(),
                        };
                        *ack_slot.lock().expect("ack slot lock poisoned") = Some(captured);
                    }
                    if app_queue.try_send(packet).is_err() {
                        warn!("application queue full, frame dropped");
                    }
                }
            }
            info!("rx dispatcher task exiting");
        });

        let worker_stop = stop.clone();
        let worker_task = tokio::spawn(async move {
            info!("protocol worker task started");
            while let Some(packet) = worker_rx.recv().await {
                if packet.is_sentinel() {
                    if worker_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    continue;
                }
                router.handle_frame(&packet).await;
            }
            info!("protocol worker task exiting");
        });

        RxPipeline {
            ingress: ingress_tx,
            worker_queue: worker_tx,
            stop,
            dispatch_task: Mutex::new(Some(dispatch_task)),
            worker_task: Mutex::new(Some(worker_task)),
        }
    }

    /// Hands a received frame to the pipeline.
    ///
    /// Non-blocking: called from the driver callback context, so a full
    /// queue drops the frame rather than stalling the driver.
    pub fn submit(&self, packet: RxPacket) {
        if self.ingress.try_send(packet).is_err() {
            debug!("rx dispatch queue full, frame dropped");
        }
    }

    /// Asks both tasks to exit without waiting for them: sets the stop
    /// flag and unblocks each queue with a sentinel frame.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.ingress.try_send(RxPacket::sentinel());
        let _ = self.worker_queue.try_send(RxPacket::sentinel());
    }

    /// Stops both tasks and waits for them to exit.
    pub async fn shutdown(&self) {
        self.request_stop();

        for slot in [&self.dispatch_task, &self.worker_task] {
            let task = slot.lock().expect("rx task lock poisoned").take();
            if let Some(task) = task {
                let abort = task.abort_handle();
                if tokio::time::timeout(Duration::from_millis(SHUTDOWN_WAIT_MS), task)
                    .await
                    .is_err()
                {
                    warn!("receive task did not stop in time, aborting it");
                    abort.abort();
                }
            }
        }
    }
}
