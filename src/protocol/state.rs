//! Transmission state machine.
//!
//! A pure transition function over send/ack/failure events. It performs no
//! I/O and no blocking; the TX engine task is its only caller, so it needs
//! no internal locking.

use serde::{Deserialize, Serialize};

use crate::core::{PendingAck, MAX_LOGICAL_RETRIES, MAX_PHYSICAL_FAILURES};

/// State of the transmit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    /// Nothing in flight; the engine polls the queue
    Idle,
    /// A send has been handed to the radio (transient)
    Sending,
    /// A requires-ack packet is in flight, waiting for its logical ACK
    WaitingForAck,
    /// The ACK timed out; a retransmission is due
    Retrying,
    /// The link is considered dead; sweep channels for the hub
    Scanning,
}

/// Drives [`TxState`] from radio and protocol events.
///
/// Two failure counters feed the dead-link heuristic: `send_fail_count`
/// counts physical failures charged against the current in-flight packet,
/// `consecutive_fail_count` counts physical failures since the last sign of
/// life on the link. Either one crossing its limit forces a channel scan.
#[derive(Debug)]
pub struct TxStateMachine {
    state: TxState,
    pending_ack: Option<PendingAck>,
    send_fail_count: u8,
    consecutive_fail_count: u8,
}

impl TxStateMachine {
    /// Creates a state machine in `Idle` with clean counters.
    pub fn new() -> Self {
        TxStateMachine {
            state: TxState::Idle,
            pending_ack: None,
            send_fail_count: 0,
            consecutive_fail_count: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// The in-flight retry context, if any.
    pub fn pending_ack(&self) -> Option<&PendingAck> {
        self.pending_ack.as_ref()
    }

    /// Installs the retry context for the packet just sent.
    pub fn set_pending_ack(&mut self, pending_ack: PendingAck) {
        self.pending_ack = Some(pending_ack);
    }

    /// Returns to `Idle`, dropping any in-flight context and counters.
    pub fn reset(&mut self) {
        self.state = TxState::Idle;
        self.pending_ack = None;
        self.send_fail_count = 0;
        self.consecutive_fail_count = 0;
    }

    /// The radio accepted a send. `requires_ack` is true only when the
    /// packet needs a logical ACK *and* the driver took it.
    pub fn on_tx_success(&mut self, requires_ack: bool) -> TxState {
        self.state = if requires_ack {
            TxState::WaitingForAck
        } else {
            TxState::Idle
        };
        self.state
    }

    /// The logical ACK for the in-flight packet arrived.
    pub fn on_ack_received(&mut self) -> TxState {
        self.send_fail_count = 0;
        self.consecutive_fail_count = 0;
        self.pending_ack = None;
        self.state = TxState::Idle;
        self.state
    }

    /// Any received frame proves the link works; forgive past failures.
    pub fn on_link_alive(&mut self) {
        self.send_fail_count = 0;
        self.consecutive_fail_count = 0;
    }

    /// The ACK wait expired.
    pub fn on_ack_timeout(&mut self) -> TxState {
        self.state = TxState::Retrying;
        self.state
    }

    /// The driver reported a physical send failure.
    pub fn on_physical_fail(&mut self) -> TxState {
        self.consecutive_fail_count += 1;

        if self.pending_ack.is_some() {
            self.send_fail_count += 1;
            if self.send_fail_count >= MAX_LOGICAL_RETRIES
                || self.consecutive_fail_count >= MAX_PHYSICAL_FAILURES
            {
                self.send_fail_count = 0;
                self.consecutive_fail_count = 0;
                self.pending_ack = None;
                self.state = TxState::Scanning;
            } else {
                self.state = TxState::WaitingForAck;
            }
        } else if self.consecutive_fail_count >= MAX_PHYSICAL_FAILURES {
            self.send_fail_count = 0;
            self.consecutive_fail_count = 0;
            self.state = TxState::Scanning;
        }
        // Without a pending ack and below the limit the state is left as-is:
        // a lost fire-and-forget frame is not worth reacting to on its own.

        self.state
    }

    /// All retransmissions of the in-flight packet are spent.
    pub fn on_max_retries(&mut self) -> TxState {
        self.pending_ack = None;
        self.state = TxState::Idle;
        self.state
    }
}

impl Default for TxStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TxPacket;

    fn pending(seq: u16) -> PendingAck {
        PendingAck {
            sequence_number: seq,
            timestamp_ms: 0,
            retries_left: MAX_LOGICAL_RETRIES,
            packet: TxPacket {
                dest_mac: [2; 6],
                data: vec![0; 17],
                requires_ack: true,
            },
            node_id: 5,
        }
    }

    #[test]
    fn test_initial_state_is_idle() {
        let fsm = TxStateMachine::new();
        assert_eq!(fsm.state(), TxState::Idle);
        assert!(fsm.pending_ack().is_none());
    }

    #[test]
    fn test_tx_success_transitions() {
        let mut fsm = TxStateMachine::new();

        // A packet that needs a logical ACK blocks the pipeline.
        assert_eq!(fsm.on_tx_success(true), TxState::WaitingForAck);
        assert_eq!(fsm.state(), TxState::WaitingForAck);

        // Fire-and-forget returns to Idle immediately.
        fsm.reset();
        assert_eq!(fsm.on_tx_success(false), TxState::Idle);
    }

    #[test]
    fn test_ack_received_clears_pending_and_returns_idle() {
        let mut fsm = TxStateMachine::new();
        fsm.set_pending_ack(pending(1));
        fsm.on_tx_success(true);

        assert_eq!(fsm.on_ack_received(), TxState::Idle);
        assert!(fsm.pending_ack().is_none());
    }

    #[test]
    fn test_ack_timeout_enters_retrying() {
        let mut fsm = TxStateMachine::new();
        fsm.on_tx_success(true);
        assert_eq!(fsm.on_ack_timeout(), TxState::Retrying);
    }

    #[test]
    fn test_physical_fails_with_pending_ack_reach_scanning() {
        let mut fsm = TxStateMachine::new();
        fsm.set_pending_ack(pending(1));
        fsm.on_tx_success(true);

        for _ in 0..MAX_LOGICAL_RETRIES - 1 {
            assert_eq!(fsm.on_physical_fail(), TxState::WaitingForAck);
            // Retry context survives until we give up on the link.
            assert!(fsm.pending_ack().is_some());
        }

        assert_eq!(fsm.on_physical_fail(), TxState::Scanning);
        // The link is considered dead; the packet is abandoned.
        assert!(fsm.pending_ack().is_none());
    }

    #[test]
    fn test_physical_fails_without_pending_ack_reach_scanning() {
        let mut fsm = TxStateMachine::new();

        for _ in 0..MAX_PHYSICAL_FAILURES - 1 {
            assert_eq!(fsm.on_physical_fail(), TxState::Idle);
        }
        assert_eq!(fsm.on_physical_fail(), TxState::Scanning);
    }

    #[test]
    fn test_fire_and_forget_sends_do_not_reset_counters() {
        let mut fsm = TxStateMachine::new();

        // Even when broadcasts keep "succeeding" at queue level, persistent
        // driver failures must still flag the link as dead.
        for _ in 0..MAX_PHYSICAL_FAILURES - 1 {
            fsm.on_physical_fail();
            fsm.on_tx_success(false);
        }
        assert_eq!(fsm.on_physical_fail(), TxState::Scanning);
    }

    #[test]
    fn test_link_alive_resets_both_counters() {
        let mut fsm = TxStateMachine::new();

        fsm.on_physical_fail();
        fsm.on_physical_fail();
        fsm.on_link_alive();

        // After forgiveness it takes a full run of failures again.
        for _ in 0..MAX_PHYSICAL_FAILURES - 1 {
            assert_eq!(fsm.on_physical_fail(), TxState::Idle);
        }
        assert_eq!(fsm.on_physical_fail(), TxState::Scanning);
    }

    #[test]
    fn test_link_alive_with_pending_ack() {
        let mut fsm = TxStateMachine::new();
        fsm.set_pending_ack(pending(9));
        fsm.on_tx_success(true);

        fsm.on_physical_fail();
        fsm.on_physical_fail();
        fsm.on_link_alive();

        // Forgiven: both limits need to be reached from scratch. The
        // per-packet counter was also cleared, so three more failures are
        // needed before scanning.
        assert_eq!(fsm.on_physical_fail(), TxState::WaitingForAck);
        assert_eq!(fsm.on_physical_fail(), TxState::WaitingForAck);
        assert_eq!(fsm.on_physical_fail(), TxState::Scanning);
    }

    #[test]
    fn test_max_retries_drops_packet() {
        let mut fsm = TxStateMachine::new();
        fsm.set_pending_ack(pending(3));
        fsm.on_tx_success(true);
        fsm.on_ack_timeout();

        assert_eq!(fsm.on_max_retries(), TxState::Idle);
        assert!(fsm.pending_ack().is_none());
    }

    #[test]
    fn test_reset_from_any_state() {
        let mut fsm = TxStateMachine::new();
        fsm.set_pending_ack(pending(4));
        fsm.on_tx_success(true);
        fsm.on_physical_fail();

        fsm.reset();
        assert_eq!(fsm.state(), TxState::Idle);
        assert!(fsm.pending_ack().is_none());

        // Counters are clean after a reset.
        for _ in 0..MAX_PHYSICAL_FAILURES - 1 {
            assert_eq!(fsm.on_physical_fail(), TxState::Idle);
        }
        assert_eq!(fsm.on_physical_fail(), TxState::Scanning);
    }
}
