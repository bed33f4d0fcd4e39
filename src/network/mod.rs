//! Network layer: radio abstraction, notification primitive, transmit
//! engine, channel scanner and the receive pipeline.

pub mod dispatch;
pub mod notify;
pub mod radio;
pub mod router;
pub mod scanner;
pub mod tx;

pub use self::notify::Notifier;
pub use self::radio::Radio;
pub use self::scanner::{ChannelScanner, ScanResult};
pub use self::tx::{TxEngine, TxHandle};

use std::sync::atomic::{AtomicU8, Ordering};

/// The radio channel the runtime believes it is operating on.
///
/// Shared between the facade, the router and the managers; updated when a
/// heartbeat response or a completed scan reveals the hub moved.
#[derive(Debug)]
pub struct ChannelState(AtomicU8);

impl ChannelState {
    /// Creates the state at the given starting channel.
    pub fn new(channel: u8) -> Self {
        ChannelState(AtomicU8::new(channel))
    }

    /// Current channel.
    pub fn get(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }

    /// Unconditionally stores `channel`.
    pub fn set(&self, channel: u8) {
        self.0.store(channel, Ordering::SeqCst);
    }

    /// Stores `channel` and reports whether it differed from the previous
    /// value.
    pub fn replace_if_changed(&self, channel: u8) -> bool {
        self.0.swap(channel, Ordering::SeqCst) != channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_state_change_detection() {
        let state = ChannelState::new(1);
        assert_eq!(state.get(), 1);

        assert!(state.replace_if_changed(6));
        assert_eq!(state.get(), 6);

        // Same value again: no change reported.
        assert!(!state.replace_if_changed(6));

        state.set(11);
        assert_eq!(state.get(), 11);
    }
}
