//! Radio abstraction.
//!
//! The runtime drives the physical link exclusively through this trait: one
//! channel-managed, peer-filtered datagram radio. The real implementation
//! wraps the platform driver; tests script a mock.

use crate::core::{Mac, Result};

/// A connectionless datagram radio with a peer filter.
///
/// All methods are quick driver calls; `send_one` returns once the driver
/// has accepted the frame for transmission, not once it is acknowledged on
/// air. Delivery outcomes arrive asynchronously through the host's
/// send-result callback.
pub trait Radio: Send + Sync {
    /// Tunes the radio to `channel` (1..=13).
    fn set_channel(&self, channel: u8) -> Result<()>;

    /// Returns the channel the radio is currently on.
    fn get_channel(&self) -> Result<u8>;

    /// Hands one frame to the driver for transmission to `mac`.
    fn send_one(&self, mac: &Mac, data: &[u8]) -> Result<()>;

    /// Registers `mac` in the driver's peer filter.
    fn add_peer(&self, mac: &Mac, channel: u8) -> Result<()>;

    /// Updates the registered channel for `mac`.
    fn modify_peer(&self, mac: &Mac, channel: u8) -> Result<()>;

    /// Removes `mac` from the driver's peer filter.
    fn remove_peer(&self, mac: &Mac) -> Result<()>;
}
