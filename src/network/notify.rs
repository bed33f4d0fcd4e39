//! Bitmask notification primitive.
//!
//! The TX engine blocks on a set of sticky event bits: timers, the radio
//! send-result callback and the protocol worker all post bits from their
//! own contexts, and the single consumer (the TX engine task, including the
//! scanner running inside it) wakes on any bit of interest and consumes the
//! bits it asked for. Bits outside the wait mask stay set for a later wait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// A frame was queued for transmission
pub const NOTIFY_LOGICAL_ACK: u32 = 0x01;
/// The radio driver reported a physical send failure
pub const NOTIFY_PHYSICAL_FAIL: u32 = 0x02;
/// A channel-scan response identified the hub
pub const NOTIFY_HUB_FOUND: u32 = 0x04;
/// A packet is waiting in the transmit queue
pub const NOTIFY_DATA: u32 = 0x20;
/// The logical ACK wait expired
pub const NOTIFY_ACK_TIMEOUT: u32 = 0x40;
/// The owning task must exit
pub const NOTIFY_STOP: u32 = 0x100;
/// A valid frame arrived, proving the link works
pub const NOTIFY_LINK_ALIVE: u32 = 0x200;

/// All defined notification bits
pub const NOTIFY_ALL: u32 = NOTIFY_LOGICAL_ACK
    | NOTIFY_PHYSICAL_FAIL
    | NOTIFY_HUB_FOUND
    | NOTIFY_DATA
    | NOTIFY_ACK_TIMEOUT
    | NOTIFY_STOP
    | NOTIFY_LINK_ALIVE;

/// Sticky-bit notifier with any-of wakeup and clear-on-read.
#[derive(Debug, Default)]
pub struct Notifier {
    bits: AtomicU32,
    event: Notify,
}

impl Notifier {
    /// Creates a notifier with no bits set.
    pub fn new() -> Self {
        Notifier {
            bits: AtomicU32::new(0),
            event: Notify::new(),
        }
    }

    /// Sets `bits` and wakes the waiter.
    pub fn post(&self, bits: u32) {
        self.bits.fetch_or(bits, Ordering::SeqCst);
        self.event.notify_one();
    }

    /// Bits currently pending, without consuming them.
    pub fn peek(&self) -> u32 {
        self.bits.load(Ordering::SeqCst)
    }

    /// Waits until any bit in `mask` is set or `timeout` elapses.
    ///
    /// Returns the full bit value observed (so the caller can inspect bits
    /// outside its mask) and clears only the masked bits; 0 means timeout.
    /// `None` waits forever.
    pub async fn wait(&self, mask: u32, timeout: Option<Duration>) -> u32 {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, self.wait_for(mask))
                .await
                .unwrap_or(0),
            None => self.wait_for(mask).await,
        }
    }

    async fn wait_for(&self, mask: u32) -> u32 {
        loop {
            // Register for wakeup before checking, so a post between the
            // check and the await is not lost.
            let notified = self.event.notified();
            let current = self.bits.load(Ordering::SeqCst);
            if current & mask != 0 {
                self.bits.fetch_and(!mask, Ordering::SeqCst);
                return current;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_before_wait_is_sticky() {
        let notifier = Notifier::new();
        notifier.post(NOTIFY_DATA);

        let bits = notifier.wait(NOTIFY_DATA, Some(Duration::from_millis(10))).await;
        assert_eq!(bits & NOTIFY_DATA, NOTIFY_DATA);
    }

    #[tokio::test]
    async fn test_wait_clears_only_masked_bits() {
        let notifier = Notifier::new();
        notifier.post(NOTIFY_DATA | NOTIFY_HUB_FOUND);

        let bits = notifier.wait(NOTIFY_HUB_FOUND, None).await;
        assert_eq!(bits, NOTIFY_DATA | NOTIFY_HUB_FOUND);

        // DATA was outside the mask and must still be pending.
        assert_eq!(notifier.peek(), NOTIFY_DATA);
        let bits = notifier.wait(NOTIFY_DATA, Some(Duration::from_millis(10))).await;
        assert_eq!(bits & NOTIFY_DATA, NOTIFY_DATA);
        assert_eq!(notifier.peek(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_without_bits() {
        let notifier = Notifier::new();
        let bits = notifier.wait(NOTIFY_DATA, Some(Duration::from_millis(50))).await;
        assert_eq!(bits, 0);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_later_post() {
        let notifier = std::sync::Arc::new(Notifier::new());
        let waiter = notifier.clone();
        let handle = tokio::spawn(async move { waiter.wait(NOTIFY_STOP, None).await });

        tokio::task::yield_now().await;
        notifier.post(NOTIFY_STOP);

        let bits = handle.await.unwrap();
        assert_eq!(bits & NOTIFY_STOP, NOTIFY_STOP);
    }

    #[tokio::test]
    async fn test_unmasked_post_does_not_satisfy_wait() {
        let notifier = Notifier::new();
        notifier.post(NOTIFY_LINK_ALIVE);

        let bits = notifier
            .wait(NOTIFY_ACK_TIMEOUT, Some(Duration::from_millis(10)))
            .await;
        assert_eq!(bits, 0);
        // The unrelated bit was not consumed by the failed wait.
        assert_eq!(notifier.peek(), NOTIFY_LINK_ALIVE);
    }
}
