//! Utility module
//!
//! Checksum routines shared by the frame codec and the persistence layer,
//! plus a monotonic millisecond clock.

use std::time::Instant;

/// Computes a ROM-compatible little-endian CRC-8 over `data`.
///
/// Reflected form of polynomial 0x07 (reversed 0xE0); the running value is
/// complemented on entry and exit. Callers seed with 0 for a whole-buffer
/// checksum and may chain calls by feeding the previous result back in.
pub fn crc8_le(seed: u8, data: &[u8]) -> u8 {
    let mut crc = !seed;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xE0 } else { crc >> 1 };
        }
    }
    !crc
}

/// Computes a ROM-compatible little-endian CRC-32 over `data`.
///
/// Reflected form of polynomial 0x04C11DB7 (reversed 0xEDB88320), value
/// complemented on entry and exit. With seed 0 this matches the common
/// zlib/IEEE CRC-32.
pub fn crc32_le(seed: u32, data: &[u8]) -> u32 {
    let mut crc = !seed;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

/// Monotonic clock anchored at construction time.
///
/// Protocol timestamps (header timestamp_ms, last-seen tracking, uptime in
/// heartbeats) all come from one of these so they share an epoch.
#[derive(Debug, Clone)]
pub struct Uptime {
    start: Instant,
}

impl Uptime {
    /// Creates a clock whose zero point is now.
    pub fn new() -> Self {
        Uptime { start: Instant::now() }
    }

    /// Milliseconds elapsed since construction.
    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Microseconds elapsed since construction.
    pub fn now_us(&self) -> i64 {
        self.start.elapsed().as_micros() as i64
    }
}

impl Default for Uptime {
    fn default() -> Self {
        Self::new()
    }
}
