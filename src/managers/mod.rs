//! Protocol managers: heartbeat keep-alives and the pairing dance.

pub mod heartbeat;
pub mod pairing;

pub use self::heartbeat::HeartbeatManager;
pub use self::pairing::{PairingAdvert, PairingManager};
