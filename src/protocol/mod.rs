//! Wire protocol module
//!
//! Message definitions, the frame codec and the transmission state machine.

pub mod codec;
pub mod message;
pub mod state;

pub use self::codec::MessageCodec;
pub use self::message::{
    AckPayload,
    AckStatus,
    CommandType,
    HeartbeatPayload,
    HeartbeatResponsePayload,
    MessageHeader,
    MessageType,
    OtaCommandPayload,
    PairRequestPayload,
    PairResponsePayload,
    PairStatus,
};
pub use self::state::{TxState, TxStateMachine};

/// Protocol version advertised during pairing
pub const PROTOCOL_VERSION: u8 = 1;
