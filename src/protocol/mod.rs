//! The family-specific wire protocol decoders (§4.2): opcode tables, command
//! and response framing, notify-channel reassembly, and pen-data decoding.
//! This module has no notion of a live connection — it's pure functions and
//! small stateful decoders that the session protocol (`crate::session`)
//! drives with bytes it receives from a `GattConnection`.

pub mod family;
pub mod frame;
pub mod pendata;

pub use family::{protocol_for, FamilyProtocol};
pub use frame::{encode_command, Frame, Reassembler};
pub use pendata::PenDataDecoder;
