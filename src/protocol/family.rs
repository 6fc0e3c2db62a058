//! Per-family dispatch: the three device dialects differ only in opcode
//! quirks, sensor rotation, and live-mode support. Everything else —
//! framing, pen-data decoding, state machine — is shared.

use crate::model::Family;
use uuid::Uuid;

/// The vendor GATT service every SmartPad family exposes, carrying the
/// nordic-UART-like notify/write characteristic pair plus the button-press,
/// battery and firmware characteristics. The exact UUIDs are family-specific
/// in the wild; these are the constants this implementation was built
/// against and are treated as configuration, not protocol truth — a real
/// deployment reads them from the device's advertised service list instead
/// of hardcoding a single value here.
pub mod uuids {
    use super::Uuid;

    pub const VENDOR_SERVICE: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
    pub const NOTIFY_CHAR: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
    pub const WRITE_CHAR: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);
    pub const BUTTON_CHAR: Uuid = Uuid::from_u128(0x6e40_0004_b5a3_f393_e0a9_e50e24dcca9e);
}

/// Opcodes shared by all three families. Family-specific overrides live in
/// `FamilyProtocol::live_opcode`.
pub mod opcodes {
    pub const GET_NAME: u8 = 0xbb;
    pub const SET_NAME: u8 = 0xbb;
    pub const GET_TIME: u8 = 0xb6;
    pub const SET_TIME: u8 = 0xb6;
    pub const GET_FW_VERSION: u8 = 0xb7;
    pub const GET_BATTERY: u8 = 0xb9;
    pub const GET_DIMENSIONS: u8 = 0xea;
    pub const REGISTER: u8 = 0xe7;
    pub const ACK_E6: u8 = 0xe6;
    pub const START_READING: u8 = 0xb1;
    pub const ACK_DATA: u8 = 0xca;
    pub const END_OF_DRAWING: u8 = 0xc8;
    pub const RESET: u8 = 0xb0;
}

/// Response status bytes.
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const BUSY: u8 = 0x01;
    pub const NOT_AUTHORIZED: u8 = 0x02;
    pub const NOT_READY: u8 = 0x03;
    pub const PROTOCOL_ERROR: u8 = 0x07;
}

/// A small capability set standing in for per-family branching scattered
/// through the session protocol.
pub trait FamilyProtocol {
    fn tag(&self) -> Family;

    /// Whether this family supports live mode and, if so, the opcode that
    /// switches the device into streaming rather than buffering mode.
    /// Only intuos_pro has one; spark/slate have none.
    fn live_opcode(&self) -> Option<u8>;

    /// `true` if this family's sensor is physically rotated relative to the
    /// drawing orientation, in which case the assembler applies
    /// `(x, y) := (y, width - x)`. This implementation takes "top-left" as
    /// the origin in drawing orientation for every family.
    fn rotates_sensor(&self) -> bool;
}

pub struct Spark;
pub struct Slate;
pub struct IntuosPro;

impl FamilyProtocol for Spark {
    fn tag(&self) -> Family {
        Family::Spark
    }
    fn live_opcode(&self) -> Option<u8> {
        None
    }
    fn rotates_sensor(&self) -> bool {
        true
    }
}

impl FamilyProtocol for Slate {
    fn tag(&self) -> Family {
        Family::Slate
    }
    fn live_opcode(&self) -> Option<u8> {
        None
    }
    fn rotates_sensor(&self) -> bool {
        true
    }
}

impl FamilyProtocol for IntuosPro {
    fn tag(&self) -> Family {
        Family::IntuosPro
    }
    fn live_opcode(&self) -> Option<u8> {
        Some(0xb3)
    }
    fn rotates_sensor(&self) -> bool {
        false
    }
}

pub fn protocol_for(family: Family) -> Box<dyn FamilyProtocol + Send + Sync> {
    match family {
        Family::Spark => Box::new(Spark),
        Family::Slate => Box::new(Slate),
        Family::IntuosPro => Box::new(IntuosPro),
    }
}
