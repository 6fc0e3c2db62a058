// tuhi Source Code File
//
// A session-scoped daemon that talks to Wacom SmartPad ink-capture tablets
// over Bluetooth Low Energy GATT, decodes their per-family binary stroke
// protocols, and exposes a normalized drawing model over a session D-Bus RPC
// interface. See `SPEC_FULL.md` module numbering for the correspondence
// between these modules and the system's design.

pub mod assembler;
pub mod bdaddr;
pub mod error;
pub mod live;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use bdaddr::BDAddr;
pub use error::{Error, Result};
