//! The in-memory drawing model: `Device`, `Drawing`, `Stroke`, `Point`, and
//! the registration record persisted to disk.

pub mod drawing;
pub mod json;

use crate::bdaddr::BDAddr;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use drawing::{Drawing, Point, Stroke};

/// Which of the three supported device dialects a `Device` speaks. Each
/// variant carries its own opcode quirks, sensor rotation, and live-mode
/// support — see `crate::protocol::family`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Spark,
    Slate,
    IntuosPro,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Family::Spark => "spark",
            Family::Slate => "slate",
            Family::IntuosPro => "intuos_pro",
        };
        f.write_str(s)
    }
}

/// `Device.BatteryState`: `0` (`Unknown`), `1` (`Charging`), `2` (`Discharging`)
/// on the RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatteryState {
    #[default]
    Unknown,
    Charging,
    Discharging,
}

impl BatteryState {
    pub fn as_u32(self) -> u32 {
        match self {
            BatteryState::Unknown => 0,
            BatteryState::Charging => 1,
            BatteryState::Discharging => 2,
        }
    }
}

/// The 16 random bytes the host assigns a device at registration.
pub type RegistrationUuid = [u8; 16];

/// A (address, uuid, family) tuple persisted to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub address: BDAddr,
    #[serde(with = "hex_uuid")]
    pub uuid: RegistrationUuid,
    pub family: Family,
}

/// A known SmartPad device and everything learned about it since it was
/// first discovered or loaded from the persistent store.
#[derive(Debug, Clone)]
pub struct Device {
    pub address: BDAddr,
    pub name: String,
    /// `None` until `Register` succeeds; present for any device loaded from
    /// the persistent store.
    pub registration: Option<RegistrationUuid>,
    pub family: Family,
    /// (width_um, height_um), read from the device via `GetDimensions`
    /// during registration; `(0, 0)` until then.
    pub dimensions: (u32, u32),
    pub firmware_version: Option<String>,
    pub battery_percent: u32,
    pub battery_state: BatteryState,
    pub drawings: Vec<Drawing>,
    pub listening: bool,
    pub live: bool,
}

impl Device {
    pub fn new(address: BDAddr, family: Family) -> Self {
        Device {
            address,
            name: String::new(),
            registration: None,
            family,
            dimensions: (0, 0),
            firmware_version: None,
            battery_percent: 0,
            battery_state: BatteryState::Unknown,
            drawings: Vec::new(),
            listening: false,
            live: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Timestamps of every completed `Drawing`, in fetch order. This backs
    /// `Device.DrawingsAvailable`, exposed as a list of timestamps rather
    /// than a bare count so a client can go straight to `GetJSONData`
    /// without a separate lookup step.
    pub fn drawing_timestamps(&self) -> Vec<u64> {
        self.drawings.iter().map(|d| d.timestamp).collect()
    }
}

mod hex_uuid {
    use serde::{de::Error as DeError, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = String::with_capacity(32);
        for b in value {
            s.push_str(&format!("{:02x}", b));
        }
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.len() != 32 {
            return Err(DeError::custom("registration uuid must be 32 hex chars"));
        }
        let mut out = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(DeError::custom)?;
            out[i] = u8::from_str_radix(hex, 16).map_err(DeError::custom)?;
        }
        Ok(out)
    }
}
