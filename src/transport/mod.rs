// tuhi Source Code File
//
// The transport-adapter trait described in spec §4.1. Everything above this
// module — the wire codec, the session state machine, the registry — talks
// only to `GattTransport`/`GattConnection`. `bluez` is the one shipped
// implementation; `mock` is an in-memory double used by the scenario tests in
// §8.

pub mod bluez;
pub mod mock;

use crate::bdaddr::BDAddr;
use bitflags::bitflags;
use futures::stream::Stream;
use std::collections::BTreeSet;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Errors raised by a `GattTransport`/`GattConnection` implementation. These
/// are distinct from `crate::Error`'s session-level taxonomy (§7) — the
/// session protocol translates a `TransportError` into the matching
/// `crate::Error` variant at the point where it observes it.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("device unreachable")]
    Unreachable,
    #[error("device not found")]
    NotFound,
    #[error("operation timed out")]
    Timeout,
    #[error("no such characteristic: {0}")]
    UnknownCharacteristic(Uuid),
    #[error("backend error: {0}")]
    Backend(String),
}

/// A single BLE advertisement observed during a scan.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: BDAddr,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    /// Raw service-data payloads keyed by service UUID, used to recognize the
    /// distinct appearance / service-data pattern a device in pairing mode
    /// advertises (§4.3 registration sub-flow).
    pub service_data: std::collections::HashMap<Uuid, Vec<u8>>,
}

bitflags! {
    /// Mirrors the subset of GATT characteristic properties the session
    /// protocol cares about: whether a characteristic can be written to and
    /// whether it can be subscribed to for notifications.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CharProps: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const NOTIFY = 0x08;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CharacteristicDescription {
    pub uuid: Uuid,
}

#[derive(Debug, Clone)]
pub struct ServiceDescription {
    pub uuid: Uuid,
    pub characteristics: BTreeSet<CharacteristicDescription>,
}

/// The type of write operation to use, matching §4.1's `{response|no_response}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// An open connection to one peripheral. Dropping the last clone does not
/// implicitly disconnect — callers call `disconnect` explicitly so the
/// session state machine always observes the transition.
#[async_trait::async_trait]
pub trait GattConnection: Send + Sync {
    async fn discover_services(&self) -> Result<Vec<ServiceDescription>, TransportError>;

    async fn write(
        &self,
        char_uuid: Uuid,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError>;

    async fn read(&self, char_uuid: Uuid) -> Result<Vec<u8>, TransportError>;

    /// Subscribes to notifications on `char_uuid`. Per §4.1's ordering
    /// guarantee, buffers from this stream arrive in the order the device
    /// sent them; there is no ordering guarantee across two different
    /// characteristics' streams.
    async fn subscribe(&self, char_uuid: Uuid) -> Result<BoxStream<Vec<u8>>, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Resolves once, when the transport observes the peripheral disconnect
    /// (whether requested locally or dropped by the remote side).
    async fn disconnected(&self) -> BoxStream<()>;
}

/// The GATT transport adapter contract (§4.1). A session never talks to a
/// concrete BLE stack directly — only through this trait — which is what
/// lets `mock` stand in for real hardware in tests.
#[async_trait::async_trait]
pub trait GattTransport: Send + Sync {
    /// Scans for nearby peripherals for `duration`, then the returned stream
    /// ends.
    async fn scan(&self, duration: Duration) -> Result<BoxStream<Advertisement>, TransportError>;

    async fn connect(
        &self,
        address: BDAddr,
    ) -> Result<Box<dyn GattConnection>, TransportError>;
}
