//! The one error type that crosses module boundaries.

use thiserror::Error;

/// Errors produced while driving a SmartPad session.
///
/// Variants map 1:1 onto the error taxonomy of the RPC surface (§7): each has
/// a POSIX-style errno used as the return value of the fallible `Device` and
/// `Manager` methods.
#[derive(Debug, Error)]
pub enum Error {
    /// The daemon is already performing this operation for another client.
    #[error("operation already in progress for this device")]
    Busy,

    /// The device is in the wrong mode for the requested operation (e.g.
    /// `Register` while the device isn't in pairing mode).
    #[error("device is not ready for this operation")]
    NotReady,

    /// The registration UUID was rejected by the device.
    #[error("not authorized by device")]
    NotAuthorized,

    /// A frame failed to parse, or an opcode arrived that the state machine
    /// did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A suspension point (connect, read, write, subscribe, button-press or
    /// auth wait) exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The transport disconnected mid-operation.
    #[error("transport lost")]
    TransportLost,

    /// The device's advertised services don't match any known SmartPad family.
    #[error("unsupported device")]
    UnsupportedDevice,

    /// No device is known for the given address.
    #[error("no such device")]
    NotFound,

    /// Error from the GATT transport adapter.
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Error persisting or loading the registration-UUID store.
    #[error("persistent store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Address(#[from] crate::bdaddr::ParseBDAddrError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The negative POSIX-style errno the RPC surface returns to clients.
    ///
    /// Every method in §6 that returns `int32` returns `0` on success and one
    /// of these on failure.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Busy => -libc::EAGAIN,
            Error::NotReady => -libc::EBADE,
            Error::NotAuthorized => -libc::EACCES,
            Error::Protocol(_) => -libc::EPROTO,
            Error::Timeout => -libc::ETIME,
            Error::TransportLost => -libc::ENODEV,
            Error::UnsupportedDevice => -libc::ENODEV,
            Error::NotFound => -libc::ENOENT,
            Error::Transport(_) => -libc::ENODEV,
            Error::Store(_) => -libc::EIO,
            Error::Io(_) => -libc::EIO,
            Error::Json(_) => -libc::EINVAL,
            Error::Address(_) => -libc::EINVAL,
        }
    }
}
