//! A completed drawing as reconstructed by the assembler (spec §3, §4.4).

use crate::bdaddr::BDAddr;

/// One decoded point of pen-down travel.
///
/// `position` and `pressure` are `None` exactly when the wire frame carried
/// no value for that axis at this point — unknown axes are omitted, never
/// zero-filled (§3). Internally the assembler still tracks a running
/// absolute reference for each axis so later deltas decode correctly; that
/// running value is not itself re-emitted on a point that didn't carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub toffset_ms: u32,
    /// (x, y) in micrometers, post sensor-rotation, 0,0 at the tablet's
    /// top-left as held in drawing orientation.
    pub position: Option<(i64, i64)>,
    /// Clamped to `[0, 65535]` by the assembler before being stored here.
    pub pressure: Option<u16>,
}

/// A pen-down-to-pen-up run of points. The first `Point` of a non-empty
/// stroke always carries an absolute position (§3 invariant).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stroke {
    pub points: Vec<Point>,
}

impl Stroke {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// A complete drawing fetched or streamed from a device.
#[derive(Debug, Clone)]
pub struct Drawing {
    pub device_address: BDAddr,
    pub device_name: String,
    /// Random opaque string, debug only — never parsed, never compared for
    /// equality of meaning, just carried through to the JSON form (§3).
    pub session_id: String,
    /// (width_um, height_um) of the sensor, in drawing orientation (i.e.
    /// already accounting for the family's sensor rotation).
    pub dimensions: (u32, u32),
    /// Seconds since the epoch, as reported by the device at drawing close
    /// and used as the JSON `timestamp` / object-path suffix (§6).
    pub timestamp: u64,
    pub strokes: Vec<Stroke>,
}

impl Drawing {
    /// `true` if every point in every stroke with a known `toffset_ms` is
    /// non-decreasing relative to the previous point with a known value,
    /// within that stroke (§3's time-offset invariant).
    pub fn times_monotonic(&self) -> bool {
        self.strokes.iter().all(|s| {
            s.points
                .windows(2)
                .all(|w| w[1].toffset_ms >= w[0].toffset_ms)
        })
    }
}
