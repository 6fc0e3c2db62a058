//! Merges decoded strokes into a normalized `Drawing` (§4.4): applies sensor
//! rotation, clamps pressure, and assigns the drawing a timestamp unique to
//! its device for the life of the process (§3).

use crate::bdaddr::BDAddr;
use crate::model::drawing::{Drawing, Point, Stroke};
use crate::model::Family;
use crate::protocol::family::protocol_for;
use dashmap::DashMap;
use std::collections::HashSet;

/// Tracks, per device, every timestamp already handed out this run so a
/// colliding fetch gets bumped forward one second at a time instead of
/// silently overwriting an earlier Drawing (§3's uniqueness invariant).
#[derive(Default)]
pub struct DrawingAssembler {
    used_timestamps: DashMap<BDAddr, HashSet<u64>>,
}

impl DrawingAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn reserve_timestamp(&self, address: BDAddr, proposed: u64) -> u64 {
        let mut used = self.used_timestamps.entry(address).or_default();
        let mut ts = proposed;
        while used.contains(&ts) {
            ts += 1;
        }
        used.insert(ts);
        ts
    }

    /// Builds a `Drawing` from the strokes a `PenDataDecoder` produced for
    /// one fetch or live session, rotating coordinates for families whose
    /// sensor is physically rotated relative to drawing orientation and
    /// clamping every pressure value into range.
    pub fn assemble(
        &self,
        address: BDAddr,
        device_name: String,
        family: Family,
        dimensions: (u32, u32),
        base_timestamp: u64,
        session_id: String,
        strokes: Vec<Stroke>,
    ) -> Drawing {
        let rotate = protocol_for(family).rotates_sensor();
        let width = dimensions.0 as i64;

        let strokes = strokes
            .into_iter()
            .map(|s| Stroke {
                points: s
                    .points
                    .into_iter()
                    .map(|p| normalize_point(p, rotate, width))
                    .collect(),
            })
            .collect();

        let timestamp = self.reserve_timestamp(address, base_timestamp);

        Drawing {
            device_address: address,
            device_name,
            session_id,
            dimensions,
            timestamp,
            strokes,
        }
    }
}

fn normalize_point(mut p: Point, rotate: bool, width: i64) -> Point {
    if rotate {
        if let Some((x, y)) = p.position {
            p.position = Some((y, width - x));
        }
    }
    if let Some(pressure) = p.pressure {
        p.pressure = Some(pressure.min(u16::MAX));
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> BDAddr {
        "00:11:22:33:44:55".parse().unwrap()
    }

    fn one_point_stroke(x: i64, y: i64) -> Vec<Stroke> {
        vec![Stroke {
            points: vec![Point {
                toffset_ms: 0,
                position: Some((x, y)),
                pressure: Some(1000),
            }],
        }]
    }

    #[test]
    fn rotates_spark_and_slate() {
        let a = DrawingAssembler::new();
        let d = a.assemble(
            addr(),
            "pad".into(),
            Family::Slate,
            (1000, 500),
            1,
            "s".into(),
            one_point_stroke(100, 200),
        );
        assert_eq!(d.strokes[0].points[0].position, Some((200, 900)));
    }

    #[test]
    fn intuos_pro_is_not_rotated() {
        let a = DrawingAssembler::new();
        let d = a.assemble(
            addr(),
            "pad".into(),
            Family::IntuosPro,
            (1000, 500),
            1,
            "s".into(),
            one_point_stroke(100, 200),
        );
        assert_eq!(d.strokes[0].points[0].position, Some((100, 200)));
    }

    #[test]
    fn colliding_timestamps_bump_forward() {
        let a = DrawingAssembler::new();
        let d1 = a.assemble(addr(), "pad".into(), Family::Spark, (1, 1), 100, "s1".into(), vec![]);
        let d2 = a.assemble(addr(), "pad".into(), Family::Spark, (1, 1), 100, "s2".into(), vec![]);
        let d3 = a.assemble(addr(), "pad".into(), Family::Spark, (1, 1), 100, "s3".into(), vec![]);
        assert_eq!(d1.timestamp, 100);
        assert_eq!(d2.timestamp, 101);
        assert_eq!(d3.timestamp, 102);
    }

    #[test]
    fn different_devices_do_not_share_the_collision_set() {
        let a = DrawingAssembler::new();
        let other: BDAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let d1 = a.assemble(addr(), "pad".into(), Family::Spark, (1, 1), 100, "s1".into(), vec![]);
        let d2 = a.assemble(other, "pad2".into(), Family::Spark, (1, 1), 100, "s2".into(), vec![]);
        assert_eq!(d1.timestamp, 100);
        assert_eq!(d2.timestamp, 100);
    }
}
