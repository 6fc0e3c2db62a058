//! The JSON v1 wire format (§6) and its conversions to/from [`Drawing`].
//!
//! Serialization never zero-fills an absent axis; deserialization ignores
//! unknown point fields by construction (`serde` drops fields it doesn't
//! know about unless `deny_unknown_fields` is set, and we deliberately never
//! set it here).

use super::drawing::{Drawing, Point, Stroke};
use crate::bdaddr::BDAddr;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct DrawingV1 {
    pub version: u32,
    pub devicename: String,
    pub sessionid: String,
    pub dimensions: (u32, u32),
    pub timestamp: u64,
    pub strokes: Vec<StrokeV1>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StrokeV1 {
    pub points: Vec<PointV1>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PointV1 {
    pub toffset: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<(i64, i64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<u32>,
}

impl From<&Drawing> for DrawingV1 {
    fn from(d: &Drawing) -> Self {
        DrawingV1 {
            version: CURRENT_VERSION,
            devicename: d.device_name.clone(),
            sessionid: d.session_id.clone(),
            dimensions: d.dimensions,
            timestamp: d.timestamp,
            strokes: d
                .strokes
                .iter()
                .map(|s| StrokeV1 {
                    points: s
                        .points
                        .iter()
                        .map(|p| PointV1 {
                            toffset: p.toffset_ms,
                            position: p.position,
                            pressure: p.pressure.map(u32::from),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// `address` is supplied by the caller: the JSON form doesn't carry it (it's
/// implied by the object path / file the caller fetched it from).
pub fn drawing_from_v1(v1: DrawingV1, address: BDAddr) -> Result<Drawing> {
    if v1.version != CURRENT_VERSION {
        return Err(Error::Protocol(format!(
            "unsupported JSON data version {}",
            v1.version
        )));
    }
    Ok(Drawing {
        device_address: address,
        device_name: v1.devicename,
        session_id: v1.sessionid,
        dimensions: v1.dimensions,
        timestamp: v1.timestamp,
        strokes: v1
            .strokes
            .into_iter()
            .map(|s| Stroke {
                points: s
                    .points
                    .into_iter()
                    .map(|p| Point {
                        toffset_ms: p.toffset,
                        position: p.position,
                        pressure: p.pressure.map(|v| v.min(u16::MAX as u32) as u16),
                    })
                    .collect(),
            })
            .collect(),
    })
}

pub fn to_json_string(d: &Drawing) -> Result<String> {
    Ok(serde_json::to_string(&DrawingV1::from(d))?)
}

pub fn from_json_str(s: &str, address: BDAddr) -> Result<Drawing> {
    let v1: DrawingV1 = serde_json::from_str(s)?;
    drawing_from_v1(v1, address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::drawing::{Point, Stroke};

    fn sample() -> Drawing {
        Drawing {
            device_address: "00:11:22:33:44:55".parse().unwrap(),
            device_name: "Bamboo Slate".into(),
            session_id: "abc123".into(),
            dimensions: (21590, 13970),
            timestamp: 1_700_000_000,
            strokes: vec![Stroke {
                points: vec![
                    Point {
                        toffset_ms: 0,
                        position: Some((100, 200)),
                        pressure: Some(1000),
                    },
                    Point {
                        toffset_ms: 2,
                        position: None,
                        pressure: Some(800),
                    },
                ],
            }],
        }
    }

    #[test]
    fn round_trip() {
        let d = sample();
        let json = to_json_string(&d).unwrap();
        let back = from_json_str(&json, d.device_address).unwrap();
        assert_eq!(back.device_name, d.device_name);
        assert_eq!(back.session_id, d.session_id);
        assert_eq!(back.dimensions, d.dimensions);
        assert_eq!(back.timestamp, d.timestamp);
        assert_eq!(back.strokes.len(), d.strokes.len());
        assert_eq!(back.strokes[0].points, d.strokes[0].points);
    }

    #[test]
    fn omits_absent_position() {
        let d = sample();
        let json = to_json_string(&d).unwrap();
        let second_point_line = json
            .lines()
            .collect::<String>();
        // the second point has no position, first does
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        let points = &v["strokes"][0]["points"];
        assert!(points[0].get("position").is_some());
        assert!(points[1].get("position").is_none());
        let _ = second_point_line;
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let json = r#"{
            "version": 1,
            "devicename": "x",
            "sessionid": "y",
            "dimensions": [1,2],
            "timestamp": 5,
            "strokes": [{"points": [{"toffset": 0, "position": [1,2], "pressure": 3, "bogus": true}]}]
        }"#;
        let addr: BDAddr = "00:11:22:33:44:55".parse().unwrap();
        let d = from_json_str(json, addr).unwrap();
        assert_eq!(d.strokes[0].points[0].pressure, Some(3));
    }
}
