//! Pen-data packet decoding (§4.2 "Pen-data encoding").
//!
//! A stream of reassembled bulk-channel frame payloads is fed in as it
//! arrives; this module turns it into `Stroke`s of `Point`s. It owns the
//! running absolute reference (time/position/pressure) a delta-encoded
//! packet decodes against, and the invariant that a delta before any
//! absolute point in a stroke is a protocol error.
//!
//! Packet types:
//! - `0xff`: stroke delimiter.
//! - `0xfa`: absolute point, all four fields as 16-bit LE values.
//! - `0xfb`: absolute point, `[bitmap:1]` then a 16-bit LE value per bitmap
//!   bit set (bit0 time, bit1 x, bit2 y, bit3 pressure).
//! - `0x00..=0x7f`: delta point. Bit layout (MSB to bit0):
//!   `0 tp ps pr tw xw yw pw` — `tp`/`ps`/`pr` gate whether a time/position/
//!   pressure delta follows at all; `tw`/`xw`/`yw`/`pw` select 16-bit (1) vs
//!   8-bit (0) width for whichever of those fields is present. Fields are
//!   read in order: time, x, y, pressure. Deltas are two's-complement and
//!   sign-extended before being added to the running reference.

use crate::error::{Error, Result};
use crate::model::drawing::{Point, Stroke};

const STROKE_DELIMITER: u8 = 0xff;
const ABS_FULL: u8 = 0xfa;
const ABS_PARTIAL: u8 = 0xfb;

const MASK_TIME_PRESENT: u8 = 0x40;
const MASK_POSITION_PRESENT: u8 = 0x20;
const MASK_PRESSURE_PRESENT: u8 = 0x10;
const MASK_TIME_WIDE: u8 = 0x08;
const MASK_X_WIDE: u8 = 0x04;
const MASK_Y_WIDE: u8 = 0x02;
const MASK_PRESSURE_WIDE: u8 = 0x01;

const BITMAP_TIME: u8 = 0x01;
const BITMAP_X: u8 = 0x02;
const BITMAP_Y: u8 = 0x04;
const BITMAP_PRESSURE: u8 = 0x08;

fn read_u16_le(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

fn read_delta(buf: &[u8], wide: bool) -> (i64, usize) {
    if wide {
        (i16::from_le_bytes([buf[0], buf[1]]) as i64, 2)
    } else {
        (buf[0] as i8 as i64, 1)
    }
}

#[derive(Debug, Default)]
pub struct PenDataDecoder {
    buf: Vec<u8>,
    time_ms: u32,
    position: Option<(i64, i64)>,
    pressure: Option<u16>,
    current: Stroke,
    strokes: Vec<Stroke>,
}

impl PenDataDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a reassembled `0xca` frame payload and decodes as many whole
    /// pen-data packets as are available.
    pub fn feed(&mut self, payload: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(payload);
        loop {
            match self.try_parse_one()? {
                Some(consumed) => {
                    self.buf.drain(0..consumed);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Call on the `0xc8` (EndOfDrawing) frame. Closes the in-progress
    /// stroke (if any) and returns every stroke decoded so far, resetting
    /// internal state for the next drawing.
    pub fn finish(&mut self) -> Vec<Stroke> {
        if !self.current.is_empty() {
            self.strokes.push(std::mem::take(&mut self.current));
        }
        std::mem::take(&mut self.strokes)
    }

    fn try_parse_one(&mut self) -> Result<Option<usize>> {
        let Some(&ty) = self.buf.first() else {
            return Ok(None);
        };

        if ty == STROKE_DELIMITER {
            if !self.current.is_empty() {
                self.strokes.push(std::mem::take(&mut self.current));
            }
            self.position = None;
            self.pressure = None;
            return Ok(Some(1));
        }

        if ty == ABS_FULL {
            if self.buf.len() < 9 {
                return Ok(None);
            }
            let t = read_u16_le(&self.buf[1..3]);
            let x = read_u16_le(&self.buf[3..5]);
            let y = read_u16_le(&self.buf[5..7]);
            let p = read_u16_le(&self.buf[7..9]);
            self.time_ms = t as u32;
            self.position = Some((x as i64, y as i64));
            self.pressure = Some(p);
            self.current.points.push(Point {
                toffset_ms: self.time_ms,
                position: self.position,
                pressure: self.pressure,
            });
            return Ok(Some(9));
        }

        if ty == ABS_PARTIAL {
            if self.buf.len() < 2 {
                return Ok(None);
            }
            let bitmap = self.buf[1];
            let needed = 2
                + [BITMAP_TIME, BITMAP_X, BITMAP_Y, BITMAP_PRESSURE]
                    .iter()
                    .filter(|b| bitmap & **b != 0)
                    .count()
                    * 2;
            if self.buf.len() < needed {
                return Ok(None);
            }
            let mut cursor = 2;
            let mut emitted_position = false;
            let mut emitted_pressure = false;
            let (mut x, mut y) = self.position.unwrap_or((0, 0));
            if bitmap & BITMAP_TIME != 0 {
                self.time_ms = read_u16_le(&self.buf[cursor..cursor + 2]) as u32;
                cursor += 2;
            }
            if bitmap & BITMAP_X != 0 {
                x = read_u16_le(&self.buf[cursor..cursor + 2]) as i64;
                cursor += 2;
                emitted_position = true;
            }
            if bitmap & BITMAP_Y != 0 {
                y = read_u16_le(&self.buf[cursor..cursor + 2]) as i64;
                cursor += 2;
                emitted_position = true;
            }
            if bitmap & BITMAP_PRESSURE != 0 {
                self.pressure = Some(read_u16_le(&self.buf[cursor..cursor + 2]));
                cursor += 2;
                emitted_pressure = true;
            }
            if emitted_position {
                self.position = Some((x, y));
            }
            self.current.points.push(Point {
                toffset_ms: self.time_ms,
                position: emitted_position.then_some((x, y)),
                pressure: emitted_pressure.then_some(self.pressure.unwrap_or(0)),
            });
            return Ok(Some(needed));
        }

        if ty <= 0x7f {
            let time_present = ty & MASK_TIME_PRESENT != 0;
            let position_present = ty & MASK_POSITION_PRESENT != 0;
            let pressure_present = ty & MASK_PRESSURE_PRESENT != 0;
            let time_wide = ty & MASK_TIME_WIDE != 0;
            let x_wide = ty & MASK_X_WIDE != 0;
            let y_wide = ty & MASK_Y_WIDE != 0;
            let pressure_wide = ty & MASK_PRESSURE_WIDE != 0;

            let mut needed = 1;
            if time_present {
                needed += if time_wide { 2 } else { 1 };
            }
            if position_present {
                needed += if x_wide { 2 } else { 1 };
                needed += if y_wide { 2 } else { 1 };
            }
            if pressure_present {
                needed += if pressure_wide { 2 } else { 1 };
            }
            if self.buf.len() < needed {
                return Ok(None);
            }

            let mut cursor = 1;
            if time_present {
                let (delta, n) = read_delta(&self.buf[cursor..], time_wide);
                cursor += n;
                self.time_ms = (self.time_ms as i64 + delta).max(0) as u32;
            }
            if position_present {
                let Some((px, py)) = self.position else {
                    return Err(Error::Protocol(
                        "position delta before any absolute point in stroke".into(),
                    ));
                };
                let (dx, n) = read_delta(&self.buf[cursor..], x_wide);
                cursor += n;
                let (dy, n) = read_delta(&self.buf[cursor..], y_wide);
                cursor += n;
                self.position = Some((px + dx, py + dy));
            }
            if pressure_present {
                let Some(pr) = self.pressure else {
                    return Err(Error::Protocol(
                        "pressure delta before any absolute point in stroke".into(),
                    ));
                };
                let (dp, n) = read_delta(&self.buf[cursor..], pressure_wide);
                cursor += n;
                let clamped = (pr as i64 + dp).clamp(0, u16::MAX as i64) as u16;
                self.pressure = Some(clamped);
            }
            let _ = cursor;

            self.current.points.push(Point {
                toffset_ms: self.time_ms,
                position: position_present.then_some(self.position.unwrap()),
                pressure: pressure_present.then_some(self.pressure.unwrap()),
            });
            return Ok(Some(needed));
        }

        Err(Error::Protocol(format!(
            "unrecognized pen-data packet type {ty:#04x}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_byte(time: bool, pos: bool, pressure: bool, tw: bool, xw: bool, yw: bool, pw: bool) -> u8 {
        let mut b = 0u8;
        if time {
            b |= MASK_TIME_PRESENT;
        }
        if pos {
            b |= MASK_POSITION_PRESENT;
        }
        if pressure {
            b |= MASK_PRESSURE_PRESENT;
        }
        if tw {
            b |= MASK_TIME_WIDE;
        }
        if xw {
            b |= MASK_X_WIDE;
        }
        if yw {
            b |= MASK_Y_WIDE;
        }
        if pw {
            b |= MASK_PRESSURE_WIDE;
        }
        b
    }

    #[test]
    fn one_stroke_two_points_position_inherited() {
        let mut dec = PenDataDecoder::new();
        dec.feed(&[STROKE_DELIMITER]).unwrap();
        dec.feed(&[ABS_FULL, 0, 0, 100, 0, 200, 0, 1000, 0])
            .unwrap();
        // time +2 (8-bit), pressure -200 (16-bit, since -200 doesn't fit i8)
        let mask = mask_byte(true, false, true, false, false, false, true);
        let mut payload = vec![mask, 2];
        payload.extend_from_slice(&(-200i16).to_le_bytes());
        dec.feed(&payload).unwrap();
        let strokes = dec.finish();

        assert_eq!(strokes.len(), 1);
        let points = &strokes[0].points;
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].toffset_ms, 0);
        assert_eq!(points[0].position, Some((100, 200)));
        assert_eq!(points[0].pressure, Some(1000));
        assert_eq!(points[1].toffset_ms, 2);
        assert_eq!(points[1].position, None);
        assert_eq!(points[1].pressure, Some(800));
    }

    #[test]
    fn delta_before_absolute_is_protocol_error() {
        let mut dec = PenDataDecoder::new();
        let mask = mask_byte(false, true, false, false, false, false, false);
        let err = dec.feed(&[mask, 1, 1]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn stroke_delimiter_does_not_reset_time_counter() {
        let mut dec = PenDataDecoder::new();
        dec.feed(&[ABS_FULL, 10, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        dec.feed(&[STROKE_DELIMITER]).unwrap();
        dec.feed(&[ABS_FULL, 20, 0, 1, 0, 1, 0, 1, 0]).unwrap();
        let strokes = dec.finish();
        assert_eq!(strokes.len(), 2);
        assert_eq!(strokes[1].points[0].toffset_ms, 20);
    }

    #[test]
    fn feed_across_chunk_boundary() {
        let mut dec = PenDataDecoder::new();
        let full = [ABS_FULL, 0, 0, 5, 0, 6, 0, 7, 0];
        dec.feed(&full[..4]).unwrap();
        dec.feed(&full[4..]).unwrap();
        let strokes = dec.finish();
        assert_eq!(strokes.len(), 1);
        assert_eq!(strokes[0].points[0].position, Some((5, 6)));
    }
}
