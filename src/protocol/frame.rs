//! Command/response framing and notify-channel reassembly.
//!
//! Commands, and the bulk-channel data opcodes (`AckData`/`EndOfDrawing`),
//! are framed `[opcode:1][length:1][payload:length]`. Every other
//! notification is a response to a command the session just issued, framed
//! `[opcode:1][status:1][length:1][payload:length]`. [`Reassembler`]
//! distinguishes the two by opcode and undoes the BLE stack's 20-byte
//! chunking before a frame is handed to the rest of the codec.

use super::family::{opcodes, status};
use crate::error::{Error, Result};

pub fn encode_command(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(opcode);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out
}

fn is_bulk_data_opcode(opcode: u8) -> bool {
    matches!(opcode, opcodes::ACK_DATA | opcodes::END_OF_DRAWING)
}

/// One reassembled notify-channel frame. `status` is `None` for bulk-data
/// frames (they carry no status byte) and `Some` for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub status: Option<u8>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Maps a non-success status byte to the matching `Error` variant.
    /// Bulk-data frames (no status byte) always check `Ok`.
    pub fn check(&self) -> Result<()> {
        match self.status {
            None | Some(status::SUCCESS) => Ok(()),
            Some(status::BUSY) => Err(Error::Busy),
            Some(status::NOT_AUTHORIZED) => Err(Error::NotAuthorized),
            Some(status::NOT_READY) => Err(Error::NotReady),
            Some(status::PROTOCOL_ERROR) => Err(Error::Protocol(format!(
                "device reported protocol error for opcode {:#04x}",
                self.opcode
            ))),
            Some(other) => Err(Error::Protocol(format!(
                "unknown response status {:#04x} for opcode {:#04x}",
                other, self.opcode
            ))),
        }
    }
}

/// Reassembles whole frames out of a stream of raw notification chunks,
/// some of which may split one frame across multiple BLE writes of up to
/// 20 bytes.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if a frame header has been seen but the frame isn't complete
    /// yet — the caller is waiting on more bytes of an already-started
    /// frame, not on a fresh one.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Feeds one raw notification buffer in and returns every whole frame
    /// that can now be extracted, in arrival order. Incomplete trailing
    /// bytes are retained for the next chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if self.buf.is_empty() {
                break;
            }
            let opcode = self.buf[0];
            let bulk = is_bulk_data_opcode(opcode);
            let header_len = if bulk { 2 } else { 3 };
            if self.buf.len() < header_len {
                break;
            }
            let length = self.buf[header_len - 1] as usize;
            let total = header_len + length;
            if self.buf.len() < total {
                break;
            }
            let status = if bulk { None } else { Some(self.buf[1]) };
            let payload = self.buf[header_len..total].to_vec();
            self.buf.drain(0..total);
            frames.push(Frame {
                opcode,
                status,
                payload,
            });
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_bulk_chunk() {
        let bytes = encode_command(opcodes::ACK_DATA, &[1, 2, 3]);
        let mut r = Reassembler::new();
        let frames = r.feed(&bytes).unwrap();
        assert_eq!(
            frames,
            vec![Frame {
                opcode: opcodes::ACK_DATA,
                status: None,
                payload: vec![1, 2, 3]
            }]
        );
    }

    #[test]
    fn reassembles_across_20_byte_chunks() {
        let payload: Vec<u8> = (0..40u8).collect();
        let bytes = encode_command(opcodes::ACK_DATA, &payload);
        let mut r = Reassembler::new();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(20) {
            frames.extend(r.feed(chunk).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, payload);
    }

    #[test]
    fn two_bulk_frames_back_to_back() {
        let mut bytes = encode_command(opcodes::ACK_DATA, &[1]);
        bytes.extend(encode_command(opcodes::END_OF_DRAWING, &[]));
        let mut r = Reassembler::new();
        let frames = r.feed(&bytes).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].opcode, opcodes::END_OF_DRAWING);
    }

    #[test]
    fn response_length_mismatch_waits_for_more_bytes() {
        // [opcode][status][length=5][two bytes of payload] — not yet whole.
        let mut r = Reassembler::new();
        let frames = r.feed(&[0xb9, 0x00, 0x05, 0x01, 0x02]).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn response_status_maps_to_error() {
        let mut r = Reassembler::new();
        let frames = r.feed(&[0xe7, 0x03, 0x00]).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0].check(), Err(Error::NotReady)));
    }
}
