//! The virtual-input sink (§1's "external collaborator", §4.3 "Live mode",
//! §6 "Virtual-input stream").
//!
//! Writes kernel UHID event frames directly to the file descriptor passed
//! to `StartLive`, following the packed `struct uhid_event` ABI from
//! `linux/uhid.h`: a 4-byte native-endian event type directly followed by
//! the union (no inter-field padding — the struct is
//! `__attribute__((__packed__))`). This implementation only ever emits
//! `UHID_INPUT2` (type 12) frames: `{ size: u16, data: [u8; UHID_DATA_MAX] }`,
//! each carrying one decoded Point's X/Y/pressure as a 6-byte little-endian
//! report at the front of `data`.

use crate::model::drawing::Point;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

const UHID_INPUT2: u32 = 12;
const UHID_DATA_MAX: usize = 4096;
const REPORT_SIZE: usize = 6;

/// The external collaborator §1 calls a "virtual-input sink": accepts a
/// structured pen-event stream and a file-descriptor-like destination.
pub trait LiveSink: Send + Sync {
    fn write_point(&self, point: &Point) -> io::Result<()>;
}

/// Writes `UHID_INPUT2` frames to the file descriptor passed to `StartLive`.
/// Owns the descriptor: the caller hands it `fd` for the lifetime of the
/// live session, so it must not be closed until this sink is dropped.
pub struct UhidSink {
    fd: OwnedFd,
}

impl UhidSink {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let ret =
            unsafe { libc::write(self.fd.as_raw_fd(), frame.as_ptr() as *const _, frame.len()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl LiveSink for UhidSink {
    fn write_point(&self, point: &Point) -> io::Result<()> {
        let (x, y) = point.position.unwrap_or((0, 0));
        let pressure = point.pressure.unwrap_or(0);

        let mut data = [0u8; UHID_DATA_MAX];
        data[0..2].copy_from_slice(&(x as i16 as u16).to_le_bytes());
        data[2..4].copy_from_slice(&(y as i16 as u16).to_le_bytes());
        data[4..6].copy_from_slice(&pressure.to_le_bytes());

        let mut frame = Vec::with_capacity(6 + UHID_DATA_MAX);
        frame.extend_from_slice(&UHID_INPUT2.to_ne_bytes());
        frame.extend_from_slice(&(REPORT_SIZE as u16).to_ne_bytes());
        frame.extend_from_slice(&data);
        self.write_frame(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;
    use std::os::unix::net::UnixStream;

    fn socket_pair() -> (OwnedFd, UnixStream) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        unsafe {
            (
                OwnedFd::from_raw_fd(fds[0]),
                UnixStream::from_raw_fd(fds[1]),
            )
        }
    }

    #[test]
    fn write_point_emits_uhid_input2_header() {
        let (writer, mut reader) = socket_pair();
        let sink = UhidSink::new(writer);
        sink.write_point(&Point {
            toffset_ms: 0,
            position: Some((10, 20)),
            pressure: Some(500),
        })
        .unwrap();

        use std::io::Read;
        let mut buf = [0u8; 6 + UHID_DATA_MAX];
        reader.read_exact(&mut buf).unwrap();
        let event_type = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(event_type, UHID_INPUT2);
        let size = u16::from_ne_bytes(buf[4..6].try_into().unwrap());
        assert_eq!(size, REPORT_SIZE as u16);
        let data_start = 6;
        assert_eq!(&buf[data_start..data_start + 2], &10u16.to_le_bytes());
        assert_eq!(&buf[data_start + 2..data_start + 4], &20u16.to_le_bytes());
        assert_eq!(&buf[data_start + 4..data_start + 6], &500u16.to_le_bytes());
    }
}
