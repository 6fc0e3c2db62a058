//! The per-device session protocol: the GATT state machine that drives
//! registration, reconnection, authenticated negotiation, command/response
//! exchange, and fetch/listen/live flows. A `DeviceSession` is driven by the
//! supervisor; it owns one `GattConnection` for the duration of one
//! connected episode and returns to `Disconnected` when that episode ends,
//! however it ends.

use crate::assembler::DrawingAssembler;
use crate::bdaddr::BDAddr;
use crate::error::{Error, Result};
use crate::live::LiveSink;
use crate::model::drawing::Drawing;
use crate::model::{Family, RegistrationUuid};
use crate::protocol::family::{opcodes, uuids, FamilyProtocol};
use crate::protocol::{encode_command, Frame, PenDataDecoder, Reassembler};
use crate::transport::{BoxStream, GattConnection, GattTransport, WriteKind};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const BUTTON_PRESS_TIMEOUT: Duration = Duration::from_secs(10);
pub const AUTH_ACK_TIMEOUT: Duration = Duration::from_secs(10);
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `NotifyReader::next_frame` waits for the rest of an
/// already-started frame before giving up on it as corrupt, instead of the
/// caller's full deadline. A device that begins a frame and then goes
/// silent mid-frame isn't "still thinking" the way a device that hasn't
/// responded at all might be — a malformed length byte means no further
/// bytes are ever coming, and waiting out the full deadline would report
/// that as a timeout rather than what it actually is.
const FRAME_STALL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ServicesResolved,
    AuthPending,
    Ready,
    Busy(BusyKind),
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyKind {
    FetchingDrawing,
    Live,
    BatteryRead,
    Registering,
}

/// Pulls raw notification chunks off a subscribed characteristic stream and
/// reassembles them into whole frames, one at a time, each bounded by a
/// caller-supplied deadline.
pub(crate) struct NotifyReader {
    stream: BoxStream<Vec<u8>>,
    reassembler: Reassembler,
    pending: std::collections::VecDeque<Frame>,
}

impl NotifyReader {
    pub(crate) fn new(stream: BoxStream<Vec<u8>>) -> Self {
        Self {
            stream,
            reassembler: Reassembler::new(),
            pending: std::collections::VecDeque::new(),
        }
    }

    pub(crate) async fn next_frame(&mut self, deadline: Duration) -> Result<Frame> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(frame);
        }
        loop {
            let wait = if self.reassembler.has_partial() {
                FRAME_STALL_TIMEOUT.min(deadline)
            } else {
                deadline
            };
            let chunk = tokio::time::timeout(wait, self.stream.next())
                .await
                .map_err(|_| {
                    if self.reassembler.has_partial() {
                        Error::Protocol("notify channel stalled mid-frame".into())
                    } else {
                        Error::Timeout
                    }
                })?
                .ok_or(Error::TransportLost)?;
            let mut frames = self.reassembler.feed(&chunk)?;
            if frames.is_empty() {
                continue;
            }
            let first = frames.remove(0);
            self.pending.extend(frames);
            return Ok(first);
        }
    }

    async fn next_frame_matching(&mut self, opcode: u8, deadline: Duration) -> Result<Frame> {
        let frame = self.next_frame(deadline).await?;
        if frame.opcode != opcode {
            return Err(Error::Protocol(format!(
                "expected response to opcode {opcode:#04x}, got {:#04x}",
                frame.opcode
            )));
        }
        Ok(frame)
    }
}

/// Everything the session protocol needs about one connected device for the
/// duration of one episode.
pub struct DeviceSession {
    pub address: BDAddr,
    protocol: Box<dyn FamilyProtocol + Send + Sync>,
    transport: Arc<dyn GattTransport>,
    pub state: SessionState,
}

impl DeviceSession {
    pub fn new(address: BDAddr, family: Family, transport: Arc<dyn GattTransport>) -> Self {
        Self {
            address,
            protocol: crate::protocol::protocol_for(family),
            transport,
            state: SessionState::Disconnected,
        }
    }

    pub fn family(&self) -> Family {
        self.protocol.tag()
    }

    /// `Disconnected → Connecting → ServicesResolved`: connects and checks
    /// that the device exposes the vendor service this family expects.
    async fn connect_and_resolve(&mut self) -> Result<Box<dyn GattConnection>> {
        self.state = SessionState::Connecting;
        let conn = self.transport.connect(self.address).await.map_err(|e| {
            self.state = SessionState::Disconnected;
            Error::from(e)
        })?;

        let services = conn.discover_services().await?;
        let has_vendor_service = services.iter().any(|s| s.uuid == uuids::VENDOR_SERVICE);
        if !has_vendor_service {
            self.state = SessionState::Disconnected;
            return Err(Error::UnsupportedDevice);
        }
        self.state = SessionState::ServicesResolved;
        Ok(conn)
    }

    /// `ServicesResolved → AuthPending → Ready`: writes the registration
    /// UUID to the write channel and waits for the auth-ack opcode
    /// (`UnknownE6`). On `NotAuthorized`, the caller decides whether to
    /// escalate to the registration sub-flow.
    async fn authenticate(
        &mut self,
        conn: &dyn GattConnection,
        notify: &mut NotifyReader,
        registration: RegistrationUuid,
    ) -> Result<()> {
        self.state = SessionState::AuthPending;
        conn.write(
            uuids::WRITE_CHAR,
            &encode_command(opcodes::ACK_E6, &registration),
            WriteKind::WithResponse,
        )
        .await?;
        let response = notify
            .next_frame_matching(opcodes::ACK_E6, AUTH_ACK_TIMEOUT)
            .await?;
        match response.check() {
            Ok(()) => {
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// The registration sub-flow: write `Register` + a fresh 16-byte UUID,
    /// wait for the button-press prompt or an explicit ack within
    /// `BUTTON_PRESS_TIMEOUT`.
    pub async fn register(
        &mut self,
        conn: &dyn GattConnection,
        notify: &mut NotifyReader,
    ) -> Result<RegistrationUuid> {
        self.state = SessionState::Busy(BusyKind::Registering);
        let uuid: RegistrationUuid = rand::random();
        conn.write(
            uuids::WRITE_CHAR,
            &encode_command(opcodes::REGISTER, &uuid),
            WriteKind::WithResponse,
        )
        .await?;
        let response = notify
            .next_frame_matching(opcodes::REGISTER, BUTTON_PRESS_TIMEOUT)
            .await?;
        match response.check() {
            Ok(()) => {
                self.state = SessionState::Ready;
                Ok(uuid)
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// The full `Connecting → Ready` path, escalating to registration when
    /// the device isn't authorized and `allow_register` is set (search
    /// mode); otherwise a `NotAuthorized` is surfaced and the connection
    /// dropped.
    pub async fn connect_ready(
        &mut self,
        registration: Option<RegistrationUuid>,
    ) -> Result<(Box<dyn GattConnection>, NotifyReader)> {
        let conn = self.connect_and_resolve().await?;
        let notify_stream = conn.subscribe(uuids::NOTIFY_CHAR).await?;
        let mut notify = NotifyReader::new(notify_stream);

        if let Some(uuid) = registration {
            self.authenticate(conn.as_ref(), &mut notify, uuid).await?;
        } else {
            self.state = SessionState::Ready;
        }
        Ok((conn, notify))
    }

    /// **Fetch flow**: `StartReading`, decode pen-data packets off
    /// the notify channel until `EndOfDrawing`, then `AckData` iff decoding
    /// succeeded. On decode failure the drawing is left on-device (no ack)
    /// and the error is returned; the caller disconnects.
    pub async fn fetch_drawing(
        &mut self,
        conn: &dyn GattConnection,
        notify: &mut NotifyReader,
        assembler: &DrawingAssembler,
        device_name: String,
        dimensions: (u32, u32),
        base_timestamp: u64,
    ) -> Result<Option<Drawing>> {
        self.state = SessionState::Busy(BusyKind::FetchingDrawing);
        conn.write(
            uuids::WRITE_CHAR,
            &encode_command(opcodes::START_READING, &[]),
            WriteKind::WithResponse,
        )
        .await?;

        let mut decoder = PenDataDecoder::new();
        let result = self.drain_fetch_frames(notify, &mut decoder).await;

        match result {
            Ok(true) => {
                let strokes = decoder.finish();
                let session_id = format!("{:016x}", rand::random::<u64>());
                let drawing = assembler.assemble(
                    self.address,
                    device_name,
                    self.family(),
                    dimensions,
                    base_timestamp,
                    session_id,
                    strokes,
                );
                conn.write(
                    uuids::WRITE_CHAR,
                    &encode_command(opcodes::ACK_DATA, &[]),
                    WriteKind::WithResponse,
                )
                .await?;
                self.state = SessionState::Ready;
                Ok(Some(drawing))
            }
            Ok(false) => {
                // Nothing was pending: device had no drawing queued.
                self.state = SessionState::Ready;
                Ok(None)
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Reads frames until `EndOfDrawing`, feeding `0xca` payloads to the
    /// decoder. Returns `Ok(true)` if any data was seen, `Ok(false)` if the
    /// device went straight to `EndOfDrawing` with nothing queued.
    async fn drain_fetch_frames(
        &self,
        notify: &mut NotifyReader,
        decoder: &mut PenDataDecoder,
    ) -> Result<bool> {
        let mut saw_data = false;
        loop {
            let frame = notify.next_frame(Duration::from_secs(30)).await?;
            match frame.opcode {
                opcodes::ACK_DATA => {
                    saw_data = true;
                    decoder.feed(&frame.payload)?;
                }
                opcodes::END_OF_DRAWING => return Ok(saw_data),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected opcode {other:#04x} during fetch"
                    )))
                }
            }
        }
    }

    /// **Live mode**: reconfigures the device to stream rather than buffer,
    /// then forwards every decoded Point to `sink` until the cancel signal
    /// fires or the transport disconnects. Live points are never appended
    /// to the device's drawing list.
    pub async fn run_live(
        &mut self,
        conn: &dyn GattConnection,
        notify: &mut NotifyReader,
        sink: &dyn LiveSink,
        mut cancel: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let opcode = self
            .protocol
            .live_opcode()
            .ok_or(Error::UnsupportedDevice)?;
        self.state = SessionState::Busy(BusyKind::Live);
        conn.write(
            uuids::WRITE_CHAR,
            &encode_command(opcode, &[1]),
            WriteKind::WithResponse,
        )
        .await?;

        let mut decoder = PenDataDecoder::new();
        let result = loop {
            tokio::select! {
                _ = cancel.changed() => break Ok(()),
                frame = notify.next_frame(Duration::from_secs(3600)) => {
                    match frame {
                        Ok(frame) if frame.opcode == opcodes::ACK_DATA => {
                            if let Err(e) = decoder.feed(&frame.payload) {
                                break Err(e);
                            }
                            for stroke in decoder.finish() {
                                for point in stroke.points {
                                    let _ = sink.write_point(&point);
                                }
                            }
                        }
                        Ok(_) => continue,
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        let _ = conn
            .write(
                uuids::WRITE_CHAR,
                &encode_command(opcode, &[0]),
                WriteKind::WithResponse,
            )
            .await;
        self.state = SessionState::Ready;
        result
    }

    /// Reads `GetBattery` and returns `(percent, state)`. Called after every
    /// connected episode so `Device.BatteryPercent`/`BatteryState` stay fresh
    /// without requiring a dedicated RPC round-trip.
    pub async fn read_battery(
        &mut self,
        conn: &dyn GattConnection,
        notify: &mut NotifyReader,
    ) -> Result<(u32, crate::model::BatteryState)> {
        conn.write(
            uuids::WRITE_CHAR,
            &encode_command(opcodes::GET_BATTERY, &[]),
            WriteKind::WithResponse,
        )
        .await?;
        let frame = notify
            .next_frame_matching(opcodes::GET_BATTERY, Duration::from_secs(10))
            .await?;
        frame.check()?;
        let percent = frame.payload.first().copied().unwrap_or(0) as u32;
        let state = match frame.payload.get(1).copied().unwrap_or(0) {
            1 => crate::model::BatteryState::Charging,
            2 => crate::model::BatteryState::Discharging,
            _ => crate::model::BatteryState::Unknown,
        };
        Ok((percent, state))
    }

    /// Reads `GetDimensions` and returns `(width_um, height_um)`. The
    /// payload is two little-endian `u16` millimeter values, which this
    /// converts to micrometers to match `Device::dimensions`.
    pub async fn read_dimensions(
        &mut self,
        conn: &dyn GattConnection,
        notify: &mut NotifyReader,
    ) -> Result<(u32, u32)> {
        conn.write(
            uuids::WRITE_CHAR,
            &encode_command(opcodes::GET_DIMENSIONS, &[]),
            WriteKind::WithResponse,
        )
        .await?;
        let frame = notify
            .next_frame_matching(opcodes::GET_DIMENSIONS, Duration::from_secs(10))
            .await?;
        frame.check()?;
        let too_short = || Error::Protocol("GetDimensions response too short".into());
        let width_mm = u16::from_le_bytes(
            frame.payload.get(0..2).ok_or_else(too_short)?.try_into().unwrap(),
        );
        let height_mm = u16::from_le_bytes(
            frame.payload.get(2..4).ok_or_else(too_short)?.try_into().unwrap(),
        );
        Ok((width_mm as u32 * 1000, height_mm as u32 * 1000))
    }

    /// Reads `GetFwVersion`.
    pub async fn read_firmware_version(
        &mut self,
        conn: &dyn GattConnection,
        notify: &mut NotifyReader,
    ) -> Result<String> {
        conn.write(
            uuids::WRITE_CHAR,
            &encode_command(opcodes::GET_FW_VERSION, &[]),
            WriteKind::WithResponse,
        )
        .await?;
        let frame = notify
            .next_frame_matching(opcodes::GET_FW_VERSION, Duration::from_secs(10))
            .await?;
        frame.check()?;
        Ok(String::from_utf8_lossy(&frame.payload).trim_end_matches('\0').to_string())
    }

    /// `Reset`: a fire-and-forget opcode exposed for tests and recovery
    /// tooling, not part of any state-machine transition the
    /// fetch/listen/live flows depend on.
    pub async fn reset(
        &mut self,
        conn: &dyn GattConnection,
        notify: &mut NotifyReader,
    ) -> Result<()> {
        conn.write(
            uuids::WRITE_CHAR,
            &encode_command(opcodes::RESET, &[]),
            WriteKind::WithResponse,
        )
        .await?;
        let frame = notify
            .next_frame_matching(opcodes::RESET, Duration::from_secs(10))
            .await?;
        frame.check()
    }

    pub async fn disconnect(&mut self, conn: &dyn GattConnection) {
        self.state = SessionState::Draining;
        let _ = conn.disconnect().await;
        self.state = SessionState::Disconnected;
    }
}

/// Matches an `Advertisement`'s service-data against the distinct pattern a
/// device in pairing mode advertises.
pub fn advertises_pairing_mode(service_data: &std::collections::HashMap<Uuid, Vec<u8>>) -> bool {
    service_data
        .get(&uuids::VENDOR_SERVICE)
        .map(|bytes| bytes.first() == Some(&0x01))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::family::status;
    use crate::transport::mock::{MockDevice, MockTransport};
    use std::time::Duration as StdDuration;

    fn addr() -> BDAddr {
        "00:11:22:33:44:55".parse().unwrap()
    }

    fn rigged_transport() -> Arc<MockTransport> {
        let t = MockTransport::new();
        let device = MockDevice::new(addr())
            .with_characteristic(uuids::VENDOR_SERVICE, uuids::NOTIFY_CHAR)
            .with_characteristic(uuids::VENDOR_SERVICE, uuids::WRITE_CHAR);
        t.add_device(device);
        Arc::new(t)
    }

    #[tokio::test]
    async fn fetch_drawing_happy_path_acks_once() {
        let transport = rigged_transport();
        let mut session = DeviceSession::new(addr(), Family::Slate, transport.clone());
        let (conn, mut notify) = session.connect_ready(None).await.unwrap();

        let tx = transport.notify_sender(addr(), uuids::NOTIFY_CHAR);
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            // stroke delimiter + one absolute point, framed as an ACK_DATA chunk.
            let payload = vec![0xff, 0xfa, 0, 0, 100, 0, 200, 0, 1000, 0];
            tx.send(encode_command(opcodes::ACK_DATA, &payload)).unwrap();
            tx.send(encode_command(opcodes::END_OF_DRAWING, &[])).unwrap();
        });

        let assembler = DrawingAssembler::new();
        let drawing = session
            .fetch_drawing(
                conn.as_ref(),
                &mut notify,
                &assembler,
                "Bamboo Slate".into(),
                (1000, 500),
                1_700_000_000,
            )
            .await
            .unwrap();

        let drawing = drawing.expect("a drawing was assembled");
        assert_eq!(drawing.strokes.len(), 1);
        assert_eq!(drawing.strokes[0].points[0].pressure, Some(1000));

        let writes = transport.writes.lock().unwrap();
        assert!(writes
            .iter()
            .any(|(_, uuid, data, _)| *uuid == uuids::WRITE_CHAR && data[0] == opcodes::ACK_DATA));
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_frame_surfaces_protocol_error_without_ack() {
        let transport = rigged_transport();
        let mut session = DeviceSession::new(addr(), Family::Slate, transport.clone());
        let (conn, mut notify) = session.connect_ready(None).await.unwrap();

        let tx = transport.notify_sender(addr(), uuids::NOTIFY_CHAR);
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            // Declares length 5 but only supplies 2 payload bytes: malformed,
            // and no more bytes ever arrive for this frame.
            tx.send(vec![opcodes::ACK_DATA, 5, 0x01, 0x02]).unwrap();
        });

        let assembler = DrawingAssembler::new();
        let result = session
            .fetch_drawing(
                conn.as_ref(),
                &mut notify,
                &assembler,
                "Bamboo Slate".into(),
                (1000, 500),
                1_700_000_000,
            )
            .await;

        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(session.state, SessionState::Disconnected);
        let writes = transport.writes.lock().unwrap();
        assert!(!writes
            .iter()
            .any(|(_, uuid, data, _)| *uuid == uuids::WRITE_CHAR && data[0] == opcodes::ACK_DATA));
    }

    #[tokio::test]
    async fn read_battery_parses_percent_and_state() {
        let transport = rigged_transport();
        let mut session = DeviceSession::new(addr(), Family::Slate, transport.clone());
        let (conn, mut notify) = session.connect_ready(None).await.unwrap();

        let notify_tx = transport.notify_sender(addr(), uuids::NOTIFY_CHAR);
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            notify_tx
                .send(vec![opcodes::GET_BATTERY, status::SUCCESS, 2, 77, 1])
                .unwrap();
        });

        let (percent, state) = session.read_battery(conn.as_ref(), &mut notify).await.unwrap();
        assert_eq!(percent, 77);
        assert_eq!(state, crate::model::BatteryState::Charging);
    }

    #[tokio::test]
    async fn registration_wrong_mode_is_not_ready_and_not_persisted() {
        let transport = rigged_transport();
        let mut session = DeviceSession::new(addr(), Family::Slate, transport.clone());
        let (conn, mut notify) = session.connect_ready(None).await.unwrap();

        let notify_tx = transport.notify_sender(addr(), uuids::NOTIFY_CHAR);
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            notify_tx
                .send(vec![opcodes::REGISTER, status::NOT_READY, 0])
                .unwrap();
        });

        let err = session.register(conn.as_ref(), &mut notify).await.unwrap_err();
        assert!(matches!(err, Error::NotReady));
        assert_eq!(session.state, SessionState::Disconnected);
    }
}
