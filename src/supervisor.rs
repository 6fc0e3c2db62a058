//! The typed supervisor: owns the registry, the transport adapter, the
//! assembler, and the persistent store; the RPC surface is a thin wrapper
//! around calls into this type. Each device gets at most one active session
//! task at a time, tracked in `listen_tasks`/`live_tasks`.

use crate::assembler::DrawingAssembler;
use crate::bdaddr::BDAddr;
use crate::error::{Error, Result};
use crate::live::LiveSink;
use crate::model::{Device, Family, RegistrationRecord};
use crate::protocol::family::uuids;
use crate::registry::{ClientId, DeviceRegistry};
use crate::session::{advertises_pairing_mode, DeviceSession, SEARCH_TIMEOUT};
use crate::store::PersistentStore;
use crate::transport::GattTransport;
use dashmap::DashMap;
use futures::StreamExt;
use log::{info, warn};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// A running per-device task's cancel handle. Dropped (or sent `true`) to
/// implement Stop{Search,Listening,Live}.
struct SessionHandle {
    cancel: watch::Sender<bool>,
}

pub struct Supervisor {
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn GattTransport>,
    assembler: Arc<DrawingAssembler>,
    store: Arc<PersistentStore>,
    listen_tasks: DashMap<BDAddr, SessionHandle>,
    live_tasks: DashMap<BDAddr, SessionHandle>,
    search_task: std::sync::Mutex<Option<SessionHandle>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Supervisor {
    pub fn new(transport: Arc<dyn GattTransport>, store: PersistentStore) -> Self {
        Self {
            registry: Arc::new(DeviceRegistry::new()),
            transport,
            assembler: Arc::new(DrawingAssembler::new()),
            store: Arc::new(store),
            listen_tasks: DashMap::new(),
            live_tasks: DashMap::new(),
            search_task: std::sync::Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Loads persisted registrations into the registry at startup so
    /// previously-registered devices show up in `Manager.Devices`
    /// immediately, without needing to be rediscovered first.
    pub fn load_persisted(&self) -> Result<()> {
        for record in self.store.load()? {
            let mut device = Device::new(record.address, record.family);
            device.registration = Some(record.uuid);
            self.registry.upsert(device);
        }
        Ok(())
    }

    /// `StartSearch`: scans for `SEARCH_TIMEOUT`, promoting any
    /// pairing-mode advertisement from an unknown address into the
    /// registry as an unregistered `Device`. A second caller colliding
    /// with an in-progress search never starts a scan of their own; they
    /// get `Busy` back immediately, same as `start_listening`/`start_live`.
    pub fn start_search(self: &Arc<Self>, client: ClientId) -> Result<()> {
        self.registry.start_search(client.clone())?;

        let this = self.clone();
        let mut cancel_rx = {
            let (tx, rx) = watch::channel(false);
            *self.search_task.lock().unwrap() = Some(SessionHandle { cancel: tx });
            rx
        };
        tokio::spawn(async move {
            let scan = match this.transport.scan(SEARCH_TIMEOUT).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("scan failed to start: {e}");
                    this.registry.force_stop_search(Error::from(e).errno());
                    return;
                }
            };
            tokio::pin!(scan);
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    ad = scan.next() => {
                        let Some(ad) = ad else { break };
                        if this.registry.contains(ad.address) {
                            continue;
                        }
                        if advertises_pairing_mode(&ad.service_data) {
                            info!("discovered unregistered device {}", ad.address);
                            // Family is resolved for real once Register connects and
                            // reads GetName/GetFwVersion; Slate is just the
                            // placeholder tag for an as-yet-unconnected device.
                            let device = Device::new(ad.address, Family::Slate);
                            this.registry.upsert(device);
                        }
                    }
                }
            }
            this.registry.stop_search(&client, 0);
        });
        Ok(())
    }

    pub fn stop_search(&self, client: &ClientId) {
        if let Some(handle) = self.search_task.lock().unwrap().take() {
            let _ = handle.cancel.send(true);
        }
        self.registry.stop_search(client, 0);
    }

    /// `Register`: connects to the device, runs the registration sub-flow,
    /// and on success persists the new record and marks the device
    /// registered.
    pub async fn register(&self, address: BDAddr) -> Result<()> {
        let family = self
            .registry
            .get(address)
            .map(|d| d.family)
            .unwrap_or(Family::Slate);
        let mut session = DeviceSession::new(address, family, self.transport.clone());
        let (conn, mut notify) = session.connect_ready(None).await?;

        self.registry.emit_button_press_required(address);
        let uuid = session.register(conn.as_ref(), &mut notify).await?;

        let firmware_version = session.read_firmware_version(conn.as_ref(), &mut notify).await.ok();
        let battery = session.read_battery(conn.as_ref(), &mut notify).await.ok();
        let dimensions = session.read_dimensions(conn.as_ref(), &mut notify).await.ok();
        session.disconnect(conn.as_ref()).await;

        self.store.persist(RegistrationRecord {
            address,
            uuid,
            family,
        })?;
        self.registry.update(address, |d| {
            d.registration = Some(uuid);
            if let Some(fw) = firmware_version {
                d.firmware_version = Some(fw);
            }
            if let Some((percent, state)) = battery {
                d.battery_percent = percent;
                d.battery_state = state;
            }
            if let Some(dims) = dimensions {
                d.dimensions = dims;
            }
        })?;
        Ok(())
    }

    /// `Reset`: connects, writes the reset opcode, disconnects. Exposed for
    /// tests and recovery tooling.
    pub async fn reset(&self, address: BDAddr) -> Result<()> {
        let device = self.registry.get(address).ok_or(Error::NotFound)?;
        let mut session = DeviceSession::new(address, device.family, self.transport.clone());
        let (conn, mut notify) = session.connect_ready(device.registration).await?;
        let result = session.reset(conn.as_ref(), &mut notify).await;
        session.disconnect(conn.as_ref()).await;
        result
    }

    /// `StartListening`: per-device background task that waits for a
    /// button-press notification and performs a fetch each time one
    /// arrives, until `StopListening` or the owning client disconnects. A
    /// second caller colliding with an existing listener on the same
    /// device never gets a task of their own; they get `Busy` back
    /// immediately, same as `start_search`/`start_live`.
    pub fn start_listening(self: &Arc<Self>, address: BDAddr, client: ClientId) -> Result<()> {
        self.registry.start_listen(address, client.clone())?;
        if self.listen_tasks.contains_key(&address) {
            return Ok(());
        }

        let (tx, mut cancel_rx) = watch::channel(false);
        self.listen_tasks.insert(address, SessionHandle { cancel: tx });
        let _ = self.registry.update(address, |d| d.listening = true);

        let this = self.clone();
        tokio::spawn(async move {
            let final_status = 'session: loop {
                if *cancel_rx.borrow() {
                    break 0;
                }
                let Some(device) = this.registry.get(address) else { break 0 };
                let Some(registration) = device.registration else { break 0 };

                let mut session = DeviceSession::new(address, device.family, this.transport.clone());
                let connected = tokio::select! {
                    _ = cancel_rx.changed() => None,
                    r = session.connect_ready(Some(registration)) => Some(r),
                };
                let (conn, mut notify) = match connected {
                    Some(Ok(pair)) => pair,
                    Some(Err(e)) => {
                        warn!("listen session for {address} failed to connect/authenticate: {e}");
                        break e.errno();
                    }
                    None => break 0,
                };

                // Remains idle on the button-press characteristic until a
                // press arrives; only then does it drive a fetch.
                let button_stream = match conn.subscribe(uuids::BUTTON_CHAR).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("listen session for {address} failed to subscribe to button char: {e}");
                        session.disconnect(conn.as_ref()).await;
                        break Error::from(e).errno();
                    }
                };
                tokio::pin!(button_stream);

                loop {
                    tokio::select! {
                        _ = cancel_rx.changed() => {
                            session.disconnect(conn.as_ref()).await;
                            break 'session 0;
                        }
                        press = button_stream.next() => {
                            let Some(_press) = press else {
                                // Device dropped the connection; reconnect from the top.
                                break;
                            };

                            this.registry.emit_sync_state(address, 0);
                            let fetch_result = session
                                .fetch_drawing(
                                    conn.as_ref(),
                                    &mut notify,
                                    &this.assembler,
                                    device.name.clone(),
                                    device.dimensions,
                                    now_secs(),
                                )
                                .await;

                            if let Ok((percent, state)) =
                                session.read_battery(conn.as_ref(), &mut notify).await
                            {
                                let _ = this.registry.update(address, |d| {
                                    d.battery_percent = percent;
                                    d.battery_state = state;
                                });
                            }
                            this.registry.emit_sync_state(address, 1);

                            match fetch_result {
                                Ok(Some(drawing)) => {
                                    let _ = this.registry.update(address, |d| d.drawings.push(drawing));
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!("fetch failed for {address}: {e}");
                                    session.disconnect(conn.as_ref()).await;
                                    break 'session e.errno();
                                }
                            }
                        }
                    }
                }
                session.disconnect(conn.as_ref()).await;
            };

            let _ = this.registry.update(address, |d| d.listening = false);
            this.listen_tasks.remove(&address);
            this.registry.force_stop_listen(address);
            this.registry.emit_listening_stopped(address, final_status);
        });
        Ok(())
    }

    pub fn stop_listening(&self, address: BDAddr, client: &ClientId) {
        self.registry.stop_listen(address, client);
        if self.registry.listen_owner(address).is_none() {
            if let Some((_, handle)) = self.listen_tasks.remove(&address) {
                let _ = handle.cancel.send(true);
            }
        }
    }

    /// `StartLive`: runs the device's live opcode and forwards decoded
    /// points to `sink` until `StopLive` or disconnect.
    pub fn start_live(
        self: &Arc<Self>,
        address: BDAddr,
        sink: Arc<dyn LiveSink>,
    ) -> Result<()> {
        let device = self.registry.get(address).ok_or(Error::NotFound)?;
        let registration = device.registration.ok_or(Error::NotReady)?;
        if self.live_tasks.contains_key(&address) {
            return Err(Error::Busy);
        }

        let (tx, cancel_rx) = watch::channel(false);
        self.live_tasks.insert(address, SessionHandle { cancel: tx });
        self.registry.update(address, |d| d.live = true)?;

        let this = self.clone();
        tokio::spawn(async move {
            let mut session = DeviceSession::new(address, device.family, this.transport.clone());
            let result = async {
                let (conn, mut notify) = session.connect_ready(Some(registration)).await?;
                let r = session
                    .run_live(conn.as_ref(), &mut notify, sink.as_ref(), cancel_rx)
                    .await;
                session.disconnect(conn.as_ref()).await;
                r
            }
            .await;
            let status = match &result {
                Ok(()) => 0,
                Err(e) => {
                    warn!("live session for {address} ended: {e}");
                    e.errno()
                }
            };
            let _ = this.registry.update(address, |d| d.live = false);
            this.live_tasks.remove(&address);
            this.registry.emit_live_stopped(address, status);
        });
        Ok(())
    }

    pub fn stop_live(&self, address: BDAddr) {
        if let Some((_, handle)) = self.live_tasks.remove(&address) {
            let _ = handle.cancel.send(true);
        }
    }

    /// `GetJSONData`: looks up an already-fetched `Drawing` by timestamp and
    /// serializes it to JSON v1.
    pub fn get_json_data(&self, address: BDAddr, timestamp: u64) -> Result<String> {
        let device = self.registry.get(address).ok_or(Error::NotFound)?;
        let drawing = device
            .drawings
            .iter()
            .find(|d| d.timestamp == timestamp)
            .ok_or(Error::NotFound)?;
        crate::model::json::to_json_string(drawing)
    }

    pub fn vendor_service_uuid(&self) -> uuid::Uuid {
        uuids::VENDOR_SERVICE
    }
}
