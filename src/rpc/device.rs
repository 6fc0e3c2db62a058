//! The per-device `org.tuhi.Tuhi1.Device` object (§6).

use crate::bdaddr::BDAddr;
use crate::live::UhidSink;
use crate::model::BatteryState;
use crate::supervisor::Supervisor;
use std::sync::Arc;
use zbus::interface;
use zbus::message::Header;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedObjectPath, OwnedFd};

pub struct DeviceIface {
    supervisor: Arc<Supervisor>,
    address: BDAddr,
}

impl DeviceIface {
    pub fn new(supervisor: Arc<Supervisor>, address: BDAddr) -> Self {
        Self { supervisor, address }
    }

    /// Fires every `<property>_changed` helper after a registry update
    /// touches this device, since several properties typically change
    /// together (battery read, a completed fetch, a listen/live toggle).
    pub async fn notify_changed(&self, ctxt: &SignalEmitter<'_>) -> zbus::Result<()> {
        self.dimensions_changed(ctxt).await?;
        self.firmware_version_changed(ctxt).await?;
        self.battery_percent_changed(ctxt).await?;
        self.battery_state_changed(ctxt).await?;
        self.drawings_available_changed(ctxt).await?;
        self.listening_changed(ctxt).await?;
        self.live_changed(ctxt).await?;
        Ok(())
    }
}

fn client_id(header: &Header<'_>) -> String {
    header.sender().map(|s| s.to_string()).unwrap_or_default()
}

#[interface(name = "org.tuhi.Tuhi1.Device")]
impl DeviceIface {
    /// Opaque handle to the transport adapter's device object. This
    /// implementation doesn't expose BlueZ's own object path directly (the
    /// session protocol only talks to `GattTransport`), so it synthesizes
    /// one in BlueZ's own naming convention for client compatibility.
    #[zbus(property)]
    async fn blue_z_device(&self) -> OwnedObjectPath {
        let addr = self.address.to_string().replace(':', "_");
        OwnedObjectPath::try_from(format!("/org/bluez/hci0/dev_{addr}"))
            .expect("address-derived object path is always valid")
    }

    #[zbus(property)]
    async fn dimensions(&self) -> (u32, u32) {
        self.supervisor
            .registry()
            .get(self.address)
            .map(|d| d.dimensions)
            .unwrap_or_default()
    }

    #[zbus(property)]
    async fn firmware_version(&self) -> String {
        self.supervisor
            .registry()
            .get(self.address)
            .and_then(|d| d.firmware_version)
            .unwrap_or_default()
    }

    #[zbus(property)]
    async fn battery_percent(&self) -> u32 {
        self.supervisor
            .registry()
            .get(self.address)
            .map(|d| d.battery_percent)
            .unwrap_or_default()
    }

    #[zbus(property)]
    async fn battery_state(&self) -> u32 {
        self.supervisor
            .registry()
            .get(self.address)
            .map(|d| d.battery_state.as_u32())
            .unwrap_or(BatteryState::Unknown.as_u32())
    }

    /// List form, per §9's resolution of the count-vs-list open question:
    /// the live interface uses timestamps, which is authoritative.
    #[zbus(property)]
    async fn drawings_available(&self) -> Vec<u64> {
        self.supervisor
            .registry()
            .get(self.address)
            .map(|d| d.drawing_timestamps())
            .unwrap_or_default()
    }

    #[zbus(property)]
    async fn listening(&self) -> bool {
        self.supervisor
            .registry()
            .get(self.address)
            .map(|d| d.listening)
            .unwrap_or_default()
    }

    #[zbus(property)]
    async fn live(&self) -> bool {
        self.supervisor
            .registry()
            .get(self.address)
            .map(|d| d.live)
            .unwrap_or_default()
    }

    async fn register(&self) -> i32 {
        match self.supervisor.register(self.address).await {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }

    async fn start_listening(&self, #[zbus(header)] header: Header<'_>) -> i32 {
        match self
            .supervisor
            .clone()
            .start_listening(self.address, client_id(&header))
        {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }

    async fn stop_listening(&self, #[zbus(header)] header: Header<'_>) {
        self.supervisor
            .stop_listening(self.address, &client_id(&header));
    }

    async fn start_live(&self, fd: OwnedFd) -> i32 {
        let fd: std::os::fd::OwnedFd = fd.into();
        let sink: Arc<dyn crate::live::LiveSink> = Arc::new(UhidSink::new(fd));
        match self.supervisor.clone().start_live(self.address, sink) {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }

    async fn stop_live(&self) {
        self.supervisor.stop_live(self.address);
    }

    async fn reset(&self) -> i32 {
        match self.supervisor.reset(self.address).await {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }

    async fn get_json_data(&self, file_version: u32, timestamp: u64) -> zbus::fdo::Result<String> {
        if file_version != crate::model::json::CURRENT_VERSION {
            return Err(zbus::fdo::Error::NotSupported(format!(
                "unsupported JSON data version {file_version}"
            )));
        }
        self.supervisor
            .get_json_data(self.address, timestamp)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    #[zbus(signal)]
    pub async fn button_press_required(ctxt: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn listening_stopped(ctxt: &SignalEmitter<'_>, status: i32) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn live_stopped(ctxt: &SignalEmitter<'_>, status: i32) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn sync_state(ctxt: &SignalEmitter<'_>, state: i32) -> zbus::Result<()>;
}
