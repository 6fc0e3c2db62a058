//! The session-bus RPC surface (§4.6, §6). A thin mapping from the
//! supervisor/registry onto `org.freedesktop.DBus`-style objects: it owns
//! no protocol logic, only property/method/signal plumbing and the
//! object-path scheme.
//!
//! Carried as part of the ambient stack even though §1 lists the object
//! tree as an "out of scope (collaborator)" concern: the engineering of the
//! object tree itself — not the desktop/GUI surface around it — is what
//! lets every other module in this crate be driven at all.

pub mod device;
pub mod manager;

use crate::bdaddr::BDAddr;
use crate::registry::RegistryEvent;
use crate::supervisor::Supervisor;
use device::DeviceIface;
use manager::ManagerIface;
use std::sync::Arc;
use zbus::connection::Builder;
use zbus::Connection;

pub const SERVICE_NAME: &str = "org.tuhi.Tuhi1";
pub const MANAGER_PATH: &str = "/org/tuhi/Tuhi1/Manager";

/// `/org/tuhi/Tuhi1/Devices/dev_XX_XX_XX_XX_XX_XX`, matching the address
/// canonicalization `BDAddr::to_string` already produces (colon-separated
/// hex), with colons swapped for underscores since D-Bus object path
/// segments may not contain `:`.
pub fn device_path(address: BDAddr) -> zbus::zvariant::OwnedObjectPath {
    let addr = address.to_string().replace(':', "_");
    zbus::zvariant::OwnedObjectPath::try_from(format!("/org/tuhi/Tuhi1/Devices/dev_{addr}"))
        .expect("address-derived object path is always valid")
}

/// Connects to the session bus, publishes `Manager` and one `Device` object
/// per already-known device, and spawns the task that mirrors registry
/// events onto the bus as property changes and signals.
pub async fn serve(supervisor: Arc<Supervisor>) -> zbus::Result<Connection> {
    let manager = ManagerIface::new(supervisor.clone());
    let connection = Builder::session()?
        .name(SERVICE_NAME)?
        .serve_at(MANAGER_PATH, manager)?
        .build()
        .await?;

    for device in supervisor.registry().snapshot() {
        publish_device(&connection, &supervisor, device.address).await?;
    }

    spawn_event_bridge(connection.clone(), supervisor);
    Ok(connection)
}

async fn publish_device(
    connection: &Connection,
    supervisor: &Arc<Supervisor>,
    address: BDAddr,
) -> zbus::Result<()> {
    let path = device_path(address);
    if connection
        .object_server()
        .interface::<_, DeviceIface>(&path)
        .await
        .is_ok()
    {
        return Ok(());
    }
    let iface = DeviceIface::new(supervisor.clone(), address);
    connection.object_server().at(&path, iface).await?;
    Ok(())
}

fn spawn_event_bridge(connection: Connection, supervisor: Arc<Supervisor>) {
    let mut events = supervisor.registry().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RegistryEvent::DeviceAdded(address) => {
                    let _ = publish_device(&connection, &supervisor, address).await;
                    if let Some(device) = supervisor.registry().get(address) {
                        if device.registration.is_none() {
                            let object_server = connection.object_server();
                            if let Ok(iface_ref) = object_server
                                .interface::<_, ManagerIface>(MANAGER_PATH)
                                .await
                            {
                                let ctxt = iface_ref.signal_emitter();
                                let _ = ManagerIface::unregistered_device(
                                    ctxt,
                                    device_path(address),
                                )
                                .await;
                            }
                        }
                    }
                }
                RegistryEvent::DeviceUpdated(address) => {
                    if let Ok(iface_ref) = connection
                        .object_server()
                        .interface::<_, DeviceIface>(device_path(address))
                        .await
                    {
                        let _ = iface_ref
                            .get()
                            .await
                            .notify_changed(iface_ref.signal_emitter())
                            .await;
                    }
                }
                RegistryEvent::SearchingChanged(_) | RegistryEvent::SearchStopped(_) => {
                    if let Ok(iface_ref) = connection
                        .object_server()
                        .interface::<_, ManagerIface>(MANAGER_PATH)
                        .await
                    {
                        let ctxt = iface_ref.signal_emitter();
                        if let RegistryEvent::SearchStopped(status) = event {
                            let _ = ManagerIface::search_stopped(ctxt, status).await;
                        }
                        let _ = iface_ref
                            .get()
                            .await
                            .searching_changed(ctxt)
                            .await;
                    }
                }
                RegistryEvent::ButtonPressRequired(address) => {
                    if let Ok(iface_ref) = connection
                        .object_server()
                        .interface::<_, DeviceIface>(device_path(address))
                        .await
                    {
                        let _ = DeviceIface::button_press_required(iface_ref.signal_emitter()).await;
                    }
                }
                RegistryEvent::SyncState(address, state) => {
                    if let Ok(iface_ref) = connection
                        .object_server()
                        .interface::<_, DeviceIface>(device_path(address))
                        .await
                    {
                        let _ = DeviceIface::sync_state(iface_ref.signal_emitter(), state).await;
                    }
                }
                RegistryEvent::ListeningStopped(address, status) => {
                    if let Ok(iface_ref) = connection
                        .object_server()
                        .interface::<_, DeviceIface>(device_path(address))
                        .await
                    {
                        let _ = DeviceIface::listening_stopped(iface_ref.signal_emitter(), status).await;
                    }
                }
                RegistryEvent::LiveStopped(address, status) => {
                    if let Ok(iface_ref) = connection
                        .object_server()
                        .interface::<_, DeviceIface>(device_path(address))
                        .await
                    {
                        let _ = DeviceIface::live_stopped(iface_ref.signal_emitter(), status).await;
                    }
                }
            }
        }
    });
}
