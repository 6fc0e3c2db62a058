// tuhi Source Code File
//
// `GattTransport` implementation backed by `bluez-async`, an async wrapper
// around BlueZ's D-Bus GATT client interface. This is the one shipped
// transport backend; everything above `transport::GattTransport` is
// transport-generic (spec §4.1, §1's "the transport is adapted" non-goal).

use super::{
    Advertisement, BoxStream, CharacteristicDescription, GattConnection, GattTransport,
    ServiceDescription, TransportError, WriteKind,
};
use crate::bdaddr::BDAddr;
use bluez_async::{
    BluetoothError, BluetoothEvent, BluetoothSession, CharacteristicEvent, CharacteristicId,
    DeviceEvent, DeviceId, MacAddress,
};
use dashmap::DashMap;
use futures::stream::StreamExt;
use log::{debug, trace, warn};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

impl From<BluetoothError> for TransportError {
    fn from(e: BluetoothError) -> Self {
        TransportError::Backend(e.to_string())
    }
}

fn to_mac(address: BDAddr) -> MacAddress {
    MacAddress::from_str(&address.to_string()).expect("BDAddr always formats as a valid MAC")
}

fn from_mac(mac: MacAddress) -> BDAddr {
    mac.to_string().parse().expect("MacAddress always formats as a valid BDAddr")
}

/// The BlueZ-backed transport adapter. One instance is shared (via `Arc`) by
/// every device session the supervisor owns.
pub struct BluezTransport {
    session: Arc<BluetoothSession>,
}

impl BluezTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let (handle, session) = BluetoothSession::new()
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        // The connection handle drives the D-Bus I/O on its own task; if it
        // dies we want to know about it in the logs rather than silently
        // stalling every future session.
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                warn!("bluez D-Bus connection task exited: {e}");
            }
        });
        Ok(Self {
            session: Arc::new(session),
        })
    }
}

#[async_trait::async_trait]
impl GattTransport for BluezTransport {
    async fn scan(&self, duration: Duration) -> Result<BoxStream<Advertisement>, TransportError> {
        self.session
            .start_discovery()
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        let session = self.session.clone();
        let events = session
            .event_stream()
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        let session_for_stop = self.session.clone();
        let stream = events.filter_map(move |event| {
            let session = session.clone();
            async move {
                match event {
                    BluetoothEvent::Device {
                        id,
                        event: DeviceEvent::Discovered,
                    }
                    | BluetoothEvent::Device {
                        id,
                        event: DeviceEvent::ServiceData { .. },
                    } => match session.get_device_info(&id).await {
                        Ok(info) => Some(Advertisement {
                            address: from_mac(info.mac_address),
                            local_name: info.name,
                            rssi: info.rssi,
                            service_data: info
                                .service_data
                                .into_iter()
                                .map(|(uuid, value)| (uuid, value))
                                .collect(),
                        }),
                        Err(e) => {
                            trace!("could not fetch device info for {id}: {e}");
                            None
                        }
                    },
                    _ => None,
                }
            }
        });

        let timed = tokio_stream::StreamExt::timeout(stream, duration)
            .take_while(|r| std::future::ready(r.is_ok()))
            .map(|r| r.expect("take_while guarantees Ok"));

        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(e) = session_for_stop.stop_discovery().await {
                trace!("stop_discovery after scan window: {e}");
            }
        });

        Ok(Box::pin(timed))
    }

    async fn connect(
        &self,
        address: BDAddr,
    ) -> Result<Box<dyn GattConnection>, TransportError> {
        let mac = to_mac(address);
        let devices = self
            .session
            .get_devices()
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        let device = devices
            .into_iter()
            .find(|d| d.mac_address == mac)
            .ok_or(TransportError::NotFound)?;

        self.session
            .connect(&device.id)
            .await
            .map_err(|_| TransportError::Unreachable)?;

        Ok(Box::new(BluezConnection {
            session: self.session.clone(),
            device_id: device.id,
            characteristics: DashMap::new(),
        }))
    }
}

struct BluezConnection {
    session: Arc<BluetoothSession>,
    device_id: DeviceId,
    characteristics: DashMap<Uuid, CharacteristicId>,
}

impl BluezConnection {
    async fn characteristic(&self, uuid: Uuid) -> Result<CharacteristicId, TransportError> {
        if let Some(id) = self.characteristics.get(&uuid) {
            return Ok(id.clone());
        }
        // Not cached yet: walk every service's characteristics once. This
        // also populates the cache for every other characteristic on the
        // device, so later lookups are free.
        let services = self
            .session
            .get_services(&self.device_id)
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        for service in services {
            let chars = self
                .session
                .get_characteristics(&service.id)
                .await
                .map_err(|e| TransportError::Backend(e.to_string()))?;
            for c in chars {
                self.characteristics.insert(c.uuid, c.id.clone());
            }
        }
        self.characteristics
            .get(&uuid)
            .map(|id| id.clone())
            .ok_or(TransportError::UnknownCharacteristic(uuid))
    }
}

#[async_trait::async_trait]
impl GattConnection for BluezConnection {
    async fn discover_services(&self) -> Result<Vec<ServiceDescription>, TransportError> {
        let services = self
            .session
            .get_services(&self.device_id)
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        let mut out = Vec::with_capacity(services.len());
        for service in services {
            let chars = self
                .session
                .get_characteristics(&service.id)
                .await
                .map_err(|e| TransportError::Backend(e.to_string()))?;
            let mut descs = std::collections::BTreeSet::new();
            for c in chars {
                self.characteristics.insert(c.uuid, c.id.clone());
                descs.insert(CharacteristicDescription { uuid: c.uuid });
            }
            out.push(ServiceDescription {
                uuid: service.uuid,
                characteristics: descs,
            });
        }
        Ok(out)
    }

    async fn write(
        &self,
        char_uuid: Uuid,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        let id = self.characteristic(char_uuid).await?;
        debug!("writing {} bytes to {char_uuid} ({:?})", data.len(), kind);
        self.session
            .write_characteristic_value(&id, data.to_vec())
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))
    }

    async fn read(&self, char_uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        let id = self.characteristic(char_uuid).await?;
        self.session
            .read_characteristic_value(&id)
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))
    }

    async fn subscribe(&self, char_uuid: Uuid) -> Result<BoxStream<Vec<u8>>, TransportError> {
        let id = self.characteristic(char_uuid).await?;
        self.session
            .start_notify(&id)
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        let events = self
            .session
            .characteristic_event_stream(&id)
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        let stream = events.filter_map(|event| async move {
            match event {
                BluetoothEvent::Characteristic {
                    event: CharacteristicEvent::Value { value },
                    ..
                } => Some(value),
                _ => None,
            }
        });
        Ok(Box::pin(stream))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.session
            .disconnect(&self.device_id)
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))
    }

    async fn disconnected(&self) -> BoxStream<()> {
        let session = self.session.clone();
        let device_id = self.device_id.clone();
        let stream = async_stream_disconnect(session, device_id);
        Box::pin(stream)
    }
}

/// Builds a one-shot stream that resolves when BlueZ reports the device as
/// disconnected.
fn async_stream_disconnect(
    session: Arc<BluetoothSession>,
    device_id: DeviceId,
) -> impl futures::Stream<Item = ()> {
    futures::stream::unfold(Some((session, device_id)), |state| async move {
        let (session, device_id) = state?;
        let mut events = session.device_event_stream(&device_id).await.ok()?;
        while let Some(event) = events.next().await {
            if let BluetoothEvent::Device {
                event: DeviceEvent::Connected { connected: false },
                ..
            } = event
            {
                return Some(((), None));
            }
        }
        None
    })
}
