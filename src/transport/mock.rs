//! An in-memory `GattTransport` double used by scenario tests (spec §8). It
//! never touches real hardware: a test builds a [`MockTransport`], seeds it
//! with [`MockDevice`] fixtures (service/characteristic UUIDs, canned read
//! responses, scripted notification frames), then drives the session
//! protocol against it exactly as `BluezTransport` would be driven against
//! real hardware.

use super::{
    Advertisement, BoxStream, CharacteristicDescription, GattConnection, GattTransport,
    ServiceDescription, TransportError, WriteKind,
};
use crate::bdaddr::BDAddr;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// A scripted peripheral. Tests push notification frames onto `notify_tx`
/// (one per subscribed characteristic) after the session subscribes, to
/// simulate the device streaming data.
#[derive(Clone)]
pub struct MockDevice {
    pub address: BDAddr,
    pub local_name: Option<String>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub services: Vec<ServiceDescription>,
    /// What `read()` returns for each characteristic UUID.
    pub reads: HashMap<Uuid, Vec<u8>>,
}

impl MockDevice {
    pub fn new(address: BDAddr) -> Self {
        Self {
            address,
            local_name: None,
            service_data: HashMap::new(),
            services: Vec::new(),
            reads: HashMap::new(),
        }
    }

    pub fn with_characteristic(mut self, service: Uuid, characteristic: Uuid) -> Self {
        if let Some(s) = self.services.iter_mut().find(|s| s.uuid == service) {
            s.characteristics
                .insert(CharacteristicDescription { uuid: characteristic });
        } else {
            let mut characteristics = BTreeSet::new();
            characteristics.insert(CharacteristicDescription { uuid: characteristic });
            self.services.push(ServiceDescription {
                uuid: service,
                characteristics,
            });
        }
        self
    }
}

type NotifyMap = Arc<Mutex<HashMap<(BDAddr, Uuid), broadcast::Sender<Vec<u8>>>>>;

#[derive(Default)]
pub struct MockTransport {
    devices: Mutex<HashMap<BDAddr, MockDevice>>,
    /// One notification sender per (address, characteristic), so a test can
    /// grab the sender via `notify_sender` and push frames after the session
    /// subscribes.
    notify: NotifyMap,
    /// Writes observed on any characteristic, for assertions.
    pub writes: Arc<Mutex<Vec<(BDAddr, Uuid, Vec<u8>, WriteKind)>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: MockDevice) {
        self.devices.lock().unwrap().insert(device.address, device);
    }

    /// Returns a sender a test can use to push notification frames to a
    /// connected session once it has subscribed to `characteristic`.
    pub fn notify_sender(&self, address: BDAddr, characteristic: Uuid) -> broadcast::Sender<Vec<u8>> {
        self.notify
            .lock()
            .unwrap()
            .entry((address, characteristic))
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

#[async_trait::async_trait]
impl GattTransport for MockTransport {
    async fn scan(&self, _duration: Duration) -> Result<BoxStream<Advertisement>, TransportError> {
        let ads: Vec<_> = self
            .devices
            .lock()
            .unwrap()
            .values()
            .map(|d| Advertisement {
                address: d.address,
                local_name: d.local_name.clone(),
                rssi: Some(-50),
                service_data: d.service_data.clone(),
            })
            .collect();
        Ok(Box::pin(stream::iter(ads)))
    }

    async fn connect(
        &self,
        address: BDAddr,
    ) -> Result<Box<dyn GattConnection>, TransportError> {
        let device = self
            .devices
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .ok_or(TransportError::NotFound)?;
        Ok(Box::new(MockConnection {
            address,
            device,
            notify: self.notify.clone(),
            writes: self.writes.clone(),
        }))
    }
}

struct MockConnection {
    address: BDAddr,
    device: MockDevice,
    notify: NotifyMap,
    writes: Arc<Mutex<Vec<(BDAddr, Uuid, Vec<u8>, WriteKind)>>>,
}

#[async_trait::async_trait]
impl GattConnection for MockConnection {
    async fn discover_services(&self) -> Result<Vec<ServiceDescription>, TransportError> {
        Ok(self.device.services.clone())
    }

    async fn write(
        &self,
        char_uuid: Uuid,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        self.writes
            .lock()
            .unwrap()
            .push((self.address, char_uuid, data.to_vec(), kind));
        Ok(())
    }

    async fn read(&self, char_uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        self.device
            .reads
            .get(&char_uuid)
            .cloned()
            .ok_or(TransportError::UnknownCharacteristic(char_uuid))
    }

    async fn subscribe(&self, char_uuid: Uuid) -> Result<BoxStream<Vec<u8>>, TransportError> {
        let sender = self
            .notify
            .lock()
            .unwrap()
            .entry((self.address, char_uuid))
            .or_insert_with(|| broadcast::channel(64).0)
            .clone();
        let rx = sender.subscribe();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|r| async move { r.ok() });
        Ok(Box::pin(stream))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnected(&self) -> BoxStream<()> {
        let (_tx, rx) = mpsc::channel::<()>(1);
        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }
}
