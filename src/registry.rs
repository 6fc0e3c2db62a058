//! The device registry: a single-owner map from address to `Device`, with a
//! broadcast channel the RPC surface subscribes to for property-changed
//! notifications, and the arbitration rules for "at most one active search"
//! and "at most one active listen per device".
//!
//! Concurrency discipline: every mutating method takes `&self` and is safe
//! to call from the single task loop that owns the supervisor; the
//! `DashMap` only needs to support concurrent *reads* from RPC method
//! handlers running on other tasks.

use crate::bdaddr::BDAddr;
use crate::error::{Error, Result};
use crate::model::Device;
use dashmap::DashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// The RPC surface identifies callers by their D-Bus unique name; the
/// registry only needs equality, so a bare `String` stands in for it here
/// rather than depending on the RPC layer's types.
pub type ClientId = String;

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    DeviceAdded(BDAddr),
    DeviceUpdated(BDAddr),
    SearchingChanged(bool),
    SearchStopped(i32),
    /// A registration is waiting on a physical button press; bridged to
    /// `Device.ButtonPressRequired`.
    ButtonPressRequired(BDAddr),
    /// `0` when a fetch begins, `1` when the device reports nothing left to
    /// sync.
    SyncState(BDAddr, i32),
    ListeningStopped(BDAddr, i32),
    LiveStopped(BDAddr, i32),
}

pub struct DeviceRegistry {
    devices: DashMap<BDAddr, Device>,
    events: broadcast::Sender<RegistryEvent>,
    search_owner: Mutex<Option<ClientId>>,
    listen_owners: DashMap<BDAddr, ClientId>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            devices: DashMap::new(),
            events,
            search_owner: Mutex::new(None),
            listen_owners: DashMap::new(),
        }
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No receivers is not an error: the RPC surface may not have
        // started yet, or nobody is watching this particular device.
        let _ = self.events.send(event);
    }

    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get(&self, address: BDAddr) -> Option<Device> {
        self.devices.get(&address).map(|e| e.value().clone())
    }

    pub fn contains(&self, address: BDAddr) -> bool {
        self.devices.contains_key(&address)
    }

    /// Inserts a newly discovered or loaded device. No-op (update) if one
    /// already exists at this address.
    pub fn upsert(&self, device: Device) {
        let address = device.address;
        let is_new = !self.devices.contains_key(&address);
        self.devices.insert(address, device);
        self.emit(if is_new {
            RegistryEvent::DeviceAdded(address)
        } else {
            RegistryEvent::DeviceUpdated(address)
        });
    }

    /// Applies `f` to the device at `address`, if any, and emits a
    /// `DeviceUpdated` event. Returns `NotFound` if the address is unknown.
    pub fn update(&self, address: BDAddr, f: impl FnOnce(&mut Device)) -> Result<()> {
        let mut entry = self.devices.get_mut(&address).ok_or(Error::NotFound)?;
        f(entry.value_mut());
        drop(entry);
        self.emit(RegistryEvent::DeviceUpdated(address));
        Ok(())
    }

    pub fn is_searching(&self) -> bool {
        self.search_owner.lock().unwrap().is_some()
    }

    /// A second `StartSearch` by the same client is a silent no-op; by a
    /// different client it is `Busy`.
    pub fn start_search(&self, client: ClientId) -> Result<()> {
        let mut owner = self.search_owner.lock().unwrap();
        match owner.as_ref() {
            Some(existing) if *existing == client => Ok(()),
            Some(_) => Err(Error::Busy),
            None => {
                *owner = Some(client);
                drop(owner);
                self.emit(RegistryEvent::SearchingChanged(true));
                Ok(())
            }
        }
    }

    /// Stops the search if `client` owns it. Stopping a search nobody owns,
    /// or that a different client owns, is a no-op: `StopSearch` has no
    /// failure mode on the RPC surface.
    pub fn stop_search(&self, client: &ClientId, status: i32) {
        let mut owner = self.search_owner.lock().unwrap();
        if owner.as_deref() == Some(client.as_str()) {
            *owner = None;
            drop(owner);
            self.emit(RegistryEvent::SearchingChanged(false));
            self.emit(RegistryEvent::SearchStopped(status));
        }
    }

    /// Also releases ownership unconditionally — used when a client
    /// disconnects from the bus, which is an implicit Stop for every
    /// session it owns.
    pub fn force_stop_search(&self, status: i32) {
        let mut owner = self.search_owner.lock().unwrap();
        if owner.take().is_some() {
            drop(owner);
            self.emit(RegistryEvent::SearchingChanged(false));
            self.emit(RegistryEvent::SearchStopped(status));
        }
    }

    /// A second `StartListening` on the same device by the same client is a
    /// no-op; by a different client it fails `Busy`.
    pub fn start_listen(&self, address: BDAddr, client: ClientId) -> Result<()> {
        match self.listen_owners.get(&address) {
            Some(existing) if *existing == client => Ok(()),
            Some(_) => Err(Error::Busy),
            None => {
                self.listen_owners.insert(address, client);
                Ok(())
            }
        }
    }

    pub fn stop_listen(&self, address: BDAddr, client: &ClientId) {
        if self.listen_owners.get(&address).map(|o| o.clone()).as_deref() == Some(client.as_str())
        {
            self.listen_owners.remove(&address);
        }
    }

    pub fn force_stop_listen(&self, address: BDAddr) {
        self.listen_owners.remove(&address);
    }

    pub fn listen_owner(&self, address: BDAddr) -> Option<ClientId> {
        self.listen_owners.get(&address).map(|o| o.clone())
    }

    pub fn emit_button_press_required(&self, address: BDAddr) {
        self.emit(RegistryEvent::ButtonPressRequired(address));
    }

    pub fn emit_sync_state(&self, address: BDAddr, state: i32) {
        self.emit(RegistryEvent::SyncState(address, state));
    }

    pub fn emit_listening_stopped(&self, address: BDAddr, status: i32) {
        self.emit(RegistryEvent::ListeningStopped(address, status));
    }

    /// Reports a search-related status without touching ownership — used
    /// when a second caller's `StartSearch` is rejected, since that caller
    /// never became the owner and there's nothing to release.
    pub fn emit_search_stopped(&self, status: i32) {
        self.emit(RegistryEvent::SearchStopped(status));
    }

    pub fn emit_live_stopped(&self, address: BDAddr, status: i32) {
        self.emit(RegistryEvent::LiveStopped(address, status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Family;

    fn addr() -> BDAddr {
        "00:11:22:33:44:55".parse().unwrap()
    }

    #[test]
    fn second_search_by_same_client_is_noop() {
        let r = DeviceRegistry::new();
        r.start_search("a".into()).unwrap();
        assert!(r.start_search("a".into()).is_ok());
        assert!(r.is_searching());
    }

    #[test]
    fn second_search_by_other_client_is_busy() {
        let r = DeviceRegistry::new();
        r.start_search("a".into()).unwrap();
        assert!(matches!(r.start_search("b".into()), Err(Error::Busy)));
    }

    #[test]
    fn stop_search_by_non_owner_is_noop() {
        let r = DeviceRegistry::new();
        r.start_search("a".into()).unwrap();
        r.stop_search(&"b".to_string(), 0);
        assert!(r.is_searching());
    }

    #[test]
    fn concurrent_listen_same_device_different_clients() {
        let r = DeviceRegistry::new();
        r.upsert(Device::new(addr(), Family::Slate));
        r.start_listen(addr(), "a".into()).unwrap();
        let err = r.start_listen(addr(), "b".into()).unwrap_err();
        assert!(matches!(err, Error::Busy));
    }

    #[test]
    fn upsert_then_update_emits_events() {
        let r = DeviceRegistry::new();
        let mut rx = r.subscribe();
        r.upsert(Device::new(addr(), Family::Spark));
        r.update(addr(), |d| d.battery_percent = 50).unwrap();
        let snap = r.get(addr()).unwrap();
        assert_eq!(snap.battery_percent, 50);
        assert!(matches!(
            rx.try_recv().unwrap(),
            RegistryEvent::DeviceAdded(_)
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            RegistryEvent::DeviceUpdated(_)
        ));
    }
}
