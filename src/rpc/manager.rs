//! The `org.tuhi.Tuhi1.Manager` singleton (§6).

use super::device_path;
use crate::supervisor::Supervisor;
use std::sync::Arc;
use zbus::interface;
use zbus::message::Header;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::OwnedObjectPath;

pub struct ManagerIface {
    supervisor: Arc<Supervisor>,
}

impl ManagerIface {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[interface(name = "org.tuhi.Tuhi1.Manager")]
impl ManagerIface {
    #[zbus(property)]
    async fn devices(&self) -> Vec<OwnedObjectPath> {
        self.supervisor
            .registry()
            .snapshot()
            .into_iter()
            .map(|d| device_path(d.address))
            .collect()
    }

    #[zbus(property)]
    async fn searching(&self) -> bool {
        self.supervisor.registry().is_searching()
    }

    /// Constant, currently `[1]` (§6). Rejecting an unsupported version in
    /// `GetJSONData` is the client's job; this just advertises what this
    /// daemon can produce.
    #[zbus(property)]
    async fn json_data_versions(&self) -> Vec<u32> {
        vec![crate::model::json::CURRENT_VERSION]
    }

    async fn start_search(&self, #[zbus(header)] header: Header<'_>) -> i32 {
        let client = header
            .sender()
            .map(|s| s.to_string())
            .unwrap_or_default();
        match self.supervisor.clone().start_search(client) {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }

    async fn stop_search(&self, #[zbus(header)] header: Header<'_>) {
        let client = header
            .sender()
            .map(|s| s.to_string())
            .unwrap_or_default();
        self.supervisor.stop_search(&client);
    }

    #[zbus(signal)]
    pub async fn unregistered_device(
        ctxt: &SignalEmitter<'_>,
        device: OwnedObjectPath,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn search_stopped(ctxt: &SignalEmitter<'_>, status: i32) -> zbus::Result<()>;
}
