// tuhi Source Code File
//
// The `tuhid` daemon entrypoint: wires up the BlueZ transport, the
// persistent registration store, the supervisor, and the session-bus RPC
// surface, then runs until asked to stop (§1, §5 "lifetime: launched once
// per login session, exits when told to or when its bus name is released").

use log::{error, info};
use std::sync::Arc;
use tuhi::rpc;
use tuhi::store::PersistentStore;
use tuhi::supervisor::Supervisor;
use tuhi::transport::bluez::BluezTransport;

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    if let Err(e) = run().await {
        error!("tuhid exiting: {e}");
        std::process::exit(1);
    }
}

async fn run() -> tuhi::Result<()> {
    let transport = BluezTransport::new().await?;
    let store = PersistentStore::open_default()?;

    let supervisor = Arc::new(Supervisor::new(Arc::new(transport), store));
    supervisor.load_persisted()?;

    let _connection = rpc::serve(supervisor).await.map_err(|e| {
        tuhi::Error::Store(format!("failed to take {} on the session bus: {e}", rpc::SERVICE_NAME))
    })?;
    info!("tuhid listening as {}", rpc::SERVICE_NAME);

    wait_for_shutdown_signal().await;
    info!("tuhid shutting down");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
