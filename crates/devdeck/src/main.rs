use std::sync::Arc;

use clap::Parser;

use devdeck::{
    cli::{self, Cli, Runtime},
    logging,
    orchestrator::Orchestrator,
    os::SystemOs,
    settings::Settings,
    store::JsonStore,
    supervisor::Supervisor,
    tunnel::{SshTunnelSpawner, TunnelSpawner},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let settings = Settings::load()?;
    let _log_guard = logging::init(&settings, args.verbose)?;
    tracing::debug!(data_root = %settings.data_root.display(), "devdeck starting");

    let store = Arc::new(JsonStore::open(settings.store_path()));
    let supervisor = Supervisor::new(store.clone(), Arc::new(SystemOs));
    let tunnels: Arc<dyn TunnelSpawner> = Arc::new(SshTunnelSpawner::new(
        store.clone(),
        supervisor.clone(),
        &settings,
    ));
    let orchestrator = Orchestrator::new(
        supervisor.clone(),
        store.clone(),
        tunnels.clone(),
        settings.default_poll_interval,
    );

    supervisor.start_polling().await;

    let rt = Runtime {
        settings,
        store,
        supervisor: supervisor.clone(),
        tunnels,
        orchestrator,
    };
    let res = cli::dispatch(&rt, args.command).await;

    supervisor.stop_polling().await;
    if let Err(e) = &res {
        tracing::error!(error = %format!("{e:#}"), "command failed");
    }
    res
}
