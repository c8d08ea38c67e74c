//! lxdroute-server: serves LXD-derived load-balancer targets to Traefik.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lxdroute::remote::{Credentials, LxdConnector};
use lxdroute::transport::serve;
use lxdroute::{
    CancellationToken, Connector, FileRegistry, LXDROUTE_VERSION, Reconciler, ServerState,
    SessionPool, TaskDispatcher,
};

mod logging;
mod settings;

use settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    logging::init_tracing();

    tracing::info!(
        version = LXDROUTE_VERSION,
        lxd = %settings.lxd_server_url,
        services_file = %settings.services_file.display(),
        "Starting lxdroute"
    );

    let credentials = if settings.uses_tls() {
        Credentials::from_files(
            settings.lxd_server_url.as_str(),
            &settings.cert_path,
            &settings.key_path,
        )
        .context("failed to load LXD client certificate")?
    } else {
        tracing::warn!("LXD server URL is plain HTTP; no client certificate is sent");
        Credentials::new(settings.lxd_server_url.as_str())
    };

    let connector: Arc<dyn Connector> = Arc::new(LxdConnector::new(credentials));
    let pool = SessionPool::connect(connector, settings.pool_config())
        .await
        .with_context(|| format!("failed to reach LXD host {}", settings.lxd_server_url))?;

    let dispatcher = (settings.workers > 0).then(|| Arc::new(TaskDispatcher::new(settings.workers)));
    let state = Arc::new(ServerState::new());
    let registry = Arc::new(FileRegistry::new(&settings.services_file));

    let mut reconciler = Reconciler::new(Arc::clone(&pool), registry, Arc::clone(&state));
    if let Some(dispatcher) = &dispatcher {
        reconciler = reconciler.with_dispatcher(Arc::clone(dispatcher));
    }

    let shutdown = CancellationToken::new();
    let reaper = pool.spawn_reaper(settings.reaper_interval(), shutdown.clone());
    let reconcile_loop =
        Arc::new(reconciler).spawn(settings.reconcile_interval(), shutdown.clone());

    let served = serve(settings.server_config(), state, shutdown.clone()).await;

    // Background loops stop after the tick in flight, if any.
    shutdown.cancel();
    if let Err(e) = reconcile_loop.await {
        tracing::warn!(error = %e, "Reconcile loop ended abnormally");
    }
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "Session reaper ended abnormally");
    }
    if let Some(dispatcher) = dispatcher {
        dispatcher.shutdown().await;
    }
    pool.close().await;

    tracing::info!("lxdroute stopped");
    served
}
