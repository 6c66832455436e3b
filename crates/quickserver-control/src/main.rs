use std::sync::Arc;

use quickserver_control::admission::AdmissionController;
use quickserver_control::config::ControlConfig;
use quickserver_control::ports::Notifier;
use quickserver_control::probe::RconProbe;
use quickserver_control::reapers::{
    self, CreditExhaustionReaper, EmptyServerReaper, LongRunningServerReaper, PendingServerReaper,
    ReclamationPolicy,
};
use quickserver_control::shutdown::ShutdownCoordinator;
use quickserver_control::state::AppState;
use quickserver_control::store::SeaStore;
use quickserver_control::task_queue::TaskQueue;
use quickserver_control::terminate::{
    DELETE_INSTANCE_TASK, DeleteInstanceProcessor, InstanceTerminator,
};
use quickserver_control::webhook::{LogNotifier, WebhookNotifier, WebhookProvisioner};
use sea_orm_migration::MigratorTrait;

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(%err, "cannot listen for SIGTERM, only ctrl-c will stop the process");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ControlConfig::from_env()?;
    let fleet_config = config.fleet.clone();

    let db = quickserver_db::connect(&config.database_url).await?;
    // Apply migrations on boot (idempotent).
    quickserver_migration::Migrator::up(&db, None).await?;
    let store = Arc::new(SeaStore::new(Arc::new(db)));

    let provisioner = Arc::new(WebhookProvisioner::new(
        &config.provisioner_url,
        fleet_config.deploy_timeout(),
    )?);
    let notifier: Arc<dyn Notifier> = match &config.notifier_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => {
            tracing::info!("QS_NOTIFIER_URL not set, owner notifications go to the log");
            Arc::new(LogNotifier)
        }
    };
    let probe = Arc::new(RconProbe::new());

    let shutdown = ShutdownCoordinator::new();
    let queue = TaskQueue::with_tick(shutdown.clone(), fleet_config.task_tick);
    let terminator = InstanceTerminator::new(
        store.clone(),
        store.clone(),
        provisioner.clone(),
        store.clone(),
    );
    queue.register_processor(
        DELETE_INSTANCE_TASK,
        DeleteInstanceProcessor::new(terminator.clone()),
    );
    queue.start();

    let admission = AdmissionController::new(
        store.clone(),
        provisioner.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        shutdown.clone(),
        fleet_config.billing_enabled,
    );

    let periods = fleet_config.periods;
    let mut policies: Vec<Arc<dyn ReclamationPolicy>> = Vec::new();
    policies.push(Arc::new(EmptyServerReaper::new(
        store.clone(),
        store.clone(),
        probe.clone(),
        notifier.clone(),
        queue.clone(),
        fleet_config.idle.clone(),
        fleet_config.probe_timeout,
        periods.empty,
    )));
    policies.push(Arc::new(PendingServerReaper::new(
        store.clone(),
        terminator.clone(),
        notifier.clone(),
        fleet_config.pending_max_age,
        periods.pending,
    )));
    policies.push(Arc::new(LongRunningServerReaper::new(
        store.clone(),
        terminator.clone(),
        probe.clone(),
        fleet_config.long_running_warn_after,
        fleet_config.long_running_max_age,
        fleet_config.probe_timeout,
        periods.long_running,
    )));
    if fleet_config.billing_enabled {
        policies.push(Arc::new(CreditExhaustionReaper::new(
            store.clone(),
            terminator.clone(),
            store.clone(),
            probe.clone(),
            notifier.clone(),
            fleet_config.low_balance_threshold,
            fleet_config.probe_timeout,
            periods.credit,
        )));
    } else {
        tracing::info!("billing disabled, credit exhaustion reaper not started");
    }
    let loops: Vec<_> = policies
        .into_iter()
        .map(|policy| reapers::spawn(policy, shutdown.clone()))
        .collect();

    let state = AppState {
        shutdown: shutdown.clone(),
        queue: queue.clone(),
        admission,
        terminator,
        billing_enabled: fleet_config.billing_enabled,
    };
    let app = quickserver_control::http::router(state);

    tracing::info!(addr = %config.http_addr, "quickserver-control HTTP listening");
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown signal received, draining");
    for handle in loops {
        handle.stop().await;
    }
    shutdown.drain().await;
    queue.stop().await;
    if !queue.is_empty() {
        tracing::warn!(
            remaining = queue.len(),
            "background tasks left in the queue are lost on exit"
        );
    }

    Ok(())
}
