use std::sync::Arc;

use tokio::sync::watch;

use broker::amqp::AmqpProvider;
use server::config::ServiceConfig;
use server::connections::ConnectionsClient;
use server::listener::{Listener, ListenerSettings};
use server::report::SmtpReporter;
use server::worker::WorkerSettings;
use session::store::pg_store::PgScoresStore;

/// Flips the shutdown flag on SIGTERM or ctrl-c.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };

            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::init_logger("calibration-service");

    let cfg = ServiceConfig::from_env()?;
    tracing::info!(pod = %cfg.pod_name, environment = ?cfg.environment, "starting calibration service");

    let store = Arc::new(PgScoresStore::connect(&cfg.database_url, cfg.max_retries).await?);
    let provider = Arc::new(AmqpProvider::new(cfg.broker.clone()));
    let status = Arc::new(ConnectionsClient::new(cfg.connections_service_url.clone())?);
    let reporter = Arc::new(SmtpReporter::new(
        cfg.email_sender.clone(),
        cfg.email_password.clone(),
        cfg.artifacts_path.clone(),
    ));

    let listener = Listener::new(
        provider,
        store,
        status,
        reporter,
        ListenerSettings {
            upper_bound_clients: cfg.upper_bound_clients,
            worker: WorkerSettings {
                pod_name: cfg.pod_name.clone(),
                client_timeout: cfg.client_timeout,
                limits: cfg.limits,
                environment: cfg.environment,
            },
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    listener.run(shutdown_rx).await?;
    Ok(())
}
