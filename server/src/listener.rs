//! Session supervisor: consumes new-session notifications and spawns one
//! isolated worker per session.
//!
//! Admission control is the consumer prefetch window: the broker holds back
//! further notifications once `upper_bound_clients` are unacked. A parallel
//! removal monitor drains the completion channel and prunes the
//! active-workers map; the listener itself only ever holds worker handles
//! for termination, never worker state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use broker::bus::{BusChannel, BusProvider, Delivery, ExchangeType, MessageBus};
use broker::topology::{
    CONNECTIONS_QUEUE, COORDINATOR_EXCHANGE, MLFLOW_EXCHANGE, NEW_CONNECTIONS_EXCHANGE,
    REPLIES_EXCHANGE, reconnect_delay,
};
use codec::InputsFormat;
use session::model::{SessionDescriptor, SessionId};
use session::store::ScoresStore;

use crate::connections::StatusPoster;
use crate::report::Reporter;
use crate::worker::{SessionWorker, WorkerContext, WorkerSettings};

/// Completion event a worker emits when it exits, whatever the outcome.
#[derive(Debug, Clone)]
pub struct CompletedSession {
    pub session_id: SessionId,
    pub user_id: String,
}

pub struct ListenerSettings {
    pub upper_bound_clients: u16,
    pub worker: WorkerSettings,
}

struct WorkerHandle {
    user_id: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct Listener {
    provider: Arc<dyn BusProvider>,
    store: Arc<dyn ScoresStore>,
    status: Arc<dyn StatusPoster>,
    reporter: Arc<dyn Reporter>,
    settings: ListenerSettings,

    active: Arc<Mutex<HashMap<SessionId, WorkerHandle>>>,
}

impl Listener {
    pub fn new(
        provider: Arc<dyn BusProvider>,
        store: Arc<dyn ScoresStore>,
        status: Arc<dyn StatusPoster>,
        reporter: Arc<dyn Reporter>,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            provider,
            store,
            status,
            reporter,
            settings,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Consume until the shutdown signal flips; reconnects with backoff on
    /// broker loss. On shutdown every active worker is signaled and awaited
    /// before the removal monitor is joined.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let (completed_tx, completed_rx) = mpsc::channel::<CompletedSession>(64);
        let monitor = tokio::spawn(removal_monitor(self.active.clone(), completed_rx));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let bus = self.provider.connect().await?;
            match self
                .consume_notifications(&bus, &completed_tx, &mut shutdown)
                .await
            {
                Ok(true) => {
                    let _ = bus.close().await;
                    break;
                }
                Ok(false) => {
                    warn!("notification stream closed; reconnecting");
                    let _ = bus.close().await;
                    tokio::time::sleep(reconnect_delay(0)).await;
                }
                Err(e) => {
                    error!(error = %e, "listener channel error; reconnecting");
                    let _ = bus.close().await;
                    tokio::time::sleep(reconnect_delay(0)).await;
                }
            }
        }

        self.shutdown_workers().await;
        drop(completed_tx);
        let _ = monitor.await;

        info!(action = "shutdown", result = "success", "listener shutdown completed");
        Ok(())
    }

    /// Returns `Ok(true)` when consumption ended due to shutdown, `Ok(false)`
    /// when the broker side went away.
    async fn consume_notifications(
        &self,
        bus: &Arc<dyn MessageBus>,
        completed_tx: &mpsc::Sender<CompletedSession>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<bool> {
        let channel = bus.channel(self.settings.upper_bound_clients).await?;

        channel
            .declare_exchange(NEW_CONNECTIONS_EXCHANGE, ExchangeType::Fanout)
            .await?;
        channel.declare_queue(CONNECTIONS_QUEUE).await?;
        channel
            .bind_queue(CONNECTIONS_QUEUE, NEW_CONNECTIONS_EXCHANGE, "")
            .await?;

        // Shared topology the rest of the fleet expects to exist; the
        // replies/coordinator pair is reserved for scale signaling.
        channel.declare_exchange(MLFLOW_EXCHANGE, ExchangeType::Direct).await?;
        channel.declare_exchange(REPLIES_EXCHANGE, ExchangeType::Direct).await?;
        channel
            .declare_exchange(COORDINATOR_EXCHANGE, ExchangeType::Fanout)
            .await?;

        let tag = format!("{}-listener", self.settings.worker.pod_name);
        let mut rx = channel.consume(CONNECTIONS_QUEUE, &tag).await?;
        info!(queue = CONNECTIONS_QUEUE, "listening for new sessions");

        let is_shutdown = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break true;
                    }
                }
                delivery = rx.recv() => match delivery {
                    Some(d) => self.handle_notification(&channel, d, completed_tx).await,
                    None => break false,
                },
            }
        };

        if is_shutdown {
            let _ = channel.cancel_consumer(&tag).await;
        }
        let _ = channel.close().await;
        Ok(is_shutdown)
    }

    async fn handle_notification(
        &self,
        channel: &Arc<dyn BusChannel>,
        delivery: Delivery,
        completed_tx: &mpsc::Sender<CompletedSession>,
    ) {
        let descriptor = match SessionDescriptor::parse(&delivery.body) {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    action = "handle_notification",
                    result = "fail",
                    error = %e,
                    body_len = delivery.body.len(),
                    body_prefix = %fingerprint(&delivery.body),
                    "rejecting malformed session notification"
                );
                if let Err(e) = channel.nack(delivery.tag, false).await {
                    warn!(error = %e, "poison nack failed");
                }
                return;
            }
        };

        let inputs_format: InputsFormat =
            match descriptor.inputs_format.as_deref().unwrap_or_default().parse() {
                Ok(f) => f,
                Err(e) => {
                    warn!(
                        action = "handle_notification",
                        result = "fail",
                        session_id = %descriptor.session_id,
                        error = %e,
                        "rejecting notification with unusable inputs_format"
                    );
                    if let Err(e) = channel.nack(delivery.tag, false).await {
                        warn!(error = %e, "poison nack failed");
                    }
                    return;
                }
            };

        match self.spawn_worker(descriptor, inputs_format, completed_tx).await {
            Ok(()) => {
                if let Err(e) = channel.ack(delivery.tag).await {
                    warn!(error = %e, "notification ack failed");
                }
            }
            Err(e) => {
                error!(
                    action = "spawn_worker",
                    result = "fail",
                    error = %e,
                    "failed to spawn session worker; requeueing"
                );
                if let Err(e) = channel.nack(delivery.tag, true).await {
                    warn!(error = %e, "requeue nack failed");
                }
            }
        }
    }

    async fn spawn_worker(
        &self,
        descriptor: SessionDescriptor,
        inputs_format: InputsFormat,
        completed_tx: &mpsc::Sender<CompletedSession>,
    ) -> anyhow::Result<()> {
        let session_id = descriptor.session_id;
        let user_id = descriptor.user_id.clone();

        let mut active = self.active.lock().await;
        if active.contains_key(&session_id) {
            warn!(session_id = %session_id, "worker already active; dropping duplicate notification");
            return Ok(());
        }

        let ctx = WorkerContext {
            bus_provider: self.provider.clone(),
            store: self.store.clone(),
            status: self.status.clone(),
            reporter: self.reporter.clone(),
        };
        let worker = SessionWorker::new(
            descriptor,
            inputs_format,
            ctx,
            self.settings.worker.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let completed_tx = completed_tx.clone();
        let task_user_id = user_id.clone();
        let join = tokio::spawn(async move {
            match worker.run(shutdown_rx).await {
                Ok(status) => {
                    info!(session_id = %session_id, final_status = %status, "session worker finished")
                }
                Err(e) => error!(session_id = %session_id, error = %e, "session worker failed"),
            }
            let _ = completed_tx
                .send(CompletedSession { session_id, user_id: task_user_id })
                .await;
        });

        active.insert(session_id, WorkerHandle { user_id: user_id.clone(), shutdown: shutdown_tx, join });
        info!(
            action = "spawn_worker",
            result = "success",
            session_id = %session_id,
            user_id = %user_id,
            "session worker spawned"
        );
        Ok(())
    }

    async fn shutdown_workers(&self) {
        let handles: Vec<(SessionId, WorkerHandle)> =
            self.active.lock().await.drain().collect();
        if handles.is_empty() {
            return;
        }

        info!(workers = handles.len(), "terminating active session workers");
        for (_, handle) in &handles {
            let _ = handle.shutdown.send(true);
        }
        for (session_id, handle) in handles {
            if let Err(e) = handle.join.await {
                error!(session_id = %session_id, user_id = %handle.user_id, error = %e, "worker join failed");
            }
        }
    }
}

async fn removal_monitor(
    active: Arc<Mutex<HashMap<SessionId, WorkerHandle>>>,
    mut completed_rx: mpsc::Receiver<CompletedSession>,
) {
    while let Some(done) = completed_rx.recv().await {
        if active.lock().await.remove(&done.session_id).is_some() {
            info!(
                action = "remove_worker",
                result = "success",
                session_id = %done.session_id,
                user_id = %done.user_id,
                "finished session worker removed"
            );
        }
    }
}

fn fingerprint(body: &[u8]) -> String {
    body.iter().take(8).map(|b| format!("{b:02x}")).collect()
}
