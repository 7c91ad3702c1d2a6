//! Per-session worker: owns the session's broker connection, pairer,
//! calibration engine and DAO handle for its whole lifecycle.
//!
//! ```text
//! CREATED --run--> RUNNING --EOF------> COMPLETED -> exit
//!                     |
//!                     +--- timeout ---> TIMEOUT  -> exit
//!                     |
//!                     +--- SIGTERM ---> TERMINATED -> exit (status stays IN_PROGRESS)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{Instrument, error, info, warn};

use broker::bus::{BusChannel, BusProvider, Delivery, ExchangeType};
use broker::topology;
use codec::InputsFormat;
use session::model::{SessionDescriptor, SessionStatus};
use session::store::ScoresStore;
use uq::UtraceCalculator;
use uq::calculator::StageLimits;

use crate::config::Environment;
use crate::connections::StatusPoster;
use crate::pairer::{BatchPairer, PairerStatus};
use crate::report::Reporter;

/// Collaborators handed in by the supervisor. Every worker dials its own
/// broker connection through the provider; nothing here is shared mutable
/// state.
#[derive(Clone)]
pub struct WorkerContext {
    pub bus_provider: Arc<dyn BusProvider>,
    pub store: Arc<dyn ScoresStore>,
    pub status: Arc<dyn StatusPoster>,
    pub reporter: Arc<dyn Reporter>,
}

#[derive(Clone)]
pub struct WorkerSettings {
    pub pod_name: String,
    pub client_timeout: Duration,
    pub limits: StageLimits,
    pub environment: Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Inputs,
    Outputs,
}

enum Flow {
    Continue,
    Complete,
}

/// Lock discipline: `last_message_time` and `status` are independent leaf
/// mutexes. Neither is ever acquired while the other is held.
pub struct SessionWorker {
    descriptor: SessionDescriptor,
    inputs_format: InputsFormat,
    ctx: WorkerContext,
    settings: WorkerSettings,

    last_message_time: Arc<Mutex<Instant>>,
    status: Arc<Mutex<SessionStatus>>,
}

impl SessionWorker {
    pub fn new(
        descriptor: SessionDescriptor,
        inputs_format: InputsFormat,
        ctx: WorkerContext,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            descriptor,
            inputs_format,
            ctx,
            settings,
            last_message_time: Arc::new(Mutex::new(Instant::now())),
            status: Arc::new(Mutex::new(SessionStatus::InProgress)),
        }
    }

    /// Drive the session to one of its terminal states. The returned status
    /// is what the session ended as; a cooperative termination leaves it
    /// IN_PROGRESS so another replica can resume it.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<SessionStatus> {
        let span = common::session_span(self.descriptor.session_id);
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<SessionStatus> {
        let session_id = self.descriptor.session_id;

        let bus = self.ctx.bus_provider.connect().await?;
        let channel = bus.channel(1).await?;

        let inputs_queue = topology::inputs_queue(session_id);
        let outputs_queue = topology::outputs_queue(session_id);
        channel.declare_queue(&inputs_queue).await?;
        channel.declare_queue(&outputs_queue).await?;
        channel
            .declare_exchange(topology::MLFLOW_EXCHANGE, ExchangeType::Direct)
            .await?;

        let calculator = UtraceCalculator::restore(
            self.ctx.store.clone(),
            session_id,
            self.settings.limits,
        )
        .await?;

        let mut pairer = BatchPairer::new(
            session_id,
            self.descriptor.user_id.clone(),
            self.inputs_format.clone(),
            self.ctx.store.clone(),
            calculator,
            channel.clone(),
        );

        if pairer.restore_state().await? == PairerStatus::SessionComplete {
            info!("session already complete on restore");
            self.finalize_completed(&mut pairer).await?;
            let _ = channel.close().await;
            let _ = bus.close().await;
            return Ok(SessionStatus::Completed);
        }

        let inputs_tag = format!("{}-{}-inputs", self.settings.pod_name, session_id);
        let outputs_tag = format!("{}-{}-outputs", self.settings.pod_name, session_id);
        let mut inputs_rx = channel.consume(&inputs_queue, &inputs_tag).await?;
        let mut outputs_rx = channel.consume(&outputs_queue, &outputs_tag).await?;

        let (timeout_tx, mut timeout_rx) = mpsc::channel::<()>(1);
        let (watchdog_stop_tx, watchdog_stop_rx) = watch::channel(false);
        let watchdog = tokio::spawn(watchdog_loop(
            self.last_message_time.clone(),
            self.status.clone(),
            self.settings.client_timeout,
            timeout_tx,
            watchdog_stop_rx,
        ));

        *self.last_message_time.lock().await = Instant::now();
        info!(user_id = %self.descriptor.user_id, "session worker running");

        let result = self
            .consume_loop(
                &channel,
                &mut pairer,
                &mut inputs_rx,
                &mut outputs_rx,
                &mut shutdown,
                &mut timeout_rx,
            )
            .await;

        let _ = watchdog_stop_tx.send(true);
        let _ = watchdog.await;

        let _ = channel.cancel_consumer(&inputs_tag).await;
        let _ = channel.cancel_consumer(&outputs_tag).await;
        let _ = channel.close().await;
        let _ = bus.close().await;

        result
    }

    async fn consume_loop(
        &self,
        channel: &Arc<dyn BusChannel>,
        pairer: &mut BatchPairer,
        inputs_rx: &mut mpsc::Receiver<Delivery>,
        outputs_rx: &mut mpsc::Receiver<Delivery>,
        shutdown: &mut watch::Receiver<bool>,
        timeout_rx: &mut mpsc::Receiver<()>,
    ) -> anyhow::Result<SessionStatus> {
        if *shutdown.borrow() {
            return Ok(SessionStatus::InProgress);
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("termination requested; leaving session resumable");
                        return Ok(SessionStatus::InProgress);
                    }
                }
                Some(()) = timeout_rx.recv() => {
                    warn!(action = "watchdog", result = "timeout", "session timed out waiting for messages");
                    self.post_status(SessionStatus::Timeout).await;
                    return Ok(SessionStatus::Timeout);
                }
                delivery = inputs_rx.recv() => match delivery {
                    Some(d) => {
                        if let Flow::Complete =
                            self.handle_delivery(channel, pairer, d, StreamKind::Inputs).await?
                        {
                            return Ok(SessionStatus::Completed);
                        }
                    }
                    None => anyhow::bail!("inputs consumer closed unexpectedly"),
                },
                delivery = outputs_rx.recv() => match delivery {
                    Some(d) => {
                        if let Flow::Complete =
                            self.handle_delivery(channel, pairer, d, StreamKind::Outputs).await?
                        {
                            return Ok(SessionStatus::Completed);
                        }
                    }
                    None => anyhow::bail!("outputs consumer closed unexpectedly"),
                },
            }
        }
    }

    async fn handle_delivery(
        &self,
        channel: &Arc<dyn BusChannel>,
        pairer: &mut BatchPairer,
        delivery: Delivery,
        kind: StreamKind,
    ) -> anyhow::Result<Flow> {
        *self.last_message_time.lock().await = Instant::now();

        let result = match kind {
            StreamKind::Inputs => pairer.handle_inputs(&delivery.body).await,
            StreamKind::Outputs => pairer.handle_outputs(&delivery.body).await,
        };

        match result {
            Ok(PairerStatus::Pending) | Ok(PairerStatus::Duplicate) => {
                channel.ack(delivery.tag).await?;
                Ok(Flow::Continue)
            }
            Ok(PairerStatus::SessionComplete) => {
                channel.ack(delivery.tag).await?;
                self.finalize_completed(pairer).await?;
                Ok(Flow::Complete)
            }
            Err(e) if is_recoverable(&e) => {
                warn!(
                    action = "handle_message",
                    result = "fail",
                    stream = ?kind,
                    error = %e,
                    "message rejected"
                );
                channel.nack(delivery.tag, false).await?;
                Ok(Flow::Continue)
            }
            // Persistence is down: leave the delivery unsettled so the broker
            // redelivers it once the channel closes, and end the worker with
            // the session still IN_PROGRESS.
            Err(e) => Err(e),
        }
    }

    async fn finalize_completed(&self, pairer: &mut BatchPairer) -> anyhow::Result<()> {
        *self.status.lock().await = SessionStatus::Completed;
        let results = pairer.finish_session().await?;

        if self.settings.environment == Environment::Production {
            match self
                .ctx
                .reporter
                .generate(self.descriptor.session_id, &results)
                .await
            {
                Ok(_) => match &self.descriptor.recipient_email {
                    Some(recipient) => {
                        if let Err(e) = self.ctx.reporter.send(recipient).await {
                            error!(
                                action = "send_report",
                                result = "fail",
                                error = %e,
                                "report delivery failed"
                            );
                        }
                    }
                    None => info!("no recipient email; report kept in artifacts"),
                },
                Err(e) => error!(
                    action = "build_report",
                    result = "fail",
                    error = %e,
                    "report generation failed"
                ),
            }
        }

        self.post_status(SessionStatus::Completed).await;
        Ok(())
    }

    async fn post_status(&self, status: SessionStatus) {
        if let Err(e) = self
            .ctx
            .status
            .post_status(self.descriptor.session_id, &self.descriptor.user_id, status)
            .await
        {
            warn!(
                action = "post_status",
                result = "fail",
                status = %status,
                error = %e,
                "status update failed"
            );
        }
    }
}

/// Local, per-message failures: the message is rejected and the session
/// continues. Anything else is worker-fatal.
fn is_recoverable(e: &anyhow::Error) -> bool {
    e.downcast_ref::<codec::CodecError>().is_some() || e.downcast_ref::<uq::UqError>().is_some()
}

/// Samples the activity timestamp at half the timeout period; flips the
/// session status to TIMEOUT and fires once when the silence exceeds it.
async fn watchdog_loop(
    last_message_time: Arc<Mutex<Instant>>,
    status: Arc<Mutex<SessionStatus>>,
    timeout: Duration,
    timeout_tx: mpsc::Sender<()>,
    mut stop: watch::Receiver<bool>,
) {
    let interval = timeout / 2;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
                continue;
            }
        }

        let last = *last_message_time.lock().await;
        if last.elapsed() > timeout {
            let mut status_guard = status.lock().await;
            if *status_guard == SessionStatus::InProgress {
                *status_guard = SessionStatus::Timeout;
                drop(status_guard);
                let _ = timeout_tx.send(()).await;
                return;
            }
        }
    }
}
