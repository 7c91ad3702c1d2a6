//! Shared in-memory doubles for the server integration tests: a loopback
//! message bus with ack/nack bookkeeping, a scores store with the Postgres
//! append semantics, and recording reporter/status-poster stubs.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use broker::bus::{BusChannel, BusProvider, Delivery, ExchangeType, MessageBus};
use codec::encode_frame;
use codec::wire::{InputsBatch, PredictionList, PredictionsBatch};
use session::model::{
    CalibrationStage, ScoresRecord, SessionId, SessionStatus, StateUpdate,
};
use session::store::ScoresStore;
use uq::results::CalibrationResults;

// ---------------------------------------------------------------------------
// In-memory message bus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<Vec<u8>>,
    consumer: Option<mpsc::Sender<Delivery>>,
}

#[derive(Default)]
pub struct BusState {
    queues: Mutex<HashMap<String, QueueState>>,
    exchanges: Mutex<HashMap<String, ExchangeType>>,
    bindings: Mutex<Vec<(String, String, String)>>, // (exchange, routing_key, queue)
    pub published: Mutex<Vec<PublishRecord>>,
    pub acked: Mutex<Vec<u64>>,
    pub nacked: Mutex<Vec<(u64, bool)>>,
    in_flight: Mutex<HashMap<u64, (String, Vec<u8>)>>,
    consumer_tags: Mutex<HashMap<String, String>>, // consumer tag -> queue
    next_tag: AtomicU64,
}

impl BusState {
    async fn deliver(&self, queue: &str, body: Vec<u8>) {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;

        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        if let Some(sender) = &state.consumer {
            let delivery = Delivery { body: body.clone(), tag };
            match sender.try_send(delivery) {
                Ok(()) => {
                    self.in_flight.lock().await.insert(tag, (queue.to_string(), body));
                    return;
                }
                Err(_) => state.consumer = None,
            }
        }
        state.backlog.push_back(body);
    }
}

/// Single shared "connection": every channel sees the same queues, so a
/// listener and its workers exchange messages in-process.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    pub state: Arc<BusState>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes recorded for a given exchange.
    pub async fn published_to(&self, exchange: &str) -> Vec<PublishRecord> {
        self.state
            .published
            .lock()
            .await
            .iter()
            .filter(|p| p.exchange == exchange)
            .cloned()
            .collect()
    }

    pub async fn ack_count(&self) -> usize {
        self.state.acked.lock().await.len()
    }

    pub async fn nacks(&self) -> Vec<(u64, bool)> {
        self.state.nacked.lock().await.clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn channel(&self, _prefetch: u16) -> anyhow::Result<Arc<dyn BusChannel>> {
        Ok(Arc::new(InMemoryChannel { state: self.state.clone() }))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct InMemoryChannel {
    state: Arc<BusState>,
}

#[async_trait]
impl BusChannel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> anyhow::Result<()> {
        self.state.exchanges.lock().await.insert(name.to_string(), kind);
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> anyhow::Result<()> {
        self.state.queues.lock().await.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> anyhow::Result<()> {
        self.state.bindings.lock().await.push((
            exchange.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.state.published.lock().await.push(PublishRecord {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.clone(),
        });

        if exchange.is_empty() {
            // Default exchange: the routing key names the queue.
            self.state.deliver(routing_key, body).await;
            return Ok(());
        }

        let kind = self.state.exchanges.lock().await.get(exchange).copied();
        let targets: Vec<String> = self
            .state
            .bindings
            .lock()
            .await
            .iter()
            .filter(|binding| {
                binding.0.as_str() == exchange
                    && match kind {
                        Some(ExchangeType::Fanout) => true,
                        _ => binding.1.as_str() == routing_key,
                    }
            })
            .map(|binding| binding.2.clone())
            .collect();

        for queue in targets {
            self.state.deliver(&queue, body.clone()).await;
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> anyhow::Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(1024);

        let backlog: Vec<Vec<u8>> = {
            let mut queues = self.state.queues.lock().await;
            let state = queues.entry(queue.to_string()).or_default();
            let drained = state.backlog.drain(..).collect();
            state.consumer = Some(tx.clone());
            drained
        };

        for body in backlog {
            let tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            self.state
                .in_flight
                .lock()
                .await
                .insert(tag, (queue.to_string(), body.clone()));
            let _ = tx.send(Delivery { body, tag }).await;
        }

        self.state
            .consumer_tags
            .lock()
            .await
            .insert(consumer_tag.to_string(), queue.to_string());
        Ok(rx)
    }

    async fn ack(&self, tag: u64) -> anyhow::Result<()> {
        self.state.acked.lock().await.push(tag);
        self.state.in_flight.lock().await.remove(&tag);
        Ok(())
    }

    async fn nack(&self, tag: u64, requeue: bool) -> anyhow::Result<()> {
        self.state.nacked.lock().await.push((tag, requeue));
        let entry = self.state.in_flight.lock().await.remove(&tag);
        if requeue {
            if let Some((queue, body)) = entry {
                self.state.deliver(&queue, body).await;
            }
        }
        Ok(())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> anyhow::Result<()> {
        let queue = self.state.consumer_tags.lock().await.remove(consumer_tag);
        if let Some(queue) = queue {
            if let Some(state) = self.state.queues.lock().await.get_mut(&queue) {
                state.consumer = None;
            }
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct InMemoryProvider {
    pub bus: InMemoryBus,
}

#[async_trait]
impl BusProvider for InMemoryProvider {
    async fn connect(&self) -> anyhow::Result<Arc<dyn MessageBus>> {
        Ok(Arc::new(self.bus.clone()))
    }
}

// ---------------------------------------------------------------------------
// In-memory scores store
// ---------------------------------------------------------------------------

fn empty_record(session_id: SessionId) -> ScoresRecord {
    ScoresRecord {
        session_id,
        batch_counter: 0,
        stage: CalibrationStage::InitialCalibration,
        alpha: None,
        scores: None,
        confidences: Vec::new(),
        alphas: Vec::new(),
        uncertainties: Vec::new(),
        coverages: Vec::new(),
        setsizes: Vec::new(),
        accuracy: 0.0,
        correct_preds: 0,
        total_samples: 0,
        last_updated: chrono::Utc::now(),
    }
}

#[derive(Default)]
pub struct InMemoryScoresStore {
    pub records: Mutex<HashMap<SessionId, ScoresRecord>>,
    pub inputs: Mutex<HashMap<SessionId, Vec<(i32, Vec<u8>)>>>,
    pub outputs: Mutex<HashMap<SessionId, Vec<(i32, Vec<u8>)>>>,
}

impl InMemoryScoresStore {
    pub async fn record(&self, session_id: SessionId) -> Option<ScoresRecord> {
        self.records.lock().await.get(&session_id).cloned()
    }
}

#[async_trait]
impl ScoresStore for InMemoryScoresStore {
    async fn create_scores_record(&self, session_id: SessionId) -> anyhow::Result<()> {
        self.records
            .lock()
            .await
            .entry(session_id)
            .or_insert_with(|| empty_record(session_id));
        Ok(())
    }

    async fn get_latest_scores_record(
        &self,
        session_id: SessionId,
    ) -> anyhow::Result<Option<ScoresRecord>> {
        Ok(self.records.lock().await.get(&session_id).cloned())
    }

    async fn update_session_state(
        &self,
        session_id: SessionId,
        update: StateUpdate,
    ) -> anyhow::Result<()> {
        let mut guard = self.records.lock().await;
        let Some(record) = guard.get_mut(&session_id) else {
            return Ok(());
        };

        record.batch_counter = update.batch_counter;
        record.stage = update.stage;
        record.last_updated = chrono::Utc::now();

        if let Some(scores) = update.scores {
            record.scores = Some(scores);
        }
        if let Some(alpha) = update.alpha {
            record.alpha = Some(alpha);
        }
        if let Some(v) = update.push_alpha {
            record.alphas.push(v);
        }
        if let Some(v) = update.push_uncertainty {
            record.uncertainties.push(v);
        }
        if let Some(v) = update.push_coverage {
            record.coverages.push(v);
        }
        if let Some(v) = update.push_setsize {
            record.setsizes.push(v);
        }
        if let Some(bytes) = update.push_confidences {
            record.confidences.extend(bytes);
        }
        if let Some(v) = update.accuracy {
            record.accuracy = v;
        }
        if let Some(v) = update.correct_preds {
            record.correct_preds = v;
        }
        if let Some(v) = update.total_samples {
            record.total_samples = v;
        }

        Ok(())
    }

    async fn write_inputs(
        &self,
        session_id: SessionId,
        batch_index: i32,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let mut guard = self.inputs.lock().await;
        let rows = guard.entry(session_id).or_default();
        if let Some(row) = rows.iter_mut().find(|(idx, _)| *idx == batch_index) {
            row.1 = payload.to_vec();
        } else {
            rows.push((batch_index, payload.to_vec()));
        }
        Ok(())
    }

    async fn write_outputs(
        &self,
        session_id: SessionId,
        batch_index: i32,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let mut guard = self.outputs.lock().await;
        let rows = guard.entry(session_id).or_default();
        if let Some(row) = rows.iter_mut().find(|(idx, _)| *idx == batch_index) {
            row.1 = payload.to_vec();
        } else {
            rows.push((batch_index, payload.to_vec()));
        }
        Ok(())
    }

    async fn get_inputs_from_session(
        &self,
        session_id: SessionId,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        Ok(self
            .inputs
            .lock()
            .await
            .get(&session_id)
            .map(|rows| rows.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_outputs_from_session(
        &self,
        session_id: SessionId,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        Ok(self
            .outputs
            .lock()
            .await
            .get(&session_id)
            .map(|rows| rows.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Recording reporter / status poster
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingReporter {
    pub generated: Mutex<Vec<SessionId>>,
    pub sent: Mutex<Vec<String>>,
}

#[async_trait]
impl server::report::Reporter for RecordingReporter {
    async fn generate(
        &self,
        session_id: SessionId,
        _results: &CalibrationResults,
    ) -> anyhow::Result<std::path::PathBuf> {
        self.generated.lock().await.push(session_id);
        Ok(std::path::PathBuf::from(format!("report_{session_id}.txt")))
    }

    async fn send(&self, recipient: &str) -> anyhow::Result<()> {
        self.sent.lock().await.push(recipient.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingStatusPoster {
    pub posts: Mutex<Vec<(SessionId, String, SessionStatus)>>,
}

#[async_trait]
impl server::connections::StatusPoster for RecordingStatusPoster {
    async fn post_status(
        &self,
        session_id: SessionId,
        user_id: &str,
        status: SessionStatus,
    ) -> anyhow::Result<()> {
        self.posts.lock().await.push((session_id, user_id.to_string(), status));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire fixtures
// ---------------------------------------------------------------------------

/// One-hot sample block for the `"(2,)"` inputs format: four samples, two
/// classes, labels 0,1,0,1.
pub const SAMPLE_LABELS: [i32; 4] = [0, 1, 0, 1];

pub fn inputs_frame(batch_index: i32, is_last_batch: bool) -> Vec<u8> {
    let mut data = Vec::new();
    for &label in &SAMPLE_LABELS {
        let sample = if label == 0 { [1.0f32, 0.0] } else { [0.0f32, 1.0] };
        for v in sample {
            data.extend_from_slice(&v.to_le_bytes());
        }
    }

    encode_frame(&InputsBatch {
        batch_index,
        data,
        labels: SAMPLE_LABELS.to_vec(),
        is_last_batch,
    })
}

pub fn outputs_frame(batch_index: i32, eof: bool) -> Vec<u8> {
    let pred = SAMPLE_LABELS
        .iter()
        .map(|&label| PredictionList {
            values: if label == 0 { vec![1.0, 0.0] } else { vec![0.0, 1.0] },
        })
        .collect();

    encode_frame(&PredictionsBatch { batch_index, pred, eof })
}

pub fn notification(session_id: SessionId, user_id: &str, email: Option<&str>) -> Vec<u8> {
    let mut value = serde_json::json!({
        "user_id": user_id,
        "session_id": session_id,
        "inputs_format": "(2,)",
    });
    if let Some(email) = email {
        value["email"] = serde_json::Value::String(email.to_string());
    }
    serde_json::to_vec(&value).unwrap()
}

/// Poll until `check` passes or the deadline hits.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
