//! Joins the inputs and predictions streams of one session by batch index.
//!
//! Design invariants:
//! - a batch reaches the calibration engine exactly once per run, and only
//!   when all three slots (inputs, labels, probabilities) are filled
//! - duplicate deliveries of a slot are dropped before any persistence
//! - raw payloads are persisted on arrival so a restarted worker can replay
//!   them in first-arrival order
//! - end of session requires both terminal markers AND no half-paired batch
//!   left behind

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use broker::bus::BusChannel;
use broker::topology::{MLFLOW_EXCHANGE, MLFLOW_ROUTING_KEY};
use codec::tensor::decode_batch;
use codec::wire::{InputsBatch, PairedBatch, PredictionList, PredictionsBatch};
use codec::{InputsFormat, Tensor, decode_frame, encode_frame};
use session::model::SessionId;
use session::store::ScoresStore;
use uq::matrix::ProbMatrix;
use uq::results::CalibrationResults;
use uq::UtraceCalculator;

/// What the worker should do with the message that produced this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairerStatus {
    /// Absorbed; the session continues.
    Pending,
    /// Already-seen slot; dropped.
    Duplicate,
    /// Both streams are terminated and every batch is paired.
    SessionComplete,
}

#[derive(Default)]
struct BatchSlots {
    inputs: Option<Tensor>,
    labels: Option<Vec<i32>>,
    probs: Option<ProbMatrix>,
}

impl BatchSlots {
    fn complete(&self) -> bool {
        self.inputs.is_some() && self.labels.is_some() && self.probs.is_some()
    }

    fn ready(&self) -> Option<(Tensor, Vec<i32>, ProbMatrix)> {
        match (&self.inputs, &self.labels, &self.probs) {
            (Some(t), Some(l), Some(p)) => Some((t.clone(), l.clone(), p.clone())),
            _ => None,
        }
    }
}

pub struct BatchPairer {
    session_id: SessionId,
    user_id: String,
    inputs_format: InputsFormat,
    store: Arc<dyn ScoresStore>,
    calculator: UtraceCalculator,
    publisher: Arc<dyn BusChannel>,

    batches: HashMap<i32, BatchSlots>,
    inputs_eof: bool,
    outputs_eof: bool,
    replaying: bool,
}

impl BatchPairer {
    pub fn new(
        session_id: SessionId,
        user_id: String,
        inputs_format: InputsFormat,
        store: Arc<dyn ScoresStore>,
        calculator: UtraceCalculator,
        publisher: Arc<dyn BusChannel>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            inputs_format,
            store,
            calculator,
            publisher,
            batches: HashMap::new(),
            inputs_eof: false,
            outputs_eof: false,
            replaying: false,
        }
    }

    pub fn calculator(&self) -> &UtraceCalculator {
        &self.calculator
    }

    /// Replay every persisted payload through the regular handling path
    /// (without re-persisting) to rebuild the in-memory map and EOF flags.
    /// Batches already reflected in the restored `batch_counter` are not
    /// re-fed to the calibration engine.
    pub async fn restore_state(&mut self) -> anyhow::Result<PairerStatus> {
        self.replaying = true;

        let inputs = self.store.get_inputs_from_session(self.session_id).await?;
        for frame in &inputs {
            self.apply_inputs(frame, false).await?;
        }

        let outputs = self.store.get_outputs_from_session(self.session_id).await?;
        for frame in &outputs {
            self.apply_outputs(frame, false).await?;
        }

        self.replaying = false;
        info!(
            action = "restore_state",
            result = "success",
            session_id = %self.session_id,
            batches = self.batches.len(),
            inputs_eof = self.inputs_eof,
            outputs_eof = self.outputs_eof,
            "pairer state restored"
        );
        Ok(self.eof_status())
    }

    pub async fn handle_inputs(&mut self, frame: &[u8]) -> anyhow::Result<PairerStatus> {
        self.apply_inputs(frame, true).await
    }

    pub async fn handle_outputs(&mut self, frame: &[u8]) -> anyhow::Result<PairerStatus> {
        self.apply_outputs(frame, true).await
    }

    /// Terminal transition: mark the calibration FINISHED and assemble the
    /// results for the reporter.
    pub async fn finish_session(&mut self) -> anyhow::Result<CalibrationResults> {
        self.calculator.finish().await?;
        Ok(self.calculator.get_results()?)
    }

    async fn apply_inputs(&mut self, frame: &[u8], persist: bool) -> anyhow::Result<PairerStatus> {
        let msg: InputsBatch = decode_frame(frame)?;
        let tensor = decode_batch(&msg.data, &self.inputs_format)?;

        if self
            .batches
            .get(&msg.batch_index)
            .is_some_and(|slots| slots.inputs.is_some())
        {
            warn!(
                action = "store_inputs",
                result = "duplicate",
                session_id = %self.session_id,
                batch_index = msg.batch_index,
                "duplicate inputs batch dropped"
            );
            return Ok(PairerStatus::Duplicate);
        }

        if persist {
            self.store
                .write_inputs(self.session_id, msg.batch_index, frame)
                .await?;
        }

        let slots = self.batches.entry(msg.batch_index).or_default();
        slots.inputs = Some(tensor);
        slots.labels = Some(msg.labels);
        let ready = slots.ready();

        if let Some((tensor, labels, probs)) = ready {
            self.process_paired(msg.batch_index, tensor, labels, probs).await?;
        }

        if msg.is_last_batch {
            debug!(session_id = %self.session_id, "inputs stream terminated");
            self.inputs_eof = true;
        }

        Ok(self.eof_status())
    }

    async fn apply_outputs(&mut self, frame: &[u8], persist: bool) -> anyhow::Result<PairerStatus> {
        let msg: PredictionsBatch = decode_frame(frame)?;
        let probs = ProbMatrix::from_rows(
            msg.pred.iter().map(|p| p.values.clone()).collect(),
        )?;

        if self
            .batches
            .get(&msg.batch_index)
            .is_some_and(|slots| slots.probs.is_some())
        {
            warn!(
                action = "store_outputs",
                result = "duplicate",
                session_id = %self.session_id,
                batch_index = msg.batch_index,
                "duplicate predictions batch dropped"
            );
            return Ok(PairerStatus::Duplicate);
        }

        if persist {
            self.store
                .write_outputs(self.session_id, msg.batch_index, frame)
                .await?;
        }

        let slots = self.batches.entry(msg.batch_index).or_default();
        slots.probs = Some(probs);
        let ready = slots.ready();

        if let Some((tensor, labels, probs)) = ready {
            self.process_paired(msg.batch_index, tensor, labels, probs).await?;
        }

        if msg.eof {
            debug!(session_id = %self.session_id, "predictions stream terminated");
            self.outputs_eof = true;
        }

        Ok(self.eof_status())
    }

    async fn process_paired(
        &mut self,
        batch_index: i32,
        tensor: Tensor,
        labels: Vec<i32>,
        probs: ProbMatrix,
    ) -> anyhow::Result<()> {
        let already_counted =
            self.replaying && i64::from(batch_index) < self.calculator.batch_counter();

        if already_counted {
            debug!(
                session_id = %self.session_id,
                batch_index,
                batch_counter = self.calculator.batch_counter(),
                "replayed batch already checkpointed; not re-processed"
            );
        } else {
            self.calculator.process_entry(&probs, &labels).await?;
            info!(
                action = "process_batch",
                result = "success",
                session_id = %self.session_id,
                batch_index,
                batch_counter = self.calculator.batch_counter(),
                "paired batch processed"
            );
        }

        self.publish_paired(batch_index, &tensor, &labels, &probs).await;
        Ok(())
    }

    /// Best-effort observability fan-out; a publish failure never fails the
    /// batch.
    async fn publish_paired(
        &self,
        batch_index: i32,
        tensor: &Tensor,
        labels: &[i32],
        probs: &ProbMatrix,
    ) {
        let envelope = PairedBatch {
            batch_index,
            user_id: self.user_id.clone(),
            session_id: self.session_id.to_string(),
            data: tensor.to_le_bytes(),
            labels: labels.to_vec(),
            pred: (0..probs.rows())
                .map(|i| PredictionList { values: probs.row(i).to_vec() })
                .collect(),
        };

        if let Err(e) = self
            .publisher
            .publish(MLFLOW_EXCHANGE, MLFLOW_ROUTING_KEY, encode_frame(&envelope))
            .await
        {
            warn!(
                action = "publish_paired",
                result = "fail",
                session_id = %self.session_id,
                batch_index,
                error = ?e,
                "paired-batch publish failed"
            );
        }
    }

    fn eof_status(&self) -> PairerStatus {
        let all_paired = self.batches.values().all(BatchSlots::complete);
        if self.inputs_eof && self.outputs_eof && all_paired {
            PairerStatus::SessionComplete
        } else {
            PairerStatus::Pending
        }
    }
}
