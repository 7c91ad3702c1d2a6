//! Three-stage calibration driver with durable per-batch checkpoints.
//!
//! Every processed entry produces exactly one atomic `StateUpdate`; the
//! in-memory accumulators are only committed after the row write succeeds,
//! and the quantifier is rolled back to its pre-batch snapshot on any
//! failure, so a redelivered message can never double-count.

use std::sync::Arc;

use tracing::info;

use session::model::{CalibrationStage, SessionId, StateUpdate};
use session::store::ScoresStore;

use crate::error::UqError;
use crate::matrix::ProbMatrix;
use crate::quantifier::{Score, UncertaintyQuantifier, coverage};
use crate::results::{
    CalibrationResults, History, Metrics, Parameters, RawData, nan_mean, nan_std,
};

/// Stage thresholds: entries processed at counter `c <= calibration_limit`
/// calibrate, `calibration_limit < c <= uncertainty_limit` estimate
/// uncertainty, and later entries build prediction sets.
#[derive(Debug, Clone, Copy)]
pub struct StageLimits {
    pub calibration_limit: i64,
    pub uncertainty_limit: i64,
}

struct QuantifierSnapshot {
    scores: Vec<f64>,
    alpha: f64,
}

/// Deferred accumulator mutations for one entry; applied only after the
/// checkpoint write succeeds.
enum PendingCommit {
    Calibration,
    Uncertainty { alpha: f64, uncertainty: f64 },
    Prediction {
        confidences: Vec<f64>,
        coverage: f64,
        set_size: i64,
        correct_preds: i64,
        total_samples: i64,
        accuracy: f64,
    },
}

pub struct UtraceCalculator {
    store: Arc<dyn ScoresStore>,
    session_id: SessionId,
    limits: StageLimits,

    stage: CalibrationStage,
    uq: UncertaintyQuantifier,
    batch_counter: i64,

    alphas: Vec<f64>,
    uncertainties: Vec<f64>,
    batch_coverages: Vec<f64>,
    batch_setsizes: Vec<i64>,

    correct_preds: i64,
    total_samples: i64,
    accuracy: f64,
    confidences: Vec<f64>,
}

impl UtraceCalculator {
    /// Load (or idempotently create) the session's scores row and rebuild the
    /// full in-memory state from it.
    pub async fn restore(
        store: Arc<dyn ScoresStore>,
        session_id: SessionId,
        limits: StageLimits,
    ) -> anyhow::Result<Self> {
        let mut calc = Self {
            store,
            session_id,
            limits,
            stage: CalibrationStage::InitialCalibration,
            uq: UncertaintyQuantifier::new(Score::Lac),
            batch_counter: 0,
            alphas: Vec::new(),
            uncertainties: Vec::new(),
            batch_coverages: Vec::new(),
            batch_setsizes: Vec::new(),
            correct_preds: 0,
            total_samples: 0,
            accuracy: 0.0,
            confidences: Vec::new(),
        };

        let Some(record) = calc.store.get_latest_scores_record(session_id).await? else {
            calc.store.create_scores_record(session_id).await?;
            return Ok(calc);
        };

        calc.batch_counter = record.batch_counter;
        calc.stage = record.stage;

        if let Some(bytes) = &record.scores {
            calc.uq.reset(UncertaintyQuantifier::decode_scores(bytes)?);
        }
        if let Some(alpha) = record.alpha {
            if !calc.uq.conformity_scores().is_empty() {
                calc.uq.set_alpha(alpha)?;
            }
        }

        calc.alphas = record.alphas;
        calc.uncertainties = record.uncertainties;
        calc.batch_coverages = record.coverages;
        calc.batch_setsizes = record.setsizes;
        calc.confidences = UncertaintyQuantifier::decode_scores(&record.confidences)?;

        calc.correct_preds = record.correct_preds;
        calc.total_samples = record.total_samples;
        calc.accuracy = record.accuracy;

        info!(
            action = "restore_session",
            result = "success",
            session_id = %session_id,
            batch_counter = calc.batch_counter,
            stage = %calc.stage,
            scores = calc.uq.conformity_scores().len(),
            alphas = calc.alphas.len(),
            "restored calibration state"
        );

        Ok(calc)
    }

    pub fn batch_counter(&self) -> i64 {
        self.batch_counter
    }

    pub fn stage(&self) -> CalibrationStage {
        self.stage
    }

    /// Run one fully-paired entry through the current stage and persist the
    /// resulting checkpoint atomically.
    pub async fn process_entry(
        &mut self,
        probs: &ProbMatrix,
        labels: &[i32],
    ) -> anyhow::Result<()> {
        let snapshot = QuantifierSnapshot {
            scores: self.uq.conformity_scores().to_vec(),
            alpha: self.uq.alpha(),
        };

        let mut update = StateUpdate {
            batch_counter: self.batch_counter + 1,
            stage: self.stage,
            ..Default::default()
        };

        let pending = match self.evaluate(probs, labels, &mut update) {
            Ok(pending) => pending,
            Err(e) => {
                self.rollback(snapshot);
                return Err(e.into());
            }
        };

        let next_stage = update.stage;
        if let Err(e) = self.store.update_session_state(self.session_id, update).await {
            self.rollback(snapshot);
            return Err(e);
        }

        self.commit(pending);
        if next_stage != self.stage {
            info!(
                action = "update_stage",
                result = "success",
                session_id = %self.session_id,
                from = %self.stage,
                to = %next_stage,
                "stage transition"
            );
            self.stage = next_stage;
        }
        self.batch_counter += 1;

        Ok(())
    }

    /// Mark the session FINISHED and persist the terminal stage. Idempotent.
    pub async fn finish(&mut self) -> anyhow::Result<()> {
        if self.stage == CalibrationStage::Finished {
            return Ok(());
        }

        let update = StateUpdate {
            batch_counter: self.batch_counter,
            stage: CalibrationStage::Finished,
            ..Default::default()
        };
        self.store.update_session_state(self.session_id, update).await?;

        info!(
            action = "update_stage",
            result = "success",
            session_id = %self.session_id,
            from = %self.stage,
            "stage transition to FINISHED"
        );
        self.stage = CalibrationStage::Finished;
        Ok(())
    }

    /// Assemble the final results; only valid once FINISHED.
    pub fn get_results(&self) -> Result<CalibrationResults, UqError> {
        if self.stage != CalibrationStage::Finished {
            return Err(UqError::NotFinished);
        }

        Ok(CalibrationResults {
            metrics: Metrics {
                accuracy: self.accuracy,
                model_uncertainty_upper_bound: nan_mean(&self.uncertainties),
                empirical_coverage: nan_mean(&self.batch_coverages),
                max_set_size: self.batch_setsizes.iter().copied().max().unwrap_or(0),
                alpha: nan_mean(&self.alphas),
            },
            history: History {
                alphas: self.alphas.clone(),
                uncertainty: self.uncertainties.clone(),
                batch_coverage: self.batch_coverages.clone(),
                batch_setsizes: self.batch_setsizes.clone(),
            },
            raw_data: RawData { confidences: self.confidences.clone() },
            parameters: Parameters {
                alpha_std: nan_std(&self.alphas),
                u_std: nan_std(&self.uncertainties),
            },
        })
    }

    fn evaluate(
        &mut self,
        probs: &ProbMatrix,
        labels: &[i32],
        update: &mut StateUpdate,
    ) -> Result<PendingCommit, UqError> {
        if self.batch_counter <= self.limits.calibration_limit {
            self.uq.calibrate(probs, labels, true)?;
            update.scores = Some(self.uq.scores_bytes());

            if self.batch_counter == self.limits.calibration_limit {
                update.stage = CalibrationStage::UncertaintyEstimation;
            }
            Ok(PendingCommit::Calibration)
        } else if self.batch_counter <= self.limits.uncertainty_limit {
            let (uncertainty, alpha) = self.uq.get_uncertainty_opt(probs, labels)?;

            update.alpha = Some(alpha);
            update.push_alpha = Some(alpha);
            update.push_uncertainty = Some(uncertainty);

            if self.batch_counter == self.limits.uncertainty_limit {
                update.stage = CalibrationStage::PredictionSetConstruction;
            }
            Ok(PendingCommit::Uncertainty { alpha, uncertainty })
        } else {
            probs.check_labels(labels)?;

            let preds = probs.argmax();
            let confidences = probs.row_max();
            let mut correct = 0i64;
            for (pred, &label) in preds.iter().zip(labels) {
                if *pred == label as usize {
                    correct += 1;
                }
            }

            let correct_preds = self.correct_preds + correct;
            let total_samples = self.total_samples + labels.len() as i64;
            let accuracy = if total_samples > 0 {
                correct_preds as f64 / total_samples as f64
            } else {
                0.0
            };

            let sets = self.uq.build_prediction_sets(probs, false)?;
            let cov = coverage(labels, &sets);
            let set_size = sets
                .iter()
                .map(|set| set.iter().filter(|&&b| b).count() as i64)
                .max()
                .unwrap_or(0);

            update.push_confidences = Some(encode_f64s(&confidences));
            update.push_coverage = Some(cov);
            update.push_setsize = Some(set_size);
            update.accuracy = Some(accuracy);
            update.correct_preds = Some(correct_preds);
            update.total_samples = Some(total_samples);

            Ok(PendingCommit::Prediction {
                confidences,
                coverage: cov,
                set_size,
                correct_preds,
                total_samples,
                accuracy,
            })
        }
    }

    fn commit(&mut self, pending: PendingCommit) {
        match pending {
            PendingCommit::Calibration => {}
            PendingCommit::Uncertainty { alpha, uncertainty } => {
                self.alphas.push(alpha);
                self.uncertainties.push(uncertainty);
            }
            PendingCommit::Prediction {
                confidences,
                coverage,
                set_size,
                correct_preds,
                total_samples,
                accuracy,
            } => {
                self.confidences.extend(confidences);
                self.batch_coverages.push(coverage);
                self.batch_setsizes.push(set_size);
                self.correct_preds = correct_preds;
                self.total_samples = total_samples;
                self.accuracy = accuracy;
            }
        }
    }

    fn rollback(&mut self, snapshot: QuantifierSnapshot) {
        let QuantifierSnapshot { scores, alpha } = snapshot;
        self.uq.reset(scores);
        if !alpha.is_nan() && !self.uq.conformity_scores().is_empty() {
            // Restoring alpha re-derives q_hat from the restored pool; with a
            // non-empty pool this cannot fail.
            let _ = self.uq.set_alpha(alpha);
        }
    }
}

fn encode_f64s(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}
