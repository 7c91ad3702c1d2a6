//! Conformal predictor over class-probability batches.
//!
//! Calibration accumulates one sorted pool of conformity scores; `alpha`
//! selection derives the `q_hat` threshold from that pool with the "higher"
//! quantile method, and prediction sets are the classes whose score clears
//! the threshold.

use tracing::{debug, warn};

use crate::error::UqError;
use crate::matrix::ProbMatrix;

/// Conformity scoring function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Score {
    /// Least Ambiguous set-valued Classifier: `1 - p`.
    #[default]
    Lac,
    /// Adaptive Prediction Sets: cumulative sorted-probability mass.
    Aps,
}

pub struct UncertaintyQuantifier {
    score: Score,
    /// Sorted ascending.
    conformity_scores: Vec<f64>,
    q_hat: f64,
    alpha: f64,
}

impl UncertaintyQuantifier {
    pub fn new(score: Score) -> Self {
        Self { score, conformity_scores: Vec::new(), q_hat: f64::NAN, alpha: f64::NAN }
    }

    /// Replace the score pool (used on resume); clears `alpha`/`q_hat`.
    pub fn reset(&mut self, mut conformity_scores: Vec<f64>) {
        conformity_scores.sort_by(f64::total_cmp);
        self.conformity_scores = conformity_scores;
        self.q_hat = f64::NAN;
        self.alpha = f64::NAN;
        debug!(scores = self.conformity_scores.len(), "quantifier reset");
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn q_hat(&self) -> f64 {
        self.q_hat
    }

    pub fn conformity_scores(&self) -> &[f64] {
        &self.conformity_scores
    }

    /// Score pool as little-endian f64 bytes, the persisted form.
    pub fn scores_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.conformity_scores.len() * 8);
        for v in &self.conformity_scores {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Inverse of [`scores_bytes`].
    pub fn decode_scores(bytes: &[u8]) -> Result<Vec<f64>, UqError> {
        if bytes.len() % 8 != 0 {
            return Err(UqError::CorruptScores(bytes.len()));
        }
        Ok(bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect())
    }

    /// Set the miscoverage level and derive `q_hat` from the current pool.
    /// Rejects an empty pool: there is no quantile to take.
    pub fn set_alpha(&mut self, alpha: f64) -> Result<(), UqError> {
        let n = self.conformity_scores.len();
        if n == 0 {
            return Err(UqError::NotCalibrated);
        }

        let mut q_level = ((n as f64 + 1.0) * (1.0 - alpha)).ceil() / n as f64;
        if q_level > 1.0 {
            warn!(
                scores = n,
                alpha,
                "q_level > 1.0, clamping to 1.0"
            );
            q_level = 1.0;
        }

        self.alpha = alpha;
        self.q_hat = quantile_higher(&self.conformity_scores, q_level);
        debug!(q_hat = self.q_hat, alpha, "q_hat updated");
        Ok(())
    }

    /// Fold a labeled batch into the calibration pool. With `batched` the new
    /// scores are merged into the existing pool; otherwise they replace it.
    pub fn calibrate(
        &mut self,
        probs: &ProbMatrix,
        labels: &[i32],
        batched: bool,
    ) -> Result<(), UqError> {
        probs.check_labels(labels)?;
        debug!(samples = labels.len(), "calibrating");

        let new_scores = conformity(self.score, probs, labels);
        if batched {
            self.conformity_scores.extend(new_scores);
        } else {
            self.conformity_scores = new_scores;
        }
        self.conformity_scores.sort_by(f64::total_cmp);
        Ok(())
    }

    /// Grid-search the calibrated score pool for the alpha that minimizes the
    /// model-uncertainty upper bound on this labeled batch. Installs the best
    /// alpha and returns `(uncertainty_upper_bound, alpha)`.
    ///
    /// Candidate `q_hat = s[j]` of the ascending pool corresponds to
    /// `alpha_j = 1 - (j+1)/(N+1)`; the bound is `E[1/|set| | covered]`
    /// scaled by the coverage level `1 - alpha_j`.
    pub fn get_uncertainty_opt(
        &mut self,
        probs: &ProbMatrix,
        labels: &[i32],
    ) -> Result<(f64, f64), UqError> {
        let n_cal = self.conformity_scores.len();
        if n_cal == 0 {
            return Err(UqError::NotCalibrated);
        }
        probs.check_labels(labels)?;
        let ns = probs.rows();

        let mut best_alpha = f64::NAN;
        let mut max_lower_bound = 0.0f64;

        for (j, &q_hat) in self.conformity_scores.iter().enumerate() {
            let alpha = 1.0 - (j as f64 + 1.0) / (n_cal as f64 + 1.0);
            let threshold = 1.0 - q_hat;

            let mut inv_size_sum = 0.0f64;
            let mut n_covered = 0usize;
            for i in 0..ns {
                let row = probs.row(i);
                let set_size = row.iter().filter(|&&p| f64::from(p) >= threshold).count();
                if f64::from(row[labels[i] as usize]) >= threshold {
                    n_covered += 1;
                    inv_size_sum += 1.0 / set_size as f64;
                }
            }

            let p1_hat = if n_covered > 0 { inv_size_sum / n_covered as f64 } else { 0.0 };
            let lower_bound = p1_hat * (1.0 - alpha);

            if lower_bound > max_lower_bound {
                max_lower_bound = lower_bound;
                best_alpha = alpha;
            }
        }

        if best_alpha.is_nan() {
            return Err(UqError::DegenerateUncertainty);
        }

        self.set_alpha(best_alpha)?;
        debug!(alpha = best_alpha, bound = 1.0 - max_lower_bound, "best alpha selected");
        Ok((1.0 - max_lower_bound, best_alpha))
    }

    /// Per-sample boolean class membership at the calibrated threshold.
    pub fn build_prediction_sets(
        &self,
        probs: &ProbMatrix,
        force_non_empty_sets: bool,
    ) -> Result<Vec<Vec<bool>>, UqError> {
        if self.q_hat.is_nan() {
            return Err(UqError::AlphaNotSet);
        }

        let scores = class_scores(self.score, probs);
        let mut sets: Vec<Vec<bool>> = scores
            .into_iter()
            .map(|row| row.into_iter().map(|s| s <= self.q_hat).collect())
            .collect();

        if force_non_empty_sets {
            for (set, pred) in sets.iter_mut().zip(probs.argmax()) {
                set[pred] = true;
            }
        }

        Ok(sets)
    }
}

/// Conformity score of the true label for each sample.
fn conformity(score: Score, probs: &ProbMatrix, labels: &[i32]) -> Vec<f64> {
    match score {
        Score::Lac => labels
            .iter()
            .enumerate()
            .map(|(i, &label)| 1.0 - f64::from(probs.row(i)[label as usize]))
            .collect(),
        Score::Aps => labels
            .iter()
            .enumerate()
            .map(|(i, &label)| aps_row_scores(probs.row(i))[label as usize])
            .collect(),
    }
}

/// Per-class score for each sample, thresholded by `q_hat` when building sets.
fn class_scores(score: Score, probs: &ProbMatrix) -> Vec<Vec<f64>> {
    match score {
        Score::Lac => (0..probs.rows())
            .map(|i| probs.row(i).iter().map(|&p| 1.0 - f64::from(p)).collect())
            .collect(),
        Score::Aps => (0..probs.rows()).map(|i| aps_row_scores(probs.row(i))).collect(),
    }
}

/// APS score per class: total probability mass of classes at least as likely,
/// including the class itself.
fn aps_row_scores(row: &[f32]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..row.len()).collect();
    order.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut scores = vec![0.0f64; row.len()];
    let mut cum = 0.0f64;
    for &idx in &order {
        cum += f64::from(row[idx]);
        scores[idx] = cum;
    }
    scores
}

/// Quantile with numpy's `method='higher'`: the element at the ceiling of the
/// virtual index `q * (n - 1)` of the ascending-sorted data.
fn quantile_higher(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    debug_assert!(n > 0);
    let pos = (q.clamp(0.0, 1.0) * (n as f64 - 1.0)).ceil() as usize;
    sorted[pos.min(n - 1)]
}

/// Fraction of samples whose true label made it into the prediction set.
pub fn coverage(labels: &[i32], sets: &[Vec<bool>]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let mut hits = 0usize;
    for (i, &label) in labels.iter().enumerate() {
        let covered = sets
            .get(i)
            .and_then(|set| set.get(label as usize))
            .copied()
            .unwrap_or(false);
        if covered {
            hits += 1;
        }
    }
    hits as f64 / labels.len() as f64
}
