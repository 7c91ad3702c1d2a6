use std::fmt;

use serde::Deserialize;

pub type SessionId = uuid::Uuid;

/// Terminal-facing session status, as reported to the Connections service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    InProgress,
    Timeout,
    Completed,
}

impl SessionStatus {
    /// Lowercase path segment for `PUT /sessions/{id}/status/{status}`.
    pub fn wire_name(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Timeout => "timeout",
            SessionStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Timeout => "TIMEOUT",
            SessionStatus::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

/// Calibration pipeline stage. The discriminants are the persisted integers;
/// the derive order gives the forward-only total order
/// INITIAL < UNCERTAINTY < PREDICTION_SET < FINISHED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CalibrationStage {
    #[default]
    InitialCalibration = 1,
    UncertaintyEstimation = 2,
    PredictionSetConstruction = 3,
    Finished = 4,
}

impl CalibrationStage {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> anyhow::Result<Self> {
        match value {
            1 => Ok(CalibrationStage::InitialCalibration),
            2 => Ok(CalibrationStage::UncertaintyEstimation),
            3 => Ok(CalibrationStage::PredictionSetConstruction),
            4 => Ok(CalibrationStage::Finished),
            other => Err(anyhow::anyhow!("invalid calibration stage value: {}", other)),
        }
    }
}

impl fmt::Display for CalibrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CalibrationStage::InitialCalibration => "INITIAL_CALIBRATION",
            CalibrationStage::UncertaintyEstimation => "UNCERTAINTY_ESTIMATION",
            CalibrationStage::PredictionSetConstruction => "PREDICTION_SET_CONSTRUCTION",
            CalibrationStage::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

/// Contract of the new-session notification consumed by the listener.
///
/// `user_id` and `session_id` are mandatory; a notification missing either is
/// a poison message. `inputs_format` stays a raw string here and is parsed at
/// the decode boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescriptor {
    pub user_id: String,
    pub session_id: SessionId,
    #[serde(default)]
    pub inputs_format: Option<String>,
    #[serde(default, rename = "email")]
    pub recipient_email: Option<String>,
}

impl SessionDescriptor {
    pub fn parse(body: &[u8]) -> anyhow::Result<Self> {
        let descriptor: SessionDescriptor = serde_json::from_slice(body)?;
        if descriptor.user_id.trim().is_empty() {
            anyhow::bail!("notification has empty user_id");
        }
        Ok(descriptor)
    }
}

/// One session's durable calibration checkpoint.
#[derive(Debug, Clone)]
pub struct ScoresRecord {
    pub session_id: SessionId,
    pub batch_counter: i64,
    pub stage: CalibrationStage,

    // Quantifier state
    pub alpha: Option<f64>,
    /// Conformity scores as little-endian f64 bytes.
    pub scores: Option<Vec<u8>>,

    // Appendable accumulators
    pub confidences: Vec<u8>,
    pub alphas: Vec<f64>,
    pub uncertainties: Vec<f64>,
    pub coverages: Vec<f64>,
    pub setsizes: Vec<i64>,

    // Accuracy counters
    pub accuracy: f64,
    pub correct_preds: i64,
    pub total_samples: i64,

    pub last_updated: chrono::DateTime<chrono::Utc>,
}

/// Atomic per-batch update of the scores row.
///
/// Scalars replace; `push_*` fields append at the storage layer
/// (`array_append` / bytea concat), which keeps retried deliveries
/// commutative with respect to the columns they touch.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub batch_counter: i64,
    pub stage: CalibrationStage,

    pub scores: Option<Vec<u8>>,
    pub alpha: Option<f64>,

    pub push_alpha: Option<f64>,
    pub push_uncertainty: Option<f64>,
    pub push_coverage: Option<f64>,
    pub push_setsize: Option<i64>,
    pub push_confidences: Option<Vec<u8>>,

    pub accuracy: Option<f64>,
    pub correct_preds: Option<i64>,
    pub total_samples: Option<i64>,
}
