use thiserror::Error;

#[derive(Error, Debug)]
pub enum UqError {
    #[error("the model must be calibrated before setting alpha")]
    NotCalibrated,

    #[error("alpha must be set before building prediction sets")]
    AlphaNotSet,

    #[error("probability batch is empty")]
    EmptyBatch,

    #[error("probability row {row} has {got} values, expected {expected}")]
    RaggedRows { row: usize, expected: usize, got: usize },

    #[error("label {label} outside the {classes} known classes")]
    LabelOutOfRange { label: i32, classes: usize },

    #[error("batch has {labels} labels for {samples} samples")]
    LabelCountMismatch { labels: usize, samples: usize },

    #[error("uncertainty search found no usable alpha")]
    DegenerateUncertainty,

    #[error("persisted conformity scores are corrupt ({0} bytes)")]
    CorruptScores(usize),

    #[error("calibration results are only available in the FINISHED stage")]
    NotFinished,
}
