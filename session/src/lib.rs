//! Session domain model and the calibration-state DAO.
//!
//! One row in `scores` is the durable checkpoint of one session's
//! calibration run; `model_inputs` / `model_outputs` hold the raw payloads
//! for replay. Each session worker owns exactly one store handle, so the
//! scores row is single-writer by construction.

pub mod model;
pub mod store;

pub use model::{
    CalibrationStage, ScoresRecord, SessionDescriptor, SessionId, SessionStatus, StateUpdate,
};
pub use store::ScoresStore;
