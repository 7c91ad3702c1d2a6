pub mod pg_store;

use crate::model::{ScoresRecord, SessionId, StateUpdate};

/// Narrow DAO consumed by the session worker and the calibration engine.
///
/// Implementations must keep `update_session_state` atomic per call and must
/// perform array appends / byte concatenation at the storage layer, never via
/// read-modify-write.
#[async_trait::async_trait]
pub trait ScoresStore: Send + Sync {
    /// Create the scores row if absent; a no-op when it already exists.
    async fn create_scores_record(&self, session_id: SessionId) -> anyhow::Result<()>;

    async fn get_latest_scores_record(
        &self,
        session_id: SessionId,
    ) -> anyhow::Result<Option<ScoresRecord>>;

    /// Apply one batch's worth of scalar replaces and appends atomically.
    async fn update_session_state(
        &self,
        session_id: SessionId,
        update: StateUpdate,
    ) -> anyhow::Result<()>;

    /// Upsert the raw payload for `(session_id, batch_index)`.
    async fn write_inputs(
        &self,
        session_id: SessionId,
        batch_index: i32,
        payload: &[u8],
    ) -> anyhow::Result<()>;

    async fn write_outputs(
        &self,
        session_id: SessionId,
        batch_index: i32,
        payload: &[u8],
    ) -> anyhow::Result<()>;

    /// All persisted input payloads for the session, in first-arrival order.
    async fn get_inputs_from_session(&self, session_id: SessionId)
    -> anyhow::Result<Vec<Vec<u8>>>;

    async fn get_outputs_from_session(
        &self,
        session_id: SessionId,
    ) -> anyhow::Result<Vec<Vec<u8>>>;
}
