//! Exchange and queue names shared with the producing services. These are
//! wire contracts; renaming any of them breaks compatibility.

use std::time::Duration;

use uuid::Uuid;

/// Fanout broadcast of new-session notifications.
pub const NEW_CONNECTIONS_EXCHANGE: &str = "new_connections_exchange";

/// The listener's durable consumer queue on the fanout above.
pub const CONNECTIONS_QUEUE: &str = "calibration_service_connections_queue";

/// Direct exchange carrying fully-paired batches for downstream observability.
pub const MLFLOW_EXCHANGE: &str = "mlflow_exchange";
pub const MLFLOW_ROUTING_KEY: &str = "mlflow.key";

/// Reserved for scale signaling; declared but not consumed.
pub const REPLIES_EXCHANGE: &str = "replies_exchange";
pub const COORDINATOR_EXCHANGE: &str = "coordinator_exchange";

pub fn inputs_queue(session_id: Uuid) -> String {
    format!("{session_id}_inputs_cal_queue")
}

pub fn outputs_queue(session_id: Uuid) -> String {
    format!("{session_id}_outputs_cal_queue")
}

const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// Exponential reconnect backoff: 5s doubling up to a 60s cap.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.min(8));
    RECONNECT_BASE.saturating_mul(factor as u32).min(RECONNECT_CAP)
}
