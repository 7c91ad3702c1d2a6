use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use session::model::{SessionId, SessionStatus};

/// Session-status sink at the external Connections service.
#[async_trait]
pub trait StatusPoster: Send + Sync {
    /// Idempotent status update. Transport failures surface as errors; a
    /// non-2xx response is logged and swallowed, it never blocks a session's
    /// terminal transition.
    async fn post_status(
        &self,
        session_id: SessionId,
        user_id: &str,
        status: SessionStatus,
    ) -> anyhow::Result<()>;
}

pub struct ConnectionsClient {
    http: reqwest::Client,
    base_url: String,
}

impl ConnectionsClient {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl StatusPoster for ConnectionsClient {
    async fn post_status(
        &self,
        session_id: SessionId,
        user_id: &str,
        status: SessionStatus,
    ) -> anyhow::Result<()> {
        let url = format!(
            "{}/sessions/{}/status/{}",
            self.base_url,
            session_id,
            status.wire_name()
        );

        let response = self
            .http
            .put(&url)
            .json(&serde_json::json!({ "user_id": user_id }))
            .send()
            .await?;

        if response.status().is_success() {
            info!(
                action = "post_status",
                result = "success",
                session_id = %session_id,
                status = %status,
                "session status posted"
            );
        } else {
            warn!(
                action = "post_status",
                result = "fail",
                session_id = %session_id,
                status = %status,
                http_status = %response.status(),
                "status update rejected by Connections service"
            );
        }

        Ok(())
    }
}
