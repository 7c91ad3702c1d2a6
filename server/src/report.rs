use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::Mutex;
use tracing::info;

use session::model::SessionId;
use uq::results::CalibrationResults;

const SMTP_RELAY: &str = "smtp.gmail.com";

/// End-of-session report sink. `generate` renders the results into a local
/// artifact, `send` mails the most recently generated one. Neither call is
/// retried; failures are logged by the caller.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn generate(
        &self,
        session_id: SessionId,
        results: &CalibrationResults,
    ) -> anyhow::Result<PathBuf>;

    async fn send(&self, recipient: &str) -> anyhow::Result<()>;
}

/// Renders a results summary to the artifacts directory and mails it over
/// SMTPS with env-sourced credentials.
pub struct SmtpReporter {
    sender: String,
    password: String,
    artifacts_path: PathBuf,
    last_report: Mutex<Option<PathBuf>>,
}

impl SmtpReporter {
    pub fn new(sender: String, password: String, artifacts_path: PathBuf) -> Self {
        Self { sender, password, artifacts_path, last_report: Mutex::new(None) }
    }
}

#[async_trait]
impl Reporter for SmtpReporter {
    async fn generate(
        &self,
        session_id: SessionId,
        results: &CalibrationResults,
    ) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.artifacts_path).await?;

        let path = self.artifacts_path.join(format!("report_{session_id}.txt"));
        tokio::fs::write(&path, render_report(session_id, results)).await?;

        info!(
            action = "build_report",
            result = "success",
            session_id = %session_id,
            path = %path.display(),
            "report generated"
        );
        *self.last_report.lock().await = Some(path.clone());
        Ok(path)
    }

    async fn send(&self, recipient: &str) -> anyhow::Result<()> {
        let path = self
            .last_report
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no report generated yet"))?;

        let body = tokio::fs::read_to_string(&path).await?;
        let email = Message::builder()
            .from(self.sender.parse()?)
            .to(recipient.parse()?)
            .subject(format!("Calibration report: {}", file_stem(&path)))
            .body(body)?;

        let mailer: AsyncSmtpTransport<Tokio1Executor> =
            AsyncSmtpTransport::<Tokio1Executor>::relay(SMTP_RELAY)?
                .credentials(Credentials::new(self.sender.clone(), self.password.clone()))
                .build();

        mailer.send(email).await?;
        info!(action = "send_report", result = "success", recipient, "report sent");
        Ok(())
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "report".to_string())
}

fn render_report(session_id: SessionId, results: &CalibrationResults) -> String {
    let m = &results.metrics;
    let p = &results.parameters;

    let mut out = String::new();
    out.push_str(&format!("Calibration report for session {session_id}\n"));
    out.push_str("\n== Metrics ==\n");
    out.push_str(&format!("Accuracy: {:.4}\n", m.accuracy));
    out.push_str(&format!(
        "Model Uncertainty Upper Bound: {:.4} (std {:.4})\n",
        m.model_uncertainty_upper_bound, p.u_std
    ));
    out.push_str(&format!("Empirical Coverage: {:.4}\n", m.empirical_coverage));
    out.push_str(&format!("Max Set Size: {}\n", m.max_set_size));
    out.push_str(&format!("Alpha: {:.4} (std {:.4})\n", m.alpha, p.alpha_std));

    out.push_str("\n== History ==\n");
    out.push_str(&format!("alphas: {:?}\n", results.history.alphas));
    out.push_str(&format!("uncertainty: {:?}\n", results.history.uncertainty));
    out.push_str(&format!("batch_coverage: {:?}\n", results.history.batch_coverage));
    out.push_str(&format!("batch_setsizes: {:?}\n", results.history.batch_setsizes));

    out.push_str(&format!(
        "\n{} confidence values recorded\n",
        results.raw_data.confidences.len()
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use uq::results::{History, Metrics, Parameters, RawData};
    use uuid::Uuid;

    fn sample_results() -> CalibrationResults {
        CalibrationResults {
            metrics: Metrics {
                accuracy: 0.9375,
                model_uncertainty_upper_bound: 0.125,
                empirical_coverage: 0.95,
                max_set_size: 3,
                alpha: 0.1,
            },
            history: History {
                alphas: vec![0.1, 0.1],
                uncertainty: vec![0.12, 0.13],
                batch_coverage: vec![0.9, 1.0],
                batch_setsizes: vec![2, 3],
            },
            raw_data: RawData { confidences: vec![0.9, 0.8, 0.99] },
            parameters: Parameters { alpha_std: 0.0, u_std: 0.005 },
        }
    }

    #[test]
    fn report_lists_every_metric() {
        let text = render_report(Uuid::nil(), &sample_results());
        assert!(text.contains("Accuracy: 0.9375"));
        assert!(text.contains("Empirical Coverage: 0.9500"));
        assert!(text.contains("Max Set Size: 3"));
        assert!(text.contains("batch_setsizes: [2, 3]"));
        assert!(text.contains("3 confidence values recorded"));
    }

    #[tokio::test]
    async fn generate_writes_the_artifact() {
        let dir = std::env::temp_dir().join(format!("calib-report-{}", Uuid::new_v4()));
        let reporter =
            SmtpReporter::new("svc@example.com".into(), "pw".into(), dir.clone());

        let session_id = Uuid::new_v4();
        let path = reporter.generate(session_id, &sample_results()).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains(&session_id.to_string()));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn send_without_generate_is_an_error() {
        let reporter = SmtpReporter::new(
            "svc@example.com".into(),
            "pw".into(),
            std::env::temp_dir(),
        );
        assert!(reporter.send("user@example.com").await.is_err());
    }
}
