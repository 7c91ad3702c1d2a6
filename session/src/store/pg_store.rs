//! PgScoresStore
//! -------------
//! Postgres-backed implementation of the `ScoresStore` DAO. It is
//! responsible for durable calibration checkpoints so that:
//!
//!  - a session survives a worker crash and resumes at its last batch
//!  - array/byte accumulators grow server-side (`array_append`, `||`),
//!    keeping retried updates commutative
//!  - raw batch payloads can be replayed in first-arrival order

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::warn;

use super::ScoresStore;
use crate::model::{CalibrationStage, ScoresRecord, SessionId, StateUpdate};

pub struct PgScoresStore {
    pool: PgPool,
    max_retries: u32,
}

impl PgScoresStore {
    pub fn from_pool(pool: PgPool, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    /// Connect and ensure the schema exists.
    pub async fn connect(database_url: &str, max_retries: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;

        let store = Self { pool, max_retries };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scores (
                session_id UUID PRIMARY KEY,
                batch_counter BIGINT NOT NULL DEFAULT 0,
                stage INTEGER NOT NULL DEFAULT 1,

                alpha DOUBLE PRECISION,
                scores BYTEA,

                confidences BYTEA NOT NULL DEFAULT ''::bytea,
                alphas DOUBLE PRECISION[] NOT NULL DEFAULT '{}',
                uncertainties DOUBLE PRECISION[] NOT NULL DEFAULT '{}',
                coverages DOUBLE PRECISION[] NOT NULL DEFAULT '{}',
                setsizes BIGINT[] NOT NULL DEFAULT '{}',

                accuracy DOUBLE PRECISION NOT NULL DEFAULT 0,
                correct_preds BIGINT NOT NULL DEFAULT 0,
                total_samples BIGINT NOT NULL DEFAULT 0,

                last_updated TIMESTAMPTZ NOT NULL DEFAULT now()
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS model_inputs (
                id BIGSERIAL,
                session_id UUID NOT NULL,
                batch_index INTEGER NOT NULL,
                payload BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (session_id, batch_index)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS model_outputs (
                id BIGSERIAL,
                session_id UUID NOT NULL,
                batch_index INTEGER NOT NULL,
                payload BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (session_id, batch_index)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Run `op` up to `max_retries + 1` times with a short pause between
    /// attempts. Transient broker-adjacent failures (pool timeouts, dropped
    /// connections) usually clear within a retry; anything persistent
    /// surfaces to the caller as worker-fatal.
    async fn with_retries<T, F, Fut>(&self, what: &'static str, op: F) -> anyhow::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        action = what,
                        result = "fail",
                        attempt,
                        error = ?e,
                        "store operation failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn record_from_row(row: &PgRow) -> anyhow::Result<ScoresRecord> {
    let stage_raw: i32 = row.try_get("stage")?;

    Ok(ScoresRecord {
        session_id: row.try_get("session_id")?,
        batch_counter: row.try_get("batch_counter")?,
        stage: CalibrationStage::from_i32(stage_raw)?,
        alpha: row.try_get("alpha")?,
        scores: row.try_get("scores")?,
        confidences: row.try_get("confidences")?,
        alphas: row.try_get("alphas")?,
        uncertainties: row.try_get("uncertainties")?,
        coverages: row.try_get("coverages")?,
        setsizes: row.try_get("setsizes")?,
        accuracy: row.try_get("accuracy")?,
        correct_preds: row.try_get("correct_preds")?,
        total_samples: row.try_get("total_samples")?,
        last_updated: row.try_get("last_updated")?,
    })
}

#[async_trait]
impl ScoresStore for PgScoresStore {
    async fn create_scores_record(&self, session_id: SessionId) -> anyhow::Result<()> {
        self.with_retries("create_scores_record", || async {
            sqlx::query(
                r#"
                INSERT INTO scores (session_id)
                VALUES ($1)
                ON CONFLICT (session_id) DO NOTHING
            "#,
            )
            .bind(session_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_latest_scores_record(
        &self,
        session_id: SessionId,
    ) -> anyhow::Result<Option<ScoresRecord>> {
        self.with_retries("get_latest_scores_record", || async {
            let row = sqlx::query("SELECT * FROM scores WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;

            row.as_ref().map(record_from_row).transpose()
        })
        .await
    }

    async fn update_session_state(
        &self,
        session_id: SessionId,
        update: StateUpdate,
    ) -> anyhow::Result<()> {
        self.with_retries("update_session_state", || {
            let update = update.clone();
            async move {
                let mut qb = QueryBuilder::<Postgres>::new("UPDATE scores SET batch_counter = ");
                qb.push_bind(update.batch_counter);
                qb.push(", stage = ");
                qb.push_bind(update.stage.as_i32());
                qb.push(", last_updated = now()");

                if let Some(scores) = update.scores {
                    qb.push(", scores = ");
                    qb.push_bind(scores);
                }
                if let Some(alpha) = update.alpha {
                    qb.push(", alpha = ");
                    qb.push_bind(alpha);
                }
                if let Some(v) = update.push_alpha {
                    qb.push(", alphas = array_append(alphas, ");
                    qb.push_bind(v);
                    qb.push(")");
                }
                if let Some(v) = update.push_uncertainty {
                    qb.push(", uncertainties = array_append(uncertainties, ");
                    qb.push_bind(v);
                    qb.push(")");
                }
                if let Some(v) = update.push_coverage {
                    qb.push(", coverages = array_append(coverages, ");
                    qb.push_bind(v);
                    qb.push(")");
                }
                if let Some(v) = update.push_setsize {
                    qb.push(", setsizes = array_append(setsizes, ");
                    qb.push_bind(v);
                    qb.push(")");
                }
                if let Some(bytes) = update.push_confidences {
                    qb.push(", confidences = coalesce(confidences, ''::bytea) || ");
                    qb.push_bind(bytes);
                }
                if let Some(v) = update.accuracy {
                    qb.push(", accuracy = ");
                    qb.push_bind(v);
                }
                if let Some(v) = update.correct_preds {
                    qb.push(", correct_preds = ");
                    qb.push_bind(v);
                }
                if let Some(v) = update.total_samples {
                    qb.push(", total_samples = ");
                    qb.push_bind(v);
                }

                qb.push(" WHERE session_id = ");
                qb.push_bind(session_id);

                qb.build().execute(&self.pool).await?;
                Ok(())
            }
        })
        .await
    }

    async fn write_inputs(
        &self,
        session_id: SessionId,
        batch_index: i32,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        self.with_retries("write_inputs", || async {
            sqlx::query(
                r#"
                INSERT INTO model_inputs (session_id, batch_index, payload)
                VALUES ($1, $2, $3)
                ON CONFLICT (session_id, batch_index) DO UPDATE SET payload = excluded.payload
            "#,
            )
            .bind(session_id)
            .bind(batch_index)
            .bind(payload)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn write_outputs(
        &self,
        session_id: SessionId,
        batch_index: i32,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        self.with_retries("write_outputs", || async {
            sqlx::query(
                r#"
                INSERT INTO model_outputs (session_id, batch_index, payload)
                VALUES ($1, $2, $3)
                ON CONFLICT (session_id, batch_index) DO UPDATE SET payload = excluded.payload
            "#,
            )
            .bind(session_id)
            .bind(batch_index)
            .bind(payload)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_inputs_from_session(
        &self,
        session_id: SessionId,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        self.with_retries("get_inputs_from_session", || async {
            let rows =
                sqlx::query("SELECT payload FROM model_inputs WHERE session_id = $1 ORDER BY id")
                    .bind(session_id)
                    .fetch_all(&self.pool)
                    .await?;

            rows.iter()
                .map(|row| Ok(row.try_get::<Vec<u8>, _>("payload")?))
                .collect()
        })
        .await
    }

    async fn get_outputs_from_session(
        &self,
        session_id: SessionId,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        self.with_retries("get_outputs_from_session", || async {
            let rows =
                sqlx::query("SELECT payload FROM model_outputs WHERE session_id = $1 ORDER BY id")
                    .bind(session_id)
                    .fetch_all(&self.pool)
                    .await?;

            rows.iter()
                .map(|row| Ok(row.try_get::<Vec<u8>, _>("payload")?))
                .collect()
        })
        .await
    }
}
