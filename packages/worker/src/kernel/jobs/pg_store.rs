//! PostgreSQL-backed implementation of the durable queue.
//!
//! The claim is a single statement: a `FOR UPDATE SKIP LOCKED` CTE picks
//! the winning row and the enclosing `UPDATE` leases it, so concurrent
//! replicas always see disjoint results. Every call goes through a small
//! transport-retry wrapper; anything that survives it bubbles to the
//! caller.

use std::future::Future;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use super::job::{CompletedArtifact, Job, JobFamily, QueueStats};
use super::store::{JobStore, ProcessingFields, StoreError, STALE_THRESHOLD_SECS};

const JOB_COLUMNS: &str = "id, owner_id, target_id, family, kind, state, priority, retry_count, \
     available_at, worker_id, started_at, completed_at, storage_path, artifact_url, \
     error_message, metadata, result, created_at, updated_at";

pub struct PgJobStore {
    pool: PgPool,
    max_retries: u32,
    retry_delay: StdDuration,
}

impl PgJobStore {
    /// Connect and run migrations, retrying transient connection failures.
    pub async fn connect(
        database_url: &str,
        max_retries: u32,
        retry_delay: StdDuration,
    ) -> Result<Self> {
        let mut attempt = 0u32;
        let pool = loop {
            match PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
            {
                Ok(pool) => break pool,
                Err(err) if attempt < max_retries => {
                    attempt += 1;
                    let delay = retry_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(attempt, error = %err, "database not reachable yet, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err).context("failed to connect to database"),
            }
        };

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;

        Ok(Self {
            pool,
            max_retries,
            retry_delay,
        })
    }

    pub fn from_pool(pool: PgPool, max_retries: u32, retry_delay: StdDuration) -> Self {
        Self {
            pool,
            max_retries,
            retry_delay,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn with_retries<T, F, Fut>(&self, op: &'static str, mut run: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match run().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && is_transient(&err) => {
                    attempt += 1;
                    let delay = self.retry_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(op, attempt, error = %err, "transient job-store error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Guarded single-row update; zero rows means the job left the expected
    /// state under us.
    fn guard(id: Uuid, rows_affected: u64) -> Result<(), StoreError> {
        if rows_affected == 0 {
            Err(StoreError::Conflict(id))
        } else {
            Ok(())
        }
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            // connection_exception, insufficient_resources, admin shutdown
            Some(code) if code.starts_with("08") || code.starts_with("53") || code == "57P01"
        ),
        _ => false,
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: Job) -> Result<Job, StoreError> {
        let pool = self.pool.clone();
        self.with_retries("insert", move || {
            let pool = pool.clone();
            let job = job.clone();
            async move {
                sqlx::query_as::<_, Job>(&format!(
                    r#"
                    INSERT INTO jobs ({JOB_COLUMNS})
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                    RETURNING {JOB_COLUMNS}
                    "#,
                ))
                .bind(job.id)
                .bind(job.owner_id)
                .bind(job.target_id)
                .bind(job.family)
                .bind(job.kind)
                .bind(job.state)
                .bind(job.priority)
                .bind(job.retry_count)
                .bind(job.available_at)
                .bind(&job.worker_id)
                .bind(job.started_at)
                .bind(job.completed_at)
                .bind(&job.storage_path)
                .bind(&job.artifact_url)
                .bind(&job.error_message)
                .bind(&job.metadata)
                .bind(&job.result)
                .bind(job.created_at)
                .bind(job.updated_at)
                .fetch_one(&pool)
                .await
            }
        })
        .await
    }

    async fn claim(&self, worker_id: &str, family: JobFamily) -> Result<Option<Job>, StoreError> {
        let pool = self.pool.clone();
        let worker_id = worker_id.to_string();
        self.with_retries("claim", move || {
            let pool = pool.clone();
            let worker_id = worker_id.clone();
            async move {
                sqlx::query_as::<_, Job>(&format!(
                    r#"
                    WITH next_job AS (
                        SELECT id
                        FROM jobs
                        WHERE family = $1
                          AND state = 'pending'
                          AND available_at <= NOW()
                        ORDER BY priority DESC, created_at ASC
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    UPDATE jobs
                    SET state = 'processing',
                        worker_id = $2,
                        started_at = NOW(),
                        updated_at = NOW()
                    WHERE id IN (SELECT id FROM next_job)
                    RETURNING {JOB_COLUMNS}
                    "#,
                ))
                .bind(family)
                .bind(&worker_id)
                .fetch_optional(&pool)
                .await
            }
        })
        .await
    }

    async fn set_processing_fields(
        &self,
        id: Uuid,
        fields: ProcessingFields,
    ) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        let rows = self
            .with_retries("set_processing_fields", move || {
                let pool = pool.clone();
                let storage_path = fields.storage_path.clone();
                async move {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET storage_path = COALESCE($2, storage_path),
                            updated_at = NOW()
                        WHERE id = $1 AND state = 'processing'
                        "#,
                    )
                    .bind(id)
                    .bind(storage_path)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
                }
            })
            .await?;
        Self::guard(id, rows)
    }

    async fn complete(
        &self,
        id: Uuid,
        storage_path: &str,
        artifact_url: &str,
    ) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        let storage_path = storage_path.to_string();
        let artifact_url = artifact_url.to_string();
        let rows = self
            .with_retries("complete", move || {
                let pool = pool.clone();
                let storage_path = storage_path.clone();
                let artifact_url = artifact_url.clone();
                async move {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET state = 'completed',
                            storage_path = $2,
                            artifact_url = $3,
                            error_message = NULL,
                            completed_at = NOW(),
                            updated_at = NOW()
                        WHERE id = $1 AND state = 'processing'
                        "#,
                    )
                    .bind(id)
                    .bind(storage_path)
                    .bind(artifact_url)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
                }
            })
            .await?;
        Self::guard(id, rows)
    }

    async fn complete_extraction(
        &self,
        id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        let rows = self
            .with_retries("complete_extraction", move || {
                let pool = pool.clone();
                let result = result.clone();
                async move {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET state = 'completed',
                            result = $2,
                            error_message = NULL,
                            completed_at = NOW(),
                            updated_at = NOW()
                        WHERE id = $1 AND state = 'processing'
                        "#,
                    )
                    .bind(id)
                    .bind(result)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
                }
            })
            .await?;
        Self::guard(id, rows)
    }

    async fn fail_terminal(&self, id: Uuid, user_message: &str) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        let user_message = user_message.to_string();
        let rows = self
            .with_retries("fail_terminal", move || {
                let pool = pool.clone();
                let user_message = user_message.clone();
                async move {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET state = 'failed',
                            error_message = $2,
                            completed_at = NOW(),
                            updated_at = NOW()
                        WHERE id = $1 AND state = 'processing'
                        "#,
                    )
                    .bind(id)
                    .bind(user_message)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
                }
            })
            .await?;
        Self::guard(id, rows)
    }

    async fn reset_with_backoff(
        &self,
        id: Uuid,
        delay_seconds: i64,
        error_message: &str,
    ) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        let error_message = error_message.to_string();
        let rows = self
            .with_retries("reset_with_backoff", move || {
                let pool = pool.clone();
                let error_message = error_message.clone();
                async move {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET state = 'pending',
                            retry_count = retry_count + 1,
                            available_at = NOW() + make_interval(secs => $2),
                            worker_id = NULL,
                            started_at = NULL,
                            error_message = $3,
                            updated_at = NOW()
                        WHERE id = $1 AND state = 'processing'
                        "#,
                    )
                    .bind(id)
                    .bind(delay_seconds as f64)
                    .bind(error_message)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
                }
            })
            .await?;
        Self::guard(id, rows)
    }

    async fn reset_immediate(&self, id: Uuid) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        let rows = self
            .with_retries("reset_immediate", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET state = 'pending',
                            available_at = NOW(),
                            worker_id = NULL,
                            started_at = NULL,
                            updated_at = NOW()
                        WHERE id = $1 AND state = 'processing'
                        "#,
                    )
                    .bind(id)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
                }
            })
            .await?;
        Self::guard(id, rows)
    }

    async fn find_stale(&self) -> Result<Vec<Uuid>, StoreError> {
        let pool = self.pool.clone();
        self.with_retries("find_stale", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_scalar::<_, Uuid>(
                    r#"
                    SELECT id
                    FROM jobs
                    WHERE state = 'processing'
                      AND started_at < NOW() - make_interval(secs => $1)
                    "#,
                )
                .bind(STALE_THRESHOLD_SECS as f64)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    async fn reset_all_stale(&self) -> Result<u64, StoreError> {
        let pool = self.pool.clone();
        let reset: Vec<Uuid> = self
            .with_retries("reset_all_stale", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query_scalar::<_, Uuid>(
                        r#"
                        UPDATE jobs
                        SET state = 'pending',
                            available_at = NOW(),
                            worker_id = NULL,
                            started_at = NULL,
                            updated_at = NOW()
                        WHERE state = 'processing'
                          AND started_at < NOW() - make_interval(secs => $1)
                        RETURNING id
                        "#,
                    )
                    .bind(STALE_THRESHOLD_SECS as f64)
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;

        for id in &reset {
            info!(job_id = %id, "recovered stale job");
        }
        Ok(reset.len() as u64)
    }

    async fn queue_depth(&self) -> Result<i64, StoreError> {
        let pool = self.pool.clone();
        self.with_retries("queue_depth", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM jobs WHERE state = 'pending' AND available_at <= NOW()",
                )
                .fetch_one(&pool)
                .await
            }
        })
        .await
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let pool = self.pool.clone();
        self.with_retries("stats", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_as::<_, QueueStats>(
                    r#"
                    SELECT
                        COUNT(*) FILTER (WHERE state = 'pending') AS pending,
                        COUNT(*) FILTER (WHERE state = 'processing') AS processing,
                        COUNT(*) FILTER (WHERE state = 'completed'
                            AND completed_at > NOW() - INTERVAL '24 hours') AS completed_24h,
                        COUNT(*) FILTER (WHERE state = 'failed'
                            AND completed_at > NOW() - INTERVAL '24 hours') AS failed_24h,
                        COALESCE(AVG(EXTRACT(EPOCH FROM (completed_at - started_at)))
                            FILTER (WHERE state = 'completed'
                                AND completed_at > NOW() - INTERVAL '24 hours'), 0)::float8
                            AS avg_processing_seconds,
                        COALESCE(EXTRACT(EPOCH FROM (
                            NOW() - MIN(created_at) FILTER (WHERE state = 'pending')
                        )), 0)::float8 AS oldest_pending_seconds
                    FROM jobs
                    "#,
                )
                .fetch_one(&pool)
                .await
            }
        })
        .await
    }

    async fn find_old_completed(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<CompletedArtifact>, StoreError> {
        let pool = self.pool.clone();
        self.with_retries("find_old_completed", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_as::<_, CompletedArtifact>(
                    r#"
                    SELECT id, storage_path
                    FROM jobs
                    WHERE state = 'completed' AND created_at < $1
                    "#,
                )
                .bind(before)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    async fn delete_old_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let pool = self.pool.clone();
        self.with_retries("delete_old_completed", move || {
            let pool = pool.clone();
            async move {
                sqlx::query("DELETE FROM jobs WHERE state = 'completed' AND created_at < $1")
                    .bind(before)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
            }
        })
        .await
    }

    async fn count_recent_for_owner(
        &self,
        owner_id: Uuid,
        window: Duration,
    ) -> Result<i64, StoreError> {
        let cutoff = Utc::now() - window;
        let pool = self.pool.clone();
        self.with_retries("count_recent_for_owner", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM jobs WHERE owner_id = $1 AND created_at > $2",
                )
                .bind(owner_id)
                .bind(cutoff)
                .fetch_one(&pool)
                .await
            }
        })
        .await
    }

    async fn count_active_for_owner(&self, owner_id: Uuid) -> Result<i64, StoreError> {
        let pool = self.pool.clone();
        self.with_retries("count_active_for_owner", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM jobs WHERE owner_id = $1 AND state IN ('pending', 'processing')",
                )
                .bind(owner_id)
                .fetch_one(&pool)
                .await
            }
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_covers_transport_errors() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(is_transient(&sqlx::Error::PoolClosed));
        assert!(is_transient(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }
}
