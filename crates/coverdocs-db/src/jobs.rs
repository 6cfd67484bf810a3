//! OCR job repository implementation.
//!
//! The scheduler's correctness lives here: leasing is a single atomic
//! `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)` statement, and
//! completion/failure transitions touch the job and its document in one
//! transaction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::Notify;
use uuid::Uuid;

use coverdocs_core::{
    compute_etag, models::set_not_before, new_id, EnqueueJobRequest, Error, JobFilter, OcrJob,
    OcrJobStatus, OcrJobStore, OcrResultData, QueueStats, Result,
};

const JOB_COLUMNS: &str = "id, document_id, status, priority, language, engine, options, result, \
     extracted_text, confidence_score, page_count, word_count, character_count, error_message, \
     error_code, retry_count, max_retries, lease_owner, lease_expires_at, processing_started_at, \
     processing_completed_at, created_at, updated_at";

/// PostgreSQL implementation of OcrJobStore.
pub struct PgOcrJobStore {
    pool: PgPool,
    /// Notify handle for event-driven worker wake.
    notify: Arc<Notify>,
}

impl PgOcrJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Create a store sharing an existing notify handle.
    pub fn with_notify(pool: PgPool, notify: Arc<Notify>) -> Self {
        Self { pool, notify }
    }

    /// Apply the completed/failed OCR outcome to the owning document,
    /// bumping its version inside the caller's transaction.
    async fn patch_document_ocr(
        tx: &mut Transaction<'_, Postgres>,
        document_id: Uuid,
        job_id: Uuid,
        result: Option<&OcrResultData>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let row = sqlx::query(
            "SELECT version, ocr_completed, deleted_at IS NOT NULL AS deleted \
             FROM documents WHERE id = $1 FOR UPDATE",
        )
        .bind(document_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(Error::Database)?;

        // The document may have been hard-deleted while the job ran; the
        // job row is about to cascade away with it, so there is nothing
        // left to patch.
        let Some(row) = row else { return Ok(()) };
        // Soft-deleted mid-processing: leave the row untouched. The outcome
        // is preserved on the job row, and a deleted document must keep
        // status = 'deleted'.
        if row.get::<bool, _>("deleted") {
            return Ok(());
        }
        let version: i32 = row.get("version");
        let ocr_completed: bool = row.get("ocr_completed");
        let new_version = version + 1;
        let new_etag = compute_etag(document_id, new_version);

        match result {
            Some(res) => {
                sqlx::query(
                    "UPDATE documents SET ocr_completed = TRUE, ocr_job_id = $2, ocr_text = $3, \
                     ocr_confidence = $4, ocr_language = $5, ocr_page_count = $6, \
                     ocr_word_count = $7, status = 'completed', version = $8, etag = $9, \
                     updated_at = $10 WHERE id = $1",
                )
                .bind(document_id)
                .bind(job_id)
                .bind(&res.text)
                .bind(res.confidence)
                .bind(&res.language)
                .bind(res.page_count)
                .bind(res.word_count)
                .bind(new_version)
                .bind(&new_etag)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
            }
            None if !ocr_completed => {
                // Terminal failure with no prior successful OCR.
                sqlx::query(
                    "UPDATE documents SET status = 'failed', version = $2, etag = $3, \
                     updated_at = $4 WHERE id = $1",
                )
                .bind(document_id)
                .bind(new_version)
                .bind(&new_etag)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
            }
            None => {}
        }
        Ok(())
    }
}

#[async_trait]
impl OcrJobStore for PgOcrJobStore {
    async fn enqueue(&self, req: EnqueueJobRequest) -> Result<OcrJob> {
        if !(coverdocs_core::defaults::JOB_PRIORITY_MIN
            ..=coverdocs_core::defaults::JOB_PRIORITY_MAX)
            .contains(&req.priority)
        {
            return Err(Error::Validation(format!(
                "priority {} outside 1..=10",
                req.priority
            )));
        }

        let job_id = new_id();
        let now = Utc::now();

        // INSERT ... WHERE EXISTS keeps the linkability check inside the
        // same statement: the job is created only for a live document.
        let row = sqlx::query(&format!(
            "INSERT INTO ocr_jobs (id, document_id, status, priority, language, engine, options, \
             retry_count, max_retries, created_at, updated_at) \
             SELECT $1, $2, 'pending', $3, $4, $5, $6, 0, $7, $8, $8 \
             WHERE EXISTS (SELECT 1 FROM documents WHERE id = $2 AND deleted_at IS NULL) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(req.document_id)
        .bind(req.priority)
        .bind(&req.language)
        .bind(&req.engine)
        .bind(&req.options)
        .bind(req.max_retries)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::DocumentNotFound(req.document_id))?;

        let job = job_from_row(&row)?;
        self.notify.notify_waiters();
        Ok(job)
    }

    async fn lease_one(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<OcrJob>> {
        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(lease_duration)
                .map_err(|e| Error::Config(e.to_string()))?;

        // FOR UPDATE SKIP LOCKED keeps concurrent leasers from contending
        // on the same head-of-queue row.
        let row = sqlx::query(&format!(
            "UPDATE ocr_jobs SET status = 'processing', lease_owner = $1, \
             lease_expires_at = $2, \
             processing_started_at = COALESCE(processing_started_at, $3), updated_at = $3 \
             WHERE id = ( \
                 SELECT id FROM ocr_jobs \
                 WHERE status = 'pending' AND retry_count <= max_retries \
                   AND COALESCE((options->>'_not_before')::timestamptz, TIMESTAMPTZ '-infinity') <= $3 \
                 ORDER BY priority ASC, created_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(worker_id)
        .bind(expires)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(lease_duration)
                .map_err(|e| Error::Config(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE ocr_jobs SET lease_expires_at = $3, updated_at = $4 \
             WHERE id = $1 AND lease_owner = $2 AND status = 'processing'",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(expires)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::LeaseLost(job_id));
        }
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str, result: OcrResultData) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(
            "UPDATE ocr_jobs SET status = 'completed', result = $3, extracted_text = $4, \
             confidence_score = $5, page_count = $6, word_count = $7, character_count = $8, \
             lease_owner = NULL, lease_expires_at = NULL, processing_completed_at = $9, \
             updated_at = $9 \
             WHERE id = $1 AND lease_owner = $2 AND status = 'processing' \
             RETURNING document_id",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(&result.raw)
        .bind(&result.text)
        .bind(result.confidence)
        .bind(result.page_count)
        .bind(result.word_count)
        .bind(result.character_count)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let document_id: Uuid = row.ok_or(Error::LeaseLost(job_id))?.get("document_id");

        Self::patch_document_ocr(&mut tx, document_id, job_id, Some(&result), now).await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        retryable: bool,
        retry_backoff: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(
            "SELECT document_id, retry_count, max_retries, options FROM ocr_jobs \
             WHERE id = $1 AND lease_owner = $2 AND status = 'processing' FOR UPDATE",
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::LeaseLost(job_id))?;

        let document_id: Uuid = row.get("document_id");
        let retry_count: i32 = row.get("retry_count");
        let max_retries: i32 = row.get("max_retries");

        if retryable && retry_count < max_retries {
            let mut options: serde_json::Value = row.get("options");
            let not_before = now
                + chrono::Duration::from_std(retry_backoff)
                    .map_err(|e| Error::Config(e.to_string()))?;
            set_not_before(&mut options, not_before);

            sqlx::query(
                "UPDATE ocr_jobs SET status = 'pending', retry_count = $2, options = $3, \
                 error_code = $4, error_message = $5, lease_owner = NULL, \
                 lease_expires_at = NULL, updated_at = $6 WHERE id = $1",
            )
            .bind(job_id)
            .bind(retry_count + 1)
            .bind(&options)
            .bind(error_code)
            .bind(error_message)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        } else {
            sqlx::query(
                "UPDATE ocr_jobs SET status = 'failed', error_code = $2, error_message = $3, \
                 lease_owner = NULL, lease_expires_at = NULL, processing_completed_at = $4, \
                 updated_at = $4 WHERE id = $1",
            )
            .bind(job_id)
            .bind(error_code)
            .bind(error_message)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            Self::patch_document_ocr(&mut tx, document_id, job_id, None, now).await?;
        }

        tx.commit().await.map_err(Error::Database)?;
        if retryable && retry_count < max_retries {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<OcrJob> {
        let now = Utc::now();

        let row = sqlx::query(&format!(
            "UPDATE ocr_jobs SET status = 'cancelled', lease_owner = NULL, \
             lease_expires_at = NULL, processing_completed_at = COALESCE(processing_completed_at, $2), \
             updated_at = $2 \
             WHERE id = $1 AND status IN ('pending', 'processing') \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => job_from_row(&row),
            None => {
                // Idempotent when already cancelled; terminal otherwise.
                let job = self.get(job_id).await?;
                if job.status == OcrJobStatus::Cancelled {
                    Ok(job)
                } else {
                    Err(Error::Conflict(format!(
                        "job {} is already {}",
                        job_id,
                        job.status.as_str()
                    )))
                }
            }
        }
    }

    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Expired leases with retry budget left go back to pending; lease
        // expiry counts as a failed attempt.
        let repended = sqlx::query(
            "UPDATE ocr_jobs SET status = 'pending', retry_count = retry_count + 1, \
             lease_owner = NULL, lease_expires_at = NULL, error_code = 'lease_expired', \
             error_message = 'worker lease expired', updated_at = $1 \
             WHERE status = 'processing' AND lease_expires_at < $1 AND retry_count < max_retries",
        )
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        // A job that would exceed its budget can never satisfy the lease
        // predicate again, so finalize it instead of stranding it.
        let failed_rows = sqlx::query(
            "UPDATE ocr_jobs SET status = 'failed', retry_count = retry_count + 1, \
             lease_owner = NULL, lease_expires_at = NULL, error_code = 'lease_expired', \
             error_message = 'worker lease expired', processing_completed_at = $1, \
             updated_at = $1 \
             WHERE status = 'processing' AND lease_expires_at < $1 AND retry_count >= max_retries \
             RETURNING document_id, id",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        for row in &failed_rows {
            let document_id: Uuid = row.get("document_id");
            let job_id: Uuid = row.get("id");
            Self::patch_document_ocr(&mut tx, document_id, job_id, None, now).await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        let total = repended + failed_rows.len() as u64;
        if repended > 0 {
            self.notify.notify_waiters();
        }
        Ok(total)
    }

    async fn get(&self, job_id: Uuid) -> Result<OcrJob> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM ocr_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::JobNotFound(job_id))?;

        job_from_row(&row)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<OcrJob>> {
        let mut conditions = Vec::new();
        let mut param_idx = 1;

        let status = filter.status.map(|s| s.as_str());
        if status.is_some() {
            conditions.push(format!("status = ${param_idx}"));
            param_idx += 1;
        }
        if filter.document_id.is_some() {
            conditions.push(format!("document_id = ${param_idx}"));
            param_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM ocr_jobs {where_clause} \
             ORDER BY created_at DESC LIMIT ${param_idx} OFFSET ${}",
            param_idx + 1
        );

        let mut q = sqlx::query(&query);
        if let Some(s) = status {
            q = q.bind(s);
        }
        if let Some(doc_id) = filter.document_id {
            q = q.bind(doc_id);
        }
        q = q
            .bind(
                filter
                    .limit
                    .unwrap_or(coverdocs_core::defaults::JOB_PAGE_LIMIT),
            )
            .bind(filter.offset.unwrap_or(0));

        let rows = q.fetch_all(&self.pool).await.map_err(Error::Database)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
                COUNT(*) FILTER (WHERE status = 'processing') AS processing, \
                COUNT(*) FILTER (WHERE status = 'completed' \
                    AND processing_completed_at > NOW() - INTERVAL '1 hour') AS completed_last_hour, \
                COUNT(*) FILTER (WHERE status = 'failed' \
                    AND processing_completed_at > NOW() - INTERVAL '1 hour') AS failed_last_hour, \
                COUNT(*) AS total \
             FROM ocr_jobs",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get::<i64, _>("pending"),
            processing: row.get::<i64, _>("processing"),
            completed_last_hour: row.get::<i64, _>("completed_last_hour"),
            failed_last_hour: row.get::<i64, _>("failed_last_hour"),
            total: row.get::<i64, _>("total"),
        })
    }

    async fn cleanup(&self, keep_count: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM ocr_jobs \
             WHERE status IN ('completed', 'failed', 'cancelled') AND id NOT IN ( \
                 SELECT id FROM ocr_jobs \
                 WHERE status IN ('completed', 'failed', 'cancelled') \
                 ORDER BY processing_completed_at DESC NULLS LAST \
                 LIMIT $1 \
             )",
        )
        .bind(keep_count)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

/// Parse a job row into an OcrJob struct.
pub(crate) fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<OcrJob> {
    Ok(OcrJob {
        id: row.get("id"),
        document_id: row.get("document_id"),
        status: OcrJobStatus::parse(row.get("status")),
        priority: row.get("priority"),
        language: row.get("language"),
        engine: row.get("engine"),
        options: row.get("options"),
        result: row.get("result"),
        extracted_text: row.get("extracted_text"),
        confidence_score: row.get("confidence_score"),
        page_count: row.get("page_count"),
        word_count: row.get("word_count"),
        character_count: row.get("character_count"),
        error_message: row.get("error_message"),
        error_code: row.get("error_code"),
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        lease_owner: row.get("lease_owner"),
        lease_expires_at: row.get("lease_expires_at"),
        processing_started_at: row.get("processing_started_at"),
        processing_completed_at: row.get("processing_completed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
