//! Access log repository implementation.
//!
//! Append-only from the core: no UPDATE or DELETE statements exist here.
//! Retention is an external sweeper's concern.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use coverdocs_core::{AccessLogEntry, AccessLogStore, AccessType, Error, Result};

/// PostgreSQL implementation of AccessLogStore.
pub struct PgAccessLogStore {
    pool: PgPool,
}

impl PgAccessLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccessLogStore for PgAccessLogStore {
    async fn append(&self, entry: AccessLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO access_logs (id, document_id, user_id, access_type, success, \
             http_status_code, error_code, error_message, response_time_ms, \
             file_size_downloaded, ip_address, user_agent, request_id, session_id, accessed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(entry.id)
        .bind(entry.document_id)
        .bind(&entry.user_id)
        .bind(entry.access_type.as_str())
        .bind(entry.success)
        .bind(entry.http_status_code)
        .bind(&entry.error_code)
        .bind(&entry.error_message)
        .bind(entry.response_time_ms)
        .bind(entry.file_size_downloaded)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(&entry.request_id)
        .bind(&entry.session_id)
        .bind(entry.accessed_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn list_for_document(
        &self,
        document_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AccessLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, document_id, user_id, access_type, success, http_status_code, \
             error_code, error_message, response_time_ms, file_size_downloaded, ip_address, \
             user_agent, request_id, session_id, accessed_at \
             FROM access_logs WHERE document_id = $1 \
             ORDER BY accessed_at DESC LIMIT $2",
        )
        .bind(document_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| AccessLogEntry {
                id: row.get("id"),
                document_id: row.get("document_id"),
                user_id: row.get("user_id"),
                access_type: AccessType::parse(row.get("access_type")),
                success: row.get("success"),
                http_status_code: row.get("http_status_code"),
                error_code: row.get("error_code"),
                error_message: row.get("error_message"),
                response_time_ms: row.get("response_time_ms"),
                file_size_downloaded: row.get("file_size_downloaded"),
                ip_address: row.get("ip_address"),
                user_agent: row.get("user_agent"),
                request_id: row.get("request_id"),
                session_id: row.get("session_id"),
                accessed_at: row.get("accessed_at"),
            })
            .collect())
    }

    async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM access_logs")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(count)
    }
}
