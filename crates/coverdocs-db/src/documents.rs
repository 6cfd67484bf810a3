//! Document repository implementation.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use coverdocs_core::{
    compute_etag, new_id, Document, DocumentFilter, DocumentPage, DocumentPatch, DocumentStatus,
    DocumentStore, Error, NewDocument, Result, ScanStatus,
};

use crate::escape_like;

const DOCUMENT_COLUMNS: &str = "id, file_name, original_filename, file_size, mime_type, file_type, \
     file_hash, storage_key, storage_bucket, document_type, status, owner_id, client_id, \
     insurer_id, version, etag, security_scan_status, virus_scan_status, content_validated, \
     ocr_completed, ocr_job_id, ocr_text, ocr_confidence, ocr_language, ocr_page_count, \
     ocr_word_count, download_count, last_accessed, tags, metadata, created_at, updated_at, \
     deleted_at";

/// PostgreSQL implementation of DocumentStore.
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock a row and return `(version, etag, deleted)` for guarded updates.
    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<(i32, String, bool, DocumentStatus)>> {
        let row = sqlx::query(
            "SELECT version, etag, deleted_at IS NOT NULL AS deleted, status
             FROM documents WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| {
            (
                r.get("version"),
                r.get("etag"),
                r.get("deleted"),
                DocumentStatus::parse(r.get("status")),
            )
        }))
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn insert(&self, doc: NewDocument) -> Result<Document> {
        let id = new_id();
        let now = Utc::now();
        let etag = compute_etag(id, 1);

        let row = sqlx::query(&format!(
            "INSERT INTO documents (id, file_name, original_filename, file_size, mime_type, \
             file_type, file_hash, storage_key, storage_bucket, document_type, status, owner_id, \
             client_id, insurer_id, version, etag, security_scan_status, virus_scan_status, \
             content_validated, tags, metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'uploaded', $11, $12, $13, 1, $14, \
             'pending', 'pending', $15, $16, $17, $18, $18) \
             RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(id)
        .bind(&doc.file_name)
        .bind(&doc.original_filename)
        .bind(doc.file_size)
        .bind(&doc.mime_type)
        .bind(&doc.file_type)
        .bind(&doc.file_hash)
        .bind(&doc.storage_key)
        .bind(&doc.storage_bucket)
        .bind(&doc.document_type)
        .bind(&doc.owner_id)
        .bind(doc.client_id)
        .bind(doc.insurer_id)
        .bind(&etag)
        .bind(doc.content_validated)
        .bind(&doc.tags)
        .bind(&doc.metadata)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.constraint() == Some("documents_storage_key_key") => {
                Error::Conflict(format!("storage_key {} already exists", doc.storage_key))
            }
            _ => Error::Database(e),
        })?;

        document_from_row(&row)
    }

    async fn get(&self, id: Uuid, include_deleted: bool) -> Result<Document> {
        let query = if include_deleted {
            format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1")
        } else {
            format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1 AND deleted_at IS NULL")
        };

        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?
            .ok_or(Error::DocumentNotFound(id))?;

        document_from_row(&row)
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        cursor: Option<&str>,
        filter: &DocumentFilter,
        limit: i64,
    ) -> Result<DocumentPage> {
        let limit = limit.clamp(1, 500);
        let mut conditions = vec![
            "owner_id = $1".to_string(),
            "deleted_at IS NULL".to_string(),
        ];
        let mut param_idx = 2;

        // Each filter claims its parameter slot up front; binds follow in
        // the same order below.
        let status = filter.status.map(|s| s.as_str().to_string());
        if status.is_some() {
            conditions.push(format!("status = ${param_idx}"));
            param_idx += 1;
        }
        if filter.file_type.is_some() {
            conditions.push(format!("file_type = ${param_idx}"));
            param_idx += 1;
        }
        if filter.tag.is_some() {
            conditions.push(format!("${param_idx} = ANY(tags)"));
            param_idx += 1;
        }
        let name_pattern = filter
            .filename_contains
            .as_deref()
            .map(|s| format!("%{}%", escape_like(s)));
        if name_pattern.is_some() {
            conditions.push(format!("file_name ILIKE ${param_idx}"));
            param_idx += 1;
        }
        if filter.has_ocr.is_some() {
            conditions.push(format!("ocr_completed = ${param_idx}"));
            param_idx += 1;
        }
        if filter.created_after.is_some() {
            conditions.push(format!("created_at >= ${param_idx}"));
            param_idx += 1;
        }
        if filter.created_before.is_some() {
            conditions.push(format!("created_at <= ${param_idx}"));
            param_idx += 1;
        }

        let decoded_cursor = cursor.map(decode_cursor).transpose()?;
        if decoded_cursor.is_some() {
            conditions.push(format!(
                "(created_at, id) < (${}, ${})",
                param_idx,
                param_idx + 1
            ));
            param_idx += 2;
        }

        let query = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE {} \
             ORDER BY created_at DESC, id DESC LIMIT ${param_idx}",
            conditions.join(" AND "),
        );

        let mut q = sqlx::query(&query).bind(owner_id);
        if let Some(s) = &status {
            q = q.bind(s);
        }
        if let Some(ft) = &filter.file_type {
            q = q.bind(ft);
        }
        if let Some(tag) = &filter.tag {
            q = q.bind(tag);
        }
        if let Some(pattern) = &name_pattern {
            q = q.bind(pattern);
        }
        if let Some(has_ocr) = filter.has_ocr {
            q = q.bind(has_ocr);
        }
        if let Some(after) = filter.created_after {
            q = q.bind(after);
        }
        if let Some(before) = filter.created_before {
            q = q.bind(before);
        }
        if let Some((ts, id)) = decoded_cursor {
            q = q.bind(ts).bind(id);
        }
        // Fetch one extra row to detect whether another page exists.
        q = q.bind(limit + 1);

        let rows = q.fetch_all(&self.pool).await.map_err(Error::Database)?;

        let mut items = Vec::with_capacity(rows.len().min(limit as usize));
        for row in rows.iter().take(limit as usize) {
            items.push(document_from_row(row)?);
        }
        let next_cursor = if rows.len() as i64 > limit {
            items.last().map(|d| encode_cursor(d.created_at, d.id))
        } else {
            None
        };

        Ok(DocumentPage { items, next_cursor })
    }

    async fn update(&self, id: Uuid, patch: DocumentPatch, if_match: &str) -> Result<Document> {
        if patch.is_empty() {
            return Err(Error::Validation("empty update patch".to_string()));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let (version, etag, deleted, current_status) = Self::lock_row(&mut tx, id)
            .await?
            .ok_or(Error::DocumentNotFound(id))?;
        if deleted {
            return Err(Error::DocumentNotFound(id));
        }
        if etag != if_match {
            return Err(Error::PreconditionFailed(format!(
                "etag mismatch on document {}",
                id
            )));
        }
        if let Some(next) = patch.status {
            let allowed = matches!(
                (current_status, next),
                (DocumentStatus::Uploaded, DocumentStatus::Completed)
                    | (DocumentStatus::Completed, DocumentStatus::Uploaded)
                    | (DocumentStatus::Uploaded, DocumentStatus::Uploaded)
                    | (DocumentStatus::Completed, DocumentStatus::Completed)
            );
            if !allowed {
                return Err(Error::Validation(format!(
                    "status may not move from {} to {} through update",
                    current_status.as_str(),
                    next.as_str()
                )));
            }
        }

        let new_version = version + 1;
        let new_etag = compute_etag(id, new_version);
        let now = Utc::now();

        let row = sqlx::query(&format!(
            "UPDATE documents SET \
                file_name = COALESCE($2, file_name), \
                document_type = COALESCE($3, document_type), \
                tags = COALESCE($4, tags), \
                metadata = COALESCE($5, metadata), \
                status = COALESCE($6, status), \
                security_scan_status = COALESCE($7, security_scan_status), \
                virus_scan_status = COALESCE($8, virus_scan_status), \
                version = $9, etag = $10, updated_at = $11 \
             WHERE id = $1 \
             RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(id)
        .bind(&patch.file_name)
        .bind(&patch.document_type)
        .bind(&patch.tags)
        .bind(patch.metadata.as_ref())
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.security_scan_status.map(|s| s.as_str()))
        .bind(patch.virus_scan_status.map(|s| s.as_str()))
        .bind(new_version)
        .bind(&new_etag)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let doc = document_from_row(&row)?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(doc)
    }

    async fn soft_delete(&self, id: Uuid, if_match: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let (version, etag, deleted, _) = Self::lock_row(&mut tx, id)
            .await?
            .ok_or(Error::DocumentNotFound(id))?;
        if deleted {
            // Idempotent on already-deleted.
            return Ok(());
        }
        if etag != if_match {
            return Err(Error::PreconditionFailed(format!(
                "etag mismatch on document {}",
                id
            )));
        }

        let new_version = version + 1;
        let now = Utc::now();
        sqlx::query(
            "UPDATE documents SET status = 'deleted', deleted_at = $2, version = $3, etag = $4, \
             updated_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .bind(new_version)
        .bind(compute_etag(id, new_version))
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn restore(&self, id: Uuid) -> Result<Document> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let (version, _, deleted, _) = Self::lock_row(&mut tx, id)
            .await?
            .ok_or(Error::DocumentNotFound(id))?;
        if !deleted {
            return self.get(id, false).await;
        }

        let new_version = version + 1;
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "UPDATE documents SET status = 'uploaded', deleted_at = NULL, version = $2, \
             etag = $3, updated_at = $4 WHERE id = $1 RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(id)
        .bind(new_version)
        .bind(compute_etag(id, new_version))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let doc = document_from_row(&row)?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(doc)
    }

    async fn hard_delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id));
        }
        Ok(())
    }

    async fn increment_access_counters(&self, id: Uuid, delta_downloads: i64) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET download_count = download_count + $2, last_accessed = $3 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(delta_downloads.max(0))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn owner_usage_bytes(&self, owner_id: &str) -> Result<i64> {
        let used: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(file_size)::BIGINT FROM documents \
             WHERE owner_id = $1 AND deleted_at IS NULL",
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(used.unwrap_or(0))
    }

    async fn find_by_owner_and_hash(
        &self,
        owner_id: &str,
        file_hash: &str,
        include_deleted: bool,
    ) -> Result<Option<Document>> {
        // Live rows sort ahead of deleted ones so a revivable duplicate is
        // only returned when no live copy exists.
        let query = if include_deleted {
            format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents \
                 WHERE owner_id = $1 AND file_hash = $2 \
                 ORDER BY deleted_at ASC NULLS FIRST, created_at ASC LIMIT 1"
            )
        } else {
            format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents \
                 WHERE owner_id = $1 AND file_hash = $2 AND deleted_at IS NULL \
                 ORDER BY created_at ASC LIMIT 1"
            )
        };

        let row = sqlx::query(&query)
            .bind(owner_id)
            .bind(file_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(|r| document_from_row(&r)).transpose()
    }

    async fn storage_key_exists(&self, storage_key: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM documents WHERE storage_key = $1)")
                .bind(storage_key)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(exists)
    }
}

/// Opaque keyset cursor: base64url of `{timestamp_micros}:{uuid}`.
pub(crate) fn encode_cursor(created_at: DateTime<Utc>, id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}:{}", created_at.timestamp_micros(), id))
}

pub(crate) fn decode_cursor(cursor: &str) -> Result<(DateTime<Utc>, Uuid)> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| Error::Validation("malformed cursor".to_string()))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| Error::Validation("malformed cursor".to_string()))?;
    let (micros, id) = text
        .split_once(':')
        .ok_or_else(|| Error::Validation("malformed cursor".to_string()))?;
    let micros: i64 = micros
        .parse()
        .map_err(|_| Error::Validation("malformed cursor".to_string()))?;
    let ts = Utc
        .timestamp_micros(micros)
        .single()
        .ok_or_else(|| Error::Validation("malformed cursor".to_string()))?;
    let id = Uuid::parse_str(id).map_err(|_| Error::Validation("malformed cursor".to_string()))?;
    Ok((ts, id))
}

/// Parse a document row into a Document struct.
pub(crate) fn document_from_row(row: &sqlx::postgres::PgRow) -> Result<Document> {
    Ok(Document {
        id: row.get("id"),
        file_name: row.get("file_name"),
        original_filename: row.get("original_filename"),
        file_size: row.get("file_size"),
        mime_type: row.get("mime_type"),
        file_type: row.get("file_type"),
        file_hash: row.get("file_hash"),
        storage_key: row.get("storage_key"),
        storage_bucket: row.get("storage_bucket"),
        document_type: row.get("document_type"),
        status: DocumentStatus::parse(row.get("status")),
        owner_id: row.get("owner_id"),
        client_id: row.get("client_id"),
        insurer_id: row.get("insurer_id"),
        version: row.get("version"),
        etag: row.get("etag"),
        security_scan_status: ScanStatus::parse(row.get("security_scan_status")),
        virus_scan_status: ScanStatus::parse(row.get("virus_scan_status")),
        content_validated: row.get("content_validated"),
        ocr_completed: row.get("ocr_completed"),
        ocr_job_id: row.get("ocr_job_id"),
        ocr_text: row.get("ocr_text"),
        ocr_confidence: row.get("ocr_confidence"),
        ocr_language: row.get("ocr_language"),
        ocr_page_count: row.get("ocr_page_count"),
        ocr_word_count: row.get("ocr_word_count"),
        download_count: row.get("download_count"),
        last_accessed: row.get("last_accessed"),
        tags: row.get("tags"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_round_trip() {
        let ts = Utc::now();
        let id = new_id();
        let cursor = encode_cursor(ts, id);
        let (decoded_ts, decoded_id) = decode_cursor(&cursor).unwrap();
        assert_eq!(decoded_ts.timestamp_micros(), ts.timestamp_micros());
        assert_eq!(decoded_id, id);
    }

    #[test]
    fn test_cursor_is_opaque() {
        let cursor = encode_cursor(Utc::now(), new_id());
        assert!(!cursor.contains(':'));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_cursor("!!!not-base64!!!"),
            Err(Error::Validation(_))
        ));
        let bogus = URL_SAFE_NO_PAD.encode("no-separator");
        assert!(matches!(decode_cursor(&bogus), Err(Error::Validation(_))));
        let bad_uuid = URL_SAFE_NO_PAD.encode("12345:not-a-uuid");
        assert!(matches!(decode_cursor(&bad_uuid), Err(Error::Validation(_))));
    }
}
