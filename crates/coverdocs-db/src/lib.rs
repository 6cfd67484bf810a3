//! # coverdocs-db
//!
//! PostgreSQL metadata store for the coverdocs document service.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for the three core entities
//!   (documents, OCR jobs, access logs)
//! - Atomic `FOR UPDATE SKIP LOCKED` job leasing
//! - An in-memory store with identical semantics for tests and
//!   embedded deployments
//!
//! ## Example
//!
//! ```rust,ignore
//! use coverdocs_db::Database;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/coverdocs").await?;
//!     let doc = db.documents.get(id, false).await?;
//!     println!("document {} v{}", doc.id, doc.version);
//!     Ok(())
//! }
//! ```

pub mod access_logs;
pub mod documents;
pub mod jobs;
pub mod memstore;
pub mod pool;

// Re-export core types
pub use coverdocs_core::*;

pub use access_logs::PgAccessLogStore;
pub use documents::PgDocumentStore;
pub use jobs::PgOcrJobStore;
pub use memstore::MemoryMetaStore;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};

/// Escape LIKE/ILIKE wildcard characters (`%`, `_`, `\`) in user input.
pub fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Combined database context with all repositories.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::PgPool,
    /// Document repository.
    pub documents: PgDocumentStore,
    /// OCR job repository.
    pub jobs: PgOcrJobStore,
    /// Access log repository.
    pub access_logs: PgAccessLogStore,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            documents: PgDocumentStore::new(pool.clone()),
            jobs: PgOcrJobStore::new(pool.clone()),
            access_logs: PgAccessLogStore::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("a_b"), "a\\_b");
        assert_eq!(escape_like("back\\slash"), "back\\\\slash");
        assert_eq!(escape_like("plain"), "plain");
    }
}
