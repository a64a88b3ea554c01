//! SQLite document store.
//!
//! Persists JSON documents and their binary attachments to a single SQLite
//! file. Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use chainfeed_storage::sqlite::SqliteDocumentStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteDocumentStore::open("./chainfeed.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteDocumentStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainfeed_core::error::IndexerError;
use chainfeed_core::store::{AttachmentBatch, Document, DocumentStore};

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed [`DocumentStore`].
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chainfeed.db"`) or a full
    /// SQLite URL (`"sqlite:./chainfeed.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        debug!(path, "opened sqlite document store");
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// A single connection is kept so every query sees the same database. All
    /// data is lost when the store is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                id   TEXT PRIMARY KEY NOT NULL,
                body TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS attachments (
                document_id TEXT NOT NULL,
                name        TEXT NOT NULL,
                bytes       BLOB NOT NULL,
                PRIMARY KEY (document_id, name)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Total number of stored documents.
    pub async fn document_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn load(&self, id: &str) -> Result<Option<Document>, IndexerError> {
        let row = sqlx::query("SELECT body FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        match row {
            Some(r) => {
                let body: String = r.get("body");
                Ok(Some(Document::new(id, serde_json::from_str(&body)?)))
            }
            None => Ok(None),
        }
    }

    async fn store(&self, document: Document) -> Result<(), IndexerError> {
        self.bulk_insert(vec![document]).await
    }

    async fn delete(&self, id: &str) -> Result<bool, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query("DELETE FROM attachments WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        let deleted = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?
            .rows_affected();

        tx.commit().await.map_err(storage_err)?;
        Ok(deleted > 0)
    }

    async fn bulk_insert(&self, documents: Vec<Document>) -> Result<(), IndexerError> {
        let count = documents.len();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        for doc in documents {
            let body = serde_json::to_string(&doc.body)?;
            sqlx::query(
                "INSERT INTO documents (id, body) VALUES (?, ?)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            )
            .bind(&doc.id)
            .bind(&body)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(count, "documents stored");
        Ok(())
    }

    async fn store_attachments(&self, batch: AttachmentBatch) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        for a in batch.into_inner() {
            let exists = sqlx::query("SELECT 1 FROM documents WHERE id = ?")
                .bind(&a.document_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage_err)?
                .is_some();
            if !exists {
                // Dropping `tx` rolls the batch back.
                return Err(IndexerError::NotFound { id: a.document_id });
            }

            sqlx::query(
                "INSERT INTO attachments (document_id, name, bytes) VALUES (?, ?, ?)
                 ON CONFLICT(document_id, name) DO UPDATE SET bytes = excluded.bytes",
            )
            .bind(&a.document_id)
            .bind(&a.name)
            .bind(&a.bytes)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)
    }

    async fn store_with_attachments(
        &self,
        document: Document,
        batch: AttachmentBatch,
    ) -> Result<(), IndexerError> {
        let body = serde_json::to_string(&document.body)?;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO documents (id, body) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
        )
        .bind(&document.id)
        .bind(&body)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        for a in batch.into_inner() {
            if a.document_id != document.id {
                let exists = sqlx::query("SELECT 1 FROM documents WHERE id = ?")
                    .bind(&a.document_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage_err)?
                    .is_some();
                if !exists {
                    return Err(IndexerError::NotFound { id: a.document_id });
                }
            }

            sqlx::query(
                "INSERT INTO attachments (document_id, name, bytes) VALUES (?, ?, ?)
                 ON CONFLICT(document_id, name) DO UPDATE SET bytes = excluded.bytes",
            )
            .bind(&a.document_id)
            .bind(&a.name)
            .bind(&a.bytes)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)
    }

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Option<Vec<u8>>, IndexerError> {
        let row = sqlx::query("SELECT bytes FROM attachments WHERE document_id = ? AND name = ?")
            .bind(id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("bytes")))
    }

    async fn load_starting_with(&self, prefix: &str) -> Result<Vec<Document>, IndexerError> {
        let rows = sqlx::query(
            "SELECT id, body FROM documents
             WHERE substr(id, 1, length(?)) = ? ORDER BY id",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let body: String = row.get("body");
            docs.push(Document::new(id, serde_json::from_str(&body)?));
        }
        Ok(docs)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
