//! src/services/metadata_index.rs
//!
//! MetadataIndex: durable `(bucket, key) -> Object` mapping backed by SQLite.
//! It never touches object bytes; GET/HEAD responses and bucket statistics
//! are answered from here alone.

use crate::models::object::{BucketStats, NewObject, Object};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid database url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IndexError {
    /// True when SQLite refused the statement because another writer holds the lock.
    pub fn is_lock_contention(&self) -> bool {
        match self {
            IndexError::Sqlx(sqlx::Error::Database(db_err)) => {
                let code = db_err.code();
                // Extended result codes keep the primary code in the low byte.
                let primary = code
                    .as_deref()
                    .and_then(|c| c.parse::<i32>().ok())
                    .map(|c| c & 0xff);
                matches!(primary, Some(5) | Some(6))
                    || db_err.message().contains("database is locked")
            }
            IndexError::Sqlx(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Result of an insert-only `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    AlreadyExists,
}

#[derive(Clone)]
pub struct MetadataIndex {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl MetadataIndex {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (creating if missing) the SQLite database named by `database_url`.
    pub async fn connect(database_url: &str) -> IndexResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|source| IndexError::InvalidUrl {
                url: database_url.to_string(),
                source,
            })?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let db_path = options.get_filename();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
                info!("Created missing directory {:?}", parent);
            }
        }
        debug!("Opening SQLite database at {}", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Convenience for tests and tooling: open a database file by path.
    pub async fn open_file(path: &Path) -> IndexResult<Self> {
        Self::connect(&format!("sqlite://{}", path.display())).await
    }

    /// Apply the embedded schema. Safe to run on every start-up.
    pub async fn migrate(&self) -> IndexResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} migration statements...", statements.len());

        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Insert a new row. An existing `(bucket, key)` is left untouched.
    pub async fn put(&self, object: &NewObject<'_>) -> IndexResult<PutOutcome> {
        let result = sqlx::query(
            "INSERT INTO objects (id, bucket, key, mime, filename, size)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Object::object_id(object.bucket, object.key))
        .bind(object.bucket)
        .bind(object.key)
        .bind(object.mime)
        .bind(object.filename)
        .bind(object.size)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => {
                info!(
                    bucket = object.bucket,
                    key = object.key,
                    size = object.size,
                    "Created object"
                );
                Ok(PutOutcome::Inserted)
            }
            Err(err) if is_unique_violation(&err) => {
                info!(
                    bucket = object.bucket,
                    key = object.key,
                    "Object already exists"
                );
                Ok(PutOutcome::AlreadyExists)
            }
            Err(err) => Err(IndexError::Sqlx(err)),
        }
    }

    /// Insert or replace the row for `(bucket, key)`.
    pub async fn upsert(&self, object: &NewObject<'_>) -> IndexResult<()> {
        sqlx::query(
            "INSERT INTO objects (id, bucket, key, mime, filename, size)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                mime = excluded.mime,
                filename = excluded.filename,
                size = excluded.size",
        )
        .bind(Object::object_id(object.bucket, object.key))
        .bind(object.bucket)
        .bind(object.key)
        .bind(object.mime)
        .bind(object.filename)
        .bind(object.size)
        .execute(&*self.db)
        .await?;

        info!(
            bucket = object.bucket,
            key = object.key,
            size = object.size,
            "Stored object"
        );
        Ok(())
    }

    pub async fn get(&self, bucket: &str, key: &str) -> IndexResult<Option<Object>> {
        let object = sqlx::query_as::<_, Object>(
            "SELECT id, bucket, key, mime, filename, size
             FROM objects WHERE bucket = ? AND key = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(object)
    }

    /// Remove the row if present. Returns whether a row was deleted.
    pub async fn delete(&self, bucket: &str, key: &str) -> IndexResult<bool> {
        let result = sqlx::query("DELETE FROM objects WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&*self.db)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(bucket, key, "Deleted object");
        }
        Ok(deleted)
    }

    pub async fn bucket_stats(&self, bucket: &str) -> IndexResult<BucketStats> {
        let (object_count, total_size_bytes) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM objects WHERE bucket = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await?;

        Ok(BucketStats {
            object_count,
            total_size_bytes,
        })
    }

    /// Lightweight connectivity probe used by readiness checks.
    pub async fn ping(&self) -> IndexResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.is_unique_violation()
            || db_err.message().to_ascii_lowercase().contains("unique")
    )
}
