//! Durable, cross-restart response cache.
//!
//! A single-writer SQLite store at a platform-appropriate user-data path.
//! Mirrors the pool setup and schema-migration style of this project
//! family's session writer (`lunaroute-session`'s `SqliteWriter`): WAL
//! journal mode, `CREATE TABLE IF NOT EXISTS` plus `CREATE INDEX IF NOT
//! EXISTS`, and all access funnelled through a bounded `SqlitePool`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;

use crate::error::{CoreError, Result};

/// One row of the durable cache. `last_accessed` is bumped on every hit.
#[derive(Debug, Clone)]
pub struct CacheRow {
    pub tool_name: String,
    pub request_fingerprint: String,
    pub params_json: String,
    pub response: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: i64,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PersistentCacheStats {
    pub total_entries: i64,
    pub expired_entries: i64,
    pub total_hits: i64,
    pub cache_size_bytes: i64,
    /// Top 10 tools by entry count, `(tool_name, count)`.
    pub per_tool_counts: Vec<(String, i64)>,
}

/// Durable response cache. Cloning shares the same connection pool.
#[derive(Clone)]
pub struct PersistentCache {
    pool: SqlitePool,
}

impl PersistentCache {
    /// Open (creating if absent) the cache database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::StorageError(e.to_string()))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal),
            )
            .await
            .map_err(|e| CoreError::StorageError(e.to_string()))?;

        Self::initialize_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Open the cache at the platform user-data default:
    /// `<user-data-dir>/UnifyMcp/ResponseCache/response_cache.db`.
    pub async fn open_default() -> Result<Self> {
        let path = default_db_path()?;
        Self::open(&path).await
    }

    async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS response_cache (
                tool_name TEXT NOT NULL,
                request_fingerprint TEXT NOT NULL,
                params_json TEXT NOT NULL,
                response TEXT NOT NULL,
                cached_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                last_accessed TEXT NOT NULL,
                PRIMARY KEY (tool_name, request_fingerprint)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_response_cache_tool ON response_cache(tool_name)")
            .execute(pool)
            .await
            .map_err(|e| CoreError::StorageError(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_response_cache_fingerprint ON response_cache(request_fingerprint)",
        )
        .execute(pool)
        .await
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_response_cache_expires ON response_cache(expires_at)")
            .execute(pool)
            .await
            .map_err(|e| CoreError::StorageError(e.to_string()))?;

        Ok(())
    }

    pub async fn get(&self, tool: &str, fingerprint: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT response, expires_at FROM response_cache WHERE tool_name = ? AND request_fingerprint = ?",
        )
        .bind(tool)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let response: String = row.get("response");
        let expires_at: String = row.get("expires_at");
        let expires_at: DateTime<Utc> = expires_at
            .parse()
            .map_err(|e: chrono::ParseError| CoreError::StorageError(e.to_string()))?;

        if expires_at < Utc::now() {
            self.delete_row(tool, fingerprint).await?;
            return Ok(None);
        }

        sqlx::query(
            "UPDATE response_cache SET hit_count = hit_count + 1, last_accessed = ? WHERE tool_name = ? AND request_fingerprint = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(tool)
        .bind(fingerprint)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

        Ok(Some(response))
    }

    pub async fn put(
        &self,
        tool: &str,
        fingerprint: &str,
        params_json: &str,
        response: &str,
        duration: chrono::Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = now + duration;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO response_cache
                (tool_name, request_fingerprint, params_json, response, cached_at, expires_at, hit_count, last_accessed)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(tool)
        .bind(fingerprint)
        .bind(params_json)
        .bind(response)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

        Ok(())
    }

    async fn delete_row(&self, tool: &str, fingerprint: &str) -> Result<()> {
        sqlx::query("DELETE FROM response_cache WHERE tool_name = ? AND request_fingerprint = ?")
            .bind(tool)
            .bind(fingerprint)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn invalidate_tool(&self, tool: &str) -> Result<()> {
        sqlx::query("DELETE FROM response_cache WHERE tool_name = ?")
            .bind(tool)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn invalidate(&self, tool: &str, fingerprint: &str) -> Result<()> {
        self.delete_row(tool, fingerprint).await
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM response_cache")
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM response_cache WHERE expires_at < ?")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::StorageError(e.to_string()))?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<PersistentCacheStats> {
        let now = Utc::now().to_rfc3339();

        let totals = sqlx::query(
            "SELECT COUNT(*) as total, COALESCE(SUM(hit_count), 0) as hits, COALESCE(SUM(LENGTH(response)), 0) as bytes FROM response_cache",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

        let expired: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM response_cache WHERE expires_at < ?")
            .bind(&now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CoreError::StorageError(e.to_string()))?;

        let per_tool_rows = sqlx::query(
            "SELECT tool_name, COUNT(*) as count FROM response_cache GROUP BY tool_name ORDER BY count DESC LIMIT 10",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

        let per_tool_counts = per_tool_rows
            .into_iter()
            .map(|r| (r.get::<String, _>("tool_name"), r.get::<i64, _>("count")))
            .collect();

        Ok(PersistentCacheStats {
            total_entries: totals.get("total"),
            expired_entries: expired,
            total_hits: totals.get("hits"),
            cache_size_bytes: totals.get("bytes"),
            per_tool_counts,
        })
    }

    pub async fn top_entries(&self, n: i64) -> Result<Vec<CacheRow>> {
        let rows = sqlx::query(
            "SELECT * FROM response_cache ORDER BY hit_count DESC LIMIT ?",
        )
        .bind(n)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

        rows.into_iter().map(row_to_cache_row).collect()
    }
}

fn row_to_cache_row(row: sqlx::sqlite::SqliteRow) -> Result<CacheRow> {
    let parse = |s: String| -> Result<DateTime<Utc>> {
        s.parse().map_err(|e: chrono::ParseError| CoreError::StorageError(e.to_string()))
    };
    Ok(CacheRow {
        tool_name: row.get("tool_name"),
        request_fingerprint: row.get("request_fingerprint"),
        params_json: row.get("params_json"),
        response: row.get("response"),
        cached_at: parse(row.get("cached_at"))?,
        expires_at: parse(row.get("expires_at"))?,
        hit_count: row.get("hit_count"),
        last_accessed: parse(row.get("last_accessed"))?,
    })
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir()
        .ok_or_else(|| CoreError::StorageError("could not determine user data directory".into()))?;
    Ok(base.join("UnifyMcp").join("ResponseCache").join("response_cache.db"))
}
