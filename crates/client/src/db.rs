//! SQLite database shared by the local store, the sync queue and the drain lease.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use visitsync_core::EntityKind;

use crate::error::StoreError;

/// Handle to one database file (or an in-memory database for tests).
///
/// Each context (foreground app, background worker) opens its own `Database`;
/// they coordinate only through the file.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        tracing::debug!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Private in-memory database.
    ///
    /// A single connection that is never recycled, otherwise the data would
    /// vanish with it.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for kind in EntityKind::ALL {
            let table = kind.collection();
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    uuid        TEXT PRIMARY KEY,
                    data        TEXT NOT NULL,
                    pending_op  INTEGER NULL,
                    created_at  TEXT NULL,
                    updated_at  TEXT NULL,
                    stored_at   TEXT NOT NULL
                )
                "#
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_pending ON {table} (pending_op)"
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                entity          TEXT NOT NULL,
                kind            TEXT NOT NULL,
                payload         TEXT NULL,
                correlation_id  TEXT NOT NULL,
                timestamp       TEXT NOT NULL,
                status          TEXT NOT NULL,
                retries         INTEGER NOT NULL DEFAULT 0,
                last_error      TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_correlation ON sync_queue (correlation_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_lease (
                name        TEXT PRIMARY KEY,
                holder      TEXT NOT NULL,
                expires_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn schema_has_every_collection() {
        let db = Database::in_memory().await.unwrap();
        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .fetch_all(db.pool())
            .await
            .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.get("name")).collect();

        for expected in ["products", "stores", "visits", "sync_queue", "sync_lease"] {
            assert!(names.iter().any(|n| n == expected), "missing table {expected}");
        }
    }

    #[tokio::test]
    async fn reopening_a_file_keeps_data_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("visitsync.db");

        let db = Database::open(&path).await.unwrap();
        sqlx::query("INSERT INTO sync_lease (name, holder, expires_at) VALUES ('x', 'y', 0)")
            .execute(db.pool())
            .await
            .unwrap();
        db.close().await;

        let db = Database::open(&path).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_lease")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
