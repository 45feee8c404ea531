use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the news snapshot store.
///
/// Cheap to clone: every clone shares one connection pool, so callers never
/// open connections of their own.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open the database at `path` (creating the file if needed) and make
    /// sure the `news` table exists.
    ///
    /// `":memory:"` opens an in-memory database shared by the whole pool,
    /// which is what the tests use.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Locked` if another process holds the file
    /// lock, `DatabaseError::Initialization` if the schema cannot be created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: a writer waits up to 5 seconds for a competing
        // lock instead of failing with SQLITE_BUSY straight away.
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");

        // WAL lets readers keep seeing the previous snapshot while
        // replace_all holds its write transaction.
        if path != ":memory:" {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// Create the `news` table and its ordering index if they are absent.
    ///
    /// Safe to call on every start: all statements use `IF NOT EXISTS`.
    /// Runs inside a transaction so a half-created schema is never left behind.
    pub async fn initialize(&self) -> Result<(), DatabaseError> {
        self.create_schema().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::Other(e) => DatabaseError::Initialization(e.to_string()),
            locked => locked,
        })
    }

    async fn create_schema(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // AUTOINCREMENT keeps ids from being reused after the table is emptied
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS news (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT,
                link TEXT NOT NULL,
                pubDate INTEGER NOT NULL,
                image TEXT,
                createdAt INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Covers ORDER BY pubDate DESC, id ASC in list_all_ordered_by_published_desc()
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_news_pub_date ON news(pubDate DESC, id)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_creates_table() {
        let db = Database::open(":memory:").await.unwrap();
        let (name,): (String,) =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'news'")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(name, "news");
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();
        db.initialize().await.unwrap();
        db.initialize().await.unwrap();
        assert_eq!(db.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reopen_file_keeps_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("news.db");
        let path = path.to_str().unwrap();

        {
            let db = Database::open(path).await.unwrap();
            db.pool.close().await;
        }
        let db = Database::open(path).await.unwrap();
        assert_eq!(db.count().await.unwrap(), 0);
    }
}
