use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("The news database is locked by another process. Please close it and try again.")]
    Locked,

    /// Schema creation failed
    #[error("Database initialization failed: {0}")]
    Initialization(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A news item built by a fetch cycle, before the store assigns its
/// `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsItemDraft {
    pub title: String,
    pub description: Option<String>,
    pub link: String,
    pub published_at: DateTime<Utc>,
    pub image: Option<String>,
}

/// A news item as held in the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewsItem {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub link: String,
    pub published_at: DateTime<Utc>,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Internal row type for `news` queries (timestamps stored as unix seconds)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct NewsRow {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub link: String,
    #[sqlx(rename = "pubDate")]
    pub pub_date: i64,
    pub image: Option<String>,
    #[sqlx(rename = "createdAt")]
    pub created_at: i64,
}

impl NewsRow {
    pub(crate) fn into_item(self) -> NewsItem {
        NewsItem {
            id: self.id,
            title: self.title,
            description: self.description,
            link: self.link,
            published_at: DateTime::from_timestamp(self.pub_date, 0).unwrap_or_default(),
            image: self.image,
            created_at: DateTime::from_timestamp(self.created_at, 0).unwrap_or_default(),
        }
    }
}
