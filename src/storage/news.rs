use sqlx::{QueryBuilder, Sqlite, Transaction};

use super::schema::Database;
use super::types::{DatabaseError, NewsItem, NewsItemDraft, NewsRow};

/// Rows per INSERT statement. 6 bound columns * 50 = 300 parameters, well
/// under SQLite's 999 limit.
const INSERT_BATCH_SIZE: usize = 50;

impl Database {
    // ========================================================================
    // Snapshot Replacement
    // ========================================================================

    /// Replace the whole snapshot with `items`, returns the number inserted.
    ///
    /// The delete and all inserts share one transaction: a concurrent reader
    /// sees either the previous complete snapshot or this one, never an
    /// empty or partially filled table. If any statement fails the
    /// transaction is rolled back and the previous snapshot stays as it was.
    ///
    /// Items are inserted in the given order, so within one snapshot `id`
    /// follows feed order. `createdAt` is the same for every row of a
    /// replacement.
    pub async fn replace_all(&self, items: &[NewsItemDraft]) -> Result<usize, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        match write_snapshot(&mut tx, items, now).await {
            Ok(deleted) => {
                tx.commit().await.map_err(DatabaseError::from_sqlx)?;
                tracing::debug!(
                    deleted = deleted,
                    inserted = items.len(),
                    "News snapshot replaced"
                );
                Ok(items.len())
            }
            Err(e) => {
                // Roll back before the connection returns to the pool
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Failed to roll back snapshot replacement");
                }
                Err(DatabaseError::from_sqlx(e))
            }
        }
    }

    // ========================================================================
    // Snapshot Queries
    // ========================================================================

    /// All items of the current snapshot, newest publication first.
    /// Items published at the same instant keep insertion (feed) order.
    pub async fn list_all_ordered_by_published_desc(&self) -> Result<Vec<NewsItem>, DatabaseError> {
        let rows = sqlx::query_as::<_, NewsRow>(
            r#"
            SELECT id, title, description, link, pubDate, image, createdAt
            FROM news
            ORDER BY pubDate DESC, id ASC
        "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(rows.into_iter().map(NewsRow::into_item).collect())
    }

    /// Number of items in the current snapshot
    pub async fn count(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM news")
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(count)
    }
}

/// Delete every row, then insert `items` in batches. Returns rows deleted.
async fn write_snapshot(
    tx: &mut Transaction<'_, Sqlite>,
    items: &[NewsItemDraft],
    now: i64,
) -> Result<u64, sqlx::Error> {
    let deleted = sqlx::query("DELETE FROM news")
        .execute(&mut **tx)
        .await?
        .rows_affected();

    for chunk in items.chunks(INSERT_BATCH_SIZE) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO news (title, description, link, pubDate, image, createdAt) ",
        );

        builder.push_values(chunk, |mut b, item| {
            b.push_bind(&item.title)
                .push_bind(&item.description)
                .push_bind(&item.link)
                .push_bind(item.published_at.timestamp())
                .push_bind(&item.image)
                .push_bind(now);
        });

        builder.build().execute(&mut **tx).await?;
    }

    Ok(deleted)
}
