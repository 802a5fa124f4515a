use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::Row;

use super::Store;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ItemRow {
    pub id: i64,
    pub user_id: i64,
    pub source_id: i64,
    pub title: String,
    pub url: Option<String>,
    pub media_urls_json: Option<String>,
    pub author: Option<String>,
    pub published_at: DateTime<Utc>,
    pub has_published_time: bool,
    pub unique_id: String,
    pub read: bool,
    pub favorite: bool,
    pub hidden: bool,
    pub read_later: bool,
    pub translated_title: Option<String>,
    pub summary: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ItemContentRow {
    pub item_id: i64,
    pub body: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// One normalized item ready for insertion.
#[derive(Debug, Clone)]
pub struct NewItemRow {
    pub title: String,
    pub url: Option<String>,
    pub media_urls: Vec<String>,
    pub author: Option<String>,
    pub published_at: DateTime<Utc>,
    pub has_published_time: bool,
    pub unique_id: String,
    pub content: Option<String>,
    pub external_id: Option<String>,
}

/// Article listing filters, mirroring the API query string.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub filter: Option<String>,
    pub feed_id: Option<i64>,
    pub category: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

const ITEM_COLS: &str = "id, user_id, source_id, title, url, media_urls_json, author, \
     published_at, has_published_time, unique_id, read, favorite, hidden, read_later, \
     translated_title, summary, external_id";

impl Store {
    /// Insert one batch of items transactionally with insert-or-ignore
    /// dedup on `(user_id, unique_id)`. Returns the ids of newly inserted
    /// rows; duplicates are silently skipped (0 rows affected is success).
    ///
    /// `max_articles` is checked against the post-insert count; the batch
    /// stops with `QuotaExceeded` once the cap would be crossed, keeping
    /// items inserted so far (partial work is retained by design).
    pub async fn insert_items(
        &self,
        user_id: i64,
        source_id: i64,
        items: &[NewItemRow],
    ) -> Result<Vec<i64>> {
        let quota = self.quota_for(user_id).await?;
        let mut count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(self.pool())
            .await?;

        let mut tx = self.pool().begin().await?;
        let mut new_ids = Vec::new();

        for item in items {
            if quota.max_articles > 0 && count + 1 > quota.max_articles {
                tx.commit().await?;
                return Err(Error::QuotaExceeded { which: "articles" });
            }

            let media_json = if item.media_urls.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&item.media_urls).unwrap_or_default())
            };

            let res = sqlx::query(
                "INSERT OR IGNORE INTO items (user_id, source_id, title, url, media_urls_json, \
                 author, published_at, has_published_time, unique_id, external_id, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(source_id)
            .bind(&item.title)
            .bind(&item.url)
            .bind(media_json)
            .bind(&item.author)
            .bind(item.published_at)
            .bind(item.has_published_time)
            .bind(&item.unique_id)
            .bind(&item.external_id)
            .bind(Utc::now())
            .execute(&mut tx)
            .await?;

            if res.rows_affected() == 0 {
                // Duplicate within (user_id, unique_id): earliest insertion wins.
                continue;
            }
            let item_id = res.last_insert_rowid();
            count += 1;

            if let Some(body) = &item.content {
                sqlx::query(
                    "INSERT OR REPLACE INTO item_contents (item_id, body, fetched_at) VALUES (?, ?, ?)",
                )
                .bind(item_id)
                .bind(body)
                .bind(Utc::now())
                .execute(&mut tx)
                .await?;
            }

            new_ids.push(item_id);
        }

        tx.commit().await?;
        Ok(new_ids)
    }

    pub async fn item_by_id(&self, user_id: i64, item_id: i64) -> Result<ItemRow> {
        sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {} FROM items WHERE id = ? AND user_id = ?",
            ITEM_COLS
        ))
        .bind(item_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| Error::not_found(format!("article {}", item_id)))
    }

    pub async fn item_by_external_id(
        &self,
        user_id: i64,
        external_id: &str,
    ) -> Result<Option<ItemRow>> {
        Ok(sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {} FROM items WHERE user_id = ? AND external_id = ?",
            ITEM_COLS
        ))
        .bind(user_id)
        .bind(external_id)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn list_items(&self, user_id: i64, f: &ItemFilter) -> Result<Vec<ItemRow>> {
        let mut sql = format!("SELECT {} FROM items i WHERE i.user_id = ?", ITEM_COLS);
        match f.filter.as_deref() {
            Some("unread") => sql.push_str(" AND i.read = FALSE AND i.hidden = FALSE"),
            Some("favorites") => sql.push_str(" AND i.favorite = TRUE"),
            Some("readLater") => sql.push_str(" AND i.read_later = TRUE"),
            _ => sql.push_str(" AND i.hidden = FALSE"),
        }
        if f.feed_id.is_some() {
            sql.push_str(" AND i.source_id = ?");
        }
        if f.category.is_some() {
            sql.push_str(
                " AND i.source_id IN (SELECT id FROM sources WHERE user_id = i.user_id AND category = ?)",
            );
        }
        sql.push_str(" ORDER BY i.published_at DESC, i.id DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query_as::<_, ItemRow>(&sql).bind(user_id);
        if let Some(feed_id) = f.feed_id {
            q = q.bind(feed_id);
        }
        if let Some(category) = &f.category {
            q = q.bind(category);
        }
        q = q.bind(f.limit.unwrap_or(50).min(500)).bind(f.offset.unwrap_or(0));

        Ok(q.fetch_all(self.pool()).await?)
    }

    /// Unread counts per source, for the sidebar.
    pub async fn unread_counts(&self, user_id: i64) -> Result<Vec<(i64, i64)>> {
        let rows = sqlx::query(
            "SELECT source_id, COUNT(*) AS n FROM items \
             WHERE user_id = ? AND read = FALSE AND hidden = FALSE GROUP BY source_id",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(|r| (r.get("source_id"), r.get("n"))).collect())
    }

    /// Set the read flag. Marking read also clears read_later; the reverse
    /// transition does not restore it.
    pub async fn set_read(&self, user_id: i64, item_id: i64, read: bool) -> Result<ItemRow> {
        let res = if read {
            sqlx::query(
                "UPDATE items SET read = TRUE, read_later = FALSE WHERE id = ? AND user_id = ?",
            )
        } else {
            sqlx::query("UPDATE items SET read = FALSE WHERE id = ? AND user_id = ?")
        }
        .bind(item_id)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("article {}", item_id)));
        }
        self.item_by_id(user_id, item_id).await
    }

    pub async fn toggle_favorite(&self, user_id: i64, item_id: i64) -> Result<ItemRow> {
        let res = sqlx::query("UPDATE items SET favorite = NOT favorite WHERE id = ? AND user_id = ?")
            .bind(item_id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("article {}", item_id)));
        }
        self.item_by_id(user_id, item_id).await
    }

    pub async fn toggle_read_later(&self, user_id: i64, item_id: i64) -> Result<ItemRow> {
        let res =
            sqlx::query("UPDATE items SET read_later = NOT read_later WHERE id = ? AND user_id = ?")
                .bind(item_id)
                .bind(user_id)
                .execute(self.pool())
                .await?;
        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("article {}", item_id)));
        }
        self.item_by_id(user_id, item_id).await
    }

    pub async fn set_translated_title(
        &self,
        user_id: i64,
        item_id: i64,
        translated: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE items SET translated_title = ? WHERE id = ? AND user_id = ?")
            .bind(translated)
            .bind(item_id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_summary(&self, user_id: i64, item_id: i64, summary: &str) -> Result<()> {
        sqlx::query("UPDATE items SET summary = ? WHERE id = ? AND user_id = ?")
            .bind(summary)
            .bind(item_id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn count_items(&self, user_id: i64) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(self.pool())
            .await?)
    }

    /// Approximate bytes of stored content for one user (title + body).
    pub async fn storage_bytes(&self, user_id: i64) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COALESCE(SUM(LENGTH(i.title) + LENGTH(COALESCE(c.body, ''))), 0) \
             FROM items i LEFT JOIN item_contents c ON c.item_id = i.id WHERE i.user_id = ?",
        )
        .bind(user_id)
        .fetch_one(self.pool())
        .await?)
    }

    /// Remove the oldest non-favorite, non-read-later items of one user
    /// until stored bytes drop to `target_bytes` or nothing removable is
    /// left. Returns the number of deleted items.
    pub async fn cleanup_to_target(&self, user_id: i64, target_bytes: i64) -> Result<u64> {
        let mut deleted = 0u64;
        loop {
            let used = self.storage_bytes(user_id).await?;
            if used <= target_bytes {
                break;
            }
            let res = sqlx::query(
                "DELETE FROM items WHERE id IN (\
                 SELECT id FROM items WHERE user_id = ? AND favorite = FALSE AND read_later = FALSE \
                 ORDER BY published_at ASC LIMIT 50)",
            )
            .bind(user_id)
            .execute(self.pool())
            .await?;
            if res.rows_affected() == 0 {
                break;
            }
            deleted += res.rows_affected();
        }
        Ok(deleted)
    }

    /// Retention sweep across all users: delete items older than
    /// `max_age_days` unless favorited or on read-later.
    pub async fn retention_sweep(&self, max_age_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(max_age_days);
        let res = sqlx::query(
            "DELETE FROM items WHERE published_at < ? AND favorite = FALSE AND read_later = FALSE",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected())
    }

    /// Storage sweep: drop the oldest content bodies (not the items) until
    /// the total cached size fits under `max_cache_size_mb`. Bodies of
    /// favorited or read-later items are pinned.
    pub async fn storage_sweep(&self, max_cache_size_mb: i64) -> Result<u64> {
        let cap_bytes = max_cache_size_mb * 1024 * 1024;
        let mut dropped = 0u64;
        loop {
            let used: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(LENGTH(COALESCE(body, ''))), 0) FROM item_contents",
            )
            .fetch_one(self.pool())
            .await?;
            if used <= cap_bytes {
                break;
            }
            let res = sqlx::query(
                "DELETE FROM item_contents WHERE item_id IN (\
                 SELECT c.item_id FROM item_contents c JOIN items i ON i.id = c.item_id \
                 WHERE i.favorite = FALSE AND i.read_later = FALSE \
                 ORDER BY c.fetched_at ASC LIMIT 50)",
            )
            .execute(self.pool())
            .await?;
            if res.rows_affected() == 0 {
                break;
            }
            dropped += res.rows_affected();
        }
        Ok(dropped)
    }

    // ---- content bodies ----

    pub async fn content_for(&self, user_id: i64, item_id: i64) -> Result<Option<ItemContentRow>> {
        // Ownership check rides along in the join.
        Ok(sqlx::query_as::<_, ItemContentRow>(
            "SELECT c.item_id, c.body, c.fetched_at FROM item_contents c \
             JOIN items i ON i.id = c.item_id WHERE c.item_id = ? AND i.user_id = ?",
        )
        .bind(item_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn upsert_content(&self, item_id: i64, body: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO item_contents (item_id, body, fetched_at) VALUES (?, ?, ?)",
        )
        .bind(item_id)
        .bind(body)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
