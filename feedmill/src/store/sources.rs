use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use super::Store;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SourceRow {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub url: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub position: i64,
    pub proxy_mode: Option<String>,
    pub refresh_mode: Option<String>,
    pub custom_interval_minutes: Option<i64>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub is_image_mode: bool,
    pub hide_from_timeline: bool,
    pub params_json: Option<String>,
    pub email_last_uid: i64,
}

/// Fields accepted when creating or updating a source.
#[derive(Debug, Clone, Default)]
pub struct NewSource {
    pub kind: String,
    pub url: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub position: i64,
    pub proxy_mode: Option<String>,
    pub refresh_mode: Option<String>,
    pub custom_interval_minutes: Option<i64>,
    pub is_image_mode: bool,
    pub hide_from_timeline: bool,
    pub params_json: Option<String>,
}

const SOURCE_COLS: &str = "id, user_id, kind, url, title, category, position, proxy_mode, \
     refresh_mode, custom_interval_minutes, last_updated, last_error, etag, last_modified, \
     is_image_mode, hide_from_timeline, params_json, email_last_uid";

impl Store {
    /// Insert a source for the user, enforcing `max_feeds` and the
    /// per-user URL uniqueness invariant.
    pub async fn create_source(&self, user_id: i64, src: &NewSource) -> Result<i64> {
        let quota = self.quota_for(user_id).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(self.pool())
            .await?;
        if quota.max_feeds > 0 && count + 1 > quota.max_feeds {
            return Err(Error::QuotaExceeded { which: "feeds" });
        }

        let res = sqlx::query(
            "INSERT INTO sources (user_id, kind, url, title, category, position, proxy_mode, \
             refresh_mode, custom_interval_minutes, is_image_mode, hide_from_timeline, params_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&src.kind)
        .bind(&src.url)
        .bind(&src.title)
        .bind(&src.category)
        .bind(src.position)
        .bind(src.proxy_mode.as_deref().unwrap_or("none"))
        .bind(src.refresh_mode.as_deref().unwrap_or("global"))
        .bind(src.custom_interval_minutes)
        .bind(src.is_image_mode)
        .bind(src.hide_from_timeline)
        .bind(&src.params_json)
        .execute(self.pool())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
                Error::Conflict(format!("source url '{}' already subscribed", src.url))
            }
            _ => Error::Db(e),
        })?;

        Ok(res.last_insert_rowid())
    }

    pub async fn update_source(&self, user_id: i64, source_id: i64, src: &NewSource) -> Result<()> {
        let res = sqlx::query(
            "UPDATE sources SET kind = ?, url = ?, title = ?, category = ?, position = ?, \
             proxy_mode = ?, refresh_mode = ?, custom_interval_minutes = ?, is_image_mode = ?, \
             hide_from_timeline = ?, params_json = ? WHERE id = ? AND user_id = ?",
        )
        .bind(&src.kind)
        .bind(&src.url)
        .bind(&src.title)
        .bind(&src.category)
        .bind(src.position)
        .bind(src.proxy_mode.as_deref().unwrap_or("none"))
        .bind(src.refresh_mode.as_deref().unwrap_or("global"))
        .bind(src.custom_interval_minutes)
        .bind(src.is_image_mode)
        .bind(src.hide_from_timeline)
        .bind(&src.params_json)
        .bind(source_id)
        .bind(user_id)
        .execute(self.pool())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
                Error::Conflict(format!("source url '{}' already subscribed", src.url))
            }
            _ => Error::Db(e),
        })?;
        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("source {}", source_id)));
        }
        Ok(())
    }

    pub async fn delete_source(&self, user_id: i64, source_id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM sources WHERE id = ? AND user_id = ?")
            .bind(source_id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("source {}", source_id)));
        }
        Ok(())
    }

    pub async fn source_by_id(&self, user_id: i64, source_id: i64) -> Result<SourceRow> {
        sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {} FROM sources WHERE id = ? AND user_id = ?",
            SOURCE_COLS
        ))
        .bind(source_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| Error::not_found(format!("source {}", source_id)))
    }

    pub async fn list_sources(&self, user_id: i64) -> Result<Vec<SourceRow>> {
        Ok(sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {} FROM sources WHERE user_id = ? ORDER BY position, id",
            SOURCE_COLS
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// Sources eligible for polling (refresh_mode != 'never').
    pub async fn active_sources(&self, user_id: i64) -> Result<Vec<SourceRow>> {
        Ok(sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {} FROM sources WHERE user_id = ? AND COALESCE(refresh_mode, 'global') != 'never' \
             ORDER BY position, id",
            SOURCE_COLS
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// All user ids that own at least one source; drives the scheduler pass.
    pub async fn user_ids_with_sources(&self) -> Result<Vec<i64>> {
        Ok(
            sqlx::query_scalar("SELECT DISTINCT user_id FROM sources ORDER BY user_id")
                .fetch_all(self.pool())
                .await?,
        )
    }

    pub async fn record_fetch_success(
        &self,
        source_id: i64,
        feed_title: Option<&str>,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sources SET last_updated = ?, last_error = NULL, \
             title = COALESCE(title, ?), etag = COALESCE(?, etag), \
             last_modified = COALESCE(?, last_modified) WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(feed_title)
        .bind(etag)
        .bind(last_modified)
        .bind(source_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn record_fetch_error(&self, source_id: i64, err: &str) -> Result<()> {
        sqlx::query("UPDATE sources SET last_error = ?, last_updated = ? WHERE id = ?")
            .bind(err)
            .bind(Utc::now())
            .bind(source_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Advances the IMAP high-water mark; never moves backwards.
    pub async fn set_email_last_uid(&self, source_id: i64, uid: i64) -> Result<()> {
        sqlx::query("UPDATE sources SET email_last_uid = ? WHERE id = ? AND email_last_uid < ?")
            .bind(uid)
            .bind(source_id)
            .bind(uid)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Published times of the newest items of one source, newest first.
    /// Drives the intelligent refresh interval (spacing over last 30 items).
    pub async fn recent_item_times(
        &self,
        source_id: i64,
        limit: i64,
    ) -> Result<Vec<DateTime<Utc>>> {
        let rows = sqlx::query(
            "SELECT published_at FROM items WHERE source_id = ? ORDER BY published_at DESC LIMIT ?",
        )
        .bind(source_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(|r| r.get("published_at")).collect())
    }
}
