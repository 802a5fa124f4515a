use chrono::{DateTime, Utc};
use serde::Serialize;

use super::Store;
use crate::error::Result;

/// One queued outbound state change, retried until success or dead-letter.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SyncOpRow {
    pub id: i64,
    pub user_id: i64,
    pub item_id: i64,
    pub item_url: Option<String>,
    pub action: String,
    pub external_id: Option<String>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub attempts: i64,
}

impl Store {
    pub async fn enqueue_sync_op(
        &self,
        user_id: i64,
        item_id: i64,
        item_url: Option<&str>,
        action: &str,
        external_id: Option<&str>,
    ) -> Result<i64> {
        let res = sqlx::query(
            "INSERT INTO sync_queue (user_id, item_id, item_url, action, external_id, enqueued_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(item_id)
        .bind(item_url)
        .bind(action)
        .bind(external_id)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(res.last_insert_rowid())
    }

    /// Oldest-first batch for one drain pass.
    pub async fn pending_sync_ops(&self, user_id: i64, limit: i64) -> Result<Vec<SyncOpRow>> {
        Ok(sqlx::query_as::<_, SyncOpRow>(
            "SELECT id, user_id, item_id, item_url, action, external_id, enqueued_at, attempts \
             FROM sync_queue WHERE user_id = ? ORDER BY enqueued_at ASC, id ASC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?)
    }

    /// Users with at least one queued op.
    pub async fn users_with_sync_ops(&self) -> Result<Vec<i64>> {
        Ok(
            sqlx::query_scalar("SELECT DISTINCT user_id FROM sync_queue ORDER BY user_id")
                .fetch_all(self.pool())
                .await?,
        )
    }

    pub async fn delete_sync_op(&self, op_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(op_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Increment the attempt counter; returns the new value.
    pub async fn bump_sync_attempts(&self, op_id: i64) -> Result<i64> {
        sqlx::query("UPDATE sync_queue SET attempts = attempts + 1 WHERE id = ?")
            .bind(op_id)
            .execute(self.pool())
            .await?;
        Ok(
            sqlx::query_scalar("SELECT attempts FROM sync_queue WHERE id = ?")
                .bind(op_id)
                .fetch_optional(self.pool())
                .await?
                .unwrap_or(0),
        )
    }

    /// True while the item still has a queued outbound op, i.e. a local
    /// flag change the aggregator has not acknowledged yet.
    pub async fn has_pending_sync_op(&self, user_id: i64, item_id: i64) -> Result<bool> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_queue WHERE user_id = ? AND item_id = ?",
        )
        .bind(user_id)
        .bind(item_id)
        .fetch_one(self.pool())
        .await?;
        Ok(n > 0)
    }

    pub async fn count_sync_ops(&self, user_id: i64) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(self.pool())
                .await?,
        )
    }
}
