use chrono::{DateTime, Utc};
use common::QuotaDefaults;
use serde::Serialize;
use sqlx::Row;

use super::Store;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub role: String,
    pub status: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QuotaRow {
    pub user_id: i64,
    pub max_feeds: i64,
    pub max_articles: i64,
    pub max_ai_tokens: i64,
    pub max_storage_mb: i64,
    pub max_concurrent_ai: i64,
    pub max_concurrent_feed_fetch: i64,
    pub max_concurrent_db_query: i64,
    pub max_concurrent_media_cache: i64,
    pub max_concurrent_discovery: i64,
    pub max_concurrent_translation: i64,
}

const USER_COLS: &str = "id, username, email, password_hash, role, status, language";

impl Store {
    /// Create a user plus its quota, settings and usage rows. Registration
    /// creates `pending` users; admin seeding creates `active` ones.
    pub async fn create_user(
        &self,
        username: &str,
        email: Option<&str>,
        password_hash: &str,
        role: &str,
        status: &str,
        defaults: &QuotaDefaults,
    ) -> Result<i64> {
        let res = sqlx::query(
            "INSERT INTO users (username, email, password_hash, role, status, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(role)
        .bind(status)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
                Error::Conflict(format!("username '{}' is taken", username))
            }
            _ => Error::Db(e),
        })?;

        let user_id = res.last_insert_rowid();

        sqlx::query(
            "INSERT INTO user_quotas (user_id, max_feeds, max_articles, max_ai_tokens, max_storage_mb, \
             max_concurrent_ai, max_concurrent_feed_fetch, max_concurrent_db_query, \
             max_concurrent_media_cache, max_concurrent_discovery, max_concurrent_translation) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(defaults.max_feeds.unwrap_or(100))
        .bind(defaults.max_articles.unwrap_or(50_000))
        .bind(defaults.max_ai_tokens.unwrap_or(0))
        .bind(defaults.max_storage_mb.unwrap_or(500))
        .bind(defaults.max_concurrent_ai.unwrap_or(3))
        .bind(defaults.max_concurrent_feed_fetch.unwrap_or(5))
        .bind(defaults.max_concurrent_db_query.unwrap_or(8))
        .bind(defaults.max_concurrent_media_cache.unwrap_or(4))
        .bind(defaults.max_concurrent_discovery.unwrap_or(2))
        .bind(defaults.max_concurrent_translation.unwrap_or(3))
        .execute(self.pool())
        .await?;

        sqlx::query("INSERT INTO user_settings (user_id, settings_json) VALUES (?, '{}')")
            .bind(user_id)
            .execute(self.pool())
            .await?;

        sqlx::query("INSERT INTO usage_counters (user_id) VALUES (?)")
            .bind(user_id)
            .execute(self.pool())
            .await?;

        Ok(user_id)
    }

    pub async fn user_by_username(&self, username: &str) -> Result<UserRow> {
        sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE username = ?",
            USER_COLS
        ))
        .bind(username)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| Error::not_found(format!("user '{}'", username)))
    }

    pub async fn user_by_id(&self, user_id: i64) -> Result<UserRow> {
        sqlx::query_as::<_, UserRow>(&format!("SELECT {} FROM users WHERE id = ?", USER_COLS))
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::not_found(format!("user {}", user_id)))
    }

    pub async fn list_users(&self) -> Result<Vec<UserRow>> {
        Ok(sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users ORDER BY id",
            USER_COLS
        ))
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn pending_users(&self) -> Result<Vec<UserRow>> {
        Ok(sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE status = 'pending' ORDER BY id",
            USER_COLS
        ))
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn approve_user(&self, user_id: i64) -> Result<()> {
        let res = sqlx::query("UPDATE users SET status = 'active' WHERE id = ?")
            .bind(user_id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("user {}", user_id)));
        }
        Ok(())
    }

    /// Destroys the user and cascades to every owned row. The translation
    /// cache is process-owned and untouched.
    pub async fn delete_user(&self, user_id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("user {}", user_id)));
        }
        Ok(())
    }

    pub async fn touch_last_login(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ---- quotas ----

    pub async fn quota_for(&self, user_id: i64) -> Result<QuotaRow> {
        sqlx::query_as::<_, QuotaRow>("SELECT * FROM user_quotas WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::not_found(format!("quota for user {}", user_id)))
    }

    pub async fn update_quota(&self, user_id: i64, quota: &QuotaRow) -> Result<()> {
        let res = sqlx::query(
            "UPDATE user_quotas SET max_feeds = ?, max_articles = ?, max_ai_tokens = ?, \
             max_storage_mb = ?, max_concurrent_ai = ?, max_concurrent_feed_fetch = ?, \
             max_concurrent_db_query = ?, max_concurrent_media_cache = ?, \
             max_concurrent_discovery = ?, max_concurrent_translation = ? WHERE user_id = ?",
        )
        .bind(quota.max_feeds)
        .bind(quota.max_articles)
        .bind(quota.max_ai_tokens)
        .bind(quota.max_storage_mb)
        .bind(quota.max_concurrent_ai)
        .bind(quota.max_concurrent_feed_fetch)
        .bind(quota.max_concurrent_db_query)
        .bind(quota.max_concurrent_media_cache)
        .bind(quota.max_concurrent_discovery)
        .bind(quota.max_concurrent_translation)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("quota for user {}", user_id)));
        }
        Ok(())
    }

    // ---- settings ----

    pub async fn settings_for(&self, user_id: i64) -> Result<serde_json::Value> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT settings_json FROM user_settings WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(self.pool())
                .await?;
        let raw = raw.ok_or_else(|| Error::not_found(format!("settings for user {}", user_id)))?;
        Ok(serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({})))
    }

    /// Whole-object save; the client debounces, the server just overwrites.
    pub async fn save_settings(&self, user_id: i64, settings: &serde_json::Value) -> Result<()> {
        let raw = serde_json::to_string(settings)
            .map_err(|e| Error::InvalidInput(format!("settings not serializable: {}", e)))?;
        sqlx::query(
            "INSERT INTO user_settings (user_id, settings_json) VALUES (?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET settings_json = excluded.settings_json",
        )
        .bind(user_id)
        .bind(raw)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ---- usage counters ----

    /// Returns (tokens_used, per-user soft limit).
    pub async fn usage_for(&self, user_id: i64) -> Result<(i64, i64)> {
        let row = sqlx::query(
            "SELECT ai_usage_tokens, ai_usage_limit FROM usage_counters WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        match row {
            Some(r) => Ok((r.get("ai_usage_tokens"), r.get("ai_usage_limit"))),
            None => Ok((0, 0)),
        }
    }

    pub async fn add_usage(&self, user_id: i64, tokens: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_counters (user_id, ai_usage_tokens) VALUES (?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET ai_usage_tokens = ai_usage_tokens + excluded.ai_usage_tokens",
        )
        .bind(user_id)
        .bind(tokens)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn reset_usage(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE usage_counters SET ai_usage_tokens = 0 WHERE user_id = ?")
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_usage_limit(&self, user_id: i64, limit: i64) -> Result<()> {
        sqlx::query("UPDATE usage_counters SET ai_usage_limit = ? WHERE user_id = ?")
            .bind(limit)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ---- app meta ----

    pub async fn meta_get(&self, key: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT value FROM app_meta WHERE key = ?")
                .bind(key)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ---- refresh-token sessions ----

    pub async fn create_session(
        &self,
        user_id: i64,
        refresh_token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (user_id, refresh_token_hash, expires_at, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(refresh_token_hash)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Returns the owning user if the refresh token is known and unexpired.
    pub async fn session_user(&self, refresh_token_hash: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT user_id, expires_at FROM sessions WHERE refresh_token_hash = ?",
        )
        .bind(refresh_token_hash)
        .fetch_optional(self.pool())
        .await?;
        match row {
            Some(r) => {
                let expires: DateTime<Utc> = r.get("expires_at");
                if expires < Utc::now() {
                    Ok(None)
                } else {
                    Ok(Some(r.get("user_id")))
                }
            }
            None => Ok(None),
        }
    }

    pub async fn delete_session(&self, refresh_token_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE refresh_token_hash = ?")
            .bind(refresh_token_hash)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn delete_expired_sessions(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
            .bind(Utc::now())
            .execute(self.pool())
            .await?;
        Ok(res.rows_affected())
    }
}
