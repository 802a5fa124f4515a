use serde::Serialize;

use super::Store;
use crate::error::{Error, Result};

/// Per-user bundle of provider credentials and model selection. The API key
/// is stored encrypted; decryption happens in the secrets module, never here.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AiProfileRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_key_enc: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub custom_headers_json: Option<String>,
    pub is_default: bool,
    pub use_global_proxy: bool,
}

const PROFILE_COLS: &str =
    "id, user_id, name, api_key_enc, endpoint, model, custom_headers_json, is_default, use_global_proxy";

impl Store {
    pub async fn create_ai_profile(
        &self,
        user_id: i64,
        name: &str,
        api_key_enc: Option<&str>,
        endpoint: Option<&str>,
        model: Option<&str>,
        custom_headers_json: Option<&str>,
        is_default: bool,
    ) -> Result<i64> {
        if is_default {
            sqlx::query("UPDATE ai_profiles SET is_default = FALSE WHERE user_id = ?")
                .bind(user_id)
                .execute(self.pool())
                .await?;
        }
        let res = sqlx::query(
            "INSERT INTO ai_profiles (user_id, name, api_key_enc, endpoint, model, \
             custom_headers_json, is_default) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(name)
        .bind(api_key_enc)
        .bind(endpoint)
        .bind(model)
        .bind(custom_headers_json)
        .bind(is_default)
        .execute(self.pool())
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn ai_profile_by_id(&self, user_id: i64, profile_id: i64) -> Result<AiProfileRow> {
        sqlx::query_as::<_, AiProfileRow>(&format!(
            "SELECT {} FROM ai_profiles WHERE id = ? AND user_id = ?",
            PROFILE_COLS
        ))
        .bind(profile_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| Error::not_found(format!("AI profile {}", profile_id)))
    }

    pub async fn default_ai_profile(&self, user_id: i64) -> Result<Option<AiProfileRow>> {
        Ok(sqlx::query_as::<_, AiProfileRow>(&format!(
            "SELECT {} FROM ai_profiles WHERE user_id = ? AND is_default = TRUE",
            PROFILE_COLS
        ))
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn list_ai_profiles(&self, user_id: i64) -> Result<Vec<AiProfileRow>> {
        Ok(sqlx::query_as::<_, AiProfileRow>(&format!(
            "SELECT {} FROM ai_profiles WHERE user_id = ? ORDER BY id",
            PROFILE_COLS
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn delete_ai_profile(&self, user_id: i64, profile_id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM ai_profiles WHERE id = ? AND user_id = ?")
            .bind(profile_id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("AI profile {}", profile_id)));
        }
        Ok(())
    }
}
