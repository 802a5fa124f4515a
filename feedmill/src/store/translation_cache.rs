use super::Store;
use crate::error::Result;

// The translation cache is process-owned and shared across tenants:
// identical text translated to the same language by the same provider is
// stored once. It is never user-scoped and survives user deletion.
impl Store {
    pub async fn translation_cache_get(
        &self,
        text_hash: &str,
        target_lang: &str,
        provider: &str,
    ) -> Result<Option<String>> {
        Ok(sqlx::query_scalar(
            "SELECT translated_text FROM translation_cache \
             WHERE text_hash = ? AND target_lang = ? AND provider = ?",
        )
        .bind(text_hash)
        .bind(target_lang)
        .bind(provider)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn translation_cache_put(
        &self,
        text_hash: &str,
        target_lang: &str,
        provider: &str,
        translated_text: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO translation_cache \
             (text_hash, target_lang, provider, translated_text) VALUES (?, ?, ?, ?)",
        )
        .bind(text_hash)
        .bind(target_lang)
        .bind(provider)
        .bind(translated_text)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn translation_cache_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM translation_cache")
            .fetch_one(self.pool())
            .await?)
    }
}
