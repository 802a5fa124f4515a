use anyhow::Context;
use sqlx::SqlitePool;

use crate::error::Result;

/// Ensure the required schema exists. Runs CREATE TABLE IF NOT EXISTS
/// statements for every table plus additive column migrations guarded by
/// pragma_table_info checks. Idempotent and safe to call at startup.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    tracing::info!("store: ensuring DB schema (CREATE TABLE IF NOT EXISTS ...)");

    let stmts = [
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            email TEXT,
            password_hash TEXT,
            role TEXT NOT NULL DEFAULT 'user',
            status TEXT NOT NULL DEFAULT 'pending',
            language TEXT,
            created_at TIMESTAMP DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            last_login TIMESTAMP
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS user_quotas (
            user_id INTEGER PRIMARY KEY,
            max_feeds INTEGER NOT NULL DEFAULT 100,
            max_articles INTEGER NOT NULL DEFAULT 50000,
            max_ai_tokens INTEGER NOT NULL DEFAULT 0,
            max_storage_mb INTEGER NOT NULL DEFAULT 500,
            max_concurrent_ai INTEGER NOT NULL DEFAULT 3,
            max_concurrent_feed_fetch INTEGER NOT NULL DEFAULT 5,
            max_concurrent_db_query INTEGER NOT NULL DEFAULT 8,
            max_concurrent_media_cache INTEGER NOT NULL DEFAULT 4,
            max_concurrent_discovery INTEGER NOT NULL DEFAULT 2,
            max_concurrent_translation INTEGER NOT NULL DEFAULT 3,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS user_settings (
            user_id INTEGER PRIMARY KEY,
            settings_json TEXT NOT NULL DEFAULT '{}',
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            url TEXT NOT NULL,
            title TEXT,
            category TEXT,
            position INTEGER DEFAULT 0,
            proxy_mode TEXT DEFAULT 'none',
            refresh_mode TEXT DEFAULT 'global',
            custom_interval_minutes INTEGER,
            last_updated TIMESTAMP,
            last_error TEXT,
            etag TEXT,
            last_modified TEXT,
            is_image_mode BOOLEAN DEFAULT FALSE,
            hide_from_timeline BOOLEAN DEFAULT FALSE,
            params_json TEXT,
            email_last_uid INTEGER DEFAULT 0,
            created_at TIMESTAMP DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE,
            UNIQUE(user_id, url)
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            source_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            url TEXT,
            media_urls_json TEXT,
            author TEXT,
            published_at TIMESTAMP NOT NULL,
            has_published_time BOOLEAN NOT NULL DEFAULT TRUE,
            unique_id TEXT NOT NULL,
            read BOOLEAN NOT NULL DEFAULT FALSE,
            favorite BOOLEAN NOT NULL DEFAULT FALSE,
            hidden BOOLEAN NOT NULL DEFAULT FALSE,
            read_later BOOLEAN NOT NULL DEFAULT FALSE,
            translated_title TEXT,
            summary TEXT,
            external_id TEXT,
            created_at TIMESTAMP DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE,
            FOREIGN KEY(source_id) REFERENCES sources(id) ON DELETE CASCADE,
            UNIQUE(user_id, unique_id)
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS item_contents (
            item_id INTEGER PRIMARY KEY,
            body TEXT,
            fetched_at TIMESTAMP,
            FOREIGN KEY(item_id) REFERENCES items(id) ON DELETE CASCADE
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS translation_cache (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            text_hash TEXT NOT NULL,
            target_lang TEXT NOT NULL,
            provider TEXT NOT NULL,
            translated_text TEXT NOT NULL,
            created_at TIMESTAMP DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            UNIQUE(text_hash, target_lang, provider)
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            item_id INTEGER NOT NULL,
            item_url TEXT,
            action TEXT NOT NULL,
            external_id TEXT,
            enqueued_at TIMESTAMP DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            attempts INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS ai_profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            api_key_enc TEXT,
            endpoint TEXT,
            model TEXT,
            custom_headers_json TEXT,
            is_default BOOLEAN NOT NULL DEFAULT FALSE,
            use_global_proxy BOOLEAN NOT NULL DEFAULT TRUE,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS usage_counters (
            user_id INTEGER PRIMARY KEY,
            ai_usage_tokens INTEGER NOT NULL DEFAULT 0,
            ai_usage_limit INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            refresh_token_hash TEXT NOT NULL,
            expires_at TIMESTAMP NOT NULL,
            created_at TIMESTAMP DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS app_meta (
            key TEXT PRIMARY KEY,
            value TEXT
        );
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_items_user_source ON items(user_id, source_id);
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_items_user_read ON items(user_id, read, hidden);
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_sync_queue_user ON sync_queue(user_id);
        "#,
    ];

    for s in &stmts {
        sqlx::query(s)
            .execute(pool)
            .await
            .with_context(|| "failed to ensure schema")?;
    }

    // Idempotent migrations for columns added after the initial schema.
    add_column_if_missing(pool, "sources", "email_last_uid", "INTEGER DEFAULT 0").await?;
    add_column_if_missing(pool, "items", "translated_title", "TEXT").await?;
    add_column_if_missing(pool, "items", "summary", "TEXT").await?;
    add_column_if_missing(pool, "sources", "custom_interval_minutes", "INTEGER").await?;

    tracing::info!("store: DB schema ensured");
    Ok(())
}

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<()> {
    let present = sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name='{}'",
        table, column
    ))
    .fetch_one(pool)
    .await
    .unwrap_or(0)
        > 0;

    if !present {
        tracing::info!("store: adding {}.{} column", table, column);
        sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
            .execute(pool)
            .await
            .with_context(|| format!("failed to add {}.{}", table, column))?;
    }
    Ok(())
}
