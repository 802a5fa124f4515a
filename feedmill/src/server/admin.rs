use rocket::serde::json::Json;
use rocket::{delete, get, post, put, State};
use serde::Deserialize;

use super::auth::{hash_password, AdminUser};
use super::envelope::{ok, ApiError, ApiResult};
use super::AppState;
use crate::error::Error;
use crate::store::{QuotaRow, UserRow};

#[derive(Deserialize)]
pub struct CreateUserBody {
    pub username: String,
    pub email: Option<String>,
    pub password: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "user".to_string()
}

#[derive(Deserialize)]
pub struct QuotaBody {
    pub max_feeds: Option<i64>,
    pub max_articles: Option<i64>,
    pub max_ai_tokens: Option<i64>,
    pub max_storage_mb: Option<i64>,
    pub max_concurrent_ai: Option<i64>,
    pub max_concurrent_feed_fetch: Option<i64>,
    pub max_concurrent_db_query: Option<i64>,
    pub max_concurrent_media_cache: Option<i64>,
    pub max_concurrent_discovery: Option<i64>,
    pub max_concurrent_translation: Option<i64>,
}

#[get("/api/admin/users")]
pub async fn list_users(state: &State<AppState>, _admin: AdminUser) -> ApiResult<Vec<UserRow>> {
    Ok(ok(state.store.list_users().await?))
}

/// Admin-created users are active immediately.
#[post("/api/admin/users", data = "<body>")]
pub async fn create_user(
    state: &State<AppState>,
    _admin: AdminUser,
    body: Json<CreateUserBody>,
) -> ApiResult<UserRow> {
    if !matches!(body.role.as_str(), "admin" | "user" | "template") {
        return Err(ApiError(Error::InvalidInput(format!(
            "unknown role '{}'",
            body.role
        ))));
    }
    let password_hash = hash_password(&body.password)?;
    let user_id = state
        .store
        .create_user(
            body.username.trim(),
            body.email.as_deref(),
            &password_hash,
            &body.role,
            "active",
            &state.config.quota_defaults(),
        )
        .await?;
    Ok(ok(state.store.user_by_id(user_id).await?))
}

#[get("/api/admin/pending-registrations")]
pub async fn pending_registrations(
    state: &State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Vec<UserRow>> {
    Ok(ok(state.store.pending_users().await?))
}

#[post("/api/admin/pending-registrations/<id>/approve")]
pub async fn approve_registration(
    state: &State<AppState>,
    _admin: AdminUser,
    id: i64,
) -> ApiResult<UserRow> {
    state.store.approve_user(id).await?;
    Ok(ok(state.store.user_by_id(id).await?))
}

/// Partial quota update: absent fields keep their current values. The
/// governor's cached semaphores are invalidated so new concurrency caps
/// apply on the next acquire.
#[put("/api/admin/users/<id>/quota", data = "<body>")]
pub async fn update_quota(
    state: &State<AppState>,
    _admin: AdminUser,
    id: i64,
    body: Json<QuotaBody>,
) -> ApiResult<QuotaRow> {
    let mut quota = state.store.quota_for(id).await?;
    let body = body.into_inner();
    if let Some(v) = body.max_feeds {
        quota.max_feeds = v;
    }
    if let Some(v) = body.max_articles {
        quota.max_articles = v;
    }
    if let Some(v) = body.max_ai_tokens {
        quota.max_ai_tokens = v;
    }
    if let Some(v) = body.max_storage_mb {
        quota.max_storage_mb = v;
    }
    if let Some(v) = body.max_concurrent_ai {
        quota.max_concurrent_ai = v;
    }
    if let Some(v) = body.max_concurrent_feed_fetch {
        quota.max_concurrent_feed_fetch = v;
    }
    if let Some(v) = body.max_concurrent_db_query {
        quota.max_concurrent_db_query = v;
    }
    if let Some(v) = body.max_concurrent_media_cache {
        quota.max_concurrent_media_cache = v;
    }
    if let Some(v) = body.max_concurrent_discovery {
        quota.max_concurrent_discovery = v;
    }
    if let Some(v) = body.max_concurrent_translation {
        quota.max_concurrent_translation = v;
    }
    state.store.update_quota(id, &quota).await?;
    state.governor.invalidate(id).await;
    Ok(ok(state.store.quota_for(id).await?))
}

/// Destroys the user; every owned row cascades. The shared translation
/// cache is untouched.
#[delete("/api/admin/users/<id>")]
pub async fn delete_user(
    state: &State<AppState>,
    admin: AdminUser,
    id: i64,
) -> ApiResult<serde_json::Value> {
    if admin.0.user_id == id {
        return Err(ApiError(Error::InvalidInput(
            "an admin cannot delete itself".into(),
        )));
    }
    state.store.delete_user(id).await?;
    Ok(ok(serde_json::json!({ "deleted": id })))
}
