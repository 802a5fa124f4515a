use rocket::serde::json::Json;
use rocket::{delete, get, post, put, State};
use serde::Deserialize;

use super::auth::AuthUser;
use super::envelope::{ok, ApiResult};
use super::AppState;
use crate::error::Error;
use crate::store::{NewSource, SourceRow};

#[derive(Deserialize)]
pub struct FeedBody {
    #[serde(default = "default_kind")]
    pub kind: String,
    pub url: String,
    pub title: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub position: i64,
    pub proxy_mode: Option<String>,
    pub refresh_mode: Option<String>,
    pub custom_interval_minutes: Option<i64>,
    #[serde(default)]
    pub is_image_mode: bool,
    #[serde(default)]
    pub hide_from_timeline: bool,
    /// Kind-specific parameters (XPath selectors, IMAP account, script
    /// path, external stream id). Plaintext secrets inside are encrypted
    /// before they reach the store.
    pub params: Option<serde_json::Value>,
}

fn default_kind() -> String {
    "rss".to_string()
}

#[derive(Deserialize)]
pub struct RefreshBody {
    pub feed_ids: Option<Vec<i64>>,
}

impl FeedBody {
    fn into_new_source(mut self, state: &AppState) -> Result<NewSource, Error> {
        if self.url.trim().is_empty() {
            return Err(Error::InvalidInput("url is required".into()));
        }
        // Encrypt any plaintext IMAP password supplied by the client.
        if let Some(params) = self.params.as_mut() {
            if let Some(password) = params.get("password").and_then(|v| v.as_str()) {
                let enc = state
                    .secrets
                    .encrypt(password)
                    .map_err(Error::Internal)?;
                let obj = params.as_object_mut().expect("params object");
                obj.remove("password");
                obj.insert("password_enc".into(), serde_json::Value::String(enc));
            }
        }
        Ok(NewSource {
            kind: self.kind,
            url: self.url.trim().to_string(),
            title: self.title,
            category: self.category,
            position: self.position,
            proxy_mode: self.proxy_mode,
            refresh_mode: self.refresh_mode,
            custom_interval_minutes: self.custom_interval_minutes,
            is_image_mode: self.is_image_mode,
            hide_from_timeline: self.hide_from_timeline,
            params_json: self.params.map(|p| p.to_string()),
        })
    }
}

#[get("/api/feeds")]
pub async fn list_feeds(state: &State<AppState>, user: AuthUser) -> ApiResult<Vec<SourceRow>> {
    Ok(ok(state.store.list_sources(user.user_id).await?))
}

#[post("/api/feeds", data = "<body>")]
pub async fn create_feed(
    state: &State<AppState>,
    user: AuthUser,
    body: Json<FeedBody>,
) -> ApiResult<SourceRow> {
    let new_source = body.into_inner().into_new_source(state)?;
    let source_id = state.store.create_source(user.user_id, &new_source).await?;
    let row = state.store.source_by_id(user.user_id, source_id).await?;

    // Newly added sources get fetched right away in the background.
    let fetcher = state.fetcher.clone();
    let cancel = state.cancel.clone();
    let user_id = user.user_id;
    tokio::spawn(async move {
        if let Err(e) = fetcher.refresh(user_id, Some(&[source_id]), false, cancel).await {
            tracing::warn!("initial fetch of source {} failed: {}", source_id, e);
        }
    });

    Ok(ok(row))
}

#[put("/api/feeds/<id>", data = "<body>")]
pub async fn update_feed(
    state: &State<AppState>,
    user: AuthUser,
    id: i64,
    body: Json<FeedBody>,
) -> ApiResult<SourceRow> {
    let new_source = body.into_inner().into_new_source(state)?;
    state
        .store
        .update_source(user.user_id, id, &new_source)
        .await?;
    Ok(ok(state.store.source_by_id(user.user_id, id).await?))
}

#[delete("/api/feeds/<id>")]
pub async fn delete_feed(
    state: &State<AppState>,
    user: AuthUser,
    id: i64,
) -> ApiResult<serde_json::Value> {
    state.store.delete_source(user.user_id, id).await?;
    Ok(ok(serde_json::json!({ "deleted": id })))
}

/// Kick off a refresh of one, several or all of the caller's sources; the
/// work happens in the background and failures land on the source rows.
#[post("/api/feeds/refresh", data = "<body>")]
pub async fn refresh_feeds(
    state: &State<AppState>,
    user: AuthUser,
    body: Option<Json<RefreshBody>>,
) -> ApiResult<serde_json::Value> {
    let feed_ids = body.and_then(|b| b.into_inner().feed_ids);
    let fetcher = state.fetcher.clone();
    let cancel = state.cancel.clone();
    let user_id = user.user_id;
    tokio::spawn(async move {
        let ids = feed_ids.as_deref();
        if let Err(e) = fetcher.refresh(user_id, ids, false, cancel).await {
            tracing::warn!("manual refresh failed for user {}: {}", user_id, e);
        }
    });
    Ok(ok(serde_json::json!({ "refreshing": true })))
}
