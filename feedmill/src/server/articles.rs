use rocket::{get, post, State};
use serde::Serialize;
use tracing::warn;

use super::auth::AuthUser;
use super::envelope::{ok, ApiResult};
use crate::error::Error;
use super::AppState;
use crate::httpclient;
use crate::sources::sanitize;
use crate::store::items::ItemFilter;
use crate::store::ItemRow;
use crate::sync::Action;

#[derive(Serialize)]
pub struct UnreadCount {
    pub feed_id: i64,
    pub count: i64,
}

#[derive(Serialize)]
pub struct ContentResponse {
    pub item_id: i64,
    pub body: Option<String>,
}

#[get("/api/articles?<filter>&<feed_id>&<category>&<limit>&<offset>")]
pub async fn list_articles(
    state: &State<AppState>,
    user: AuthUser,
    filter: Option<String>,
    feed_id: Option<i64>,
    category: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> ApiResult<Vec<ItemRow>> {
    let rows = state
        .store
        .list_items(
            user.user_id,
            &ItemFilter {
                filter,
                feed_id,
                category,
                limit,
                offset,
            },
        )
        .await?;
    Ok(ok(rows))
}

/// Set the read flag. Marking read clears read-later as a side effect (the
/// reverse toggle does not restore it). Sync to the aggregator happens in
/// the background and never fails the request.
#[post("/api/articles/read?<id>&<read>")]
pub async fn mark_read(
    state: &State<AppState>,
    user: AuthUser,
    id: i64,
    read: Option<bool>,
) -> ApiResult<ItemRow> {
    let read = read.unwrap_or(true);
    let item = state.store.set_read(user.user_id, id, read).await?;

    let action = if read { Action::MarkRead } else { Action::MarkUnread };
    spawn_sync(state, user.user_id, &item, action);
    Ok(ok(item))
}

#[post("/api/articles/favorite?<id>")]
pub async fn toggle_favorite(
    state: &State<AppState>,
    user: AuthUser,
    id: i64,
) -> ApiResult<ItemRow> {
    let item = state.store.toggle_favorite(user.user_id, id).await?;
    let action = if item.favorite {
        Action::MarkFavorite
    } else {
        Action::MarkUnfavorite
    };
    spawn_sync(state, user.user_id, &item, action);
    Ok(ok(item))
}

#[post("/api/articles/toggle-read-later?<id>")]
pub async fn toggle_read_later(
    state: &State<AppState>,
    user: AuthUser,
    id: i64,
) -> ApiResult<ItemRow> {
    let item = state.store.toggle_read_later(user.user_id, id).await?;
    Ok(ok(item))
}

#[get("/api/articles/unread-counts")]
pub async fn unread_counts(state: &State<AppState>, user: AuthUser) -> ApiResult<Vec<UnreadCount>> {
    let counts = state
        .store
        .unread_counts(user.user_id)
        .await?
        .into_iter()
        .map(|(feed_id, count)| UnreadCount { feed_id, count })
        .collect();
    Ok(ok(counts))
}

/// Full content, lazily materialized: the first read of an item without a
/// stored body fetches and sanitizes the article page.
#[get("/api/articles/<id>/content")]
pub async fn article_content(
    state: &State<AppState>,
    user: AuthUser,
    id: i64,
) -> ApiResult<ContentResponse> {
    let item = state.store.item_by_id(user.user_id, id).await?;

    if let Some(content) = state.store.content_for(user.user_id, id).await? {
        if content.body.as_deref().map(|b| !b.is_empty()).unwrap_or(false) {
            return Ok(ok(ContentResponse {
                item_id: id,
                body: content.body,
            }));
        }
    }

    let Some(url) = &item.url else {
        return Ok(ok(ContentResponse { item_id: id, body: None }));
    };

    let _permit = state
        .governor
        .acquire(user.user_id, crate::quota::Class::MediaCache)
        .await?;

    let client = httpclient::client(None, state.config.fetch().timeout_seconds())
        .map_err(Error::Internal)?;
    let body = match client.get(url).send().await {
        Ok(response) if response.status().is_success() => match response.text().await {
            Ok(raw) => Some(sanitize::clean_html(&raw)),
            Err(e) => {
                warn!("failed to read content body for item {}: {}", id, e);
                None
            }
        },
        Ok(response) => {
            warn!("content fetch for item {} returned {}", id, response.status());
            None
        }
        Err(e) => {
            warn!("content fetch for item {} failed: {}", id, e);
            None
        }
    };

    if let Some(body) = &body {
        state.store.upsert_content(id, body).await?;
    }
    Ok(ok(ContentResponse { item_id: id, body }))
}

fn spawn_sync(state: &State<AppState>, user_id: i64, item: &ItemRow, action: Action) {
    let sync = state.sync.clone();
    let item_id = item.id;
    let item_url = item.url.clone();
    let external_id = item.external_id.clone();
    tokio::spawn(async move {
        sync.push_flag_change(
            user_id,
            item_id,
            item_url.as_deref(),
            external_id.as_deref(),
            action,
        )
        .await;
    });
}
