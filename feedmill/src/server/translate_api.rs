use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde::{Deserialize, Serialize};

use super::auth::AuthUser;
use super::envelope::{ok, ApiResult};
use super::AppState;
use crate::ratelimit::Priority;
use crate::settings::SettingsView;
use crate::translate::{TranslateOutcome, TranslateRequest, DEFAULT_TARGET_LANG};

#[derive(Deserialize)]
pub struct TranslateTextBody {
    pub text: String,
    pub target_language: Option<String>,
    pub source_language: Option<String>,
    #[serde(default)]
    pub markdown: bool,
}

#[derive(Deserialize)]
pub struct TranslateArticleBody {
    pub article_id: i64,
}

#[derive(Serialize)]
pub struct ArticleTranslation {
    pub article_id: i64,
    pub title: TranslateOutcome,
}

#[derive(Serialize)]
pub struct UsageResponse {
    pub used: i64,
    pub limit: i64,
    pub limit_reached: bool,
}

async fn target_for(state: &AppState, user_id: i64, requested: Option<String>) -> String {
    if let Some(lang) = requested {
        return lang;
    }
    match state.store.settings_for(user_id).await {
        Ok(settings) => SettingsView::new(settings)
            .target_lang()
            .unwrap_or(DEFAULT_TARGET_LANG)
            .to_string(),
        Err(_) => DEFAULT_TARGET_LANG.to_string(),
    }
}

/// On-demand translation of arbitrary text. User-initiated, so it enters
/// the rate limiter at High priority.
#[post("/api/translate/text", data = "<body>")]
pub async fn translate_text(
    state: &State<AppState>,
    user: AuthUser,
    body: Json<TranslateTextBody>,
) -> ApiResult<TranslateOutcome> {
    let body = body.into_inner();
    let target_lang = target_for(state, user.user_id, body.target_language).await;
    let outcome = state
        .orchestrator
        .translate(
            user.user_id,
            &TranslateRequest {
                text: body.text,
                target_lang,
                source_lang: body.source_language,
                priority: Priority::High,
                markdown: body.markdown,
            },
        )
        .await?;
    Ok(ok(outcome))
}

/// Translate an article's title and persist the result on the item row.
#[post("/api/translate/article", data = "<body>")]
pub async fn translate_article(
    state: &State<AppState>,
    user: AuthUser,
    body: Json<TranslateArticleBody>,
) -> ApiResult<ArticleTranslation> {
    let item = state.store.item_by_id(user.user_id, body.article_id).await?;
    let target_lang = target_for(state, user.user_id, None).await;

    let outcome = state
        .orchestrator
        .translate(
            user.user_id,
            &TranslateRequest {
                text: item.title.clone(),
                target_lang,
                source_lang: None,
                priority: Priority::High,
                markdown: false,
            },
        )
        .await?;

    if !outcome.skipped {
        state
            .store
            .set_translated_title(user.user_id, item.id, &outcome.translated_text)
            .await?;
    }

    Ok(ok(ArticleTranslation {
        article_id: item.id,
        title: outcome,
    }))
}

#[get("/api/ai/usage")]
pub async fn ai_usage(state: &State<AppState>, user: AuthUser) -> ApiResult<UsageResponse> {
    let (used, limit) = state.tracker.usage(user.user_id).await?;
    let limit_reached = state.tracker.is_limit_reached(user.user_id).await?;
    Ok(ok(UsageResponse {
        used,
        limit,
        limit_reached,
    }))
}

#[post("/api/ai/usage/reset")]
pub async fn reset_ai_usage(state: &State<AppState>, user: AuthUser) -> ApiResult<UsageResponse> {
    state.tracker.reset(user.user_id).await?;
    let (used, limit) = state.tracker.usage(user.user_id).await?;
    Ok(ok(UsageResponse {
        used,
        limit,
        limit_reached: false,
    }))
}
