/*!
Rocket HTTP server: managed state, JSON envelope, bearer-token guards and
the route modules. The server does not migrate the database or spawn the
scheduler; that is process-startup work owned by main.
*/

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Header;
use rocket::{get, routes, Request, Response, State};
use std::sync::Arc;
use tokio::sync::watch;

use crate::fetcher::Fetcher;
use crate::quota::QuotaGovernor;
use crate::secrets::SecretBox;
use crate::store::Store;
use crate::sync::SyncLayer;
use crate::translate::TranslationOrchestrator;
use crate::usage::UsageTracker;

pub mod admin;
pub mod articles;
pub mod auth;
pub mod envelope;
pub mod feeds;
pub mod opml;
pub mod settings_api;
pub mod translate_api;

use envelope::{ok, ApiResult};

pub const DEFAULT_PORT: u16 = 1234;

/// Application state stored inside Rocket managed state.
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub config: Arc<common::Config>,
    pub store: Store,
    pub secrets: SecretBox,
    pub governor: QuotaGovernor,
    pub tracker: UsageTracker,
    pub orchestrator: Arc<TranslationOrchestrator>,
    pub fetcher: Fetcher,
    pub sync: SyncLayer,
    /// Cancellation handle propagated into background refreshes.
    pub cancel: watch::Receiver<bool>,
}

/// `Cache-Control: no-cache` on every API response; static assets (served
/// by a reverse proxy in production) keep long cache lifetimes.
pub struct NoCacheApi;

#[rocket::async_trait]
impl Fairing for NoCacheApi {
    fn info(&self) -> Info {
        Info {
            name: "api-cache-control",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        if req.uri().path().as_str().starts_with("/api/") {
            res.set_header(Header::new("Cache-Control", "no-cache"));
        }
    }
}

#[derive(serde::Serialize)]
pub struct VersionInfo {
    pub version: &'static str,
    pub uptime_seconds: i64,
}

#[get("/api/version")]
async fn version(state: &State<AppState>) -> ApiResult<VersionInfo> {
    Ok(ok(VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
    }))
}

/// Build the Rocket instance; split from launch so tests can drive it with
/// a local client.
pub fn build_rocket(state: AppState) -> rocket::Rocket<rocket::Build> {
    let server_cfg = state.config.server.clone();
    let mut fig = rocket::Config::figment()
        .merge(("port", server_cfg.as_ref().and_then(|s| s.port).unwrap_or(DEFAULT_PORT)))
        .merge(("limits.string", 10 * 1024 * 1024u32));
    if let Some(bind) = server_cfg.as_ref().and_then(|s| s.bind.clone()) {
        fig = fig.merge(("address", bind));
    }

    rocket::custom(fig)
        .manage(state)
        .attach(NoCacheApi)
        .mount(
            "/",
            routes![
                version,
                auth::register,
                auth::login,
                auth::refresh,
                auth::logout,
                auth::me,
                admin::list_users,
                admin::create_user,
                admin::pending_registrations,
                admin::approve_registration,
                admin::update_quota,
                admin::delete_user,
                feeds::list_feeds,
                feeds::create_feed,
                feeds::update_feed,
                feeds::delete_feed,
                feeds::refresh_feeds,
                articles::list_articles,
                articles::mark_read,
                articles::toggle_favorite,
                articles::toggle_read_later,
                articles::unread_counts,
                articles::article_content,
                translate_api::translate_text,
                translate_api::translate_article,
                translate_api::ai_usage,
                translate_api::reset_ai_usage,
                settings_api::get_settings,
                settings_api::save_settings,
                opml::import_opml,
                opml::export_opml,
            ],
        )
}

/// Launch the Rocket server; blocks until it shuts down.
pub async fn launch_rocket(state: AppState) -> Result<()> {
    tracing::info!("Starting Rocket HTTP server");
    build_rocket(state)
        .launch()
        .await
        .map_err(|e| anyhow!("Rocket failed: {}", e))?;
    tracing::info!("Rocket HTTP server has shut down");
    Ok(())
}
