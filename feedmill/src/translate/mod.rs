/*!
Translation and summarization orchestration.

Per request: language-detection short-circuit, two-level cache lookup
(process memory in front of the shared DB table), provider dispatch with a
fallback chain, AI rate limiting, echo post-check, then cache store and
usage accounting.
*/

use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ingest::PostJob;
use crate::quota::{Class, QuotaGovernor};
use crate::ratelimit::{AiRateLimiter, Priority};
use crate::secrets::SecretBox;
use crate::settings::{AiFeature, SettingsView};
use crate::store::{AiProfileRow, Store};
use crate::usage::{estimate_tokens, UsageTracker};

pub mod detect;
pub mod markdown;
pub mod providers;

use providers::ai::AiTranslator;
use providers::custom::{CustomConfig, CustomTranslator};
use providers::deepl::DeeplTranslator;
use providers::free::FreeTranslator;
use providers::Translator;

const DEFAULT_FREE_ENDPOINT: &str = "https://translate.googleapis.com/translate_a/single";
pub const DEFAULT_TARGET_LANG: &str = "en";

pub const REASON_ALREADY_TARGET: &str = "already_target_language";
pub const REASON_EQUALS_ORIGINAL: &str = "translation_equals_original";

#[derive(Debug, Clone)]
pub struct TranslateRequest {
    pub text: String,
    pub target_lang: String,
    pub source_lang: Option<String>,
    pub priority: Priority,
    pub markdown: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslateOutcome {
    pub translated_text: String,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub cached: bool,
    pub limit_reached: bool,
}

impl TranslateOutcome {
    fn skipped(text: String, reason: &'static str, limit_reached: bool) -> Self {
        TranslateOutcome {
            translated_text: text,
            skipped: true,
            reason: Some(reason),
            provider: None,
            cached: false,
            limit_reached,
        }
    }
}

type MemoryKey = (String, String, String); // (text hash, target lang, provider kind)

pub struct TranslationOrchestrator {
    store: Store,
    tracker: UsageTracker,
    limiter: AiRateLimiter,
    governor: QuotaGovernor,
    secrets: SecretBox,
    free_endpoint: String,
    global_proxy: Option<String>,
    memory_cache: Mutex<HashMap<MemoryKey, String>>,
}

impl TranslationOrchestrator {
    pub fn new(
        store: Store,
        tracker: UsageTracker,
        limiter: AiRateLimiter,
        governor: QuotaGovernor,
        secrets: SecretBox,
        free_endpoint: Option<String>,
        global_proxy: Option<String>,
    ) -> Self {
        TranslationOrchestrator {
            store,
            tracker,
            limiter,
            governor,
            secrets,
            free_endpoint: free_endpoint.unwrap_or_else(|| DEFAULT_FREE_ENDPOINT.to_string()),
            global_proxy,
            memory_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Run the full pipeline for one translation request.
    pub async fn translate(&self, user_id: i64, req: &TranslateRequest) -> Result<TranslateOutcome> {
        if req.text.trim().is_empty() {
            return Err(Error::InvalidInput("text is empty".into()));
        }

        let limit_reached = self.tracker.is_limit_reached(user_id).await?;

        // Pre-detection: already in the target language means no work.
        if detect::already_in_target(&req.text, &req.target_lang) {
            return Ok(TranslateOutcome::skipped(
                req.text.clone(),
                REASON_ALREADY_TARGET,
                limit_reached,
            ));
        }

        let _permit = self.governor.acquire(user_id, Class::Translation).await?;

        let chain = self.build_chain(user_id, limit_reached).await?;
        if chain.is_empty() {
            return Err(Error::ProviderUnreachable(
                "no translation provider configured".into(),
            ));
        }

        let text_hash = hash_text(&req.text);
        let mut last_err: Option<Error> = None;

        for provider in chain {
            // Cache lookup, memory first then the shared DB table.
            if let Some(hit) = self
                .cache_get(&text_hash, &req.target_lang, provider.kind())
                .await?
            {
                debug!("translation cache hit ({})", provider.kind());
                return Ok(TranslateOutcome {
                    translated_text: hit,
                    skipped: false,
                    reason: None,
                    provider: Some(provider.kind().to_string()),
                    cached: true,
                    limit_reached,
                });
            }

            if provider.is_ai() {
                self.limiter.acquire(req.priority).await?;
            }

            let result = if req.markdown {
                self.translate_markdown(provider.as_ref(), req).await
            } else {
                provider
                    .translate(&req.text, &req.target_lang, req.source_lang.as_deref())
                    .await
            };

            match result {
                Ok(translated) => {
                    if provider.is_ai() {
                        let tokens =
                            estimate_tokens(&req.text) + estimate_tokens(&translated);
                        self.tracker.account(user_id, tokens).await?;
                    }
                    // Post-translation echo check, a safety net for
                    // detection misses.
                    if translated.trim() == req.text.trim() {
                        return Ok(TranslateOutcome::skipped(
                            req.text.clone(),
                            REASON_EQUALS_ORIGINAL,
                            limit_reached,
                        ));
                    }
                    self.cache_put(&text_hash, &req.target_lang, provider.kind(), &translated)
                        .await?;
                    return Ok(TranslateOutcome {
                        translated_text: translated,
                        skipped: false,
                        reason: None,
                        provider: Some(provider.kind().to_string()),
                        cached: false,
                        limit_reached,
                    });
                }
                Err(e @ (Error::ProviderUnreachable(_) | Error::ProviderRejected(_))) => {
                    warn!("provider {} failed, falling back: {}", provider.kind(), e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::ProviderUnreachable("all providers failed".into())))
    }

    /// Structure-preserving mode: only the textual runs go to the provider.
    async fn translate_markdown(
        &self,
        provider: &dyn Translator,
        req: &TranslateRequest,
    ) -> Result<String> {
        let mut segments = markdown::segment(&req.text);
        for seg in &mut segments {
            if let markdown::Segment::Translate(run) = seg {
                let translated = provider
                    .translate(run, &req.target_lang, req.source_lang.as_deref())
                    .await?;
                *run = translated;
            }
        }
        Ok(markdown::reassemble(&segments))
    }

    /// Fallback order: bound/default AI profile, then the free public
    /// endpoint, then the commercial key, then the user's custom endpoint.
    /// At the usage limit the AI link is dropped and the free provider
    /// carries the load.
    async fn build_chain(
        &self,
        user_id: i64,
        limit_reached: bool,
    ) -> Result<Vec<Arc<dyn Translator>>> {
        let settings = SettingsView::new(self.store.settings_for(user_id).await?);
        let mut chain: Vec<Arc<dyn Translator>> = Vec::new();

        if !limit_reached {
            let profile = match settings.ai_profile_for(AiFeature::Translation) {
                Some(profile_id) => match self.store.ai_profile_by_id(user_id, profile_id).await {
                    Ok(p) => Some(p),
                    Err(Error::NotFound { .. }) => self.store.default_ai_profile(user_id).await?,
                    Err(e) => return Err(e),
                },
                None => self.store.default_ai_profile(user_id).await?,
            };
            if let Some(profile) = profile {
                match self.ai_from_profile(&profile) {
                    Ok(provider) => chain.push(Arc::new(provider)),
                    Err(e) => warn!("AI profile {} unusable: {}", profile.id, e),
                }
            }
        }

        chain.push(Arc::new(FreeTranslator::new(
            self.free_endpoint.clone(),
            self.global_proxy.clone(),
        )));

        if let Some(key_enc) = settings
            .raw()
            .get("translate")
            .and_then(|t| t.get("deepl_key_enc"))
            .and_then(|v| v.as_str())
        {
            match self.secrets.decrypt(key_enc) {
                Ok(key) => {
                    chain.push(Arc::new(DeeplTranslator::new(key, self.global_proxy.clone())))
                }
                Err(e) => warn!("deepl key for user {} cannot be decrypted: {}", user_id, e),
            }
        }

        if let Some(custom_raw) = settings.raw().get("translate").and_then(|t| t.get("custom")) {
            match serde_json::from_value::<CustomConfig>(custom_raw.clone()) {
                Ok(config) => chain.push(Arc::new(CustomTranslator::new(
                    config,
                    self.global_proxy.clone(),
                ))),
                Err(e) => warn!("custom translator config for user {} malformed: {}", user_id, e),
            }
        }

        Ok(chain)
    }

    fn ai_from_profile(&self, profile: &AiProfileRow) -> anyhow::Result<AiTranslator> {
        let endpoint = profile
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("profile has no endpoint"))?;
        let api_key = match &profile.api_key_enc {
            Some(enc) => Some(self.secrets.decrypt(enc)?),
            None => None,
        };
        let model = profile
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        let headers = profile
            .custom_headers_json
            .as_deref()
            .and_then(|raw| serde_json::from_str::<HashMap<String, String>>(raw).ok())
            .map(|map| map.into_iter().collect())
            .unwrap_or_default();
        let proxy = if profile.use_global_proxy {
            self.global_proxy.clone()
        } else {
            None
        };
        Ok(AiTranslator::new(endpoint, api_key, model, headers, proxy))
    }

    /// Summaries always go through the AI provider bound to the summary
    /// feature (no free fallback exists for summarization).
    pub async fn summarize(&self, user_id: i64, text: &str, priority: Priority) -> Result<String> {
        if self.tracker.is_limit_reached(user_id).await? {
            return Err(Error::QuotaExceeded { which: "ai_tokens" });
        }
        let settings = SettingsView::new(self.store.settings_for(user_id).await?);
        let profile = match settings.ai_profile_for(AiFeature::Summary) {
            Some(profile_id) => Some(self.store.ai_profile_by_id(user_id, profile_id).await?),
            None => self.store.default_ai_profile(user_id).await?,
        };
        let Some(profile) = profile else {
            return Err(Error::ProviderUnreachable("no AI profile for summaries".into()));
        };
        let provider = self
            .ai_from_profile(&profile)
            .map_err(|e| Error::ProviderUnreachable(e.to_string()))?;

        let _permit = self.governor.acquire(user_id, Class::Ai).await?;
        self.limiter.acquire(priority).await?;

        let system = "You are a news summarizer. Summarize the article in 2-3 sentences, \
                      in the article's own language. Output only the summary.";
        let summary = provider.complete(system, text).await?;
        let tokens = estimate_tokens(text) + estimate_tokens(&summary);
        self.tracker.account(user_id, tokens).await?;
        Ok(summary)
    }

    async fn cache_get(
        &self,
        text_hash: &str,
        target_lang: &str,
        provider: &str,
    ) -> Result<Option<String>> {
        let key = (
            text_hash.to_string(),
            target_lang.to_string(),
            provider.to_string(),
        );
        {
            let cache = self.memory_cache.lock().await;
            if let Some(hit) = cache.get(&key) {
                return Ok(Some(hit.clone()));
            }
        }
        let db_hit = self
            .store
            .translation_cache_get(text_hash, target_lang, provider)
            .await?;
        if let Some(hit) = &db_hit {
            self.memory_cache.lock().await.insert(key, hit.clone());
        }
        Ok(db_hit)
    }

    async fn cache_put(
        &self,
        text_hash: &str,
        target_lang: &str,
        provider: &str,
        translated: &str,
    ) -> Result<()> {
        self.store
            .translation_cache_put(text_hash, target_lang, provider, translated)
            .await?;
        self.memory_cache.lock().await.insert(
            (
                text_hash.to_string(),
                target_lang.to_string(),
                provider.to_string(),
            ),
            translated.to_string(),
        );
        Ok(())
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Consume post-write jobs from the ingestor. Worker count bounds the
/// background translation parallelism on top of the per-user governor.
pub fn spawn_worker_pool(
    orchestrator: Arc<TranslationOrchestrator>,
    store: Store,
    rx: mpsc::UnboundedReceiver<PostJob>,
    workers: usize,
) {
    let rx = Arc::new(Mutex::new(rx));
    for worker in 0..workers.max(1) {
        let orchestrator = orchestrator.clone();
        let store = store.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            loop {
                let job = { rx.lock().await.recv().await };
                let Some(job) = job else {
                    debug!("translation worker {} shutting down", worker);
                    break;
                };
                if let Err(e) = handle_job(&orchestrator, &store, job).await {
                    warn!("translation worker {}: job failed: {}", worker, e);
                }
            }
        });
    }
}

async fn handle_job(
    orchestrator: &TranslationOrchestrator,
    store: &Store,
    job: PostJob,
) -> Result<()> {
    match job {
        PostJob::TranslateTitle { user_id, item_id } => {
            let item = store.item_by_id(user_id, item_id).await?;
            if item.translated_title.is_some() {
                return Ok(());
            }
            let settings = SettingsView::new(store.settings_for(user_id).await?);
            let target = settings
                .target_lang()
                .unwrap_or(DEFAULT_TARGET_LANG)
                .to_string();
            let outcome = orchestrator
                .translate(
                    user_id,
                    &TranslateRequest {
                        text: item.title.clone(),
                        target_lang: target,
                        source_lang: None,
                        priority: Priority::Normal,
                        markdown: false,
                    },
                )
                .await?;
            if !outcome.skipped {
                store
                    .set_translated_title(user_id, item_id, &outcome.translated_text)
                    .await?;
                info!("auto-translated title of item {}", item_id);
            }
            Ok(())
        }
        PostJob::Summarize { user_id, item_id } => {
            let item = store.item_by_id(user_id, item_id).await?;
            if item.summary.is_some() {
                return Ok(());
            }
            let body = store
                .content_for(user_id, item_id)
                .await?
                .and_then(|c| c.body)
                .unwrap_or_else(|| item.title.clone());
            let summary = orchestrator
                .summarize(user_id, &body, Priority::Normal)
                .await?;
            store.set_summary(user_id, item_id, &summary).await?;
            info!("auto-summarized item {}", item_id);
            Ok(())
        }
    }
}
