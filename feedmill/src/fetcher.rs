/*!
Coordinates concurrent polling of a user's sources.

Concurrency is bounded twice: per-user by the governor's feed-fetch
semaphore and host-wide by a global semaphore sized from a startup
network-speed probe. Per-source failures are recorded on the source row and
never abort the batch.
*/

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ingest::Ingestor;
use crate::quota::{Class, QuotaGovernor};
use crate::secrets::SecretBox;
use crate::sources::{self, FetchContext};
use crate::store::{SourceRow, Store};
use crate::{httpclient, sync};

const INTELLIGENT_MIN: i64 = 10; // minutes
const INTELLIGENT_MAX: i64 = 24 * 60;
const INTELLIGENT_WINDOW: i64 = 30; // items

#[derive(Clone)]
pub struct Fetcher {
    store: Store,
    governor: QuotaGovernor,
    ingestor: Ingestor,
    secrets: SecretBox,
    fetch_cfg: common::FetchConfig,
    global_slots: Arc<Semaphore>,
    default_refresh_minutes: i64,
}

/// Probe the network once at startup and derive the host-wide concurrent
/// fetch cap from the observed latency.
pub async fn probe_fetch_slots(cfg: &common::FetchConfig) -> usize {
    let url = cfg
        .probe_url
        .clone()
        .unwrap_or_else(|| "https://www.google.com/generate_204".to_string());
    let timeout = cfg.probe_timeout_seconds.unwrap_or(15);

    let client = match httpclient::client(None, timeout) {
        Ok(c) => c,
        Err(_) => return 4,
    };
    let started = Instant::now();
    match client.get(&url).send().await {
        Ok(_) => {
            let elapsed = started.elapsed();
            let slots = if elapsed < Duration::from_secs(1) {
                16
            } else if elapsed < Duration::from_secs(3) {
                8
            } else {
                4
            };
            info!("network probe took {:?}; using {} fetch slots", elapsed, slots);
            slots
        }
        Err(e) => {
            warn!("network probe failed ({}), defaulting to 4 fetch slots", e);
            4
        }
    }
}

impl Fetcher {
    pub fn new(
        store: Store,
        governor: QuotaGovernor,
        ingestor: Ingestor,
        secrets: SecretBox,
        fetch_cfg: common::FetchConfig,
        global_slots: usize,
        default_refresh_minutes: i64,
    ) -> Self {
        Fetcher {
            store,
            governor,
            ingestor,
            secrets,
            fetch_cfg,
            global_slots: Arc::new(Semaphore::new(global_slots.max(1))),
            default_refresh_minutes,
        }
    }

    /// Poll one or all of the user's active sources concurrently; returns
    /// when every source has terminated. `only_due` applies the per-source
    /// refresh interval (scheduler passes true, manual refresh false).
    pub async fn refresh(
        &self,
        user_id: i64,
        source_ids: Option<&[i64]>,
        only_due: bool,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let all = self.store.active_sources(user_id).await?;
        let now = Utc::now();
        let mut targets: Vec<SourceRow> = Vec::new();
        for s in all {
            if let Some(ids) = source_ids {
                if !ids.contains(&s.id) {
                    continue;
                }
            }
            if only_due && !self.is_due(&s, now).await {
                continue;
            }
            targets.push(s);
        }

        if targets.is_empty() {
            return Ok(());
        }
        debug!("refreshing {} sources for user {}", targets.len(), user_id);

        let tasks = targets.into_iter().map(|source| {
            let fetcher = self.clone();
            let cancel = cancel.clone();
            async move {
                fetcher.refresh_one(user_id, source, cancel).await;
            }
        });
        join_all(tasks).await;
        Ok(())
    }

    /// Fetch + ingest one source. Errors land on the source row.
    async fn refresh_one(&self, user_id: i64, source: SourceRow, mut cancel: watch::Receiver<bool>) {
        // Backpressure: wait on the governor and the host cap before any
        // network I/O; an aborted wait holds nothing.
        let _user_permit = match self.governor.acquire(user_id, Class::FeedFetch).await {
            Ok(p) => p,
            Err(e) => {
                warn!("governor unavailable for user {}: {}", user_id, e);
                return;
            }
        };
        let _global_permit = match self.global_slots.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };

        if *cancel.borrow() {
            return;
        }

        let ctx = match self.context_for(user_id, &source).await {
            Ok(ctx) => ctx,
            Err(e) => {
                let _ = self
                    .store
                    .record_fetch_error(source.id, &e.to_string())
                    .await;
                return;
            }
        };

        let outcome = tokio::select! {
            outcome = sources::fetch(&ctx, &source) => outcome,
            _ = cancelled(&mut cancel) => {
                debug!("refresh of source {} cancelled", source.id);
                return;
            }
        };

        match outcome {
            Ok(outcome) => {
                if outcome.not_modified {
                    let _ = self
                        .store
                        .record_fetch_success(source.id, None, None, None)
                        .await;
                    return;
                }
                let feed_title = outcome.feed_title.clone();
                let etag = outcome.etag.clone();
                let last_modified = outcome.last_modified.clone();
                let last_uid = outcome.last_uid;
                let item_count = outcome.items.len();

                match self.ingestor.ingest(user_id, source.id, outcome.items).await {
                    Ok(new_ids) => {
                        debug!(
                            "source {}: {} fetched, {} new",
                            source.id, item_count, new_ids.len()
                        );
                        let _ = self
                            .store
                            .record_fetch_success(
                                source.id,
                                feed_title.as_deref(),
                                etag.as_deref(),
                                last_modified.as_deref(),
                            )
                            .await;
                        if let Some(uid) = last_uid {
                            let _ = self.store.set_email_last_uid(source.id, uid).await;
                        }
                    }
                    Err(e) => {
                        warn!("ingest failed for source {}: {}", source.id, e);
                        let _ = self
                            .store
                            .record_fetch_error(source.id, &e.to_string())
                            .await;
                    }
                }
            }
            Err(e) => {
                warn!("fetch failed for source {}: {}", source.id, e);
                let _ = self
                    .store
                    .record_fetch_error(source.id, &e.to_string())
                    .await;
            }
        }
    }

    async fn context_for(&self, user_id: i64, source: &SourceRow) -> Result<FetchContext> {
        let proxy = match source.proxy_mode.as_deref() {
            None | Some("none") | Some("") => None,
            Some("global") => self.fetch_cfg.global_proxy.clone(),
            // Any other value is a custom proxy URL for this source.
            Some(custom) => Some(custom.to_string()),
        };
        let aggregator = if source.kind == "external" {
            sync::aggregator_for(&self.store, &self.secrets, user_id).await?
        } else {
            None
        };
        Ok(FetchContext {
            timeout_secs: self.fetch_cfg.timeout_seconds(),
            scripts_root: self.fetch_cfg.scripts_root.as_ref().map(PathBuf::from),
            proxy,
            secrets: self.secrets.clone(),
            aggregator,
        })
    }

    /// Due when `now - last_updated >= effective_interval`; `never` sources
    /// are filtered out before this is called.
    async fn is_due(&self, source: &SourceRow, now: DateTime<Utc>) -> bool {
        let Some(last) = source.last_updated else {
            return true;
        };
        match self.effective_interval_minutes(source).await {
            Some(minutes) => now - last >= ChronoDuration::minutes(minutes),
            None => false,
        }
    }

    async fn effective_interval_minutes(&self, source: &SourceRow) -> Option<i64> {
        match source.refresh_mode.as_deref().unwrap_or("global") {
            "never" => None,
            "custom" => Some(
                source
                    .custom_interval_minutes
                    .unwrap_or(self.default_refresh_minutes),
            ),
            "intelligent" => Some(
                self.intelligent_interval_minutes(source.id)
                    .await
                    .unwrap_or(self.default_refresh_minutes),
            ),
            _ => Some(self.default_refresh_minutes),
        }
    }

    /// `clamp(avg spacing of the last 30 items * 0.5, 10 min, 24 h)`.
    pub async fn intelligent_interval_minutes(&self, source_id: i64) -> Result<i64> {
        let times = self
            .store
            .recent_item_times(source_id, INTELLIGENT_WINDOW)
            .await?;
        Ok(intelligent_from_times(&times, self.default_refresh_minutes))
    }
}

/// Resolves only when cancellation is actually signalled; a dropped sender
/// means cancellation can never arrive, not that it has.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Pure interval computation over newest-first publish times.
pub(crate) fn intelligent_from_times(times: &[DateTime<Utc>], default_minutes: i64) -> i64 {
    if times.len() < 2 {
        return default_minutes.clamp(INTELLIGENT_MIN, INTELLIGENT_MAX);
    }
    let newest = times[0];
    let oldest = *times.last().expect("non-empty");
    let span_minutes = (newest - oldest).num_minutes().max(0);
    let avg_spacing = span_minutes / (times.len() as i64 - 1);
    (avg_spacing / 2).clamp(INTELLIGENT_MIN, INTELLIGENT_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn intelligent_interval_clamps() {
        let base = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();

        // 30 items one hour apart: avg spacing 60 min, half = 30 min.
        let hourly: Vec<_> = (0..30)
            .map(|i| base - ChronoDuration::hours(i))
            .collect();
        assert_eq!(intelligent_from_times(&hourly, 10), 30);

        // Very dense feed clamps at the 10 minute floor.
        let dense: Vec<_> = (0..30)
            .map(|i| base - ChronoDuration::minutes(i))
            .collect();
        assert_eq!(intelligent_from_times(&dense, 10), INTELLIGENT_MIN);

        // Nearly-dead feed clamps at 24 h.
        let sparse: Vec<_> = (0..30)
            .map(|i| base - ChronoDuration::days(i * 7))
            .collect();
        assert_eq!(intelligent_from_times(&sparse, 10), INTELLIGENT_MAX);

        // Too little history falls back to the default.
        assert_eq!(intelligent_from_times(&[base], 25), 25);
    }
}
