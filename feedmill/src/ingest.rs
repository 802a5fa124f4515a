/*!
Deduplicating ingestion: normalizes adapter output into item rows, enforces
article/storage quotas, and fires post-write jobs (auto-translate and
auto-summary) onto the worker channel.
*/

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::settings::SettingsView;
use crate::sources::FetchedItem;
use crate::store::{NewItemRow, Store};

/// Batches above this size trigger the progressive storage check.
const LARGE_BATCH: usize = 10;

/// Post-write side-effect jobs, consumed by the translation worker pool.
#[derive(Debug, Clone)]
pub enum PostJob {
    TranslateTitle { user_id: i64, item_id: i64 },
    Summarize { user_id: i64, item_id: i64 },
}

/// Deterministic content address used for deduplication.
///
/// `hex(sha1(normalize(title) \x1f source_id \x1f date_or_empty))` where the
/// date portion is the YYYY-MM-DD of the published time when the source
/// supplied one, and empty otherwise. Compatible implementations must agree
/// byte-for-byte.
pub fn unique_id(title: &str, source_id: i64, published: Option<DateTime<Utc>>) -> String {
    let normalized = normalize_title(title);
    let date_part = published
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    let mut hasher = Sha1::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0x1f]);
    hasher.update(source_id.to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(date_part.as_bytes());
    hex::encode(hasher.finalize())
}

/// trim + lowercase + collapse internal whitespace runs to single spaces.
fn normalize_title(title: &str) -> String {
    title
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Clone)]
pub struct Ingestor {
    store: Store,
    jobs: Option<mpsc::UnboundedSender<PostJob>>,
}

impl Ingestor {
    pub fn new(store: Store, jobs: Option<mpsc::UnboundedSender<PostJob>>) -> Self {
        Ingestor { store, jobs }
    }

    /// Persist one source's batch. Items are inserted in the order the
    /// source returned them; dedup keeps the earliest insertion. Per-item
    /// failures never abort the batch.
    pub async fn ingest(
        &self,
        user_id: i64,
        source_id: i64,
        items: Vec<FetchedItem>,
    ) -> Result<Vec<i64>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        if items.len() > LARGE_BATCH {
            self.progressive_cleanup(user_id).await?;
        }

        let rows: Vec<NewItemRow> = items
            .into_iter()
            .filter(|item| !item.title.trim().is_empty())
            .map(|item| {
                let has_published_time = item.published_at.is_some();
                let uid = unique_id(&item.title, source_id, item.published_at);
                NewItemRow {
                    title: item.title,
                    url: item.url,
                    media_urls: item.media_urls,
                    author: item.author,
                    published_at: item.published_at.unwrap_or_else(Utc::now),
                    has_published_time,
                    unique_id: uid,
                    content: item.content,
                    external_id: item.external_id,
                }
            })
            .collect();

        let new_ids = self.store.insert_items(user_id, source_id, &rows).await?;
        if !new_ids.is_empty() {
            info!(
                "ingested {} new items for user {} source {}",
                new_ids.len(),
                user_id,
                source_id
            );
            self.fire_post_jobs(user_id, &new_ids).await;
        }
        Ok(new_ids)
    }

    /// Before a large batch: if the user sits within 10% of the storage
    /// cap, sweep oldest non-favorite, non-read-later items down to 80%.
    async fn progressive_cleanup(&self, user_id: i64) -> Result<()> {
        let quota = self.store.quota_for(user_id).await?;
        if quota.max_storage_mb == 0 {
            return Ok(());
        }
        let cap_bytes = quota.max_storage_mb * 1024 * 1024;
        let used = self.store.storage_bytes(user_id).await?;
        if used * 10 >= cap_bytes * 9 {
            let target = cap_bytes * 8 / 10;
            debug!(
                "user {} at {}B of {}B cap, cleaning down to {}B",
                user_id, used, cap_bytes, target
            );
            let removed = self.store.cleanup_to_target(user_id, target).await?;
            if removed > 0 {
                info!("progressive cleanup removed {} items for user {}", removed, user_id);
            }
        }
        Ok(())
    }

    async fn fire_post_jobs(&self, user_id: i64, item_ids: &[i64]) {
        let Some(jobs) = &self.jobs else { return };
        let settings = match self.store.settings_for(user_id).await {
            Ok(value) => SettingsView::new(value),
            Err(e) => {
                warn!("could not load settings for user {}: {}", user_id, e);
                return;
            }
        };

        for &item_id in item_ids {
            if settings.auto_translate() {
                let _ = jobs.send(PostJob::TranslateTitle { user_id, item_id });
            }
            if settings.auto_summary() {
                let _ = jobs.send(PostJob::Summarize { user_id, item_id });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn unique_id_is_stable_and_normalized() {
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let a = unique_id("Hello World", 3, Some(date));
        let b = unique_id("  hello   WORLD ", 3, Some(date));
        assert_eq!(a, b, "normalization must collapse case and whitespace");

        // Same title on a different calendar day is a different item.
        let next_day = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_ne!(a, unique_id("Hello World", 3, Some(next_day)));

        // Same title in a different source is a different item.
        assert_ne!(a, unique_id("Hello World", 4, Some(date)));

        // Different time on the same day collapses (date portion only).
        let same_day_later = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 59).unwrap();
        assert_eq!(a, unique_id("Hello World", 3, Some(same_day_later)));
    }

    #[test]
    fn unique_id_missing_published_time_uses_empty_date() {
        let a = unique_id("Hello", 1, None);
        let b = unique_id("Hello", 1, None);
        // Two imports on different wall-clock days still collide.
        assert_eq!(a, b);
        let dated = unique_id(
            "Hello",
            1,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        );
        assert_ne!(a, dated);
    }

    #[test]
    fn unique_id_matches_reference_digest() {
        // sha1("hello\x1f1\x1f2024-01-01") computed independently.
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id = unique_id("Hello", 1, Some(date));
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        let mut hasher = Sha1::new();
        hasher.update(b"hello\x1f1\x1f2024-01-01");
        assert_eq!(id, hex::encode(hasher.finalize()));
    }
}
