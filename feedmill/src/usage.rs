/*!
AI usage accounting: token estimation plus persistent per-user counters.

The estimate is a heuristic, not a tokenizer: CJK characters cost about one
token per 1.5 characters, everything else about one per 4, plus a flat
system-prompt overhead.
*/

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::store::Store;

const SYSTEM_OVERHEAD_TOKENS: i64 = 10;

/// Estimate the token cost of a piece of text.
pub fn estimate_tokens(text: &str) -> i64 {
    let mut cjk = 0usize;
    let mut other = 0usize;
    for ch in text.chars() {
        if is_cjk(ch) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    let estimate = (cjk as f64 / 1.5) + (other as f64 / 4.0) + SYSTEM_OVERHEAD_TOKENS as f64;
    (estimate as i64).max(1)
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF      // CJK Unified Ideographs
        | 0x3400..=0x4DBF    // Extension A
        | 0x3040..=0x30FF    // Hiragana + Katakana
        | 0xAC00..=0xD7AF    // Hangul syllables
        | 0xF900..=0xFAFF    // Compatibility Ideographs
    )
}

#[derive(Clone)]
pub struct UsageTracker {
    store: Store,
    hard_limit: i64,
    // Accounting is write-through and serialized per process; the mutex
    // keeps read-modify-write pairs atomic across concurrent AI calls.
    write_lock: Arc<Mutex<()>>,
}

impl UsageTracker {
    pub fn new(store: Store, hard_limit: i64) -> Self {
        UsageTracker {
            store,
            hard_limit,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Effective limit is the minimum of the set, non-zero limits among the
    /// user's soft cap and the system hard cap; 0 means unlimited.
    pub async fn effective_limit(&self, user_id: i64) -> Result<i64> {
        let (_, user_limit) = self.store.usage_for(user_id).await?;
        let limits: Vec<i64> = [user_limit, self.hard_limit]
            .into_iter()
            .filter(|l| *l > 0)
            .collect();
        Ok(limits.into_iter().min().unwrap_or(0))
    }

    /// Checked before every AI call; the orchestrator degrades to the free
    /// provider when true.
    pub async fn is_limit_reached(&self, user_id: i64) -> Result<bool> {
        let limit = self.effective_limit(user_id).await?;
        if limit == 0 {
            return Ok(false);
        }
        let (used, _) = self.store.usage_for(user_id).await?;
        Ok(used >= limit)
    }

    pub async fn account(&self, user_id: i64, tokens: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.add_usage(user_id, tokens).await
    }

    pub async fn usage(&self, user_id: i64) -> Result<(i64, i64)> {
        let (used, _) = self.store.usage_for(user_id).await?;
        let limit = self.effective_limit(user_id).await?;
        Ok((used, limit))
    }

    pub async fn reset(&self, user_id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.reset_usage(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::open_test_store;

    #[test]
    fn estimate_counts_cjk_denser() {
        // 12 ASCII chars ≈ 3 tokens + overhead
        let ascii = estimate_tokens("hello worlds");
        // 12 CJK chars ≈ 8 tokens + overhead
        let cjk = estimate_tokens("你好世界你好世界你好世界");
        assert!(cjk > ascii);
        assert_eq!(estimate_tokens(""), 10); // overhead only
        assert!(estimate_tokens("a") >= 1);
    }

    #[tokio::test]
    async fn limit_logic_minimum_of_set_limits() {
        let store = open_test_store().await;
        let user_id = store
            .create_user("u", None, "x", "user", "active", &Default::default())
            .await
            .unwrap();

        // No limits set: unlimited.
        let tracker = UsageTracker::new(store.clone(), 0);
        assert!(!tracker.is_limit_reached(user_id).await.unwrap());

        // User soft limit applies.
        store.set_usage_limit(user_id, 100).await.unwrap();
        assert_eq!(tracker.effective_limit(user_id).await.unwrap(), 100);
        tracker.account(user_id, 99).await.unwrap();
        assert!(!tracker.is_limit_reached(user_id).await.unwrap());
        tracker.account(user_id, 1).await.unwrap();
        assert!(tracker.is_limit_reached(user_id).await.unwrap());

        // Hard limit lower than soft limit wins.
        let strict = UsageTracker::new(store.clone(), 50);
        assert_eq!(strict.effective_limit(user_id).await.unwrap(), 50);

        // Reset zeroes the counter.
        tracker.reset(user_id).await.unwrap();
        let (used, _) = tracker.usage(user_id).await.unwrap();
        assert_eq!(used, 0);
    }
}
