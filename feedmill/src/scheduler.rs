/*!
Process-wide background loop: periodic refresh of due sources, outbound
sync drain, inbound sync pull, retention and storage sweeps, session
expiry. Runs until the shutdown notifier fires; every cadence gets a small
random start jitter so ticks do not align across restarts.
*/

use rand::Rng;
use std::sync::Arc;
use tokio::select;
use tokio::sync::{watch, Notify};
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::fetcher::Fetcher;
use crate::ingest::Ingestor;
use crate::store::Store;
use crate::sync::SyncLayer;

pub struct Scheduler {
    store: Store,
    fetcher: Fetcher,
    sync: SyncLayer,
    ingestor: Ingestor,
    cfg: common::SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Store,
        fetcher: Fetcher,
        sync: SyncLayer,
        ingestor: Ingestor,
        cfg: common::SchedulerConfig,
    ) -> Self {
        Scheduler {
            store,
            fetcher,
            sync,
            ingestor,
            cfg,
        }
    }

    /// Main loop. Waits for the store's ready latch, runs one initial
    /// refresh pass, then ticks each task on its cadence.
    pub async fn run(self, shutdown: Arc<Notify>, cancel: watch::Receiver<bool>) {
        self.store.ready().await;
        info!("scheduler: store ready, running initial refresh pass");
        self.refresh_pass(&cancel, false).await;

        let minutes = |m: i64| Duration::from_secs((m.max(1) as u64) * 60);
        let mut next_refresh = jittered(minutes(self.cfg.refresh_minutes()));
        let mut next_outbound = jittered(minutes(self.cfg.sync_outbound_minutes()));
        let mut next_inbound = jittered(minutes(self.cfg.sync_inbound_minutes()));
        let mut next_retention = jittered(minutes(self.cfg.retention_sweep_minutes()));
        let mut next_storage = jittered(minutes(self.cfg.storage_sweep_minutes()));

        loop {
            let now = Instant::now();
            let next = [next_refresh, next_outbound, next_inbound, next_retention, next_storage]
                .into_iter()
                .min()
                .expect("non-empty");
            let sleep_for = next.saturating_duration_since(now);

            select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.notified() => {
                    info!("scheduler: shutdown requested, exiting loop");
                    break;
                }
            }

            let now = Instant::now();
            if now >= next_refresh {
                self.refresh_pass(&cancel, true).await;
                next_refresh = now + minutes(self.cfg.refresh_minutes());
            }
            if now >= next_outbound {
                if let Err(e) = self.sync.drain_outbound().await {
                    error!("scheduler: outbound sync drain failed: {}", e);
                }
                next_outbound = now + minutes(self.cfg.sync_outbound_minutes());
            }
            if now >= next_inbound {
                self.inbound_pass().await;
                next_inbound = now + minutes(self.cfg.sync_inbound_minutes());
            }
            if now >= next_retention {
                self.retention_pass().await;
                next_retention = now + minutes(self.cfg.retention_sweep_minutes());
            }
            if now >= next_storage {
                self.storage_pass().await;
                next_storage = now + minutes(self.cfg.storage_sweep_minutes());
            }
        }

        info!("scheduler: cleanup complete");
    }

    /// Refresh every user's due sources; per-user failures are logged and
    /// the pass continues.
    async fn refresh_pass(&self, cancel: &watch::Receiver<bool>, only_due: bool) {
        let user_ids = match self.store.user_ids_with_sources().await {
            Ok(ids) => ids,
            Err(e) => {
                error!("scheduler: could not enumerate users: {}", e);
                return;
            }
        };
        for user_id in user_ids {
            if *cancel.borrow() {
                return;
            }
            if let Err(e) = self
                .fetcher
                .refresh(user_id, None, only_due, cancel.clone())
                .await
            {
                warn!("scheduler: refresh failed for user {}: {}", user_id, e);
            }
        }
    }

    async fn inbound_pass(&self) {
        let user_ids = match self.store.user_ids_with_sources().await {
            Ok(ids) => ids,
            Err(e) => {
                error!("scheduler: could not enumerate users: {}", e);
                return;
            }
        };
        for user_id in user_ids {
            if let Err(e) = self.sync.pull_inbound(user_id, &self.ingestor).await {
                warn!("scheduler: inbound sync failed for user {}: {}", user_id, e);
            }
        }
    }

    async fn retention_pass(&self) {
        if let Some(max_age_days) = self.cfg.max_age_days {
            match self.store.retention_sweep(max_age_days).await {
                Ok(0) => {}
                Ok(n) => info!("scheduler: retention sweep removed {} items", n),
                Err(e) => error!("scheduler: retention sweep failed: {}", e),
            }
        }
        match self.store.delete_expired_sessions().await {
            Ok(0) => {}
            Ok(n) => info!("scheduler: expired {} sessions", n),
            Err(e) => error!("scheduler: session expiry failed: {}", e),
        }
    }

    async fn storage_pass(&self) {
        if let Some(cap) = self.cfg.max_cache_size_mb {
            match self.store.storage_sweep(cap).await {
                Ok(0) => {}
                Ok(n) => info!("scheduler: storage sweep dropped {} content bodies", n),
                Err(e) => error!("scheduler: storage sweep failed: {}", e),
            }
        }
    }
}

/// First firing lands somewhere inside the cadence window instead of
/// exactly one period out.
fn jittered(period: Duration) -> Instant {
    let jitter = rand::thread_rng().gen_range(0..=period.as_secs().max(1));
    Instant::now() + Duration::from_secs(jitter)
}
