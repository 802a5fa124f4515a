/*!
Bidirectional state sync with an external FreshRSS-compatible aggregator.

Outbound: flag changes are pushed immediately from the API path; a failed
push lands in the durable queue, drained on the scheduler cadence with
at-least-once semantics (ops retry until success or dead-letter at 10
attempts). Inbound: the scheduler periodically pulls the remote unread list
and reconciles it into the local store.
*/

use anyhow::Result as AnyResult;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::secrets::SecretBox;
use crate::settings::SettingsView;
use crate::sources::external::remote_to_item;
use crate::store::Store;

pub mod greader;

use greader::{AggregatorConfig, GReaderClient, STREAM_READING_LIST, TAG_READ, TAG_STARRED};

const MAX_ATTEMPTS: i64 = 10;
const DRAIN_BATCH: i64 = 100;
const INBOUND_LIMIT: u32 = 200;

/// Outbound state-change actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    MarkRead,
    MarkUnread,
    MarkFavorite,
    MarkUnfavorite,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::MarkRead => "mark_read",
            Action::MarkUnread => "mark_unread",
            Action::MarkFavorite => "mark_favorite",
            Action::MarkUnfavorite => "mark_unfavorite",
        }
    }

    /// The (add, remove) tag pair for the aggregator's edit-tag endpoint.
    fn tags(self) -> (Option<&'static str>, Option<&'static str>) {
        match self {
            Action::MarkRead => (Some(TAG_READ), None),
            Action::MarkUnread => (None, Some(TAG_READ)),
            Action::MarkFavorite => (Some(TAG_STARRED), None),
            Action::MarkUnfavorite => (None, Some(TAG_STARRED)),
        }
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> AnyResult<Self> {
        match s {
            "mark_read" => Ok(Action::MarkRead),
            "mark_unread" => Ok(Action::MarkUnread),
            "mark_favorite" => Ok(Action::MarkFavorite),
            "mark_unfavorite" => Ok(Action::MarkUnfavorite),
            other => anyhow::bail!("unknown sync action '{}'", other),
        }
    }
}

/// Resolve the user's aggregator connection from settings, decrypting the
/// stored password. Returns None when sync is disabled or unconfigured.
pub async fn aggregator_for(
    store: &Store,
    secrets: &SecretBox,
    user_id: i64,
) -> Result<Option<AggregatorConfig>> {
    let settings = SettingsView::new(store.settings_for(user_id).await?);
    if !settings.sync_enabled() {
        return Ok(None);
    }
    let (Some(endpoint), Some(username), Some(password_enc)) = (
        settings.sync_endpoint(),
        settings.sync_username(),
        settings.sync_password_enc(),
    ) else {
        return Ok(None);
    };
    let password = match secrets.decrypt(password_enc) {
        Ok(p) => p,
        Err(e) => {
            warn!("user {} sync password cannot be decrypted: {}", user_id, e);
            return Ok(None);
        }
    };
    Ok(Some(AggregatorConfig {
        endpoint: endpoint.to_string(),
        username: username.to_string(),
        password,
        proxy: settings.sync_proxy().map(str::to_string),
    }))
}

#[derive(Clone)]
pub struct SyncLayer {
    store: Store,
    secrets: SecretBox,
}

impl SyncLayer {
    pub fn new(store: Store, secrets: SecretBox) -> Self {
        SyncLayer { store, secrets }
    }

    /// Immediate path: push one flag change right away. On failure the op
    /// is queued for the deferred drain; this function never surfaces an
    /// error to the API caller.
    pub async fn push_flag_change(
        &self,
        user_id: i64,
        item_id: i64,
        item_url: Option<&str>,
        external_id: Option<&str>,
        action: Action,
    ) {
        let Some(external_id) = external_id else {
            // Items without a remote identity have nothing to sync.
            return;
        };
        let config = match aggregator_for(&self.store, &self.secrets, user_id).await {
            Ok(Some(config)) => config,
            Ok(None) => return,
            Err(e) => {
                warn!("sync config lookup failed for user {}: {}", user_id, e);
                return;
            }
        };

        let mut client = GReaderClient::new(config);
        let (add, remove) = action.tags();
        match client.edit_tag(external_id, add, remove).await {
            Ok(()) => {
                debug!("synced {} for item {} (user {})", action.as_str(), item_id, user_id);
            }
            Err(e) => {
                warn!(
                    "immediate sync of {} failed for item {} (user {}): {}; queueing",
                    action.as_str(),
                    item_id,
                    user_id,
                    e
                );
                if let Err(e) = self
                    .store
                    .enqueue_sync_op(user_id, item_id, item_url, action.as_str(), Some(external_id))
                    .await
                {
                    warn!("failed to enqueue sync op for item {}: {}", item_id, e);
                }
            }
        }
    }

    /// Deferred path: drain every user's queue once. Successes delete the
    /// op; failures bump the attempt counter; ops past the attempt cap are
    /// dead-lettered (dropped with a warning).
    pub async fn drain_outbound(&self) -> Result<()> {
        for user_id in self.store.users_with_sync_ops().await? {
            let Some(config) = aggregator_for(&self.store, &self.secrets, user_id).await? else {
                // Sync was disabled with ops still queued; drop them.
                let ops = self.store.pending_sync_ops(user_id, DRAIN_BATCH).await?;
                for op in ops {
                    self.store.delete_sync_op(op.id).await?;
                }
                continue;
            };
            let mut client = GReaderClient::new(config);

            let ops = self.store.pending_sync_ops(user_id, DRAIN_BATCH).await?;
            for op in ops {
                let Ok(action) = Action::from_str(&op.action) else {
                    warn!("dropping sync op {} with unknown action '{}'", op.id, op.action);
                    self.store.delete_sync_op(op.id).await?;
                    continue;
                };
                let Some(external_id) = op.external_id.as_deref() else {
                    self.store.delete_sync_op(op.id).await?;
                    continue;
                };
                let (add, remove) = action.tags();
                match client.edit_tag(external_id, add, remove).await {
                    Ok(()) => {
                        debug!("drained sync op {} ({})", op.id, op.action);
                        self.store.delete_sync_op(op.id).await?;
                    }
                    Err(e) => {
                        let attempts = self.store.bump_sync_attempts(op.id).await?;
                        if attempts > MAX_ATTEMPTS {
                            warn!(
                                "dead-lettering sync op {} for item {} after {} attempts: {}",
                                op.id, op.item_id, attempts, e
                            );
                            self.store.delete_sync_op(op.id).await?;
                        } else {
                            debug!("sync op {} failed (attempt {}): {}", op.id, attempts, e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Inbound reconciliation for one user: items present remotely but not
    /// locally are ingested; locally-untouched items that are read remotely
    /// are marked read. A queued outbound op marks an item as touched by
    /// the user since the last successful sync, and those items are left
    /// alone until the drain delivers the op.
    pub async fn pull_inbound(&self, user_id: i64, ingestor: &crate::ingest::Ingestor) -> Result<()> {
        let Some(config) = aggregator_for(&self.store, &self.secrets, user_id).await? else {
            return Ok(());
        };

        // The external source rows define which streams this user mirrors.
        let sources = self.store.list_sources(user_id).await?;
        let external: Vec<_> = sources.iter().filter(|s| s.kind == "external").collect();
        if external.is_empty() {
            return Ok(());
        }

        let mut client = GReaderClient::new(config);
        let remote_unread = client
            .stream_contents(STREAM_READING_LIST, true, INBOUND_LIMIT)
            .await
            .map_err(|e| crate::error::Error::ProviderUnreachable(e.to_string()))?;

        let target_source = external[0];
        let mut to_insert = Vec::new();
        let mut remote_unread_ids = std::collections::HashSet::new();
        for remote in &remote_unread {
            remote_unread_ids.insert(remote.id.clone());
            if self
                .store
                .item_by_external_id(user_id, &remote.id)
                .await?
                .is_none()
            {
                to_insert.push(remote_to_item(remote));
            }
        }
        if !to_insert.is_empty() {
            info!(
                "inbound sync: inserting {} remote items for user {}",
                to_insert.len(),
                user_id
            );
            match ingestor.ingest(user_id, target_source.id, to_insert).await {
                Ok(_) => {}
                Err(e) => warn!("inbound sync insert failed for user {}: {}", user_id, e),
            }
        }

        // Remote read-state wins only for items the user has not touched
        // locally: unread here + absent from the remote unread list means
        // it was read elsewhere.
        let unread_local = self
            .store
            .list_items(
                user_id,
                &crate::store::items::ItemFilter {
                    filter: Some("unread".to_string()),
                    feed_id: Some(target_source.id),
                    limit: Some(500),
                    ..Default::default()
                },
            )
            .await?;
        for item in unread_local {
            let Some(ext) = &item.external_id else { continue };
            if remote_unread_ids.contains(ext) {
                continue;
            }
            // An op still in the queue means the user changed this item's
            // flags and the aggregator has not seen it yet; the remote
            // unread list is stale for it. Local state wins.
            if self.store.has_pending_sync_op(user_id, item.id).await? {
                debug!(
                    "inbound sync: item {} has a queued outbound op, keeping local state",
                    item.id
                );
                continue;
            }
            debug!("inbound sync: marking item {} read (read remotely)", item.id);
            let _ = self.store.set_read(user_id, item.id, true).await;
        }

        Ok(())
    }
}
