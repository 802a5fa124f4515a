/*!
Durable storage over a single SQLite file.

Every public helper is user-scoped (takes a `user_id`) except the shared
translation cache and administrative counters. Row-level scoping is enforced
in each query; no helper returns rows from a foreign user.

Readers block on the `ready` latch until migrations have completed.
*/

use sqlx::SqlitePool;
use tokio::sync::watch;

pub mod ai_profiles;
pub mod items;
pub mod schema;
pub mod sources;
pub mod sync_queue;
pub mod translation_cache;
pub mod users;

pub use ai_profiles::AiProfileRow;
pub use items::{ItemContentRow, ItemRow, NewItemRow};
pub use sources::{NewSource, SourceRow};
pub use sync_queue::SyncOpRow;
pub use users::{QuotaRow, UserRow};

use crate::error::Result;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Store {
    /// Wrap an initialized pool. The store is not ready until `migrate` runs.
    pub fn new(pool: SqlitePool) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Store {
            pool,
            ready_tx,
            ready_rx,
        }
    }

    /// Run idempotent schema creation plus additive column migrations, then
    /// open the ready latch. Must be called exactly once at startup, before
    /// any other helper.
    pub async fn migrate(&self) -> Result<()> {
        schema::ensure_schema(&self.pool).await?;
        let _ = self.ready_tx.send(true);
        Ok(())
    }

    /// Wait until migrations have completed.
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::Store;

    /// File-backed test database under the OS temp dir; WAL mode needs a
    /// real file, and each pool connection must see the same database.
    pub async fn open_test_store() -> Store {
        let db_path = std::env::temp_dir().join(format!("feedmill_test_{}.sqlite", uuid::Uuid::new_v4()));
        let pool = common::init_db_pool(&db_path.to_string_lossy())
            .await
            .expect("init pool");
        let store = Store::new(pool);
        store.migrate().await.expect("migrate");
        store
    }
}
