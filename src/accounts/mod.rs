pub mod ledger;
pub mod selector;
pub mod store;

pub use ledger::{DEFAULT_COOLDOWN_MS, MinWait};
pub use selector::StickyPick;
pub use store::{Account, AccountSource, AccountStore};

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::clock::Clock;

/// Persistence callback invoked with the serialized store after a mutation.
///
/// Always called outside the store lock; implementations are fire-and-forget
/// and must never block selection.
pub type SaveHook = Arc<dyn Fn(String) + Send + Sync>;

/// Save hook that writes the store to disk on a blocking task.
pub fn disk_save_hook(path: PathBuf) -> SaveHook {
    Arc::new(move |json: String| {
        let path = path.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(dir) = path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            if let Err(e) = std::fs::write(&path, json) {
                tracing::warn!(error = %e, path = %path.display(), "Failed to persist account store");
            }
        });
    })
}

/// No-op save hook for ephemeral pools.
#[cfg(test)]
pub fn noop_save_hook() -> SaveHook {
    Arc::new(|_| {})
}

/// Pool summary for the health endpoint.
#[derive(Debug, serde::Serialize)]
pub struct PoolSummary {
    pub total: usize,
    pub usable: usize,
    pub rate_limited: usize,
    pub invalid: usize,
    pub disabled: usize,
}

/// Shared handle over the account store.
///
/// One `RwLock` guards the whole pool; every critical section is free of
/// await points, so selector and ledger reads observe a consistent snapshot
/// and `mark_rate_limited` is atomic with respect to `all_rate_limited`.
pub struct AccountManager {
    store: RwLock<AccountStore>,
    save: SaveHook,
    clock: Arc<dyn Clock>,
    max_wait_ms: u64,
}

impl AccountManager {
    pub fn new(
        store: AccountStore,
        clock: Arc<dyn Clock>,
        save: SaveHook,
        max_wait_ms: u64,
    ) -> Self {
        Self {
            store: RwLock::new(store),
            save,
            clock,
            max_wait_ms,
        }
    }

    pub async fn account_count(&self) -> usize {
        self.store.read().await.accounts.len()
    }

    pub async fn pick_sticky(&self, model: &str) -> StickyPick {
        let now = self.clock.now_ms();
        let (pick, json) = {
            let mut store = self.store.write().await;
            let pick = store.pick_sticky(model, now, self.max_wait_ms);
            (pick, self.serialize(&store))
        };
        self.persist(json);
        pick
    }

    pub async fn pick_next(&self, model: &str) -> Option<Account> {
        let now = self.clock.now_ms();
        let (account, json) = {
            let mut store = self.store.write().await;
            let account = store.pick_next(model, now);
            (account, self.serialize(&store))
        };
        self.persist(json);
        account
    }

    pub async fn current_sticky(&self, model: &str) -> Option<Account> {
        let now = self.clock.now_ms();
        let (account, json) = {
            let mut store = self.store.write().await;
            let account = store.current_sticky(model, now);
            (account, self.serialize(&store))
        };
        self.persist(json);
        account
    }

    pub async fn all_rate_limited(&self, model: &str) -> bool {
        let now = self.clock.now_ms();
        self.store.read().await.all_rate_limited(model, now)
    }

    pub async fn min_wait(&self, model: &str) -> MinWait {
        let now = self.clock.now_ms();
        self.store.read().await.min_wait(model, now)
    }

    pub async fn clear_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let (cleared, json) = {
            let mut store = self.store.write().await;
            let cleared = store.clear_expired(now);
            (cleared, self.serialize(&store))
        };
        if cleared > 0 {
            self.persist(json);
        }
        cleared
    }

    pub async fn mark_rate_limited(&self, email: &str, reset_ms: Option<u64>, model: &str) {
        let now = self.clock.now_ms();
        let json = {
            let mut store = self.store.write().await;
            store.mark_rate_limited(email, reset_ms, model, now);
            self.serialize(&store)
        };
        self.persist(json);
    }

    pub async fn mark_invalid(&self, email: &str, reason: &str) {
        let now = self.clock.now_ms();
        let json = {
            let mut store = self.store.write().await;
            store.mark_invalid(email, reason, now);
            self.serialize(&store)
        };
        self.persist(json);
    }

    pub async fn clear_invalid(&self, email: &str) {
        let json = {
            let mut store = self.store.write().await;
            store.clear_invalid(email);
            self.serialize(&store)
        };
        self.persist(json);
    }

    /// Manual optimistic override: forget every rate-limit record.
    pub async fn reset_all_limits(&self) {
        let json = {
            let mut store = self.store.write().await;
            store.reset_all_limits();
            self.serialize(&store)
        };
        self.persist(json);
    }

    /// Replace the in-memory pool with a freshly loaded store.
    pub async fn replace(&self, new_store: AccountStore) {
        let mut store = self.store.write().await;
        *store = new_store;
        store.clamp_index();
    }

    pub async fn summary(&self, model: &str) -> PoolSummary {
        let now = self.clock.now_ms();
        let store = self.store.read().await;
        let mut summary = PoolSummary {
            total: store.accounts.len(),
            usable: store.available(model, now).len(),
            rate_limited: 0,
            invalid: 0,
            disabled: 0,
        };
        for account in &store.accounts {
            if account.is_invalid {
                summary.invalid += 1;
            } else if !account.enabled {
                summary.disabled += 1;
            } else if account.has_active_limit(model, now) {
                summary.rate_limited += 1;
            }
        }
        summary
    }

    fn serialize(&self, store: &AccountStore) -> Option<String> {
        serde_json::to_string_pretty(store).ok()
    }

    fn persist(&self, json: Option<String>) {
        if let Some(json) = json {
            (self.save)(json);
        }
    }
}
