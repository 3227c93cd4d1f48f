//! Persisted account pool: the account list, its per-model rate-limit
//! records, and the sticky `activeIndex`.
//!
//! The on-disk layout is `{accounts, settings, activeIndex}` (camelCase),
//! shared with the dashboard that manages the pool.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// How an access token is obtained for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AccountSource {
    /// OAuth refresh-token exchange against the Google token endpoint.
    #[default]
    Oauth,
    /// Statically configured API key.
    Manual,
    /// Token read out of a local Antigravity state file.
    LegacyDb,
}

/// Per-model rate limit record. Active iff `is_rate_limited` and
/// `reset_time` (epoch ms) is in the future.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRateLimit {
    #[serde(default)]
    pub is_rate_limited: bool,
    #[serde(default)]
    pub reset_time: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Unique key of the account.
    pub email: String,
    #[serde(default)]
    pub source: AccountSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    /// Explicit project override; discovered lazily when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sticky auth failure flag, cleared by a successful refresh.
    #[serde(default)]
    pub is_invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_since: Option<u64>,
    #[serde(default)]
    pub model_rate_limits: HashMap<String, ModelRateLimit>,
    /// Advisory, epoch ms.
    #[serde(default)]
    pub last_used: u64,
}

fn default_true() -> bool {
    true
}

impl Account {
    pub fn new(email: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            source: AccountSource::Oauth,
            refresh_token: Some(refresh_token.into()),
            api_key: None,
            db_path: None,
            project_id: None,
            enabled: true,
            is_invalid: false,
            invalid_reason: None,
            invalid_since: None,
            model_rate_limits: HashMap::new(),
            last_used: 0,
        }
    }

    /// Active rate limit for a model at `now_ms`?
    pub fn has_active_limit(&self, model: &str, now_ms: u64) -> bool {
        self.model_rate_limits
            .get(model)
            .map(|l| l.is_rate_limited && l.reset_time.map(|t| t > now_ms).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Remaining wait on an active limit, 0 when none.
    pub fn limit_remaining_ms(&self, model: &str, now_ms: u64) -> u64 {
        self.model_rate_limits
            .get(model)
            .filter(|l| l.is_rate_limited)
            .and_then(|l| l.reset_time)
            .map(|t| t.saturating_sub(now_ms))
            .unwrap_or(0)
    }

    /// Usable for a model: enabled, not invalid, no active limit.
    pub fn is_usable(&self, model: &str, now_ms: u64) -> bool {
        self.enabled && !self.is_invalid && !self.has_active_limit(model, now_ms)
    }

    pub fn set_rate_limit(&mut self, model: &str, reset_at_ms: u64) {
        self.model_rate_limits.insert(
            model.to_string(),
            ModelRateLimit {
                is_rate_limited: true,
                reset_time: Some(reset_at_ms),
            },
        );
    }

    pub fn clear_rate_limit(&mut self, model: &str) {
        self.model_rate_limits.remove(model);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSettings {
    /// Cooldown applied when a 429 carries no reset hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_cooldown_ms: Option<u64>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            default_cooldown_ms: None,
        }
    }
}

/// The persisted pool state. Selector and ledger operations live in
/// `selector.rs` / `ledger.rs`; this type owns load/save and membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStore {
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub settings: StoreSettings,
    #[serde(default)]
    pub active_index: usize,
}

impl AccountStore {
    /// Load the store from disk, clamping `activeIndex` and capping the
    /// account list at `max_accounts`. A missing file yields an empty store.
    pub fn load(path: &Path, max_accounts: usize) -> Result<Self> {
        if !path.exists() {
            return Ok(AccountStore::default());
        }

        let content = std::fs::read_to_string(path)?;
        let mut store: AccountStore = serde_json::from_str(&content)?;

        if store.accounts.len() > max_accounts {
            tracing::warn!(
                loaded = store.accounts.len(),
                max = max_accounts,
                "Too many accounts in store, ignoring extras"
            );
            store.accounts.truncate(max_accounts);
        }
        store.clamp_index();

        tracing::info!(
            count = store.accounts.len(),
            "Loaded accounts from {}",
            path.display()
        );
        Ok(store)
    }

    /// Write the store to disk (pretty JSON, parent dirs created).
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Keep `activeIndex` inside the list; out-of-range collapses to 0.
    pub fn clamp_index(&mut self) {
        if self.active_index >= self.accounts.len() {
            self.active_index = 0;
        }
    }

    pub fn get_mut(&mut self, email: &str) -> Option<&mut Account> {
        self.accounts.iter_mut().find(|a| a.email == email)
    }

    /// Add or refresh an account keyed by email.
    pub fn add_account(&mut self, account: Account) {
        if let Some(existing) = self.get_mut(&account.email) {
            existing.source = account.source;
            existing.refresh_token = account.refresh_token;
            existing.api_key = account.api_key;
            existing.db_path = account.db_path;
            existing.enabled = true;
            existing.is_invalid = false;
            existing.invalid_reason = None;
            existing.invalid_since = None;
            tracing::info!(email = %account.email, "Updated existing account");
        } else {
            tracing::info!(email = %account.email, "Added new account");
            self.accounts.push(account);
        }
    }

    pub fn remove_account(&mut self, email: &str) -> bool {
        let len_before = self.accounts.len();
        self.accounts.retain(|a| a.email != email);
        self.clamp_index();
        self.accounts.len() < len_before
    }
}
