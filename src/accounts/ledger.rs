//! Rate-limit ledger: per-(account, model) limit state, consulted on every
//! selection and mutated when an account exhausts all endpoints with 429s.
//!
//! Operates on the `AccountStore` in place; callers pass the current time so
//! the ledger itself holds no clock.

use super::store::AccountStore;

/// Cooldown used when neither the response nor the store settings carry one.
pub const DEFAULT_COOLDOWN_MS: u64 = 10_000;

/// Result of `min_wait`: the shortest remaining reset and whose it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinWait {
    pub wait_ms: u64,
    /// Email of the account with the shortest wait, for logging only.
    pub email: Option<String>,
}

impl AccountStore {
    /// Every account is invalid or actively limited for `model`.
    /// Vacuously true for an empty list.
    pub fn all_rate_limited(&self, model: &str, now_ms: u64) -> bool {
        self.accounts
            .iter()
            .all(|a| a.is_invalid || a.has_active_limit(model, now_ms))
    }

    /// Accounts currently usable for `model`.
    pub fn available(&self, model: &str, now_ms: u64) -> Vec<&super::store::Account> {
        self.accounts
            .iter()
            .filter(|a| a.is_usable(model, now_ms))
            .collect()
    }

    /// Drop every expired limit record. Returns the number cleared.
    ///
    /// A cleared record cannot re-appear until the next 429 writes a new one.
    pub fn clear_expired(&mut self, now_ms: u64) -> usize {
        let mut cleared = 0;
        for account in &mut self.accounts {
            let before = account.model_rate_limits.len();
            account.model_rate_limits.retain(|_, limit| {
                !(limit.is_rate_limited && limit.reset_time.map(|t| t <= now_ms).unwrap_or(true))
            });
            cleared += before - account.model_rate_limits.len();
        }
        cleared
    }

    /// Clear every record regardless of expiry. Manual optimistic override.
    pub fn reset_all_limits(&mut self) {
        for account in &mut self.accounts {
            account.model_rate_limits.clear();
        }
    }

    /// Record a rate limit for (email, model). The reset instant is
    /// `now + reset_ms`, falling back to the store settings cooldown and
    /// then to `DEFAULT_COOLDOWN_MS`.
    pub fn mark_rate_limited(&mut self, email: &str, reset_ms: Option<u64>, model: &str, now_ms: u64) {
        let cooldown = reset_ms
            .or(self.settings.default_cooldown_ms)
            .unwrap_or(DEFAULT_COOLDOWN_MS);
        if let Some(account) = self.get_mut(email) {
            account.set_rate_limit(model, now_ms + cooldown);
            tracing::debug!(
                account = %email,
                model = %model,
                reset_ms = cooldown,
                "Account rate limited"
            );
        }
    }

    /// Flag an account as invalid (auth rejected). Sticky until re-auth or a
    /// successful refresh clears it.
    pub fn mark_invalid(&mut self, email: &str, reason: &str, now_ms: u64) {
        if let Some(account) = self.get_mut(email) {
            account.is_invalid = true;
            account.invalid_reason = Some(reason.to_string());
            account.invalid_since = Some(now_ms);
            tracing::warn!(account = %email, reason = %reason, "Account marked invalid");
        }
    }

    pub fn clear_invalid(&mut self, email: &str) {
        if let Some(account) = self.get_mut(email)
            && account.is_invalid
        {
            account.is_invalid = false;
            account.invalid_reason = None;
            account.invalid_since = None;
            tracing::info!(account = %email, "Account invalid flag cleared");
        }
    }

    /// Shortest wait until some account frees up for `model`.
    ///
    /// Zero when the pool is not fully limited; the default cooldown when it
    /// is but no positive reset exists (e.g. everything invalid).
    pub fn min_wait(&self, model: &str, now_ms: u64) -> MinWait {
        if !self.all_rate_limited(model, now_ms) {
            return MinWait {
                wait_ms: 0,
                email: None,
            };
        }

        let shortest = self
            .accounts
            .iter()
            .filter_map(|a| {
                let remaining = a.limit_remaining_ms(model, now_ms);
                (remaining > 0).then_some((remaining, a.email.as_str()))
            })
            .min_by_key(|(remaining, _)| *remaining);

        match shortest {
            Some((wait_ms, email)) => MinWait {
                wait_ms,
                email: Some(email.to_string()),
            },
            None => MinWait {
                wait_ms: DEFAULT_COOLDOWN_MS,
                email: None,
            },
        }
    }
}
