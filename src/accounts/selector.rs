//! Sticky-preference account selection.
//!
//! The account at `activeIndex` is preferred for every request to preserve
//! backend-side session affinity; rotation happens only when the sticky
//! account is unusable and another account is free. A short rate limit on
//! the sticky account with nothing else free is reported as a wait rather
//! than a rotation.

use super::store::{Account, AccountStore};

/// Outcome of a sticky selection.
///
/// `account` carries a snapshot (clone) of the selected account; writers
/// must re-look up by email. `wait_ms > 0` with no account tells the caller
/// to sleep and retry while keeping the sticky preference.
#[derive(Debug, Clone, Default)]
pub struct StickyPick {
    pub account: Option<Account>,
    pub wait_ms: u64,
}

impl AccountStore {
    /// Sticky selection for `model`:
    ///
    /// 1. the sticky account when usable;
    /// 2. else the next usable account (rotation);
    /// 3. else, when the sticky account frees up within `max_wait_ms`,
    ///    no account plus that wait;
    /// 4. else rotation's verdict (possibly nothing).
    pub fn pick_sticky(&mut self, model: &str, now_ms: u64, max_wait_ms: u64) -> StickyPick {
        if self.accounts.is_empty() {
            return StickyPick::default();
        }
        self.clamp_index();

        if self.accounts[self.active_index].is_usable(model, now_ms) {
            let account = &mut self.accounts[self.active_index];
            account.last_used = now_ms;
            return StickyPick {
                account: Some(account.clone()),
                wait_ms: 0,
            };
        }

        let other_usable = self
            .accounts
            .iter()
            .enumerate()
            .any(|(i, a)| i != self.active_index && a.is_usable(model, now_ms));
        if other_usable {
            return StickyPick {
                account: self.pick_next(model, now_ms),
                wait_ms: 0,
            };
        }

        let remaining = self.accounts[self.active_index].limit_remaining_ms(model, now_ms);
        if remaining > 0 && remaining <= max_wait_ms {
            tracing::debug!(
                account = %self.accounts[self.active_index].email,
                model = %model,
                wait_ms = remaining,
                "Sticky account rate limited briefly, waiting instead of rotating"
            );
            return StickyPick {
                account: None,
                wait_ms: remaining,
            };
        }

        StickyPick {
            account: self.pick_next(model, now_ms),
            wait_ms: 0,
        }
    }

    /// Rotate: clear expired limits, then scan from `activeIndex + 1`
    /// around the ring for the first usable account. Moves `activeIndex`
    /// and touches `lastUsed` on a hit.
    pub fn pick_next(&mut self, model: &str, now_ms: u64) -> Option<Account> {
        self.clear_expired(now_ms);

        let n = self.accounts.len();
        if n == 0 {
            return None;
        }

        for offset in 1..=n {
            let idx = (self.active_index + offset) % n;
            if self.accounts[idx].is_usable(model, now_ms) {
                self.active_index = idx;
                let account = &mut self.accounts[idx];
                account.last_used = now_ms;
                tracing::debug!(account = %account.email, model = %model, "Rotated to account");
                return Some(account.clone());
            }
        }
        None
    }

    /// The sticky account when usable for `model`, else nothing.
    pub fn current_sticky(&mut self, model: &str, now_ms: u64) -> Option<Account> {
        if self.accounts.is_empty() {
            return None;
        }
        self.clamp_index();

        let account = &mut self.accounts[self.active_index];
        if account.is_usable(model, now_ms) {
            account.last_used = now_ms;
            Some(account.clone())
        } else {
            None
        }
    }
}
