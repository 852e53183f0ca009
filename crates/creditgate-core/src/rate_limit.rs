//! ============================================================================
//! Rate Limiter - Rolling-window caps on redemptions and top-ups
//! ============================================================================
//! Each account carries an ordered log of timestamped entries per limiter.
//! A check prunes entries that left the window, compares the remaining weight
//! against the cap and appends `now` only when allowed. The whole sequence
//! runs inside one ledger `update`, so two concurrent requests for the same
//! account can never both pass.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::db::LedgerStore;
use crate::types::{EngineResult, RateEvent, UserAccount, UserId};

/// Upper bound on retained log entries per account
pub const MAX_LOG_ENTRIES: usize = 64;

/// What a limiter counts inside its window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitUnit {
    /// Every recorded call weighs 1
    Events,
    /// Every recorded call weighs its credit amount
    Credits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_weight: u64,
    pub window_secs: i64,
    pub unit: LimitUnit,
}

impl RateLimitPolicy {
    /// At most `max_events` recorded calls per window
    pub const fn events(max_events: u64, window_secs: i64) -> Self {
        Self {
            max_weight: max_events,
            window_secs,
            unit: LimitUnit::Events,
        }
    }

    /// At most `max_credits` credits recorded per window
    pub const fn credits(max_credits: u64, window_secs: i64) -> Self {
        Self {
            max_weight: max_credits,
            window_secs,
            unit: LimitUnit::Credits,
        }
    }

    fn weight_of(&self, amount: u64) -> u64 {
        match self.unit {
            LimitUnit::Events => 1,
            LimitUnit::Credits => amount,
        }
    }

    fn prune(&self, log: &mut Vec<RateEvent>, now: i64) {
        let cutoff = now - self.window_secs;
        log.retain(|event| event.at > cutoff);
    }

    /// Prune, check and append in one step. Returns whether the entry was
    /// recorded; on denial only expired entries are dropped.
    pub fn try_record(&self, log: &mut Vec<RateEvent>, now: i64, amount: u64) -> bool {
        self.prune(log, now);

        let used: u64 = log.iter().map(|event| event.weight).sum();
        let weight = self.weight_of(amount);
        if used.saturating_add(weight) > self.max_weight {
            return false;
        }

        log.push(RateEvent { at: now, weight });
        if log.len() > MAX_LOG_ENTRIES {
            let excess = log.len() - MAX_LOG_ENTRIES;
            log.drain(..excess);
        }
        true
    }

    /// Weight still available in the window
    pub fn remaining(&self, log: &[RateEvent], now: i64) -> u64 {
        let cutoff = now - self.window_secs;
        let used: u64 = log
            .iter()
            .filter(|event| event.at > cutoff)
            .map(|event| event.weight)
            .sum();
        self.max_weight.saturating_sub(used)
    }

    /// When the oldest in-window entry ages out, if any entry is in the window
    pub fn next_release_at(&self, log: &[RateEvent], now: i64) -> Option<i64> {
        let cutoff = now - self.window_secs;
        log.iter()
            .filter(|event| event.at > cutoff)
            .map(|event| event.at + self.window_secs)
            .min()
    }
}

/// Which per-account log a limiter instance owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLog {
    Redemption,
    TopUp,
}

impl RateLog {
    pub(crate) fn of(self, account: &UserAccount) -> &Vec<RateEvent> {
        match self {
            RateLog::Redemption => &account.redemption_log,
            RateLog::TopUp => &account.top_up_log,
        }
    }

    pub(crate) fn of_mut(self, account: &mut UserAccount) -> &mut Vec<RateEvent> {
        match self {
            RateLog::Redemption => &mut account.redemption_log,
            RateLog::TopUp => &mut account.top_up_log,
        }
    }
}

/// A limiter bound to one log field and one policy
pub struct RateLimiter {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    policy: RateLimitPolicy,
    log: RateLog,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        policy: RateLimitPolicy,
        log: RateLog,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            log,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Atomic check-and-append for `user_id`
    pub fn try_record(&self, user_id: UserId, amount: u64) -> EngineResult<bool> {
        let now = self.clock.now();
        let mut allowed = false;
        self.store.update(user_id, now, &mut |account| {
            allowed = self.record_in(account, now, amount);
        })?;
        debug!(
            "Rate limit {:?} for user {}: {}",
            self.log,
            user_id,
            if allowed { "recorded" } else { "denied" }
        );
        Ok(allowed)
    }

    /// Check-and-append against an account already held inside a ledger
    /// update. Lets callers fold the limiter into a larger atomic step.
    pub(crate) fn record_in(&self, account: &mut UserAccount, now: i64, amount: u64) -> bool {
        self.policy.try_record(self.log.of_mut(account), now, amount)
    }

    pub fn remaining(&self, user_id: UserId) -> EngineResult<u64> {
        let now = self.clock.now();
        Ok(match self.store.get(user_id)? {
            Some(account) => self.policy.remaining(self.log.of(&account), now),
            None => self.policy.max_weight,
        })
    }

    pub fn next_release_at(&self, user_id: UserId) -> EngineResult<Option<i64>> {
        let now = self.clock.now();
        Ok(self
            .store
            .get(user_id)?
            .and_then(|account| self.policy.next_release_at(self.log.of(&account), now)))
    }
}
