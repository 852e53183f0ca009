//! ============================================================================
//! Subscription Manager - Premium tier state machine
//! ============================================================================
//! Tiers are granted by an operator with their canonical credit amount and an
//! optional expiry. A held tier is dropped as soon as the balance falls under
//! the premium floor or the expiry passes, whichever tier it was.
//! ============================================================================

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info};

use super::types::{SubscriptionStatus, Tier};
use crate::clock::Clock;
use crate::config::DAY_SECS;
use crate::db::LedgerStore;
use crate::types::{EngineError, EngineResult, UserAccount, UserId};

pub struct SubscriptionManager {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    premium_floor: u64,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, premium_floor: u64) -> Self {
        Self {
            store,
            clock,
            premium_floor,
        }
    }

    /// Operator grant: set `tier`, reset the balance to `credits` and
    /// optionally start an expiry clock.
    pub fn grant(
        &self,
        user_id: UserId,
        tier: Tier,
        credits: u64,
        duration: Option<Duration>,
    ) -> EngineResult<UserAccount> {
        if !tier.is_premium() {
            return Err(EngineError::InvalidGrant(
                "cannot grant the None tier, use revoke instead".to_string(),
            ));
        }
        if credits != tier.canonical_credits() {
            return Err(EngineError::InvalidGrant(format!(
                "{} requires exactly {} credits, got {}",
                tier,
                tier.canonical_credits(),
                credits
            )));
        }
        if let Some(duration) = duration {
            if duration <= Duration::zero() {
                return Err(EngineError::InvalidGrant("duration must be positive".to_string()));
            }
        }

        let now = self.clock.now();
        let expiry = duration.map(|d| now.saturating_add(d.num_seconds()));
        let account = self.store.update(user_id, now, &mut |account| {
            account.tier = tier;
            account.balance = credits;
            account.tier_expiry = expiry;
        })?;

        info!(
            "Granted {} to user {} ({} credits, expiry: {:?})",
            tier, user_id, credits, expiry
        );
        Ok(account)
    }

    /// Drop any held tier. Returns whether a tier was held.
    pub fn revoke(&self, user_id: UserId) -> EngineResult<bool> {
        if self.store.get(user_id)?.is_none() {
            return Ok(false);
        }

        let mut held = Tier::None;
        self.store.update(user_id, self.clock.now(), &mut |account| {
            held = account.tier;
            account.tier = Tier::None;
            account.tier_expiry = None;
        })?;

        if held.is_premium() {
            info!("Revoked {} from user {}", held, user_id);
        }
        Ok(held.is_premium())
    }

    /// Demote when the balance is under the floor or the expiry has passed.
    /// Returns whether a demotion happened.
    pub fn reevaluate(&self, user_id: UserId) -> EngineResult<bool> {
        if self.store.get(user_id)?.is_none() {
            return Ok(false);
        }

        let now = self.clock.now();
        let mut demoted = false;
        self.store.update(user_id, now, &mut |account| {
            demoted = self.reevaluate_in(account, now);
        })?;
        Ok(demoted)
    }

    /// Same check as `reevaluate`, on an account already held inside a
    /// ledger update.
    pub(crate) fn reevaluate_in(&self, account: &mut UserAccount, now: i64) -> bool {
        if !account.tier.is_premium() {
            return false;
        }

        let below_floor = account.balance < self.premium_floor;
        let expired = account.tier_expiry.map_or(false, |expiry| expiry <= now);
        if !(below_floor || expired) {
            return false;
        }

        info!(
            "Demoting user {} from {} (balance {}, expired: {})",
            account.id, account.tier, account.balance, expired
        );
        account.tier = Tier::None;
        account.tier_expiry = None;
        true
    }

    pub fn is_active(&self, user_id: UserId) -> EngineResult<bool> {
        let now = self.clock.now();
        Ok(self
            .store
            .get(user_id)?
            .map_or(false, |account| account.is_premium_active(now)))
    }

    pub fn status(&self, user_id: UserId) -> EngineResult<SubscriptionStatus> {
        let now = self.clock.now();
        let account = self.store.get_or_create(user_id, now)?;
        let days_left = account
            .tier_expiry
            .filter(|expiry| *expiry > now)
            .map(|expiry| (expiry - now) / DAY_SECS);

        Ok(SubscriptionStatus {
            tier: account.tier,
            active: account.is_premium_active(now),
            expires_at: account.tier_expiry,
            days_left,
            balance: account.balance,
        })
    }

    /// Re-evaluate every premium account. Returns the number demoted.
    pub fn sweep(&self) -> EngineResult<usize> {
        let premium: Vec<UserId> = self
            .store
            .list_accounts()?
            .into_iter()
            .filter(|account| account.tier.is_premium())
            .map(|account| account.id)
            .collect();

        let mut demoted = 0;
        for user_id in premium {
            if self.reevaluate(user_id)? {
                demoted += 1;
            }
        }

        debug!("Subscription sweep demoted {} accounts", demoted);
        Ok(demoted)
    }
}
