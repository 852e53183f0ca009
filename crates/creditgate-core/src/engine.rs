//! ============================================================================
//! Credit Engine - Wiring of every component behind one handle
//! ============================================================================
//! Owns the process-scoped collaborators (ledger, transport, shortener, clock)
//! and hands them to the components it builds. Front ends (bot handlers, the
//! admin CLI) talk to this type only.
//! ============================================================================

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::access::{AccessGate, AccessOutcome, SubscriptionManager, SubscriptionStatus, Tier};
use crate::broadcast::{BroadcastDispatcher, BroadcastReport};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::db::{LedgerStore, RedbLedger};
use crate::rate_limit::{RateLimiter, RateLog};
use crate::shortener::{HttpShortener, PassthroughShortener, Shortener};
use crate::stats::StatsReporter;
use crate::token::{RedeemOutcome, TokenManager};
use crate::transport::{BotApiTransport, MessagingTransport, StartPayload, TransportError};
use crate::types::{BalanceChange, Content, EngineError, EngineResult, UserAccount, UserId};

/// Longest duration grant accepted, in days
pub const MAX_GRANT_DAYS: i64 = 3650;

/// Result of an operator-assisted top-up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TopUpOutcome {
    Credited { balance: u64 },
    /// The credit window is full; `remaining` credits could still be added
    RateLimited { remaining: u64, retry_at: Option<i64> },
}

/// Transport used when no bot token is configured
struct UnconfiguredTransport;

#[async_trait::async_trait]
impl MessagingTransport for UnconfiguredTransport {
    async fn send(&self, _recipient: UserId, _content: &Content) -> Result<(), TransportError> {
        Err(TransportError::Other("TG_BOT_TOKEN is not set".to_string()))
    }
}

pub struct CreditEngine {
    config: EngineConfig,
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    subscriptions: Arc<SubscriptionManager>,
    tokens: Arc<TokenManager>,
    gate: AccessGate,
    broadcaster: BroadcastDispatcher,
    stats: StatsReporter,
    top_up_limiter: RateLimiter,
}

impl CreditEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn LedgerStore>,
        transport: Arc<dyn MessagingTransport>,
        shortener: Arc<dyn Shortener>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let subscriptions = Arc::new(SubscriptionManager::new(
            store.clone(),
            clock.clone(),
            config.premium_floor,
        ));
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            clock.clone(),
            shortener,
            subscriptions.clone(),
            &config,
        ));
        let gate = AccessGate::new(
            store.clone(),
            clock.clone(),
            transport.clone(),
            subscriptions.clone(),
            tokens.clone(),
        );
        let broadcaster = BroadcastDispatcher::new(store.clone(), transport);
        let stats =
            StatsReporter::new(store.clone(), clock.clone(), config.stats_utc_offset_minutes)?;
        let top_up_limiter = RateLimiter::new(
            store.clone(),
            clock.clone(),
            config.top_up_limit,
            RateLog::TopUp,
        );

        Ok(Self {
            config,
            store,
            clock,
            subscriptions,
            tokens,
            gate,
            broadcaster,
            stats,
            top_up_limiter,
        })
    }

    /// Production wiring: redb ledger, bot API transport, HTTP shortener
    /// (each falling back when its settings are absent), system clock.
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        let store = RedbLedger::open(config.db_path.as_deref())?
            .with_starting_balance(config.start_credits);
        info!("Ledger opened at {}", store.path().display());

        let transport = transport_from_config(&config);
        let shortener = shortener_from_config(&config);
        Self::new(config, Arc::new(store), transport, shortener, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    pub fn stats(&self) -> &StatsReporter {
        &self.stats
    }

    // ------------------------------------------------------------------------
    // User-facing operations
    // ------------------------------------------------------------------------

    /// First-touch registration
    pub fn account(&self, user_id: UserId) -> EngineResult<UserAccount> {
        self.store.get_or_create(user_id, self.clock.now())
    }

    pub async fn verification_link(&self, user_id: UserId) -> EngineResult<String> {
        self.tokens.get_or_issue_link(user_id).await
    }

    pub fn redeem(&self, user_id: UserId, token: &str) -> EngineResult<RedeemOutcome> {
        self.tokens.redeem(user_id, token)
    }

    /// Handle a `/start` message: verification payloads are redeemed,
    /// anything else is left to the caller.
    pub fn handle_start(&self, user_id: UserId, text: &str) -> EngineResult<Option<RedeemOutcome>> {
        self.account(user_id)?;
        match StartPayload::parse(text) {
            StartPayload::Verify(token) => self.redeem(user_id, token).map(Some),
            StartPayload::Content(_) | StartPayload::Empty => Ok(None),
        }
    }

    pub async fn serve(&self, user_id: UserId, items: &[Content]) -> EngineResult<AccessOutcome> {
        self.gate.serve(user_id, items).await
    }

    pub fn subscription_status(&self, user_id: UserId) -> EngineResult<SubscriptionStatus> {
        self.subscriptions.status(user_id)
    }

    // ------------------------------------------------------------------------
    // Operator operations
    // ------------------------------------------------------------------------

    /// Unrestricted signed credit adjustment, clamped at zero, with the
    /// tier re-checked in the same ledger step.
    pub fn grant_credits(&self, user_id: UserId, delta: i64) -> EngineResult<BalanceChange> {
        let now = self.clock.now();
        let mut applied = 0;
        let account = self.store.update(user_id, now, &mut |account| {
            applied = account.apply_delta(delta);
            self.subscriptions.reevaluate_in(account, now);
        })?;

        info!(
            "Operator adjusted user {} by {} (applied {}, balance {})",
            user_id, delta, applied, account.balance
        );
        Ok(BalanceChange {
            balance: account.balance,
            applied,
        })
    }

    /// Assisted top-up, limited to the credit window of the top-up policy
    pub fn assisted_top_up(&self, user_id: UserId, amount: u64) -> EngineResult<TopUpOutcome> {
        let max = self.config.top_up_limit.max_weight;
        if amount == 0 || amount > max {
            return Err(EngineError::InvalidAmount(format!(
                "top-up must be between 1 and {} credits, got {}",
                max, amount
            )));
        }

        let now = self.clock.now();
        let mut outcome = TopUpOutcome::Credited { balance: 0 };
        self.store.update(user_id, now, &mut |account| {
            if !self.top_up_limiter.record_in(account, now, amount) {
                let policy = self.top_up_limiter.policy();
                outcome = TopUpOutcome::RateLimited {
                    remaining: policy.remaining(&account.top_up_log, now),
                    retry_at: policy.next_release_at(&account.top_up_log, now),
                };
                return;
            }
            account.apply_delta(amount as i64);
            self.subscriptions.reevaluate_in(account, now);
            outcome = TopUpOutcome::Credited {
                balance: account.balance,
            };
        })?;

        info!("Top-up of {} for user {}: {:?}", amount, user_id, outcome);
        Ok(outcome)
    }

    pub fn grant_tier(&self, user_id: UserId, tier: Tier, credits: u64) -> EngineResult<UserAccount> {
        self.subscriptions.grant(user_id, tier, credits, None)
    }

    /// `days` of premium at the tier's canonical credit amount
    pub fn grant_days(&self, user_id: UserId, tier: Tier, days: i64) -> EngineResult<UserAccount> {
        if !(1..=MAX_GRANT_DAYS).contains(&days) {
            return Err(EngineError::InvalidGrant(format!(
                "days must be between 1 and {}, got {}",
                MAX_GRANT_DAYS, days
            )));
        }
        self.subscriptions
            .grant(user_id, tier, tier.canonical_credits(), Some(Duration::days(days)))
    }

    pub fn revoke_tier(&self, user_id: UserId) -> EngineResult<bool> {
        self.subscriptions.revoke(user_id)
    }

    pub fn sweep_subscriptions(&self) -> EngineResult<usize> {
        self.subscriptions.sweep()
    }

    pub fn rotate_token(&self, user_id: UserId) -> EngineResult<String> {
        self.tokens.rotate(user_id)
    }

    pub async fn broadcast(&self, content: &Content) -> EngineResult<BroadcastReport> {
        self.broadcaster.run(content).await
    }
}

/// Bot API transport when a token is configured
pub fn transport_from_config(config: &EngineConfig) -> Arc<dyn MessagingTransport> {
    match &config.bot_token {
        Some(token) => Arc::new(BotApiTransport::new(token)),
        None => Arc::new(UnconfiguredTransport),
    }
}

/// HTTP shortener when both host and key are configured
pub fn shortener_from_config(config: &EngineConfig) -> Arc<dyn Shortener> {
    match (&config.shortlink_url, &config.shortlink_api_key) {
        (Some(site), Some(key)) => Arc::new(HttpShortener::new(site, key)),
        _ => Arc::new(PassthroughShortener),
    }
}
