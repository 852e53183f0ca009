//! ============================================================================
//! Token Manager - Verification links and bonus-credit redemption
//! ============================================================================
//! Each account gets one opaque token, issued on first need and kept stable
//! until an operator rotates it. Opening the bot through the verification
//! deep link presents the token back; a match that passes the redemption
//! limiter credits the bonus. The token stays valid afterwards, so the rolling
//! limiter alone decides how often an account can earn.
//! ============================================================================

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::access::SubscriptionManager;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::db::LedgerStore;
use crate::rate_limit::{RateLimiter, RateLog};
use crate::shortener::{shorten_or_original, Shortener};
use crate::transport::StartPayload;
use crate::types::{EngineResult, UserId, VerificationRecord};

/// Random bytes per token (128 bits)
pub const TOKEN_BYTES: usize = 16;

/// Generate a fresh URL-safe token
pub fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `{base}?start=verify_{token}`
pub fn verification_link(deep_link_base: &str, token: &str) -> String {
    format!(
        "{}?start={}{}",
        deep_link_base,
        StartPayload::VERIFY_PREFIX,
        token
    )
}

/// Compare without short-circuiting on the first differing byte
fn tokens_match(stored: &str, provided: &str) -> bool {
    let (a, b) = (stored.as_bytes(), provided.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Result of presenting a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RedeemOutcome {
    Success { balance: u64, bonus: u64 },
    /// Token was right but the window is full; nothing changed
    RateLimited { retry_at: Option<i64> },
    /// Token did not match; nothing changed
    InvalidToken,
}

pub struct TokenManager {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    shortener: Arc<dyn Shortener>,
    subscriptions: Arc<SubscriptionManager>,
    limiter: RateLimiter,
    deep_link_base: String,
    bonus: u64,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        shortener: Arc<dyn Shortener>,
        subscriptions: Arc<SubscriptionManager>,
        config: &EngineConfig,
    ) -> Self {
        let limiter = RateLimiter::new(
            store.clone(),
            clock.clone(),
            config.verify_limit,
            RateLog::Redemption,
        );
        Self {
            store,
            clock,
            shortener,
            subscriptions,
            limiter,
            deep_link_base: config.deep_link_base(),
            bonus: config.verify_bonus,
        }
    }

    /// Current token, issuing one if the account has none
    pub fn token(&self, user_id: UserId) -> EngineResult<String> {
        if let Some(token) = self.store.get(user_id)?.and_then(|a| a.verify_token) {
            return Ok(token);
        }

        let mut issued = false;
        let account = self.store.update(user_id, self.clock.now(), &mut |account| {
            if account.verify_token.is_none() {
                account.verify_token = Some(generate_token());
                issued = true;
            }
        })?;

        if issued {
            info!("Issued verification token for user {}", user_id);
        }
        Ok(account.verify_token.unwrap_or_default())
    }

    /// Unshortened verification deep link
    pub fn raw_link(&self, user_id: UserId) -> EngineResult<String> {
        Ok(verification_link(&self.deep_link_base, &self.token(user_id)?))
    }

    /// Verification link passed through the shortener (falls back to the raw link)
    pub async fn get_or_issue_link(&self, user_id: UserId) -> EngineResult<String> {
        let link = self.raw_link(user_id)?;
        Ok(shorten_or_original(self.shortener.as_ref(), &link).await)
    }

    /// Present `provided` for `user_id`
    pub fn redeem(&self, user_id: UserId, provided: &str) -> EngineResult<RedeemOutcome> {
        let matches = self
            .store
            .get(user_id)?
            .and_then(|account| account.verify_token)
            .map_or(false, |stored| tokens_match(&stored, provided));
        if !matches {
            warn!("Invalid verification token from user {}", user_id);
            return Ok(RedeemOutcome::InvalidToken);
        }

        let now = self.clock.now();
        let bonus = self.bonus;
        let mut outcome = RedeemOutcome::InvalidToken;
        self.store.update(user_id, now, &mut |account| {
            // Re-check under the account lock: a rotation may have raced us
            let still_valid = account
                .verify_token
                .as_deref()
                .map_or(false, |stored| tokens_match(stored, provided));
            if !still_valid {
                outcome = RedeemOutcome::InvalidToken;
                return;
            }

            if !self.limiter.record_in(account, now, 1) {
                outcome = RedeemOutcome::RateLimited {
                    retry_at: self
                        .limiter
                        .policy()
                        .next_release_at(&account.redemption_log, now),
                };
                return;
            }

            account.apply_delta(bonus as i64);
            self.subscriptions.reevaluate_in(account, now);
            outcome = RedeemOutcome::Success {
                balance: account.balance,
                bonus,
            };
        })?;

        match &outcome {
            RedeemOutcome::Success { balance, .. } => {
                info!("User {} redeemed {} credits (balance {})", user_id, bonus, balance);
                let record = VerificationRecord {
                    user_id,
                    at: now,
                    credits: bonus,
                };
                // Stats only; the credit above is already committed
                if let Err(e) = self.store.append_verification(&record) {
                    error!("Failed to log verification for user {}: {}", user_id, e);
                }
            }
            RedeemOutcome::RateLimited { retry_at } => {
                debug!("Redemption for user {} rate limited until {:?}", user_id, retry_at);
            }
            RedeemOutcome::InvalidToken => {
                warn!("Token for user {} changed during redemption", user_id);
            }
        }
        Ok(outcome)
    }

    /// Replace the token; old links stop working
    pub fn rotate(&self, user_id: UserId) -> EngineResult<String> {
        let token = generate_token();
        let stored = token.clone();
        self.store.update(user_id, self.clock.now(), &mut |account| {
            account.verify_token = Some(stored.clone());
        })?;
        info!("Rotated verification token for user {}", user_id);
        Ok(token)
    }

    /// Redemptions still allowed in the current window
    pub fn remaining_redemptions(&self, user_id: UserId) -> EngineResult<u64> {
        self.limiter.remaining(user_id)
    }
}
