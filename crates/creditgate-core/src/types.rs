//! ============================================================================
//! Core Types for the Credit Engine
//! ============================================================================
//! Fixed-shape records for user accounts, rate-limit logs, verification
//! entries and the content the bot hands out. Everything here is persisted
//! through the ledger store or exchanged with the transport.
//! ============================================================================

use serde::{Deserialize, Serialize};

use crate::access::Tier;

/// Largest balance an account can hold, so applied deltas fit in an i64
pub const MAX_BALANCE: u64 = i64::MAX as u64;

/// Platform user identifier (stable, unique, may be negative for chats)
pub type UserId = i64;

/// One timestamped entry in a rolling-window log.
/// `weight` is 1 for event-counted limits and the credit amount for
/// credit-counted limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateEvent {
    pub at: i64,
    pub weight: u64,
}

/// Ledger record, one per distinct end-user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    /// Credit count, never negative
    pub balance: u64,
    pub tier: Tier,
    /// Unix seconds after which the tier no longer counts
    pub tier_expiry: Option<i64>,
    /// Opaque verification token, issued lazily
    pub verify_token: Option<String>,
    /// Successful token redemptions, oldest first
    pub redemption_log: Vec<RateEvent>,
    /// Operator-assisted top-ups, oldest first
    pub top_up_log: Vec<RateEvent>,
    pub registered_at: i64,
}

impl UserAccount {
    /// Fresh account with the configured starting balance
    pub fn new(id: UserId, starting_balance: u64, now: i64) -> Self {
        Self {
            id,
            balance: starting_balance,
            tier: Tier::None,
            tier_expiry: None,
            verify_token: None,
            redemption_log: Vec::new(),
            top_up_log: Vec::new(),
            registered_at: now,
        }
    }

    /// Premium is active when a tier is held and it has not expired
    pub fn is_premium_active(&self, now: i64) -> bool {
        self.tier != Tier::None && self.tier_expiry.map_or(true, |expiry| expiry > now)
    }

    /// Apply a signed delta, clamping at zero.
    /// Returns the delta that was actually applied.
    pub fn apply_delta(&mut self, delta: i64) -> i64 {
        let before = self.balance.min(MAX_BALANCE);
        let after = if delta >= 0 {
            before.saturating_add(delta as u64).min(MAX_BALANCE)
        } else {
            before.saturating_sub(delta.unsigned_abs())
        };
        self.balance = after;
        // Both sides are within 0..=i64::MAX
        after as i64 - before as i64
    }
}

/// Result of a balance adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub balance: u64,
    /// Delta after clamping (differs from the request when the floor was hit)
    pub applied: i64,
}

/// Verification log entry kept for operator statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub user_id: UserId,
    pub at: i64,
    pub credits: u64,
}

/// Content the transport can deliver to a recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Content {
    /// Plain text message
    Text { text: String },
    /// Copy of an existing message (e.g. a file stored in the database channel)
    Copy { from_chat: i64, message_id: i64 },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }
}

/// Engine-level failures. Recoverable user-visible conditions (rate limits,
/// wrong tokens, empty balance) are reported as outcomes instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
