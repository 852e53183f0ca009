//! ============================================================================
//! CREDITGATE-CORE: Credit & Access Control Engine
//! ============================================================================
//! Backend logic for a credit-gated content bot:
//! - Per-user credit ledger on an embedded redb database
//! - Rolling-window rate limits on token redemptions and top-ups
//! - Verification tokens and shortened deep links that earn bonus credits
//! - Premium tiers with expiry and a balance floor
//! - Debit/deliver/refund access gate and the broadcast dispatcher
//! ============================================================================

pub mod access;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod rate_limit;
pub mod shortener;
pub mod stats;
pub mod token;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use types::*;
pub use access::{AccessGate, AccessOutcome, SubscriptionManager, SubscriptionStatus, Tier};
pub use broadcast::{BroadcastDispatcher, BroadcastReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use db::{LedgerStore, MemoryLedger, RedbLedger};
pub use engine::{CreditEngine, TopUpOutcome};
pub use token::{RedeemOutcome, TokenManager};
pub use transport::{BotApiTransport, MessagingTransport, TransportError};
