//! ============================================================================
//! Access Module - Premium tiers and credit-gated content
//! ============================================================================
//! Decides whether a user may consume content and what it costs.
//!
//! ## Tiers
//! - **None**: pays one credit per request
//! - **Bronze**: granted with 50 credits
//! - **Silver**: granted with 100 credits
//! - **Gold**: granted with 200 credits
//!
//! Any tier is lost when the balance drops under the premium floor (20) or
//! its expiry passes.
//!
//! ## Usage
//! ```rust,ignore
//! use creditgate_core::access::{AccessGate, AccessOutcome};
//!
//! match gate.serve(user_id, &items).await? {
//!     AccessOutcome::Denied { verify_link } => prompt_top_up(verify_link),
//!     outcome => tracing::info!("{:?}", outcome),
//! }
//! ```
//! ============================================================================

mod gate;
mod subscription;
mod types;

// Re-export public types
pub use gate::{AccessGate, Admission, CREDITS_PER_REQUEST};
pub use subscription::SubscriptionManager;
pub use types::{
    AccessOutcome, SubscriptionStatus, Tier, TIER_BRONZE_CREDITS, TIER_GOLD_CREDITS,
    TIER_SILVER_CREDITS,
};
