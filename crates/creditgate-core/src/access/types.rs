//! ============================================================================
//! Access Types - Premium tiers and access decisions
//! ============================================================================
//! Defines the premium tiers an operator can grant and the outcome of a
//! content request at the gate.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Canonical credit amounts an operator grant assigns per tier
pub const TIER_BRONZE_CREDITS: u64 = 50;
pub const TIER_SILVER_CREDITS: u64 = 100;
pub const TIER_GOLD_CREDITS: u64 = 200;

/// Premium tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Regular account - pays per request
    #[default]
    None,
    Bronze,
    Silver,
    Gold,
}

impl Tier {
    /// Balance an operator grant sets for this tier
    pub fn canonical_credits(&self) -> u64 {
        match self {
            Tier::None => 0,
            Tier::Bronze => TIER_BRONZE_CREDITS,
            Tier::Silver => TIER_SILVER_CREDITS,
            Tier::Gold => TIER_GOLD_CREDITS,
        }
    }

    /// Get the numeric rank for comparison
    fn rank(&self) -> u8 {
        match self {
            Tier::None => 0,
            Tier::Bronze => 1,
            Tier::Silver => 2,
            Tier::Gold => 3,
        }
    }

    /// Get human-readable tier name
    pub fn display_name(&self) -> &'static str {
        match self {
            Tier::None => "No Premium",
            Tier::Bronze => "Bronze",
            Tier::Silver => "Silver",
            Tier::Gold => "Gold",
        }
    }

    pub fn is_premium(&self) -> bool {
        *self != Tier::None
    }
}

impl PartialOrd for Tier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Tier::None),
            "bronze" => Ok(Tier::Bronze),
            "silver" => Ok(Tier::Silver),
            "gold" => Ok(Tier::Gold),
            other => Err(format!(
                "Unknown tier '{}'. Valid values: bronze, silver, gold",
                other
            )),
        }
    }
}

/// Subscription snapshot for a user-facing status reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub tier: Tier,
    pub active: bool,
    pub expires_at: Option<i64>,
    /// Whole days left before expiry, when an expiry is set and in the future
    pub days_left: Option<i64>,
    pub balance: u64,
}

/// Outcome of a content request at the gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AccessOutcome {
    /// Premium account served without a debit
    Premium { tier: Tier, delivered: usize },
    /// One credit debited and the content delivered
    Charged { balance: u64, delivered: usize },
    /// Balance already zero; the caller should show the top-up link
    Denied { verify_link: String },
    /// Delivery failed; any debit has been refunded
    DeliveryFailed { balance: u64, refunded: bool },
}
