//! ============================================================================
//! Database Types - Aggregates reported from the ledger
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Ledger-wide counters for the operator stats command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbStats {
    pub total_users: usize,
    /// Accounts whose tier is held and not expired
    pub premium_users: usize,
    pub total_credits: u64,
    pub total_verifications: usize,
}
