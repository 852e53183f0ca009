// ============================================================================
// Ledger Store - per-user balances, tokens and rate logs
// ============================================================================
// Every mutation is one atomic get-or-create + modify + write step so that
// interleaved handlers for the same user can never lose an update.
// Default path: ~/.creditgate/ledger.redb (override via CREDITGATE_DB_PATH)
// ============================================================================

mod memory;
pub mod types;

pub use memory::MemoryLedger;
pub use types::DbStats;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::DEFAULT_START_CREDITS;
use crate::types::{
    BalanceChange, EngineError, EngineResult, UserAccount, UserId, VerificationRecord,
};

// Table definitions
const USERS: TableDefinition<i64, &[u8]> = TableDefinition::new("users");
const VERIFICATIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("verifications");

/// Storage contract consumed by every engine component.
///
/// Implementations must run `update` as a single critical section per call:
/// no other mutation of the same account may interleave between the read and
/// the write.
pub trait LedgerStore: Send + Sync {
    /// Fetch an account without creating it
    fn get(&self, user_id: UserId) -> EngineResult<Option<UserAccount>>;

    /// Atomically load (or create) the account, apply `apply`, persist it and
    /// return the stored result.
    fn update(
        &self,
        user_id: UserId,
        now: i64,
        apply: &mut dyn FnMut(&mut UserAccount),
    ) -> EngineResult<UserAccount>;

    fn list_user_ids(&self) -> EngineResult<Vec<UserId>>;

    fn list_accounts(&self) -> EngineResult<Vec<UserAccount>>;

    /// Permanently delete an account. Returns whether it existed.
    fn remove(&self, user_id: UserId) -> EngineResult<bool>;

    fn append_verification(&self, record: &VerificationRecord) -> EngineResult<()>;

    fn list_verifications(&self) -> EngineResult<Vec<VerificationRecord>>;

    /// Idempotent: accounts pruned by a broadcast are recreated on next touch
    fn get_or_create(&self, user_id: UserId, now: i64) -> EngineResult<UserAccount> {
        if let Some(account) = self.get(user_id)? {
            return Ok(account);
        }
        self.update(user_id, now, &mut |_| {})
    }

    /// Apply a signed delta, clamped at a floor of zero
    fn adjust_balance(&self, user_id: UserId, delta: i64, now: i64) -> EngineResult<BalanceChange> {
        let mut applied = 0;
        let account = self.update(user_id, now, &mut |account| {
            applied = account.apply_delta(delta);
        })?;
        Ok(BalanceChange {
            balance: account.balance,
            applied,
        })
    }

    fn stats(&self, now: i64) -> EngineResult<DbStats> {
        let accounts = self.list_accounts()?;
        let verifications = self.list_verifications()?;
        Ok(DbStats {
            total_users: accounts.len(),
            premium_users: accounts.iter().filter(|a| a.is_premium_active(now)).count(),
            total_credits: accounts
                .iter()
                .fold(0u64, |total, a| total.saturating_add(a.balance)),
            total_verifications: verifications.len(),
        })
    }
}

pub(crate) fn unavailable<E: Display>(context: &'static str) -> impl Fn(E) -> EngineError {
    move |e| EngineError::StoreUnavailable(format!("{}: {}", context, e))
}

fn encode<T: serde::Serialize>(value: &T) -> EngineResult<Vec<u8>> {
    bincode::serialize(value).map_err(unavailable("Failed to serialize record"))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> EngineResult<T> {
    bincode::deserialize(bytes).map_err(unavailable("Failed to deserialize record"))
}

/// Embedded ledger backed by redb
pub struct RedbLedger {
    db: Database,
    path: PathBuf,
    starting_balance: u64,
}

impl RedbLedger {
    /// Open (or create) the ledger at the given path.
    /// If `path` is None, uses CREDITGATE_DB_PATH env var or ~/.creditgate/ledger.redb
    pub fn open(path: Option<&str>) -> EngineResult<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("CREDITGATE_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| {
                EngineError::Config("Cannot determine home directory".to_string())
            })?;
            let data_dir = home.join(".creditgate");
            std::fs::create_dir_all(&data_dir)
                .map_err(unavailable("Failed to create .creditgate directory"))?;
            data_dir.join("ledger.redb")
        };

        info!("Opening ledger at: {}", db_path.display());

        let db = Database::create(&db_path).map_err(unavailable("Failed to open database"))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db.begin_write().map_err(unavailable("Failed to begin write"))?;
        {
            let _ = write_txn
                .open_table(USERS)
                .map_err(unavailable("Failed to create users table"))?;
            let _ = write_txn
                .open_table(VERIFICATIONS)
                .map_err(unavailable("Failed to create verifications table"))?;
        }
        write_txn.commit().map_err(unavailable("Failed to commit init"))?;

        info!("Ledger ready");

        Ok(Self {
            db,
            path: db_path,
            starting_balance: DEFAULT_START_CREDITS,
        })
    }

    /// Balance assigned to accounts created by this ledger
    pub fn with_starting_balance(mut self, starting_balance: u64) -> Self {
        self.starting_balance = starting_balance;
        self
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for RedbLedger {
    fn get(&self, user_id: UserId) -> EngineResult<Option<UserAccount>> {
        let read_txn = self.db.begin_read().map_err(unavailable("Failed to begin read"))?;
        let table = read_txn
            .open_table(USERS)
            .map_err(unavailable("Failed to open users table"))?;

        match table.get(user_id).map_err(unavailable("Failed to get account"))? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn update(
        &self,
        user_id: UserId,
        now: i64,
        apply: &mut dyn FnMut(&mut UserAccount),
    ) -> EngineResult<UserAccount> {
        // redb admits one write transaction at a time, which makes the whole
        // read-modify-write below a single critical section.
        let write_txn = self.db.begin_write().map_err(unavailable("Failed to begin write"))?;
        let account = {
            let mut table = write_txn
                .open_table(USERS)
                .map_err(unavailable("Failed to open users table"))?;

            let existing: Option<UserAccount> = table
                .get(user_id)
                .map_err(unavailable("Failed to get account"))?
                .map(|value| decode(value.value()))
                .transpose()?;

            let mut account = match existing {
                Some(account) => account,
                None => {
                    debug!("Creating account {}", user_id);
                    UserAccount::new(user_id, self.starting_balance, now)
                }
            };
            apply(&mut account);

            let value = encode(&account)?;
            table
                .insert(user_id, value.as_slice())
                .map_err(unavailable("Failed to insert account"))?;
            account
        };
        write_txn.commit().map_err(unavailable("Failed to commit"))?;

        Ok(account)
    }

    fn list_user_ids(&self) -> EngineResult<Vec<UserId>> {
        let read_txn = self.db.begin_read().map_err(unavailable("Failed to begin read"))?;
        let table = read_txn
            .open_table(USERS)
            .map_err(unavailable("Failed to open users table"))?;

        let mut ids = Vec::with_capacity(table.len().unwrap_or(0) as usize);
        for entry in table.iter().map_err(unavailable("Failed to iterate users"))? {
            let (key, _value) = entry.map_err(unavailable("Failed to read entry"))?;
            ids.push(key.value());
        }
        Ok(ids)
    }

    fn list_accounts(&self) -> EngineResult<Vec<UserAccount>> {
        let read_txn = self.db.begin_read().map_err(unavailable("Failed to begin read"))?;
        let table = read_txn
            .open_table(USERS)
            .map_err(unavailable("Failed to open users table"))?;

        let mut results = Vec::new();
        for entry in table.iter().map_err(unavailable("Failed to iterate users"))? {
            let (_key, value) = entry.map_err(unavailable("Failed to read entry"))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    fn remove(&self, user_id: UserId) -> EngineResult<bool> {
        let write_txn = self.db.begin_write().map_err(unavailable("Failed to begin write"))?;
        let removed;
        {
            let mut table = write_txn
                .open_table(USERS)
                .map_err(unavailable("Failed to open users table"))?;
            removed = table
                .remove(user_id)
                .map_err(unavailable("Failed to remove account"))?
                .is_some();
        }
        write_txn.commit().map_err(unavailable("Failed to commit delete"))?;

        if removed {
            debug!("Deleted account: {}", user_id);
        }
        Ok(removed)
    }

    fn append_verification(&self, record: &VerificationRecord) -> EngineResult<()> {
        let value = encode(record)?;

        let write_txn = self.db.begin_write().map_err(unavailable("Failed to begin write"))?;
        {
            let mut table = write_txn
                .open_table(VERIFICATIONS)
                .map_err(unavailable("Failed to open verifications table"))?;
            let next_seq = table
                .last()
                .map_err(unavailable("Failed to read last verification"))?
                .map(|(key, _)| key.value() + 1)
                .unwrap_or(0);
            table
                .insert(next_seq, value.as_slice())
                .map_err(unavailable("Failed to insert verification"))?;
        }
        write_txn.commit().map_err(unavailable("Failed to commit"))?;

        debug!("Logged verification for user {}", record.user_id);
        Ok(())
    }

    fn list_verifications(&self) -> EngineResult<Vec<VerificationRecord>> {
        let read_txn = self.db.begin_read().map_err(unavailable("Failed to begin read"))?;
        let table = read_txn
            .open_table(VERIFICATIONS)
            .map_err(unavailable("Failed to open verifications table"))?;

        let mut results = Vec::new();
        for entry in table.iter().map_err(unavailable("Failed to iterate verifications"))? {
            let (_key, value) = entry.map_err(unavailable("Failed to read entry"))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Tier;
    use std::sync::Arc;

    fn open_temp() -> (tempfile::TempDir, RedbLedger) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.redb");
        let ledger = RedbLedger::open(Some(path.to_str().unwrap())).unwrap();
        (dir, ledger)
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (_dir, ledger) = open_temp();

        let first = ledger.get_or_create(42, 1_000).unwrap();
        assert_eq!(first.balance, DEFAULT_START_CREDITS);
        assert_eq!(first.registered_at, 1_000);

        let second = ledger.get_or_create(42, 5_000).unwrap();
        assert_eq!(second.registered_at, 1_000);
        assert_eq!(ledger.list_user_ids().unwrap(), vec![42]);
    }

    #[test]
    fn test_adjust_balance_clamps_and_reports_applied() {
        let (_dir, ledger) = open_temp();
        let ledger = ledger.with_starting_balance(3);

        let change = ledger.adjust_balance(7, -10, 0).unwrap();
        assert_eq!(change, BalanceChange { balance: 0, applied: -3 });

        let change = ledger.adjust_balance(7, 4, 0).unwrap();
        assert_eq!(change, BalanceChange { balance: 4, applied: 4 });
    }

    #[test]
    fn test_update_persists_fields() {
        let (_dir, ledger) = open_temp();

        ledger
            .update(9, 10, &mut |account| {
                account.tier = Tier::Silver;
                account.verify_token = Some("tok".to_string());
            })
            .unwrap();

        let stored = ledger.get(9).unwrap().unwrap();
        assert_eq!(stored.tier, Tier::Silver);
        assert_eq!(stored.verify_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_remove_then_recreate() {
        let (_dir, ledger) = open_temp();
        ledger.adjust_balance(5, 100, 0).unwrap();

        assert!(ledger.remove(5).unwrap());
        assert!(!ledger.remove(5).unwrap());
        assert!(ledger.get(5).unwrap().is_none());

        let recreated = ledger.get_or_create(5, 50).unwrap();
        assert_eq!(recreated.balance, DEFAULT_START_CREDITS);
    }

    #[test]
    fn test_verifications_keep_insertion_order() {
        let (_dir, ledger) = open_temp();
        for (user_id, at) in [(1, 30), (2, 10), (1, 20)] {
            ledger
                .append_verification(&VerificationRecord { user_id, at, credits: 10 })
                .unwrap();
        }

        let ats: Vec<i64> = ledger.list_verifications().unwrap().iter().map(|v| v.at).collect();
        assert_eq!(ats, vec![30, 10, 20]);
    }

    #[test]
    fn test_concurrent_adjustments_lose_no_updates() {
        let (_dir, ledger) = open_temp();
        let ledger = Arc::new(ledger.with_starting_balance(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        ledger.adjust_balance(1, 2, 0).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.get(1).unwrap().unwrap().balance, 200);
    }

    #[test]
    fn test_stats_counts_premium_and_credits() {
        let (_dir, ledger) = open_temp();
        let ledger = ledger.with_starting_balance(10);
        ledger.get_or_create(1, 0).unwrap();
        ledger
            .update(2, 0, &mut |a| {
                a.tier = Tier::Gold;
                a.balance = 200;
            })
            .unwrap();

        let stats = ledger.stats(100).unwrap();
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.premium_users, 1);
        assert_eq!(stats.total_credits, 210);
        assert_eq!(stats.total_verifications, 0);
    }
}
