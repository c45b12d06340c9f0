use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{Clock, SystemClock, duration_millis};
use crate::types::UserAddress;

pub const DEFAULT_GAS_PRICE: u64 = 1;

/// One immutable ledger entry. `cost` is fixed at the price in force when it was written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingRecord {
    pub user: UserAddress,
    pub gas_used: u64,
    pub cost: u128,
    pub timestamp_ms: u64,
    pub description: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BillingError {
    #[error("invalid gas amount: must be positive")]
    InvalidGasAmount,
    #[error("invalid user address")]
    InvalidUserAddress,
}

type Ledger = Mutex<Vec<BillingRecord>>;

/// Append-only usage ledger keyed by user.
///
/// Appends for existing users only take the map's shared lock plus that user's own mutex,
/// so writers for different users do not serialize. The gas price sits behind its own lock.
pub struct BillingManager {
    ledgers: RwLock<HashMap<UserAddress, Ledger>>,
    gas_price: RwLock<u64>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BillingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingManager")
            .field("gas_price", &self.gas_price())
            .finish_non_exhaustive()
    }
}

impl Default for BillingManager {
    fn default() -> Self {
        Self::new(DEFAULT_GAS_PRICE)
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_ledger(ledger: &Ledger) -> MutexGuard<'_, Vec<BillingRecord>> {
    ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BillingManager {
    pub fn new(gas_price: u64) -> Self {
        Self {
            ledgers: RwLock::new(HashMap::new()),
            gas_price: RwLock::new(gas_price),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn record_usage(
        &self,
        user: &UserAddress,
        gas_used: u64,
        description: impl Into<String>,
    ) -> Result<BillingRecord, BillingError> {
        if user.is_zero() {
            return Err(BillingError::InvalidUserAddress);
        }
        if gas_used == 0 {
            return Err(BillingError::InvalidGasAmount);
        }

        let price = self.gas_price();
        let record = BillingRecord {
            user: *user,
            gas_used,
            cost: u128::from(gas_used) * u128::from(price),
            timestamp_ms: self.clock.now_millis(),
            description: description.into(),
        };

        {
            let ledgers = read(&self.ledgers);
            if let Some(ledger) = ledgers.get(user) {
                lock_ledger(ledger).push(record.clone());
                tracing::debug!(user = %user, gas_used, cost = %record.cost, "usage recorded");
                return Ok(record);
            }
        }

        let mut ledgers = write(&self.ledgers);
        ledgers
            .entry(*user)
            .or_default()
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        tracing::debug!(user = %user, gas_used, cost = %record.cost, "usage recorded");
        Ok(record)
    }

    /// Records with `start_ms < timestamp < end_ms`. Unknown users yield an empty list.
    pub fn get_user_records(
        &self,
        user: &UserAddress,
        start_ms: u64,
        end_ms: u64,
    ) -> Vec<BillingRecord> {
        let ledgers = read(&self.ledgers);
        let Some(ledger) = ledgers.get(user) else {
            return Vec::new();
        };
        lock_ledger(ledger)
            .iter()
            .filter(|record| record.timestamp_ms > start_ms && record.timestamp_ms < end_ms)
            .cloned()
            .collect()
    }

    pub fn get_total_cost(&self, user: &UserAddress, start_ms: u64, end_ms: u64) -> u128 {
        self.get_user_records(user, start_ms, end_ms)
            .iter()
            .map(|record| record.cost)
            .sum()
    }

    pub fn update_gas_price(&self, new_price: u64) {
        let mut price = write(&self.gas_price);
        tracing::info!(old_price = *price, new_price, "gas price updated");
        *price = new_price;
    }

    pub fn gas_price(&self) -> u64 {
        *read(&self.gas_price)
    }

    /// Drops records at or before `now - age` and forgets users left with no records.
    /// Returns the number of records removed.
    pub fn cleanup_old_records(&self, age: Duration) -> usize {
        let cutoff = self.clock.now_millis().saturating_sub(duration_millis(age));
        let mut ledgers = write(&self.ledgers);
        let mut removed = 0usize;
        ledgers.retain(|_, ledger| {
            let records = ledger
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = records.len();
            records.retain(|record| record.timestamp_ms > cutoff);
            removed += before - records.len();
            !records.is_empty()
        });
        if removed > 0 {
            tracing::info!(removed, cutoff_ms = cutoff, "old billing records removed");
        }
        removed
    }

    pub fn users(&self) -> Vec<UserAddress> {
        let mut users: Vec<UserAddress> = read(&self.ledgers).keys().copied().collect();
        users.sort();
        users
    }
}
