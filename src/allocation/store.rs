use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use super::Allocation;
use crate::types::UserAddress;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock is poisoned")]
    Poisoned,
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("value out of range for column {column}: {value}")]
    OutOfRange { column: &'static str, value: u64 },
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Persistence contract for allocations.
///
/// Writes are conditional on the grant the caller last read, matched by `id` and `version`,
/// so concurrent read-check-write sequences for the same user cannot both commit against a
/// stale read. Versions restart for every new grant; the random `id` tells grants apart.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    async fn get_allocation(&self, user: &UserAddress) -> Result<Option<Allocation>, StoreError>;

    /// Writes `allocation` only if the stored grant is still `expected` (`None` means no
    /// allocation may exist yet). Returns `false` on a conflict.
    async fn save_allocation(
        &self,
        allocation: &Allocation,
        expected: Option<&Allocation>,
    ) -> Result<bool, StoreError>;

    /// Deletes the user's allocation. With `Some(expected)` the delete only happens if the
    /// stored grant is still `expected`. Returns whether something was deleted.
    async fn delete_allocation(
        &self,
        user: &UserAddress,
        expected: Option<&Allocation>,
    ) -> Result<bool, StoreError>;

    async fn list_allocations(&self) -> Result<Vec<Allocation>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryAllocationStore {
    allocations: Mutex<HashMap<UserAddress, Allocation>>,
}

impl MemoryAllocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<UserAddress, Allocation>>, StoreError> {
        self.allocations.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl AllocationStore for MemoryAllocationStore {
    async fn get_allocation(&self, user: &UserAddress) -> Result<Option<Allocation>, StoreError> {
        Ok(self.lock()?.get(user).cloned())
    }

    async fn save_allocation(
        &self,
        allocation: &Allocation,
        expected: Option<&Allocation>,
    ) -> Result<bool, StoreError> {
        let mut allocations = self.lock()?;
        let unchanged = match (allocations.get(&allocation.user), expected) {
            (None, None) => true,
            (Some(stored), Some(expected)) => stored.is_same_revision(expected),
            _ => false,
        };
        if !unchanged {
            return Ok(false);
        }
        allocations.insert(allocation.user, allocation.clone());
        Ok(true)
    }

    async fn delete_allocation(
        &self,
        user: &UserAddress,
        expected: Option<&Allocation>,
    ) -> Result<bool, StoreError> {
        let mut allocations = self.lock()?;
        let Some(stored) = allocations.get(user) else {
            return Ok(false);
        };
        if expected.is_some_and(|expected| !stored.is_same_revision(expected)) {
            return Ok(false);
        }
        allocations.remove(user);
        Ok(true)
    }

    async fn list_allocations(&self) -> Result<Vec<Allocation>, StoreError> {
        let mut out: Vec<Allocation> = self.lock()?.values().cloned().collect();
        out.sort_by(|a, b| a.user.cmp(&b.user));
        Ok(out)
    }
}
