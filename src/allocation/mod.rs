//! Per-user gas grants with policy bounds and version-guarded debits.

#[cfg(feature = "store-sqlite")]
mod sqlite_store;
mod store;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{Clock, SystemClock, duration_millis};
use crate::observability::{GasAlerts, MeterMetrics, NoopObserver};
use crate::types::{UserAddress, random_id};

#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteAllocationStore;
pub use store::{AllocationStore, MemoryAllocationStore, StoreError};

/// Lifetime of a grant when no policy is configured.
pub const DEFAULT_ALLOCATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_MAX_UPDATE_ATTEMPTS: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub id: String,
    pub user: UserAddress,
    pub amount: u64,
    pub used: u64,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub last_used_at_ms: u64,
    pub version: u64,
}

/// Gas set aside on one grant for a run whose final cost is not known yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasReservation {
    pub user: UserAddress,
    pub allocation_id: String,
    pub amount: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Active,
    Expired,
}

impl Allocation {
    pub fn remaining(&self) -> u64 {
        self.amount.saturating_sub(self.used)
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms
    }

    /// Same grant at the same revision. Ids are unique per grant, so a fresh grant whose
    /// version restarted never matches a read of the one it replaced.
    pub fn is_same_revision(&self, other: &Allocation) -> bool {
        self.id == other.id && self.version == other.version
    }

    pub fn status_at(&self, now_ms: u64) -> AllocationStatus {
        if self.is_expired_at(now_ms) {
            AllocationStatus::Expired
        } else {
            AllocationStatus::Active
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasPolicy {
    pub max_allocation_per_user: u64,
    pub min_allocation_amount: u64,
    pub max_allocation_secs: u64,
    /// Remaining balance at or below which a successful debit raises a low-gas alert.
    pub refill_threshold: u64,
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self {
            max_allocation_per_user: 10_000_000,
            min_allocation_amount: 1,
            max_allocation_secs: DEFAULT_ALLOCATION_TTL.as_secs(),
            refill_threshold: 0,
        }
    }
}

impl GasPolicy {
    pub fn max_allocation_time(&self) -> Duration {
        Duration::from_secs(self.max_allocation_secs)
    }
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("invalid user address")]
    InvalidUserAddress,
    #[error("invalid gas amount: must be positive")]
    InvalidAmount,
    #[error("amount {requested} exceeds maximum allocation {maximum}")]
    ExceedsPolicyMaximum { requested: u64, maximum: u64 },
    #[error("amount {requested} is below minimum allocation {minimum}")]
    BelowPolicyMinimum { requested: u64, minimum: u64 },
    #[error("no gas allocation found for {user}")]
    NotFound { user: UserAddress },
    #[error("gas allocation for {user} expired at {expired_at_ms}")]
    Expired {
        user: UserAddress,
        expired_at_ms: u64,
    },
    #[error("insufficient gas: requested {requested}, remaining {remaining}")]
    InsufficientGas { requested: u64, remaining: u64 },
    #[error("gas allocation for {user} changed concurrently {attempts} times")]
    Contention { user: UserAddress, attempts: usize },
    #[error("failed to {operation}: {source}")]
    Store {
        operation: String,
        #[source]
        source: StoreError,
    },
}

impl AllocationError {
    /// Malformed input; never worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidUserAddress
                | Self::InvalidAmount
                | Self::ExceedsPolicyMaximum { .. }
                | Self::BelowPolicyMinimum { .. }
        )
    }

    /// Expected outcomes of normal operation the caller has to branch on.
    pub fn is_business_outcome(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Expired { .. }
                | Self::InsufficientGas { .. }
                | Self::Contention { .. }
        )
    }
}

fn store_error(operation: &str, user: &UserAddress) -> impl FnOnce(StoreError) -> AllocationError {
    let operation = format!("{operation} for {user}");
    move |source| {
        tracing::warn!(operation = %operation, error = %source, "allocation store failure");
        AllocationError::Store { operation, source }
    }
}

fn validate_user(user: &UserAddress) -> Result<(), AllocationError> {
    if user.is_zero() {
        return Err(AllocationError::InvalidUserAddress);
    }
    Ok(())
}

pub struct AllocationManager {
    store: Arc<dyn AllocationStore>,
    policy: Option<GasPolicy>,
    metrics: Arc<dyn MeterMetrics>,
    alerts: Arc<dyn GasAlerts>,
    clock: Arc<dyn Clock>,
    max_update_attempts: usize,
}

impl std::fmt::Debug for AllocationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationManager")
            .field("policy", &self.policy)
            .field("max_update_attempts", &self.max_update_attempts)
            .finish_non_exhaustive()
    }
}

impl AllocationManager {
    pub fn new(store: Arc<dyn AllocationStore>) -> Self {
        Self {
            store,
            policy: None,
            metrics: Arc::new(NoopObserver),
            alerts: Arc::new(NoopObserver),
            clock: Arc::new(SystemClock),
            max_update_attempts: DEFAULT_MAX_UPDATE_ATTEMPTS,
        }
    }

    pub fn with_policy(mut self, policy: GasPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MeterMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn GasAlerts>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_update_attempts(mut self, attempts: usize) -> Self {
        self.max_update_attempts = attempts.max(1);
        self
    }

    pub fn policy(&self) -> Option<&GasPolicy> {
        self.policy.as_ref()
    }

    fn allocation_ttl_ms(&self) -> u64 {
        let ttl = self
            .policy
            .as_ref()
            .map(GasPolicy::max_allocation_time)
            .unwrap_or(DEFAULT_ALLOCATION_TTL);
        duration_millis(ttl)
    }

    async fn load(
        &self,
        user: &UserAddress,
        operation: &str,
    ) -> Result<Option<Allocation>, AllocationError> {
        self.store
            .get_allocation(user)
            .await
            .map_err(store_error(operation, user))
    }

    async fn save(
        &self,
        allocation: &Allocation,
        expected: Option<&Allocation>,
        operation: &str,
    ) -> Result<bool, AllocationError> {
        self.store
            .save_allocation(allocation, expected)
            .await
            .map_err(store_error(operation, &allocation.user))
    }

    /// Grants `amount` gas to `user`. Returns the existing grant unchanged while it is still
    /// active, so retried calls never double-grant.
    pub async fn allocate_gas(
        &self,
        user: &UserAddress,
        amount: u64,
    ) -> Result<Allocation, AllocationError> {
        validate_user(user)?;
        if amount == 0 {
            return Err(AllocationError::InvalidAmount);
        }
        if let Some(policy) = &self.policy {
            if amount > policy.max_allocation_per_user {
                return Err(AllocationError::ExceedsPolicyMaximum {
                    requested: amount,
                    maximum: policy.max_allocation_per_user,
                });
            }
            if amount < policy.min_allocation_amount {
                return Err(AllocationError::BelowPolicyMinimum {
                    requested: amount,
                    minimum: policy.min_allocation_amount,
                });
            }
        }

        for _ in 0..self.max_update_attempts {
            let existing = self.load(user, "check existing allocation").await?;
            let now = self.clock.now_millis();
            if let Some(existing) = existing.as_ref().filter(|a| !a.is_expired_at(now)) {
                tracing::debug!(
                    user = %user,
                    allocation_id = %existing.id,
                    "reusing active allocation"
                );
                return Ok(existing.clone());
            }

            let allocation = Allocation {
                id: random_id("alloc-"),
                user: *user,
                amount,
                used: 0,
                created_at_ms: now,
                expires_at_ms: now.saturating_add(self.allocation_ttl_ms()),
                last_used_at_ms: now,
                version: existing
                    .as_ref()
                    .map_or(1, |expired| expired.version.saturating_add(1)),
            };
            if self
                .save(&allocation, existing.as_ref(), "save allocation")
                .await?
            {
                self.metrics.record_allocation(&allocation);
                tracing::info!(
                    user = %user,
                    allocation_id = %allocation.id,
                    amount,
                    expires_at_ms = allocation.expires_at_ms,
                    "gas allocated"
                );
                return Ok(allocation);
            }
        }

        Err(AllocationError::Contention {
            user: *user,
            attempts: self.max_update_attempts,
        })
    }

    /// Debits `amount` from the user's active allocation.
    pub async fn use_gas(
        &self,
        user: &UserAddress,
        amount: u64,
    ) -> Result<Allocation, AllocationError> {
        validate_user(user)?;
        if amount == 0 {
            return Err(AllocationError::InvalidAmount);
        }

        for _ in 0..self.max_update_attempts {
            let Some(current) = self.load(user, "get allocation").await? else {
                return Err(AllocationError::NotFound { user: *user });
            };
            let now = self.clock.now_millis();
            if current.is_expired_at(now) {
                self.alerts.allocation_expired(&current);
                tracing::info!(
                    user = %user,
                    expires_at_ms = current.expires_at_ms,
                    "gas allocation expired"
                );
                return Err(AllocationError::Expired {
                    user: *user,
                    expired_at_ms: current.expires_at_ms,
                });
            }

            let remaining = current.remaining();
            if remaining < amount {
                self.alerts.low_gas(user, remaining);
                tracing::info!(user = %user, requested = amount, remaining, "insufficient gas");
                return Err(AllocationError::InsufficientGas {
                    requested: amount,
                    remaining,
                });
            }

            let mut updated = current.clone();
            updated.used = updated.used.saturating_add(amount);
            updated.last_used_at_ms = now;
            updated.version = current.version.saturating_add(1);
            if !self
                .save(&updated, Some(&current), "update allocation")
                .await?
            {
                tracing::debug!(user = %user, "allocation changed concurrently; retrying debit");
                continue;
            }

            self.metrics.record_usage(user, amount);
            let remaining = updated.remaining();
            tracing::debug!(user = %user, amount, remaining, "gas used");
            if let Some(policy) = &self.policy {
                if remaining <= policy.refill_threshold {
                    self.alerts.low_gas(user, remaining);
                }
            }
            return Ok(updated);
        }

        Err(AllocationError::Contention {
            user: *user,
            attempts: self.max_update_attempts,
        })
    }

    /// Debits up to `maximum` from the active allocation before a run, failing with
    /// `InsufficientGas` when less than `minimum` is left. The debit is held until
    /// [`Self::settle_reservation`] refunds whatever the run did not consume.
    pub async fn reserve_gas(
        &self,
        user: &UserAddress,
        maximum: u64,
        minimum: u64,
    ) -> Result<GasReservation, AllocationError> {
        validate_user(user)?;
        if maximum == 0 {
            return Err(AllocationError::InvalidAmount);
        }
        let minimum = minimum.max(1);

        for _ in 0..self.max_update_attempts {
            let Some(current) = self.load(user, "get allocation").await? else {
                return Err(AllocationError::NotFound { user: *user });
            };
            let now = self.clock.now_millis();
            if current.is_expired_at(now) {
                self.alerts.allocation_expired(&current);
                return Err(AllocationError::Expired {
                    user: *user,
                    expired_at_ms: current.expires_at_ms,
                });
            }

            let remaining = current.remaining();
            if remaining < minimum {
                self.alerts.low_gas(user, remaining);
                tracing::info!(user = %user, minimum, remaining, "insufficient gas to reserve");
                return Err(AllocationError::InsufficientGas {
                    requested: minimum,
                    remaining,
                });
            }

            let amount = maximum.min(remaining);
            let mut updated = current.clone();
            updated.used = updated.used.saturating_add(amount);
            updated.last_used_at_ms = now;
            updated.version = current.version.saturating_add(1);
            if self
                .save(&updated, Some(&current), "reserve gas")
                .await?
            {
                tracing::debug!(user = %user, allocation_id = %updated.id, amount, "gas reserved");
                return Ok(GasReservation {
                    user: *user,
                    allocation_id: updated.id,
                    amount,
                });
            }
        }

        Err(AllocationError::Contention {
            user: *user,
            attempts: self.max_update_attempts,
        })
    }

    /// Keeps `charged` of a reservation (capped at its amount) and refunds the rest. Returns
    /// `None` when the reserved grant was released or replaced in the meantime; nothing is
    /// refunded then.
    pub async fn settle_reservation(
        &self,
        reservation: &GasReservation,
        charged: u64,
    ) -> Result<Option<Allocation>, AllocationError> {
        let user = &reservation.user;
        let charged = charged.min(reservation.amount);
        let refund = reservation.amount - charged;

        for _ in 0..self.max_update_attempts {
            let current = self.load(user, "get allocation").await?;
            let Some(current) = current.filter(|a| a.id == reservation.allocation_id) else {
                tracing::info!(
                    user = %user,
                    allocation_id = %reservation.allocation_id,
                    charged,
                    "reserved allocation is gone; nothing refunded"
                );
                if charged > 0 {
                    self.metrics.record_usage(user, charged);
                }
                return Ok(None);
            };

            let settled = if refund == 0 {
                current
            } else {
                let mut updated = current.clone();
                updated.used = updated.used.saturating_sub(refund);
                updated.version = current.version.saturating_add(1);
                if !self
                    .save(&updated, Some(&current), "settle reservation")
                    .await?
                {
                    continue;
                }
                updated
            };

            if charged > 0 {
                self.metrics.record_usage(user, charged);
            }
            let remaining = settled.remaining();
            tracing::debug!(user = %user, charged, refund, remaining, "gas reservation settled");
            if let Some(policy) = &self.policy {
                if remaining <= policy.refill_threshold {
                    self.alerts.low_gas(user, remaining);
                }
            }
            return Ok(Some(settled));
        }

        Err(AllocationError::Contention {
            user: *user,
            attempts: self.max_update_attempts,
        })
    }

    /// Adds `amount` to an active allocation. The resulting total is bounded by the policy
    /// maximum when one is configured.
    pub async fn refill_allocation(
        &self,
        user: &UserAddress,
        amount: u64,
    ) -> Result<Allocation, AllocationError> {
        validate_user(user)?;
        if amount == 0 {
            return Err(AllocationError::InvalidAmount);
        }

        for _ in 0..self.max_update_attempts {
            let Some(current) = self.load(user, "get allocation").await? else {
                return Err(AllocationError::NotFound { user: *user });
            };
            let now = self.clock.now_millis();
            if current.is_expired_at(now) {
                self.alerts.allocation_expired(&current);
                return Err(AllocationError::Expired {
                    user: *user,
                    expired_at_ms: current.expires_at_ms,
                });
            }

            let total = current.amount.saturating_add(amount);
            if let Some(policy) = &self.policy {
                if total > policy.max_allocation_per_user {
                    return Err(AllocationError::ExceedsPolicyMaximum {
                        requested: total,
                        maximum: policy.max_allocation_per_user,
                    });
                }
            }

            let mut updated = current.clone();
            updated.amount = total;
            updated.version = current.version.saturating_add(1);
            if self
                .save(&updated, Some(&current), "refill allocation")
                .await?
            {
                tracing::info!(user = %user, added = amount, total, "gas allocation refilled");
                return Ok(updated);
            }
        }

        Err(AllocationError::Contention {
            user: *user,
            attempts: self.max_update_attempts,
        })
    }

    /// Removes the user's allocation. Releasing an absent allocation is not an error.
    pub async fn release_gas(&self, user: &UserAddress) -> Result<(), AllocationError> {
        validate_user(user)?;
        let deleted = self
            .store
            .delete_allocation(user, None)
            .await
            .map_err(store_error("delete allocation", user))?;
        if deleted {
            self.metrics.record_release(user);
            tracing::info!(user = %user, "gas allocation released");
        }
        Ok(())
    }

    /// Returns `Ok(None)` when the user has no allocation.
    pub async fn get_allocation(
        &self,
        user: &UserAddress,
    ) -> Result<Option<Allocation>, AllocationError> {
        validate_user(user)?;
        self.load(user, "get allocation").await
    }

    /// Like [`Self::get_allocation`] but treats a missing or expired grant as an error.
    pub async fn get_active_allocation(
        &self,
        user: &UserAddress,
    ) -> Result<Allocation, AllocationError> {
        let Some(allocation) = self.get_allocation(user).await? else {
            return Err(AllocationError::NotFound { user: *user });
        };
        if allocation.is_expired_at(self.clock.now_millis()) {
            self.alerts.allocation_expired(&allocation);
            return Err(AllocationError::Expired {
                user: *user,
                expired_at_ms: allocation.expires_at_ms,
            });
        }
        Ok(allocation)
    }

    pub async fn list_allocations(&self) -> Result<Vec<Allocation>, AllocationError> {
        self.store
            .list_allocations()
            .await
            .map_err(|source| AllocationError::Store {
                operation: "list allocations".to_string(),
                source,
            })
    }

    /// Deletes every allocation that is past its expiry and returns how many were removed.
    /// Deletes are version-guarded so a grant renewed in the meantime survives.
    pub async fn cleanup_expired(&self) -> Result<usize, AllocationError> {
        let now = self.clock.now_millis();
        let mut removed = 0usize;
        for allocation in self.list_allocations().await? {
            if !allocation.is_expired_at(now) {
                continue;
            }
            let deleted = self
                .store
                .delete_allocation(&allocation.user, Some(&allocation))
                .await
                .map_err(store_error("delete expired allocation", &allocation.user))?;
            if deleted {
                removed += 1;
                tracing::debug!(
                    user = %allocation.user,
                    allocation_id = %allocation.id,
                    unused = allocation.remaining(),
                    "expired gas allocation removed"
                );
            }
        }
        if removed > 0 {
            tracing::info!(removed, "expired gas allocations cleaned up");
        }
        Ok(removed)
    }
}
