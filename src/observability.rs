use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::allocation::Allocation;
use crate::clock::{Clock, SystemClock, duration_millis};
use crate::executor::{ExecutionResult, ExecutionStatus};
use crate::types::UserAddress;

/// Usage metrics sink. Every hook defaults to a no-op.
pub trait MeterMetrics: Send + Sync {
    fn record_allocation(&self, _allocation: &Allocation) {}

    fn record_usage(&self, _user: &UserAddress, _amount: u64) {}

    fn record_release(&self, _user: &UserAddress) {}

    fn record_execution(&self, _function_id: &str, _result: &ExecutionResult) {}
}

/// Advisory gas alerts. Every hook defaults to a no-op.
pub trait GasAlerts: Send + Sync {
    fn allocation_expired(&self, _allocation: &Allocation) {}

    fn low_gas(&self, _user: &UserAddress, _remaining: u64) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl MeterMetrics for NoopObserver {}

impl GasAlerts for NoopObserver {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilitySnapshot {
    pub allocations: u64,
    pub gas_allocated: u64,
    pub gas_used: u64,
    pub usage_events: u64,
    pub releases: u64,
    pub executions: u64,
    pub executions_failed: u64,
    pub execution_gas: u64,
}

/// In-process counters.
#[derive(Debug, Default)]
pub struct MeterObservability {
    allocations: AtomicU64,
    gas_allocated: AtomicU64,
    gas_used: AtomicU64,
    usage_events: AtomicU64,
    releases: AtomicU64,
    executions: AtomicU64,
    executions_failed: AtomicU64,
    execution_gas: AtomicU64,
}

impl MeterObservability {
    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            gas_allocated: self.gas_allocated.load(Ordering::Relaxed),
            gas_used: self.gas_used.load(Ordering::Relaxed),
            usage_events: self.usage_events.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            execution_gas: self.execution_gas.load(Ordering::Relaxed),
        }
    }
}

fn saturating_add(counter: &AtomicU64, delta: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
        Some(value.saturating_add(delta))
    });
}

impl MeterMetrics for MeterObservability {
    fn record_allocation(&self, allocation: &Allocation) {
        saturating_add(&self.allocations, 1);
        saturating_add(&self.gas_allocated, allocation.amount);
    }

    fn record_usage(&self, _user: &UserAddress, amount: u64) {
        saturating_add(&self.usage_events, 1);
        saturating_add(&self.gas_used, amount);
    }

    fn record_release(&self, _user: &UserAddress) {
        saturating_add(&self.releases, 1);
    }

    fn record_execution(&self, _function_id: &str, result: &ExecutionResult) {
        saturating_add(&self.executions, 1);
        if result.status == ExecutionStatus::Error {
            saturating_add(&self.executions_failed, 1);
        }
        saturating_add(&self.execution_gas, result.gas_used);
    }
}

pub const DEFAULT_ALERT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Logs alerts through `tracing`, suppressing repeats of the same alert inside a cooldown.
pub struct TracingAlerts {
    cooldown_ms: u64,
    last_alerts: Mutex<HashMap<String, u64>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TracingAlerts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingAlerts")
            .field("cooldown_ms", &self.cooldown_ms)
            .finish()
    }
}

impl Default for TracingAlerts {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_COOLDOWN)
    }
}

impl TracingAlerts {
    pub fn new(cooldown: Duration) -> Self {
        Self::with_clock(cooldown, Arc::new(SystemClock))
    }

    pub fn with_clock(cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cooldown_ms: duration_millis(cooldown),
            last_alerts: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Returns true if the alert should fire and stamps it.
    fn should_fire(&self, key: String) -> bool {
        let now = self.clock.now_millis();
        let mut last_alerts = match self.last_alerts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(last) = last_alerts.get(&key) {
            if now.saturating_sub(*last) < self.cooldown_ms {
                return false;
            }
        }
        last_alerts.retain(|_, last| now.saturating_sub(*last) < self.cooldown_ms);
        last_alerts.insert(key, now);
        true
    }
}

impl GasAlerts for TracingAlerts {
    fn allocation_expired(&self, allocation: &Allocation) {
        if !self.should_fire(format!("allocation_expired_{}", allocation.id)) {
            return;
        }
        let expired_for_ms = self
            .clock
            .now_millis()
            .saturating_sub(allocation.expires_at_ms);
        tracing::warn!(
            allocation_id = %allocation.id,
            user = %allocation.user,
            amount = allocation.amount,
            expired_for_ms,
            "gas allocation expired without release"
        );
    }

    fn low_gas(&self, user: &UserAddress, remaining: u64) {
        if !self.should_fire(format!("low_gas_{user}_{remaining}")) {
            return;
        }
        tracing::warn!(user = %user, remaining, "low gas");
    }
}
