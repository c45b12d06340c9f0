use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::allocation::AllocationManager;
use crate::billing::BillingManager;
use crate::executor::FunctionExecutor;

/// What to sweep and how much history to keep.
#[derive(Clone, Debug)]
pub struct Maintenance {
    pub allocations: Arc<AllocationManager>,
    pub executor: Arc<FunctionExecutor>,
    pub billing: Arc<BillingManager>,
    pub execution_retention: Duration,
    pub record_retention: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub expired_allocations: usize,
    pub stale_executions: usize,
    pub finished_executions: usize,
    pub billing_records: usize,
    /// Set when the allocation store could not be swept. The in-process sweeps still ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_error: Option<String>,
}

impl Maintenance {
    /// One sweep over every component. An allocation store failure is reported rather than
    /// returned, so executions and billing records are still pruned while the store is down.
    pub async fn run_once(&self) -> MaintenanceReport {
        let cleanup = self.allocations.cleanup_expired().await;
        let (expired_allocations, allocation_error) = match cleanup {
            Ok(removed) => (removed, None),
            Err(err) => {
                tracing::warn!(error = %err, "expired allocation cleanup failed");
                (0, Some(err.to_string()))
            }
        };
        MaintenanceReport {
            expired_allocations,
            stale_executions: self.executor.clear(self.execution_retention),
            finished_executions: self.executor.prune_finished(self.execution_retention),
            billing_records: self.billing.cleanup_old_records(self.record_retention),
            allocation_error,
        }
    }

    /// Sweeps every `interval` until `cancel` fires.
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let report = self.run_once().await;
                tracing::debug!(?report, "maintenance sweep finished");
            }
            tracing::debug!("maintenance task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{
        Allocation, AllocationStore, GasPolicy, MemoryAllocationStore, StoreError,
    };
    use crate::clock::ManualClock;
    use crate::executor::{FunctionInput, FunctionOutput, Sandbox, SandboxContext, SandboxError};
    use crate::types::UserAddress;

    struct NoopSandbox;

    #[async_trait::async_trait]
    impl Sandbox for NoopSandbox {
        async fn execute(
            &self,
            _ctx: SandboxContext,
            _input: FunctionInput,
        ) -> Result<FunctionOutput, SandboxError> {
            Ok(FunctionOutput::default())
        }
    }

    #[tokio::test]
    async fn sweeps_expired_state() {
        let clock = Arc::new(ManualClock::new(1_000));
        let allocations = Arc::new(
            AllocationManager::new(Arc::new(MemoryAllocationStore::new()))
                .with_clock(clock.clone())
                .with_policy(GasPolicy {
                    max_allocation_secs: 10,
                    ..GasPolicy::default()
                }),
        );
        let billing = Arc::new(BillingManager::new(1).with_clock(clock.clone()));
        let executor =
            Arc::new(FunctionExecutor::new(Arc::new(NoopSandbox)).with_clock(clock.clone()));
        let user = UserAddress::new([5; 20]);

        allocations.allocate_gas(&user, 100).await.unwrap();
        billing.record_usage(&user, 10, "run").unwrap();
        executor
            .execute(&crate::executor::Function::new("f", ""), serde_json::Value::Null, None)
            .await;

        clock.advance(Duration::from_secs(120));
        let maintenance = Maintenance {
            allocations: allocations.clone(),
            executor,
            billing,
            execution_retention: Duration::from_secs(60),
            record_retention: Duration::from_secs(60),
        };
        let report = maintenance.run_once().await;
        assert_eq!(
            report,
            MaintenanceReport {
                expired_allocations: 1,
                stale_executions: 0,
                finished_executions: 1,
                billing_records: 1,
                allocation_error: None,
            }
        );
        assert!(allocations.get_allocation(&user).await.unwrap().is_none());
    }

    struct OfflineStore;

    #[async_trait::async_trait]
    impl AllocationStore for OfflineStore {
        async fn get_allocation(
            &self,
            _user: &UserAddress,
        ) -> Result<Option<Allocation>, StoreError> {
            Err(StoreError::Backend("offline".to_string()))
        }

        async fn save_allocation(
            &self,
            _allocation: &Allocation,
            _expected: Option<&Allocation>,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Backend("offline".to_string()))
        }

        async fn delete_allocation(
            &self,
            _user: &UserAddress,
            _expected: Option<&Allocation>,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Backend("offline".to_string()))
        }

        async fn list_allocations(&self) -> Result<Vec<Allocation>, StoreError> {
            Err(StoreError::Backend("offline".to_string()))
        }
    }

    #[tokio::test]
    async fn store_outage_does_not_stop_in_process_sweeps() {
        let clock = Arc::new(ManualClock::new(1_000));
        let billing = Arc::new(BillingManager::new(1).with_clock(clock.clone()));
        let executor =
            Arc::new(FunctionExecutor::new(Arc::new(NoopSandbox)).with_clock(clock.clone()));
        let user = UserAddress::new([6; 20]);
        billing.record_usage(&user, 10, "run").unwrap();
        executor
            .execute(&crate::executor::Function::new("f", ""), serde_json::Value::Null, None)
            .await;
        clock.advance(Duration::from_secs(1));

        let maintenance = Maintenance {
            allocations: Arc::new(AllocationManager::new(Arc::new(OfflineStore))),
            executor: executor.clone(),
            billing: billing.clone(),
            execution_retention: Duration::ZERO,
            record_retention: Duration::ZERO,
        };
        let report = maintenance.run_once().await;

        assert_eq!(report.expired_allocations, 0);
        assert!(report
            .allocation_error
            .as_deref()
            .is_some_and(|err| err.contains("offline")));
        assert_eq!(report.billing_records, 1);
        assert_eq!(report.finished_executions, 1);
        assert!(billing.users().is_empty());
    }

    #[tokio::test]
    async fn spawned_task_stops_on_cancel() {
        let maintenance = Maintenance {
            allocations: Arc::new(AllocationManager::new(Arc::new(MemoryAllocationStore::new()))),
            executor: Arc::new(FunctionExecutor::new(Arc::new(NoopSandbox))),
            billing: Arc::new(BillingManager::default()),
            execution_retention: Duration::from_secs(1),
            record_retention: Duration::from_secs(1),
        };
        let cancel = CancellationToken::new();
        let handle = maintenance.spawn(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task stops")
            .expect("task did not panic");
    }
}
