use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::allocation::{AllocationManager, GasReservation};
use crate::billing::{BillingManager, BillingRecord};
use crate::error::Result;
use crate::executor::{ExecutionOptions, ExecutionResult, Function, FunctionExecutor, execution_id};
use crate::types::{UserAddress, random_id};

/// What a metered run cost the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Charge {
    pub gas_charged: u64,
    pub remaining: u64,
    #[serde(default)]
    pub record: Option<BillingRecord>,
}

#[derive(Debug)]
pub struct MeteredExecution {
    pub execution_id: String,
    pub result: ExecutionResult,
    /// Outcome of debiting the allocation and writing the ledger entry. The run itself has
    /// already happened either way.
    pub charge: Result<Charge>,
}

/// Admission, execution, debit and ledger entry for one invocation.
#[derive(Debug, Clone)]
pub struct MeteredExecutor {
    executor: Arc<FunctionExecutor>,
    allocations: Arc<AllocationManager>,
    billing: Arc<BillingManager>,
}

impl MeteredExecutor {
    pub fn new(
        executor: Arc<FunctionExecutor>,
        allocations: Arc<AllocationManager>,
        billing: Arc<BillingManager>,
    ) -> Self {
        Self {
            executor,
            allocations,
            billing,
        }
    }

    pub fn executor(&self) -> &Arc<FunctionExecutor> {
        &self.executor
    }

    pub fn allocations(&self) -> &Arc<AllocationManager> {
        &self.allocations
    }

    pub fn billing(&self) -> &Arc<BillingManager> {
        &self.billing
    }

    pub async fn execute(
        &self,
        user: &UserAddress,
        function: &Function,
        input: serde_json::Value,
        options: Option<ExecutionOptions>,
    ) -> Result<MeteredExecution> {
        self.execute_with_cancel(&CancellationToken::new(), user, function, input, options)
            .await
    }

    /// Reserves the run's gas limit (capped at the remaining balance, which must cover the
    /// run's minimum price) on the user's active allocation, runs the function, then keeps
    /// the computed gas (capped at that limit) and refunds the rest. Overlapping runs therefore
    /// never spend the same balance twice. Runs that cost nothing are not billed.
    pub async fn execute_with_cancel(
        &self,
        cancel: &CancellationToken,
        user: &UserAddress,
        function: &Function,
        input: serde_json::Value,
        options: Option<ExecutionOptions>,
    ) -> Result<MeteredExecution> {
        let mut options = options.unwrap_or_else(|| self.executor.default_options().clone());
        let minimum = self.executor.calculator().minimum(options.capabilities());
        let reservation = self
            .allocations
            .reserve_gas(user, options.gas_limit, minimum)
            .await?;

        let gas_limit = reservation.amount;
        options.gas_limit = gas_limit;
        options.caller = Some(*user);
        let trace_id = options
            .trace_id
            .clone()
            .filter(|trace_id| !trace_id.is_empty())
            .unwrap_or_else(|| random_id(""));
        options.trace_id = Some(trace_id.clone());
        let execution_id = execution_id(&function.id, &trace_id);

        let result = self
            .executor
            .execute_with_cancel(cancel, function, input, Some(options))
            .await;

        let gas_charged = result.gas_used.min(gas_limit);
        let charge = self
            .charge(&reservation, &function.id, &execution_id, gas_charged)
            .await;
        if let Err(err) = &charge {
            tracing::warn!(
                user = %user,
                execution_id = %execution_id,
                gas_charged,
                error = %err,
                "failed to charge execution"
            );
        }

        Ok(MeteredExecution {
            execution_id,
            result,
            charge,
        })
    }

    async fn charge(
        &self,
        reservation: &GasReservation,
        function_id: &str,
        execution_id: &str,
        gas_charged: u64,
    ) -> Result<Charge> {
        let remaining = self
            .allocations
            .settle_reservation(reservation, gas_charged)
            .await?
            .map(|allocation| allocation.remaining())
            .unwrap_or_default();
        if gas_charged == 0 {
            return Ok(Charge {
                gas_charged,
                remaining,
                record: None,
            });
        }

        let record = self.billing.record_usage(
            &reservation.user,
            gas_charged,
            format!("function {function_id} execution {execution_id}"),
        )?;
        Ok(Charge {
            gas_charged,
            remaining,
            record: Some(record),
        })
    }
}
