//! Bounded, priced function execution with in-process execution tracking.

mod sandbox;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::clock::{Clock, SystemClock, duration_millis};
use crate::gas::{Capabilities, ExecutionTelemetry, GasCalculator};
use crate::observability::{MeterMetrics, NoopObserver};
use crate::types::{UserAddress, random_id};

pub use sandbox::{
    FunctionInput, FunctionOutput, InvocationContext, Sandbox, SandboxContext, SandboxError,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 128 * 1024 * 1024;
pub const DEFAULT_GAS_LIMIT: u64 = 1_000_000;

/// Message carried by results whose computed cost exceeded the caller's gas limit.
pub const GAS_LIMIT_EXCEEDED: &str = "gas limit exceeded";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub code: String,
}

impl Function {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionOptions {
    /// `None` runs without a deadline.
    pub timeout: Option<Duration>,
    pub memory_limit_bytes: u64,
    pub secrets: BTreeMap<String, String>,
    pub gas_limit: u64,
    pub caller: Option<UserAddress>,
    /// Generated when absent.
    pub trace_id: Option<String>,
    pub batch_id: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub network: bool,
    pub file_io: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            secrets: BTreeMap::new(),
            gas_limit: DEFAULT_GAS_LIMIT,
            caller: None,
            trace_id: None,
            batch_id: None,
            metadata: BTreeMap::new(),
            network: false,
            file_io: false,
        }
    }
}

impl ExecutionOptions {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            network: self.network,
            file_io: self.file_io,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Why a run ended in `error`.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    #[error("{message}")]
    Sandbox { message: String },
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("execution cancelled")]
    Cancelled,
    #[error("{message}")]
    Function { message: String },
    #[error("gas limit exceeded")]
    GasLimitExceeded { gas_limit: u64, gas_used: u64 },
    #[error("execution {execution_id} is already running")]
    AlreadyRunning { execution_id: String },
}

impl From<SandboxError> for ExecutionFailure {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Failed { message, .. } => Self::Sandbox { message },
            SandboxError::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            SandboxError::Cancelled => Self::Cancelled,
        }
    }
}

/// Result handed back to the caller of [`FunctionExecutor::execute`]. Always populated,
/// including cost, even when the run failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ExecutionFailure>,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub memory_used: u64,
    pub gas_used: u64,
}

impl ExecutionResult {
    fn failed(
        failure: ExecutionFailure,
        logs: Vec<String>,
        duration_ms: u64,
        gas_used: u64,
    ) -> Self {
        Self {
            status: ExecutionStatus::Error,
            result: None,
            logs,
            error: Some(failure.to_string()),
            failure: Some(failure),
            duration_ms,
            memory_used: 0,
            gas_used,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn is_gas_limit_exceeded(&self) -> bool {
        matches!(self.failure, Some(ExecutionFailure::GasLimitExceeded { .. }))
    }
}

/// Audit record of one invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionExecution {
    pub id: String,
    pub function_id: String,
    pub status: ExecutionStatus,
    pub started_at_ms: u64,
    #[serde(default)]
    pub ended_at_ms: Option<u64>,
    pub duration_ms: u64,
    pub memory_used: u64,
    pub cost_in_gas: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub invoked_by: Option<UserAddress>,
    pub trace_id: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl FunctionExecution {
    fn finish(&mut self, result: &ExecutionResult, ended_at_ms: u64) {
        self.status = result.status;
        self.ended_at_ms = Some(ended_at_ms.max(self.started_at_ms));
        self.duration_ms = result.duration_ms;
        self.memory_used = result.memory_used;
        self.cost_in_gas = result.gas_used;
        self.logs = result.logs.clone();
        if result.is_success() {
            self.result = result.result.clone();
        } else {
            self.error = result.error.clone();
        }
    }
}

pub fn execution_id(function_id: &str, trace_id: &str) -> String {
    format!("{function_id}_{trace_id}")
}

#[derive(Debug)]
struct FinishedExecution {
    execution: FunctionExecution,
    result: ExecutionResult,
}

/// Active and finished runs behind one lock, so completion moves a record atomically.
#[derive(Debug, Default)]
struct ExecutionTable {
    active: HashMap<String, FunctionExecution>,
    finished: HashMap<String, FinishedExecution>,
}

pub struct FunctionExecutor {
    sandbox: Arc<dyn Sandbox>,
    calculator: GasCalculator,
    default_options: ExecutionOptions,
    executions: RwLock<ExecutionTable>,
    metrics: Arc<dyn MeterMetrics>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FunctionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionExecutor")
            .field("calculator", &self.calculator)
            .field("default_options", &self.default_options)
            .finish_non_exhaustive()
    }
}

impl FunctionExecutor {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            calculator: GasCalculator::default(),
            default_options: ExecutionOptions::default(),
            executions: RwLock::new(ExecutionTable::default()),
            metrics: Arc::new(NoopObserver),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_calculator(mut self, calculator: GasCalculator) -> Self {
        self.calculator = calculator;
        self
    }

    pub fn with_default_options(mut self, options: ExecutionOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MeterMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn calculator(&self) -> &GasCalculator {
        &self.calculator
    }

    pub fn default_options(&self) -> &ExecutionOptions {
        &self.default_options
    }

    fn table(&self) -> RwLockReadGuard<'_, ExecutionTable> {
        self.executions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn table_mut(&self) -> RwLockWriteGuard<'_, ExecutionTable> {
        self.executions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn execute(
        &self,
        function: &Function,
        input: serde_json::Value,
        options: Option<ExecutionOptions>,
    ) -> ExecutionResult {
        self.execute_with_cancel(&CancellationToken::new(), function, input, options)
            .await
    }

    /// Runs `function` in the sandbox. Cancelling `cancel` ends the run the same way a
    /// timeout does.
    pub async fn execute_with_cancel(
        &self,
        cancel: &CancellationToken,
        function: &Function,
        input: serde_json::Value,
        options: Option<ExecutionOptions>,
    ) -> ExecutionResult {
        let options = options.unwrap_or_else(|| self.default_options.clone());
        let trace_id = options
            .trace_id
            .clone()
            .filter(|trace_id| !trace_id.is_empty())
            .unwrap_or_else(|| random_id(""));
        let id = execution_id(&function.id, &trace_id);
        let capabilities = options.capabilities();

        let started_at_ms = self.clock.now_millis();
        let started = tokio::time::Instant::now();
        let timeout = options.timeout.filter(|timeout| !timeout.is_zero());
        let deadline = timeout.map(|timeout| started + timeout);
        let child = cancel.child_token();

        let sandbox_input = FunctionInput {
            code: function.code.clone(),
            args: input.clone(),
            secrets: options.secrets.clone(),
            parameters: InvocationContext {
                function_id: function.id.clone(),
                caller: options.caller,
                trace_id: trace_id.clone(),
                timestamp_ms: started_at_ms,
            },
        };
        let ctx = SandboxContext {
            cancel: child.clone(),
            deadline,
            memory_limit_bytes: options.memory_limit_bytes,
            capabilities,
        };

        let mut execution = FunctionExecution {
            id: id.clone(),
            function_id: function.id.clone(),
            status: ExecutionStatus::Running,
            started_at_ms,
            ended_at_ms: None,
            duration_ms: 0,
            memory_used: 0,
            cost_in_gas: 0,
            result: None,
            error: None,
            logs: Vec::new(),
            parameters: input,
            invoked_by: options.caller,
            trace_id: trace_id.clone(),
            batch_id: options.batch_id.clone(),
            metadata: options.metadata.clone(),
        };
        {
            let mut table = self.table_mut();
            if table.active.contains_key(&id) {
                drop(table);
                tracing::warn!(execution_id = %id, "execution id already active; run rejected");
                let failure = ExecutionFailure::AlreadyRunning { execution_id: id };
                let result = ExecutionResult::failed(failure, Vec::new(), 0, 0);
                self.metrics.record_execution(&function.id, &result);
                return result;
            }
            table.active.insert(id.clone(), execution.clone());
        }

        let span = tracing::info_span!(
            "function_execution",
            execution_id = %id,
            function_id = %function.id,
            trace_id = %trace_id,
            gas_limit = options.gas_limit,
            status = tracing::field::Empty,
            gas_used = tracing::field::Empty,
        );

        let outcome = async {
            tokio::select! {
                biased;
                _ = child.cancelled() => Err(SandboxError::Cancelled),
                _ = sleep_until(deadline) => {
                    child.cancel();
                    Err(SandboxError::Timeout {
                        timeout_ms: timeout.map(duration_millis).unwrap_or_default(),
                    })
                }
                output = self.sandbox.execute(ctx, sandbox_input) => output,
            }
        }
        .instrument(span.clone())
        .await;
        child.cancel();

        let result = match outcome {
            Err(err) => {
                let logs = err.logs().to_vec();
                let elapsed_ms = duration_millis(started.elapsed());
                let gas_used = self.calculator.minimum(capabilities);
                let failure = ExecutionFailure::from(err);
                span.in_scope(|| {
                    tracing::warn!(error = %failure, elapsed_ms, "sandbox execution failed")
                });
                ExecutionResult::failed(failure, logs, elapsed_ms, gas_used)
            }
            Ok(output) => self.price_output(output, capabilities, options.gas_limit),
        };

        span.record("status", result.status.as_str());
        span.record("gas_used", result.gas_used);
        span.in_scope(|| {
            tracing::info!(
                duration_ms = result.duration_ms,
                memory_used = result.memory_used,
                "function execution finished"
            )
        });

        execution.finish(&result, self.clock.now_millis());
        {
            let mut table = self.table_mut();
            table.active.remove(&id);
            table.finished.insert(
                id,
                FinishedExecution {
                    execution,
                    result: result.clone(),
                },
            );
        }

        self.metrics.record_execution(&function.id, &result);
        result
    }

    fn price_output(
        &self,
        output: FunctionOutput,
        capabilities: Capabilities,
        gas_limit: u64,
    ) -> ExecutionResult {
        let gas_used = self.calculator.calculate(
            ExecutionTelemetry {
                duration_ms: output.duration_ms,
                memory_bytes: output.memory_used,
            },
            capabilities,
        );

        if gas_used > gas_limit {
            let failure = ExecutionFailure::GasLimitExceeded {
                gas_limit,
                gas_used,
            };
            return ExecutionResult {
                status: ExecutionStatus::Error,
                result: None,
                logs: output.logs,
                error: Some(failure.to_string()),
                failure: Some(failure),
                duration_ms: output.duration_ms,
                memory_used: output.memory_used,
                gas_used,
            };
        }

        let function_error = output.error.filter(|message| !message.is_empty());
        let (status, failure) = match function_error {
            Some(message) => (
                ExecutionStatus::Error,
                Some(ExecutionFailure::Function { message }),
            ),
            None => (ExecutionStatus::Success, None),
        };
        ExecutionResult {
            status,
            result: output.result,
            logs: output.logs,
            error: failure.as_ref().map(ToString::to_string),
            failure,
            duration_ms: output.duration_ms,
            memory_used: output.memory_used,
            gas_used,
        }
    }

    /// Snapshot of in-flight executions, oldest first.
    pub fn get_active_executions(&self) -> Vec<FunctionExecution> {
        let mut active: Vec<FunctionExecution> = self.table().active.values().cloned().collect();
        active.sort_by(|a, b| {
            a.started_at_ms
                .cmp(&b.started_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        active
    }

    /// Looks in the active set first, then in finished executions.
    pub fn get_execution(&self, id: &str) -> Option<FunctionExecution> {
        let table = self.table();
        if let Some(execution) = table.active.get(id) {
            return Some(execution.clone());
        }
        table
            .finished
            .get(id)
            .map(|finished| finished.execution.clone())
    }

    pub fn get_result(&self, id: &str) -> Option<ExecutionResult> {
        self.table()
            .finished
            .get(id)
            .map(|finished| finished.result.clone())
    }

    /// Evicts active executions started more than `max_age` ago. Finished executions are
    /// left alone; see [`Self::prune_finished`].
    pub fn clear(&self, max_age: Duration) -> usize {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(duration_millis(max_age));
        let mut table = self.table_mut();
        let before = table.active.len();
        table
            .active
            .retain(|_, execution| execution.started_at_ms >= cutoff);
        let evicted = before - table.active.len();
        if evicted > 0 {
            tracing::warn!(evicted, "evicted stale active executions");
        }
        evicted
    }

    /// Drops finished executions that ended more than `max_age` ago.
    pub fn prune_finished(&self, max_age: Duration) -> usize {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(duration_millis(max_age));
        let mut table = self.table_mut();
        let before = table.finished.len();
        table.finished.retain(|_, finished| {
            finished
                .execution
                .ended_at_ms
                .is_some_and(|ended_at_ms| ended_at_ms >= cutoff)
        });
        before - table.finished.len()
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
