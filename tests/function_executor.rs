use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fn_meter::executor::{GAS_LIMIT_EXCEEDED, execution_id};
use fn_meter::{
    ExecutionFailure, ExecutionOptions, ExecutionStatus, Function, FunctionExecutor,
    FunctionInput, FunctionOutput, GasCalculator, ManualClock, MeterObservability, Sandbox,
    SandboxContext, SandboxError, UserAddress,
};
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Reports fixed telemetry and remembers what it was asked to run.
#[derive(Default)]
struct ScriptedSandbox {
    output: FunctionOutput,
    seen: Mutex<Vec<(FunctionInput, SandboxContext)>>,
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn execute(
        &self,
        ctx: SandboxContext,
        input: FunctionInput,
    ) -> Result<FunctionOutput, SandboxError> {
        self.seen.lock().unwrap().push((input, ctx));
        Ok(self.output.clone())
    }
}

struct PendingSandbox;

#[async_trait]
impl Sandbox for PendingSandbox {
    async fn execute(
        &self,
        _ctx: SandboxContext,
        _input: FunctionInput,
    ) -> Result<FunctionOutput, SandboxError> {
        std::future::pending().await
    }
}

struct GatedSandbox {
    gate: Arc<Notify>,
}

#[async_trait]
impl Sandbox for GatedSandbox {
    async fn execute(
        &self,
        _ctx: SandboxContext,
        input: FunctionInput,
    ) -> Result<FunctionOutput, SandboxError> {
        self.gate.notified().await;
        Ok(FunctionOutput {
            result: Some(json!({ "echo": input.args })),
            logs: vec!["done".to_string()],
            duration_ms: 7,
            memory_used: 4096,
            error: None,
        })
    }
}

struct FailingSandbox;

#[async_trait]
impl Sandbox for FailingSandbox {
    async fn execute(
        &self,
        _ctx: SandboxContext,
        _input: FunctionInput,
    ) -> Result<FunctionOutput, SandboxError> {
        Err(SandboxError::Failed {
            message: "interpreter exploded".to_string(),
            logs: vec!["partial output".to_string()],
        })
    }
}

fn options_with_trace(trace_id: &str) -> ExecutionOptions {
    ExecutionOptions {
        trace_id: Some(trace_id.to_string()),
        ..ExecutionOptions::default()
    }
}

#[tokio::test]
async fn cost_above_gas_limit_is_reported_as_error_with_true_cost() {
    let sandbox = Arc::new(ScriptedSandbox {
        output: FunctionOutput {
            result: Some(json!(42)),
            logs: vec!["computed".to_string()],
            duration_ms: 500,
            memory_used: 512,
            error: None,
        },
        ..ScriptedSandbox::default()
    });
    let executor = FunctionExecutor::new(sandbox).with_calculator(GasCalculator {
        base_cost: 100,
        ..GasCalculator::default()
    });

    let options = ExecutionOptions {
        gas_limit: 500,
        ..options_with_trace("trace-1")
    };
    let result = executor
        .execute(&Function::new("fn-1", "code"), json!({}), Some(options))
        .await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.error.as_deref(), Some(GAS_LIMIT_EXCEEDED));
    assert!(result.is_gas_limit_exceeded());
    assert_eq!(
        result.failure,
        Some(ExecutionFailure::GasLimitExceeded {
            gas_limit: 500,
            gas_used: 600
        })
    );
    assert_eq!(result.gas_used, 600);
    assert_eq!(result.result, None);
    assert_eq!(result.logs, vec!["computed".to_string()]);

    let execution = executor
        .get_execution(&execution_id("fn-1", "trace-1"))
        .expect("recorded");
    assert_eq!(execution.status, ExecutionStatus::Error);
    assert_eq!(execution.cost_in_gas, 600);
    assert_eq!(execution.error.as_deref(), Some(GAS_LIMIT_EXCEEDED));
}

#[tokio::test]
async fn sandbox_receives_invocation_context() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let executor = FunctionExecutor::new(sandbox.clone());
    let caller = UserAddress::new([0x42; 20]);

    let mut secrets = BTreeMap::new();
    secrets.insert("API_KEY".to_string(), "s3cr3t".to_string());
    let options = ExecutionOptions {
        caller: Some(caller),
        secrets,
        network: true,
        batch_id: Some("batch-9".to_string()),
        ..options_with_trace("trace-ctx")
    };
    let result = executor
        .execute(&Function::new("fn-ctx", "return 1"), json!([1]), Some(options))
        .await;
    assert!(result.is_success());
    assert_eq!(result.gas_used, 1000 + 500);

    let seen = sandbox.seen.lock().unwrap();
    let (input, ctx) = &seen[0];
    assert_eq!(input.code, "return 1");
    assert_eq!(input.args, json!([1]));
    assert_eq!(input.secrets.get("API_KEY").map(String::as_str), Some("s3cr3t"));
    assert_eq!(input.parameters.function_id, "fn-ctx");
    assert_eq!(input.parameters.caller, Some(caller));
    assert_eq!(input.parameters.trace_id, "trace-ctx");
    assert!(ctx.capabilities.network);
    assert!(!ctx.capabilities.file_io);
    assert!(ctx.deadline.is_some());
    assert_eq!(ctx.memory_limit_bytes, 128 * 1024 * 1024);

    let execution = executor
        .get_execution("fn-ctx_trace-ctx")
        .expect("recorded");
    assert_eq!(execution.invoked_by, Some(caller));
    assert_eq!(execution.batch_id.as_deref(), Some("batch-9"));
    assert_eq!(execution.parameters, json!([1]));
}

#[tokio::test]
async fn sandbox_failure_is_priced_at_minimum_and_keeps_logs() {
    let executor = FunctionExecutor::new(Arc::new(FailingSandbox));
    let options = ExecutionOptions {
        network: true,
        file_io: true,
        ..options_with_trace("t")
    };
    let result = executor
        .execute(&Function::new("fn-fail", ""), json!(null), Some(options))
        .await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.error.as_deref(), Some("interpreter exploded"));
    assert!(matches!(result.failure, Some(ExecutionFailure::Sandbox { .. })));
    assert_eq!(result.gas_used, 2000);
    assert_eq!(result.logs, vec!["partial output".to_string()]);
    assert!(!result.is_gas_limit_exceeded());
}

#[tokio::test]
async fn timeout_ends_a_run_that_never_finishes() {
    let executor = FunctionExecutor::new(Arc::new(PendingSandbox));
    let options = ExecutionOptions {
        timeout: Some(Duration::from_millis(50)),
        ..options_with_trace("slow")
    };

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        executor.execute(&Function::new("fn-slow", ""), json!(null), Some(options)),
    )
    .await
    .expect("executor honours its deadline");

    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.failure, Some(ExecutionFailure::Timeout { timeout_ms: 50 }));
    assert_eq!(result.gas_used, 1000);
    assert!(result.duration_ms >= 50);
    assert!(executor.get_active_executions().is_empty());
}

#[tokio::test]
async fn caller_cancellation_propagates() {
    let executor = Arc::new(FunctionExecutor::new(Arc::new(PendingSandbox)));
    let cancel = CancellationToken::new();

    let task = {
        let executor = executor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let options = ExecutionOptions {
                timeout: None,
                ..options_with_trace("cancel-me")
            };
            executor
                .execute_with_cancel(
                    &cancel,
                    &Function::new("fn-c", ""),
                    json!(null),
                    Some(options),
                )
                .await
        })
    };

    while executor.get_active_executions().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancellation is prompt")
        .expect("join");
    assert_eq!(result.failure, Some(ExecutionFailure::Cancelled));
    assert_eq!(result.error.as_deref(), Some("execution cancelled"));
    assert!(executor.get_active_executions().is_empty());
}

#[tokio::test]
async fn execution_moves_from_active_to_finished_once() {
    let gate = Arc::new(Notify::new());
    let observability = Arc::new(MeterObservability::default());
    let executor = Arc::new(
        FunctionExecutor::new(Arc::new(GatedSandbox { gate: gate.clone() }))
            .with_metrics(observability.clone()),
    );
    let id = execution_id("fn-life", "trace-life");

    let task = {
        let executor = executor.clone();
        tokio::spawn(async move {
            executor
                .execute(
                    &Function::new("fn-life", ""),
                    json!("hi"),
                    Some(options_with_trace("trace-life")),
                )
                .await
        })
    };

    while executor.get_active_executions().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let active = executor.get_active_executions();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, id);
    assert_eq!(active[0].status, ExecutionStatus::Running);
    assert!(executor.get_result(&id).is_none());

    gate.notify_one();
    let result = task.await.expect("join");
    assert!(result.is_success());
    assert_eq!(result.result, Some(json!({ "echo": "hi" })));
    assert_eq!(result.gas_used, 1000 + 7 + 4);

    assert!(executor.get_active_executions().is_empty());
    let execution = executor.get_execution(&id).expect("finished");
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.function_id, "fn-life");
    assert_eq!(execution.trace_id, "trace-life");
    assert!(execution.ended_at_ms.expect("ended") >= execution.started_at_ms);
    assert_eq!(execution.logs, vec!["done".to_string()]);
    assert_eq!(executor.get_result(&id), Some(result));

    let snapshot = observability.snapshot();
    assert_eq!(snapshot.executions, 1);
    assert_eq!(snapshot.executions_failed, 0);
    assert_eq!(snapshot.execution_gas, 1011);
}

#[tokio::test]
async fn clear_evicts_stale_active_executions_only() {
    let clock = Arc::new(ManualClock::new(1_000));
    let executor = Arc::new(
        FunctionExecutor::new(Arc::new(PendingSandbox)).with_clock(clock.clone()),
    );
    let cancel = CancellationToken::new();

    let task = {
        let executor = executor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let options = ExecutionOptions {
                timeout: None,
                ..options_with_trace("hung")
            };
            executor
                .execute_with_cancel(
                    &cancel,
                    &Function::new("fn-hung", ""),
                    json!(null),
                    Some(options),
                )
                .await
        })
    };
    while executor.get_active_executions().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(executor.clear(Duration::from_secs(60)), 0);
    clock.advance(Duration::from_secs(120));
    assert_eq!(executor.clear(Duration::from_secs(60)), 1);
    assert!(executor.get_active_executions().is_empty());
    assert!(executor.get_execution("fn-hung_hung").is_none());

    cancel.cancel();
    task.await.expect("join");
    assert_eq!(executor.clear(Duration::ZERO), 0);
    assert!(executor.get_execution("fn-hung_hung").is_some());
}

#[tokio::test]
async fn reused_trace_id_is_rejected_while_first_run_is_active() {
    let gate = Arc::new(Notify::new());
    let executor = Arc::new(FunctionExecutor::new(Arc::new(GatedSandbox {
        gate: gate.clone(),
    })));
    let id = execution_id("fn-dup", "trace-dup");

    let first = {
        let executor = executor.clone();
        tokio::spawn(async move {
            executor
                .execute(
                    &Function::new("fn-dup", ""),
                    json!(1),
                    Some(options_with_trace("trace-dup")),
                )
                .await
        })
    };
    while executor.get_active_executions().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let second = executor
        .execute(
            &Function::new("fn-dup", ""),
            json!(2),
            Some(options_with_trace("trace-dup")),
        )
        .await;
    assert_eq!(second.status, ExecutionStatus::Error);
    assert_eq!(second.gas_used, 0);
    assert_eq!(
        second.failure,
        Some(ExecutionFailure::AlreadyRunning {
            execution_id: id.clone()
        })
    );

    let active = executor.get_active_executions();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].parameters, json!(1));

    gate.notify_one();
    let first = first.await.expect("join");
    assert!(first.is_success());
    assert!(executor.get_active_executions().is_empty());
    assert_eq!(executor.get_result(&id), Some(first));
}
