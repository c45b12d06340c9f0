use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::gas::Capabilities;
use crate::types::UserAddress;

/// Contextual parameters handed to the function alongside its arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub function_id: String,
    pub caller: Option<UserAddress>,
    pub trace_id: String,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionInput {
    pub code: String,
    pub args: serde_json::Value,
    #[serde(default, skip_serializing)]
    pub secrets: BTreeMap<String, String>,
    pub parameters: InvocationContext,
}

/// What a sandbox reports after running to completion. A non-empty `error` is a
/// function-level failure, distinct from the sandbox itself failing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionOutput {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Limits a sandbox is expected to honour for one run.
#[derive(Clone, Debug)]
pub struct SandboxContext {
    /// Fires on caller cancellation or when the executor's deadline passes.
    pub cancel: CancellationToken,
    pub deadline: Option<tokio::time::Instant>,
    pub memory_limit_bytes: u64,
    pub capabilities: Capabilities,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("{message}")]
    Failed { message: String, logs: Vec<String> },
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("execution cancelled")]
    Cancelled,
}

impl SandboxError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            logs: Vec::new(),
        }
    }

    /// Logs emitted before the failure, when the sandbox captured any.
    pub fn logs(&self) -> &[String] {
        match self {
            Self::Failed { logs, .. } => logs,
            Self::Timeout { .. } | Self::Cancelled => &[],
        }
    }
}

/// Isolated runtime for untrusted function code.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        ctx: SandboxContext,
        input: FunctionInput,
    ) -> Result<FunctionOutput, SandboxError>;
}
