use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::allocation::{AllocationManager, AllocationStore, GasPolicy};
use crate::billing::{BillingManager, DEFAULT_GAS_PRICE};
use crate::executor::{
    DEFAULT_GAS_LIMIT, DEFAULT_MEMORY_LIMIT_BYTES, DEFAULT_TIMEOUT, ExecutionOptions,
    FunctionExecutor, Sandbox,
};
use crate::gas::GasCalculator;
use crate::maintenance::Maintenance;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse json config failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("parse toml config failed: {0}")]
    Toml(#[from] toml::de::Error),
    #[cfg(feature = "config-yaml")]
    #[error("parse yaml config failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported config format: {0:?}")]
    UnsupportedFormat(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<GasPolicy>,
    pub gas: GasCalculator,
    pub executor: ExecutorConfig,
    pub billing: BillingConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// 0 disables the default deadline.
    pub default_timeout_ms: u64,
    pub default_memory_limit_bytes: u64,
    pub default_gas_limit: u64,
    /// How long stale active executions and finished ones are kept.
    pub execution_retention_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            default_memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            default_gas_limit: DEFAULT_GAS_LIMIT,
            execution_retention_secs: 60 * 60,
        }
    }
}

impl ExecutorConfig {
    pub fn default_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            timeout: (self.default_timeout_ms > 0)
                .then(|| Duration::from_millis(self.default_timeout_ms)),
            memory_limit_bytes: self.default_memory_limit_bytes,
            gas_limit: self.default_gas_limit,
            ..ExecutionOptions::default()
        }
    }

    pub fn execution_retention(&self) -> Duration {
        Duration::from_secs(self.execution_retention_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub gas_price: u64,
    pub record_retention_secs: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            gas_price: DEFAULT_GAS_PRICE,
            record_retention_secs: 30 * 24 * 60 * 60,
        }
    }
}

impl BillingConfig {
    pub fn record_retention(&self) -> Duration {
        Duration::from_secs(self.record_retention_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// 0 disables the background task.
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

impl MeterConfig {
    /// Parses by file extension: `.toml`, `.json`, and with `config-yaml` `.yaml`/`.yml`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let config = Self::parse(&raw, &extension)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(raw: &str, format: &str) -> Result<Self, ConfigError> {
        match format {
            "toml" => Ok(toml::from_str(raw)?),
            "json" => Ok(serde_json::from_str(raw)?),
            #[cfg(feature = "config-yaml")]
            "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(policy) = &self.policy {
            if policy.max_allocation_per_user == 0 {
                return Err(ConfigError::Invalid(
                    "policy.max_allocation_per_user must be positive".to_string(),
                ));
            }
            if policy.min_allocation_amount > policy.max_allocation_per_user {
                return Err(ConfigError::Invalid(format!(
                    "policy.min_allocation_amount ({}) exceeds policy.max_allocation_per_user ({})",
                    policy.min_allocation_amount, policy.max_allocation_per_user
                )));
            }
            if policy.max_allocation_secs == 0 {
                return Err(ConfigError::Invalid(
                    "policy.max_allocation_secs must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn allocation_manager(&self, store: Arc<dyn AllocationStore>) -> AllocationManager {
        let manager = AllocationManager::new(store);
        match &self.policy {
            Some(policy) => manager.with_policy(policy.clone()),
            None => manager,
        }
    }

    pub fn billing_manager(&self) -> BillingManager {
        BillingManager::new(self.billing.gas_price)
    }

    pub fn function_executor(&self, sandbox: Arc<dyn Sandbox>) -> FunctionExecutor {
        FunctionExecutor::new(sandbox)
            .with_calculator(self.gas.clone())
            .with_default_options(self.executor.default_options())
    }

    /// Sweep over the given components with the configured retention windows. `None` when
    /// `maintenance.interval_secs` is 0.
    pub fn maintenance(
        &self,
        allocations: Arc<AllocationManager>,
        executor: Arc<FunctionExecutor>,
        billing: Arc<BillingManager>,
    ) -> Option<Maintenance> {
        self.maintenance.interval()?;
        Some(Maintenance {
            allocations,
            executor,
            billing,
            execution_retention: self.executor.execution_retention(),
            record_retention: self.billing.record_retention(),
        })
    }

    /// Starts [`Self::maintenance`] on the configured interval. Must be called inside a tokio
    /// runtime.
    pub fn spawn_maintenance(
        &self,
        allocations: Arc<AllocationManager>,
        executor: Arc<FunctionExecutor>,
        billing: Arc<BillingManager>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let interval = self.maintenance.interval()?;
        let maintenance = self.maintenance(allocations, executor, billing)?;
        tracing::info!(interval_secs = interval.as_secs(), "starting maintenance task");
        Some(maintenance.spawn(interval, cancel))
    }
}
