pub mod allocation;
pub mod billing;
pub mod clock;
pub mod config;
mod error;
pub mod executor;
pub mod gas;
pub mod logging;
pub mod maintenance;
pub mod metering;
pub mod observability;
pub mod types;

#[cfg(feature = "metrics-prometheus")]
pub mod metrics_prometheus;
#[cfg(feature = "otel")]
pub mod otel;

pub use error::{Error, Result};

pub use allocation::{
    Allocation, AllocationError, AllocationManager, AllocationStatus, AllocationStore, GasPolicy,
    GasReservation, MemoryAllocationStore, StoreError,
};
pub use billing::{BillingError, BillingManager, BillingRecord};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, MeterConfig};
pub use executor::{
    ExecutionFailure, ExecutionOptions, ExecutionResult, ExecutionStatus, Function,
    FunctionExecution, FunctionExecutor, FunctionInput, FunctionOutput, Sandbox, SandboxContext,
    SandboxError,
};
pub use gas::{Capabilities, ExecutionTelemetry, GasCalculator};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use metering::{Charge, MeteredExecution, MeteredExecutor};
pub use observability::{
    GasAlerts, MeterMetrics, MeterObservability, NoopObserver, ObservabilitySnapshot,
    TracingAlerts,
};
pub use types::{AddressParseError, UserAddress};

#[cfg(feature = "store-sqlite")]
pub use allocation::SqliteAllocationStore;
#[cfg(feature = "metrics-prometheus")]
pub use metrics_prometheus::{PrometheusMetrics, PrometheusMetricsConfig};
