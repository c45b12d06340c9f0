use serde::{Deserialize, Serialize};

/// Gas price table for sandboxed runs.
///
/// `cost = base + time_cost_per_ms * duration_ms + memory_cost_per_kib * (memory_bytes / 1024)`
/// plus a flat surcharge for every capability the run was *granted*, whether or not it used it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasCalculator {
    pub base_cost: u64,
    pub time_cost_per_ms: u64,
    pub memory_cost_per_kib: u64,
    pub network_access_cost: u64,
    pub file_access_cost: u64,
}

impl Default for GasCalculator {
    fn default() -> Self {
        Self {
            base_cost: 1000,
            time_cost_per_ms: 1,
            memory_cost_per_kib: 1,
            network_access_cost: 500,
            file_access_cost: 500,
        }
    }
}

/// Capabilities requested for a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub network: bool,
    pub file_io: bool,
}

/// Measured cost drivers of a finished run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTelemetry {
    pub duration_ms: u64,
    pub memory_bytes: u64,
}

impl GasCalculator {
    pub fn calculate(&self, telemetry: ExecutionTelemetry, capabilities: Capabilities) -> u64 {
        let time_cost = self.time_cost_per_ms.saturating_mul(telemetry.duration_ms);
        let memory_cost = self
            .memory_cost_per_kib
            .saturating_mul(telemetry.memory_bytes / 1024);

        let mut extra_cost = 0u64;
        if capabilities.network {
            extra_cost = extra_cost.saturating_add(self.network_access_cost);
        }
        if capabilities.file_io {
            extra_cost = extra_cost.saturating_add(self.file_access_cost);
        }

        self.base_cost
            .saturating_add(time_cost)
            .saturating_add(memory_cost)
            .saturating_add(extra_cost)
    }

    /// Cost charged when the sandbox never produced telemetry.
    pub fn minimum(&self, capabilities: Capabilities) -> u64 {
        self.calculate(ExecutionTelemetry::default(), capabilities)
    }
}
