use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::allocation::Allocation;
use crate::executor::ExecutionResult;
use crate::observability::MeterMetrics;
use crate::types::UserAddress;

#[derive(Clone, Debug)]
pub struct PrometheusMetricsConfig {
    pub max_user_series: usize,
    pub max_function_series: usize,
}

impl Default for PrometheusMetricsConfig {
    fn default() -> Self {
        Self {
            max_user_series: 1024,
            max_function_series: 256,
        }
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    allocations_total: u64,
    gas_allocated_total: u64,
    gas_used_total: u64,
    gas_used_by_user: HashMap<String, u64>,
    releases_total: u64,
    executions_by_status: HashMap<String, u64>,
    executions_by_function: HashMap<String, u64>,
    execution_gas_by_function: HashMap<String, u64>,
    gas_limit_exceeded_by_function: HashMap<String, u64>,
    execution_duration_seconds: HashMap<String, DurationHistogram>,
}

/// `MeterMetrics` sink rendered in the Prometheus text format. Per-user and per-function
/// label sets are capped; extra series fold into `__overflow__`.
#[derive(Debug)]
pub struct PrometheusMetrics {
    config: PrometheusMetricsConfig,
    state: Mutex<MetricsState>,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new(PrometheusMetricsConfig::default())
    }
}

impl PrometheusMetrics {
    pub fn new(config: PrometheusMetricsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MetricsState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn render(&self) -> String {
        let state = self.state();
        let mut out = String::new();

        write_counter(
            &mut out,
            "fn_meter_allocations_total",
            "Total gas allocations granted.",
            state.allocations_total,
        );
        write_counter(
            &mut out,
            "fn_meter_gas_allocated_total",
            "Total gas granted across allocations.",
            state.gas_allocated_total,
        );
        write_counter(
            &mut out,
            "fn_meter_gas_used_total",
            "Total gas debited from allocations.",
            state.gas_used_total,
        );
        write_counter_map(
            &mut out,
            "fn_meter_gas_used_by_user_total",
            "Gas debited grouped by user address.",
            "user",
            &state.gas_used_by_user,
        );
        write_counter(
            &mut out,
            "fn_meter_releases_total",
            "Total gas allocations released.",
            state.releases_total,
        );
        write_counter_map(
            &mut out,
            "fn_meter_executions_total",
            "Function executions grouped by terminal status.",
            "status",
            &state.executions_by_status,
        );
        write_counter_map(
            &mut out,
            "fn_meter_executions_by_function_total",
            "Function executions grouped by function id.",
            "function_id",
            &state.executions_by_function,
        );
        write_counter_map(
            &mut out,
            "fn_meter_execution_gas_total",
            "Computed execution gas grouped by function id.",
            "function_id",
            &state.execution_gas_by_function,
        );
        write_counter_map(
            &mut out,
            "fn_meter_gas_limit_exceeded_total",
            "Executions whose cost exceeded their gas limit, grouped by function id.",
            "function_id",
            &state.gas_limit_exceeded_by_function,
        );
        write_histogram_map(
            &mut out,
            "fn_meter_execution_duration_seconds",
            "Reported execution duration in seconds.",
            "function_id",
            &state.execution_duration_seconds,
        );

        out
    }
}

impl MeterMetrics for PrometheusMetrics {
    fn record_allocation(&self, allocation: &Allocation) {
        let mut state = self.state();
        state.allocations_total = state.allocations_total.saturating_add(1);
        state.gas_allocated_total = state.gas_allocated_total.saturating_add(allocation.amount);
    }

    fn record_usage(&self, user: &UserAddress, amount: u64) {
        let mut state = self.state();
        state.gas_used_total = state.gas_used_total.saturating_add(amount);
        add_limited(
            &mut state.gas_used_by_user,
            &user.to_string(),
            self.config.max_user_series,
            amount,
        );
    }

    fn record_release(&self, _user: &UserAddress) {
        let mut state = self.state();
        state.releases_total = state.releases_total.saturating_add(1);
    }

    fn record_execution(&self, function_id: &str, result: &ExecutionResult) {
        let max_series = self.config.max_function_series;
        let mut state = self.state();
        bump_limited(&mut state.executions_by_status, result.status.as_str(), 8);
        bump_limited(&mut state.executions_by_function, function_id, max_series);
        add_limited(
            &mut state.execution_gas_by_function,
            function_id,
            max_series,
            result.gas_used,
        );
        if result.is_gas_limit_exceeded() {
            bump_limited(
                &mut state.gas_limit_exceeded_by_function,
                function_id,
                max_series,
            );
        }
        if let Some(histogram) = entry_limited(
            &mut state.execution_duration_seconds,
            function_id,
            max_series,
        ) {
            histogram.observe(Duration::from_millis(result.duration_ms));
        }
    }
}

const OVERFLOW_SERIES_LABEL: &str = "__overflow__";

fn entry_limited<'a, T: Default>(
    map: &'a mut HashMap<String, T>,
    key: &str,
    max_series: usize,
) -> Option<&'a mut T> {
    if max_series == 0 {
        return None;
    }
    if map.contains_key(key) {
        return map.get_mut(key);
    }
    if map.len() < max_series {
        return Some(map.entry(key.to_string()).or_default());
    }
    Some(map.entry(OVERFLOW_SERIES_LABEL.to_string()).or_default())
}

fn bump_limited(map: &mut HashMap<String, u64>, key: &str, max_series: usize) {
    add_limited(map, key, max_series, 1);
}

fn add_limited(map: &mut HashMap<String, u64>, key: &str, max_series: usize, delta: u64) {
    if let Some(entry) = entry_limited(map, key, max_series) {
        *entry = entry.saturating_add(delta);
    }
}

fn write_counter(out: &mut String, metric: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} counter\n"));
    out.push_str(&format!("{metric} {value}\n"));
}

fn write_counter_map(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    map: &HashMap<String, u64>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} counter\n"));

    let mut entries: Vec<(&String, &u64)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (value, count) in entries {
        out.push_str(&format!(
            "{metric}{{{label}=\"{}\"}} {count}\n",
            escape_label_value(value)
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

const DURATION_BUCKETS: [f64; 11] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[derive(Clone, Debug, Default)]
struct DurationHistogram {
    bucket_counts: [u64; 11],
    sum_seconds: f64,
    count: u64,
}

impl DurationHistogram {
    fn observe(&mut self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        self.sum_seconds += seconds;
        self.count = self.count.saturating_add(1);
        for (idx, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.bucket_counts[idx] = self.bucket_counts[idx].saturating_add(1);
            }
        }
    }
}

fn write_histogram_map(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    map: &HashMap<String, DurationHistogram>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} histogram\n"));

    let mut entries: Vec<(&String, &DurationHistogram)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (value, hist) in entries {
        let value = escape_label_value(value);
        for (idx, bound) in DURATION_BUCKETS.iter().enumerate() {
            out.push_str(&format!(
                "{metric}_bucket{{{label}=\"{value}\",le=\"{bound}\"}} {}\n",
                hist.bucket_counts[idx]
            ));
        }
        out.push_str(&format!(
            "{metric}_bucket{{{label}=\"{value}\",le=\"+Inf\"}} {}\n",
            hist.count
        ));
        out.push_str(&format!(
            "{metric}_sum{{{label}=\"{value}\"}} {}\n",
            hist.sum_seconds
        ));
        out.push_str(&format!(
            "{metric}_count{{{label}=\"{value}\"}} {}\n",
            hist.count
        ));
    }
}
