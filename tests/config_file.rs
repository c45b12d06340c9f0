use std::sync::Arc;
use std::time::Duration;

use fn_meter::{ConfigError, MemoryAllocationStore, MeterConfig, UserAddress};

#[test]
fn loads_toml_by_extension() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("meter.toml");
    std::fs::write(
        &path,
        r#"
[policy]
max_allocation_per_user = 5000
min_allocation_amount = 100
max_allocation_secs = 600
refill_threshold = 250

[gas]
base_cost = 10
network_access_cost = 7

[executor]
default_timeout_ms = 1500
default_gas_limit = 4000

[billing]
gas_price = 2
"#,
    )
    .expect("write");

    let config = MeterConfig::load(&path).expect("load");
    let policy = config.policy.as_ref().expect("policy");
    assert_eq!(policy.max_allocation_per_user, 5000);
    assert_eq!(policy.refill_threshold, 250);
    assert_eq!(config.gas.base_cost, 10);
    assert_eq!(config.gas.network_access_cost, 7);
    assert_eq!(config.gas.file_access_cost, 500);
    assert_eq!(config.executor.default_gas_limit, 4000);
    assert_eq!(config.billing.gas_price, 2);
    assert_eq!(config.billing.record_retention(), Duration::from_secs(30 * 24 * 60 * 60));

    let options = config.executor.default_options();
    assert_eq!(options.timeout, Some(Duration::from_millis(1500)));
    assert_eq!(options.gas_limit, 4000);
    assert_eq!(config.billing_manager().gas_price(), 2);
}

#[test]
fn loads_json_and_rejects_invalid_policy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("meter.json");
    std::fs::write(
        &path,
        r#"{"policy": {"max_allocation_per_user": 10, "max_allocation_secs": 0}}"#,
    )
    .expect("write");

    assert!(matches!(
        MeterConfig::load(&path),
        Err(ConfigError::Invalid(message)) if message.contains("max_allocation_secs")
    ));
}

#[test]
fn missing_files_and_unknown_formats_fail() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(matches!(
        MeterConfig::load(dir.path().join("absent.toml")),
        Err(ConfigError::Read(_))
    ));

    let path = dir.path().join("meter.ini");
    std::fs::write(&path, "").expect("write");
    assert!(matches!(
        MeterConfig::load(&path),
        Err(ConfigError::UnsupportedFormat(_))
    ));
}

#[cfg(feature = "config-yaml")]
#[test]
fn loads_yaml_when_enabled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("meter.yml");
    std::fs::write(&path, "billing:\n  gas_price: 9\n").expect("write");
    let config = MeterConfig::load(&path).expect("load");
    assert_eq!(config.billing.gas_price, 9);
}

#[tokio::test]
async fn config_builds_policy_bound_manager() {
    let config = MeterConfig::parse(
        "[policy]\nmax_allocation_per_user = 100\nmax_allocation_secs = 60\n",
        "toml",
    )
    .expect("parse");
    let manager = config.allocation_manager(Arc::new(MemoryAllocationStore::new()));
    let user = UserAddress::new([1; 20]);

    assert!(manager.allocate_gas(&user, 101).await.is_err());
    let allocation = manager.allocate_gas(&user, 100).await.expect("allocate");
    assert_eq!(
        allocation.expires_at_ms - allocation.created_at_ms,
        60_000
    );
}
