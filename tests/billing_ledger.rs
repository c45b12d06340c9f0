use std::sync::Arc;
use std::time::Duration;

use fn_meter::{BillingError, BillingManager, ManualClock, UserAddress};

fn user(byte: u8) -> UserAddress {
    UserAddress::new([byte; 20])
}

#[test]
fn totals_after_cleanup_only_count_surviving_records() {
    let clock = Arc::new(ManualClock::new(10_000));
    let billing = BillingManager::new(5).with_clock(clock.clone());

    billing.record_usage(&user(1), 100, "first").expect("record");
    clock.set(20_000);
    billing.update_gas_price(9);
    billing.record_usage(&user(1), 10, "second").expect("record");
    clock.set(30_000);
    billing.record_usage(&user(1), 1, "third").expect("record");

    assert_eq!(billing.get_total_cost(&user(1), 0, u64::MAX), 500 + 90 + 9);

    clock.set(40_000);
    let removed = billing.cleanup_old_records(Duration::from_secs(15));
    assert_eq!(removed, 2);

    let records = billing.get_user_records(&user(1), 0, u64::MAX);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].description, "third");
    assert_eq!(records[0].cost, 9);
    assert_eq!(billing.get_total_cost(&user(1), 0, u64::MAX), 9);
}

#[test]
fn validation_is_the_only_error() {
    let billing = BillingManager::default();
    assert_eq!(
        billing.record_usage(&user(1), 0, "zero").unwrap_err(),
        BillingError::InvalidGasAmount
    );
    assert!(billing.get_user_records(&user(9), 0, u64::MAX).is_empty());
    assert_eq!(billing.get_total_cost(&user(9), 0, u64::MAX), 0);
    assert_eq!(billing.cleanup_old_records(Duration::ZERO), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_and_price_updates() {
    let billing = Arc::new(BillingManager::new(1));

    let mut handles = Vec::new();
    for idx in 0..16u8 {
        let billing = billing.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                billing
                    .record_usage(&user(idx % 4 + 1), 2, "run")
                    .expect("record");
            }
        }));
    }
    let pricer = {
        let billing = billing.clone();
        tokio::spawn(async move {
            for price in 1..=20 {
                billing.update_gas_price(price);
                tokio::task::yield_now().await;
            }
        })
    };
    for handle in handles {
        handle.await.expect("join");
    }
    pricer.await.expect("join");

    let mut records = 0;
    for idx in 1..=4 {
        let user_records = billing.get_user_records(&user(idx), 0, u64::MAX);
        for record in &user_records {
            assert_eq!(record.cost % 2, 0);
            assert!(record.cost >= 2 && record.cost <= 40);
        }
        records += user_records.len();
    }
    assert_eq!(records, 16 * 50);
    assert_eq!(billing.gas_price(), 20);
}
