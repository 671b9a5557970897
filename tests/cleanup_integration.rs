mod common;

use std::time::Duration;

use chrono::Utc;
use common::make_test_sandbox;
use sandboxd::cleanup::{decide_eviction, CleanupConfig};
use sandboxd::sandbox::PoolStatus;

fn config() -> CleanupConfig {
    CleanupConfig {
        idle_timeout: Duration::from_secs(60 * 30),
        max_lifetime: Duration::from_secs(60 * 60),
    }
}

// §8 scenario 4: allocated_at exceeds max-lifetime even though the sandbox
// was just touched — max-lifetime wins.
#[test]
fn max_lifetime_wins_over_fresh_activity() {
    let now = Utc::now();
    let sandbox = make_test_sandbox(
        "sbx-1",
        PoolStatus::Allocated,
        Some("u1"),
        now - chrono::Duration::hours(2),
        Some(now - chrono::Duration::seconds(3601)),
        Some(now),
    );
    assert_eq!(decide_eviction(&sandbox, config(), now), Some("exceeded-max-lifetime"));
}

#[test]
fn idle_timeout_fires_when_lifetime_not_exceeded() {
    let now = Utc::now();
    let sandbox = make_test_sandbox(
        "sbx-2",
        PoolStatus::Allocated,
        Some("u1"),
        now - chrono::Duration::minutes(40),
        Some(now - chrono::Duration::minutes(40)),
        Some(now - chrono::Duration::minutes(31)),
    );
    assert_eq!(decide_eviction(&sandbox, config(), now), Some("idle-timeout"));
}

#[test]
fn neither_timeout_triggers_within_bounds() {
    let now = Utc::now();
    let sandbox = make_test_sandbox(
        "sbx-3",
        PoolStatus::Allocated,
        Some("u1"),
        now - chrono::Duration::minutes(10),
        Some(now - chrono::Duration::minutes(10)),
        Some(now - chrono::Duration::minutes(1)),
    );
    assert_eq!(decide_eviction(&sandbox, config(), now), None);
}

// Warm sandboxes never carry allocated_at, so decide_eviction is a no-op
// for them regardless of age — the separate MaxWarmAge knob (not modeled
// by decide_eviction) is the only thing that should ever reclaim one.
#[test]
fn warm_sandbox_without_allocated_at_never_evicted() {
    let now = Utc::now();
    let sandbox = make_test_sandbox("sbx-4", PoolStatus::Warm, None, now - chrono::Duration::days(1), None, None);
    assert_eq!(decide_eviction(&sandbox, config(), now), None);
}

#[test]
fn missing_last_activity_never_triggers_idle_eviction() {
    let now = Utc::now();
    let sandbox = make_test_sandbox(
        "sbx-5",
        PoolStatus::Manual,
        Some("u2"),
        now - chrono::Duration::minutes(5),
        Some(now - chrono::Duration::minutes(5)),
        None,
    );
    assert_eq!(decide_eviction(&sandbox, config(), now), None);
}
