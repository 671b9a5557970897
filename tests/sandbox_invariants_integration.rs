mod common;

use chrono::Utc;
use common::make_test_sandbox;
use sandboxd::sandbox::PoolStatus;

// §3 invariants (a) and (b): allocated/manual sandboxes always carry a
// user and an allocated_at; warm sandboxes never carry a user.
#[test]
fn allocated_sandbox_with_user_and_timestamp_is_valid() {
    let now = Utc::now();
    let sandbox = make_test_sandbox("sbx-1", PoolStatus::Allocated, Some("u1"), now, Some(now), Some(now));
    assert!(sandbox.satisfies_invariants());
    assert!(sandbox.is_allocated());
    assert!(!sandbox.is_warm());
}

#[test]
fn manual_sandbox_without_user_violates_invariant() {
    let now = Utc::now();
    let sandbox = make_test_sandbox("sbx-2", PoolStatus::Manual, None, now, None, None);
    assert!(!sandbox.satisfies_invariants());
}

#[test]
fn warm_sandbox_with_user_violates_invariant() {
    let now = Utc::now();
    let sandbox = make_test_sandbox("sbx-3", PoolStatus::Warm, Some("u1"), now, None, None);
    assert!(!sandbox.satisfies_invariants());
    assert!(sandbox.is_warm());
}

#[test]
fn creating_sandbox_has_no_ownership_requirement() {
    let now = Utc::now();
    let sandbox = make_test_sandbox("sbx-4", PoolStatus::Creating, None, now, None, None);
    assert!(sandbox.satisfies_invariants());
    assert!(!sandbox.is_allocated());
    assert!(!sandbox.is_warm());
}

#[test]
fn info_projection_omits_nothing_user_visible() {
    let now = Utc::now();
    let sandbox = make_test_sandbox("sbx-5", PoolStatus::Allocated, Some("u1"), now, Some(now), Some(now));
    let info = sandbox.info();
    assert_eq!(info.name, "sbx-5");
    assert_eq!(info.user_id.as_deref(), Some("u1"));
    assert_eq!(info.pod_ip.as_deref(), Some("10.0.0.5"));
}
