use pluginhost_core::health::HealthState;
use pluginhost_lifecycle::{LifecycleServer, ReportHealthRequest};
use std::time::Duration;

#[test]
fn degraded_still_routes_traffic_but_unhealthy_does_not() {
    let lifecycle = LifecycleServer::new();
    lifecycle.report_health(
        "r1",
        ReportHealthRequest {
            state: HealthState::Degraded,
            reason: Some("cache miss storm".into()),
            unavailable_dependencies: vec!["cache".into()],
        },
    );
    assert!(lifecycle.routes_traffic("r1"));

    lifecycle.report_health(
        "r1",
        ReportHealthRequest {
            state: HealthState::Unhealthy,
            reason: None,
            unavailable_dependencies: vec![],
        },
    );
    assert!(!lifecycle.routes_traffic("r1"));
}

#[test]
fn staleness_window_is_respected() {
    let lifecycle = LifecycleServer::new();
    lifecycle.report_health(
        "r1",
        ReportHealthRequest {
            state: HealthState::Healthy,
            reason: None,
            unavailable_dependencies: vec![],
        },
    );
    assert!(!lifecycle.is_stale("r1", Duration::from_secs(90)));
    assert!(lifecycle.is_stale("r1", Duration::from_nanos(0)));
}
