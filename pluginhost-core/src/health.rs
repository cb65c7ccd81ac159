//! The three-state (plus unspecified) health model shared by the lifecycle,
//! registry, and router components.
//!
//! This module holds only the state machine itself: transition rules,
//! liveness staleness, and the watch-stream aggregation fold. The store that
//! maps `runtime_id -> HealthRecord` and the background eviction sweep live
//! in the lifecycle crate, which is the sole owner of plugin liveness.

use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

/// The three traffic-relevant health states plus the initial unknown state.
///
/// `Unspecified` is the state of a `runtime_id` that has never called
/// `ReportHealth` (or is unknown entirely); it is never traffic-eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unspecified,
    Healthy,
    Degraded,
    Unhealthy,
}

impl Default for HealthState {
    fn default() -> Self {
        HealthState::Unspecified
    }
}

impl HealthState {
    /// `should_route_traffic`: only `Healthy` and `Degraded` providers are
    /// eligible for new discovery results and routed requests. `Unhealthy`
    /// providers stay invisible to new calls but may still service in-flight
    /// ones, since this predicate only gates new routing decisions.
    pub fn routes_traffic(self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::Degraded)
    }
}

/// The most recent health report for one `runtime_id`.
///
/// `last_report` is a monotonic [`Instant`] used for liveness-sweep
/// comparisons; `reported_at` is the wall-clock timestamp surfaced to
/// callers over the wire.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub state: HealthState,
    pub reason: Option<String>,
    pub unavailable_dependencies: Vec<String>,
    pub last_report: Instant,
    pub reported_at: SystemTime,
}

impl HealthRecord {
    /// The record for a `runtime_id` that has never reported.
    pub fn unspecified() -> Self {
        HealthRecord {
            state: HealthState::Unspecified,
            reason: None,
            unavailable_dependencies: Vec::new(),
            last_report: Instant::now(),
            reported_at: SystemTime::now(),
        }
    }

    /// Apply an incoming `ReportHealth` call. Every state is reachable from
    /// every other state; there are no illegal transitions, only the update
    /// itself and a refreshed liveness timestamp.
    pub fn apply_report(
        &mut self,
        state: HealthState,
        reason: Option<String>,
        unavailable_dependencies: Vec<String>,
    ) {
        self.state = state;
        self.reason = reason;
        self.unavailable_dependencies = unavailable_dependencies;
        self.last_report = Instant::now();
        self.reported_at = SystemTime::now();
    }

    pub fn routes_traffic(&self) -> bool {
        self.state.routes_traffic()
    }

    /// Whether this record is stale with respect to a liveness sweep: no
    /// report has refreshed it within `window`.
    pub fn is_stale(&self, window: Duration) -> bool {
        self.last_report.elapsed() >= window
    }
}

/// The aggregate state surfaced on a service watch stream, derived from the
/// set of providers currently eligible for a `service_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateAvailability {
    Unspecified,
    Available,
    Unavailable,
    Degraded,
}

/// Fold a set of provider health states for one `service_type` into the
/// aggregate availability reported on a watch stream: `Available` if any
/// provider is `Healthy`, `Degraded` if the best any provider manages is
/// `Degraded`, else `Unavailable`.
pub fn aggregate_availability<I: IntoIterator<Item = HealthState>>(
    states: I,
) -> AggregateAvailability {
    let mut any_degraded = false;
    for state in states {
        match state {
            HealthState::Healthy => return AggregateAvailability::Available,
            HealthState::Degraded => any_degraded = true,
            HealthState::Unhealthy | HealthState::Unspecified => {}
        }
    }
    if any_degraded {
        AggregateAvailability::Degraded
    } else {
        AggregateAvailability::Unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_does_not_route_traffic() {
        assert!(!HealthState::Unspecified.routes_traffic());
    }

    #[test]
    fn healthy_and_degraded_route_traffic() {
        assert!(HealthState::Healthy.routes_traffic());
        assert!(HealthState::Degraded.routes_traffic());
        assert!(!HealthState::Unhealthy.routes_traffic());
    }

    #[test]
    fn any_transition_is_legal() {
        let mut record = HealthRecord::unspecified();
        record.apply_report(HealthState::Healthy, None, vec![]);
        assert_eq!(record.state, HealthState::Healthy);
        record.apply_report(HealthState::Degraded, Some("cache down".into()), vec!["cache".into()]);
        assert_eq!(record.state, HealthState::Degraded);
        assert_eq!(record.unavailable_dependencies, vec!["cache".to_string()]);
        record.apply_report(HealthState::Unhealthy, None, vec![]);
        assert!(!record.routes_traffic());
        record.apply_report(HealthState::Healthy, None, vec![]);
        assert!(record.routes_traffic());
    }

    #[test]
    fn staleness_uses_last_report_not_creation() {
        let record = HealthRecord::unspecified();
        assert!(!record.is_stale(Duration::from_secs(90)));
    }

    #[test]
    fn aggregate_prefers_available_over_degraded() {
        let states = vec![HealthState::Unhealthy, HealthState::Degraded, HealthState::Healthy];
        assert_eq!(aggregate_availability(states), AggregateAvailability::Available);
    }

    #[test]
    fn aggregate_degraded_when_no_healthy_provider_remains() {
        let states = vec![HealthState::Unhealthy, HealthState::Degraded];
        assert_eq!(aggregate_availability(states), AggregateAvailability::Degraded);
    }

    #[test]
    fn aggregate_unavailable_when_nothing_eligible() {
        let states = vec![HealthState::Unhealthy, HealthState::Unspecified];
        assert_eq!(aggregate_availability(states), AggregateAvailability::Unavailable);
    }
}
