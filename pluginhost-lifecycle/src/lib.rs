//! Lifecycle server: accepts plugin-reported health and exposes current
//! health to the router and registry.
//!
//! The eviction sweep itself lives in the registry (§4.2.1 of the design):
//! this crate only answers "is this `runtime_id` stale" so the registry can
//! decide what to evict.

use std::time::Duration;

use dashmap::DashMap;
use pluginhost_core::health::{HealthRecord, HealthState};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ReportHealthRequest {
    pub state: HealthState,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub unavailable_dependencies: Vec<String>,
}

/// The transition produced by a `ReportHealth` call, used by the caller to
/// decide whether downstream watchers need notifying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: HealthState,
    pub current: HealthState,
}

impl Transition {
    pub fn changed(self) -> bool {
        self.previous != self.current
    }
}

/// Process-wide map of `runtime_id -> HealthRecord`.
pub struct LifecycleServer {
    records: DashMap<String, HealthRecord>,
}

impl LifecycleServer {
    pub fn new() -> Self {
        LifecycleServer {
            records: DashMap::new(),
        }
    }

    /// Upsert a health report for `runtime_id`, returning the before/after
    /// transition so the caller can trigger watcher notifications.
    pub fn report_health(&self, runtime_id: &str, req: ReportHealthRequest) -> Transition {
        let mut entry = self
            .records
            .entry(runtime_id.to_string())
            .or_insert_with(HealthRecord::unspecified);
        let previous = entry.state;
        entry.apply_report(req.state, req.reason, req.unavailable_dependencies);
        Transition {
            previous,
            current: entry.state,
        }
    }

    /// `GetHealth`: unknown ids report `Unspecified`, which is never
    /// traffic-eligible.
    pub fn get_health(&self, runtime_id: &str) -> HealthState {
        self.records
            .get(runtime_id)
            .map(|r| r.state)
            .unwrap_or(HealthState::Unspecified)
    }

    pub fn routes_traffic(&self, runtime_id: &str) -> bool {
        self.get_health(runtime_id).routes_traffic()
    }

    /// Whether `runtime_id` has gone longer than `window` without a report.
    /// A `runtime_id` with no record at all is treated as stale (nothing to
    /// keep alive).
    pub fn is_stale(&self, runtime_id: &str, window: Duration) -> bool {
        match self.records.get(runtime_id) {
            Some(record) => record.is_stale(window),
            None => true,
        }
    }

    /// Delete a runtime's record entirely (plugin removal).
    pub fn remove(&self, runtime_id: &str) {
        self.records.remove(runtime_id);
    }
}

impl Default for LifecycleServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_runtime_id_is_unspecified() {
        let lifecycle = LifecycleServer::new();
        assert_eq!(lifecycle.get_health("ghost"), HealthState::Unspecified);
        assert!(!lifecycle.routes_traffic("ghost"));
    }

    #[test]
    fn report_health_tracks_transitions() {
        let lifecycle = LifecycleServer::new();
        let t1 = lifecycle.report_health(
            "r1",
            ReportHealthRequest {
                state: HealthState::Healthy,
                reason: None,
                unavailable_dependencies: vec![],
            },
        );
        assert_eq!(t1.previous, HealthState::Unspecified);
        assert_eq!(t1.current, HealthState::Healthy);
        assert!(t1.changed());

        let t2 = lifecycle.report_health(
            "r1",
            ReportHealthRequest {
                state: HealthState::Healthy,
                reason: None,
                unavailable_dependencies: vec![],
            },
        );
        assert!(!t2.changed());
    }

    #[test]
    fn unspecified_runtime_id_with_no_record_is_stale() {
        let lifecycle = LifecycleServer::new();
        assert!(lifecycle.is_stale("ghost", Duration::from_secs(90)));
    }

    #[test]
    fn freshly_reported_runtime_id_is_not_stale() {
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
    }

    #[test]
    fn remove_clears_record() {
        let lifecycle = LifecycleServer::new();
        lifecycle.report_health(
            "r1",
            ReportHealthRequest {
                state: HealthState::Healthy,
                reason: None,
                unavailable_dependencies: vec![],
            },
        );
        lifecycle.remove("r1");
        assert_eq!(lifecycle.get_health("r1"), HealthState::Unspecified);
    }
}
