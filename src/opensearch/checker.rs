//! Replication health inspection
//!
//! [`ReplicationChecker::inspect`] gathers everything both the health
//! endpoint and the replication watcher need in one pass; the report then
//! answers "how healthy" and "does it need a restart" without more calls.

use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use super::replication::{
    is_service_index, IndexReplicationStatus, ReplicationManager, RuleStats, STATUS_FAILED,
    STATUS_PAUSED,
};
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationHealth {
    Up,
    Degraded,
    Down,
}

impl ReplicationHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationHealth::Up => "up",
            ReplicationHealth::Degraded => "degraded",
            ReplicationHealth::Down => "down",
        }
    }

    /// Gauge value exported as `opensearch_replication_health`
    pub fn gauge_value(&self) -> i64 {
        match self {
            ReplicationHealth::Up => 2,
            ReplicationHealth::Degraded => 1,
            ReplicationHealth::Down => 0,
        }
    }
}

impl fmt::Display for ReplicationHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the replication state of the local cluster
#[derive(Clone, Debug, Default)]
pub struct ReplicationReport {
    /// Stats of the `dr-replication` rule; `None` when the rule is missing
    pub rule: Option<RuleStats>,
    /// User indices of the rule pattern whose health is not green
    pub unhealthy_indices: Vec<String>,
    /// Replication status of each user index that could be looked up
    pub index_statuses: Vec<(String, IndexReplicationStatus)>,
}

impl ReplicationReport {
    pub fn health(&self) -> ReplicationHealth {
        let Some(rule) = &self.rule else {
            return ReplicationHealth::Down;
        };

        let failed = rule.failed_user_indices();
        if !failed.is_empty() {
            return if rule.success_start > 0 {
                ReplicationHealth::Degraded
            } else {
                ReplicationHealth::Down
            };
        }
        if rule.failed_start > 0 {
            return ReplicationHealth::Degraded;
        }
        if !self.unhealthy_indices.is_empty() {
            info!(indices = ?self.unhealthy_indices, "Some replicated indices are not green");
            return ReplicationHealth::Degraded;
        }
        if !self.failed_indices().is_empty() {
            return ReplicationHealth::Degraded;
        }
        ReplicationHealth::Up
    }

    /// Indices whose replication task is in the FAILED state
    pub fn failed_indices(&self) -> Vec<&str> {
        self.index_statuses
            .iter()
            .filter(|(_, s)| s.status == STATUS_FAILED)
            .map(|(i, _)| i.as_str())
            .collect()
    }

    /// Indices that are paused for a reason other than a lost leader index
    pub fn stuck_indices(&self) -> Vec<&str> {
        self.index_statuses
            .iter()
            .filter(|(_, s)| s.status == STATUS_PAUSED && !s.is_paused_by_missing_leader())
            .map(|(i, _)| i.as_str())
            .collect()
    }

    /// Whether the replication watcher should tear replication down and start it again
    pub fn needs_restart(&self) -> Option<String> {
        let Some(rule) = &self.rule else {
            return Some("there is no autofollow rule".to_string());
        };
        let failed = rule.failed_user_indices();
        if !failed.is_empty() {
            return Some(format!("autofollow rule has failed indices: {failed:?}"));
        }
        let mut broken = self.failed_indices();
        broken.extend(self.stuck_indices());
        if !broken.is_empty() {
            return Some(format!("replication is broken for indices: {broken:?}"));
        }
        None
    }
}

#[derive(Clone, Debug)]
pub struct ReplicationChecker {
    manager: ReplicationManager,
}

impl ReplicationChecker {
    pub fn new(manager: ReplicationManager) -> Self {
        Self { manager }
    }

    pub async fn inspect(&self) -> Result<ReplicationReport> {
        let Some(rule) = self.manager.get_auto_follow_rule_stats().await? else {
            info!("There is no autofollow rule");
            return Ok(ReplicationReport::default());
        };

        let pattern = if rule.pattern.is_empty() {
            self.manager.pattern().to_string()
        } else {
            rule.pattern.clone()
        };

        let indices: Vec<_> = self
            .manager
            .get_indices_by_pattern(&pattern)
            .await?
            .into_iter()
            .filter(|i| !is_service_index(&i.index))
            .collect();

        let unhealthy_indices = indices
            .iter()
            .filter(|i| i.health.as_deref().is_some_and(|h| h != "green"))
            .map(|i| i.index.clone())
            .collect();

        let mut index_statuses = Vec::with_capacity(indices.len());
        for index in indices {
            match self.manager.get_index_replication_status(&index.index).await {
                Ok(status) => {
                    if status.is_paused_by_missing_leader() {
                        info!(
                            index = %index.index,
                            "Replication is paused because the index was lost on the active side"
                        );
                    }
                    index_statuses.push((index.index, status));
                }
                Err(e) => warn!(index = %index.index, "Cannot get replication status: {e}"),
            }
        }

        Ok(ReplicationReport {
            rule: Some(rule),
            unhealthy_indices,
            index_statuses,
        })
    }

    pub async fn health(&self) -> Result<ReplicationHealth> {
        Ok(self.inspect().await?.health())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(success: u64, failed: u64, failed_indices: &[&str]) -> RuleStats {
        RuleStats {
            name: "dr-replication".to_string(),
            pattern: "*".to_string(),
            success_start: success,
            failed_start: failed,
            failed_indices: failed_indices.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn status(value: &str, reason: Option<&str>) -> IndexReplicationStatus {
        IndexReplicationStatus {
            status: value.to_string(),
            reason: reason.map(str::to_string),
        }
    }

    #[test]
    fn test_missing_rule_is_down() {
        let report = ReplicationReport::default();
        assert_eq!(report.health(), ReplicationHealth::Down);
        assert!(report.needs_restart().is_some());
    }

    #[test]
    fn test_failed_indices_without_successes_is_down() {
        let report = ReplicationReport {
            rule: Some(rule(0, 1, &["app-1"])),
            ..Default::default()
        };
        assert_eq!(report.health(), ReplicationHealth::Down);
    }

    #[test]
    fn test_failed_indices_with_successes_is_degraded() {
        let report = ReplicationReport {
            rule: Some(rule(3, 1, &["app-1"])),
            ..Default::default()
        };
        assert_eq!(report.health(), ReplicationHealth::Degraded);
    }

    #[test]
    fn test_failed_starts_without_failed_indices_is_degraded() {
        let report = ReplicationReport {
            rule: Some(rule(3, 2, &[])),
            ..Default::default()
        };
        assert_eq!(report.health(), ReplicationHealth::Degraded);
        assert!(report.needs_restart().is_none());
    }

    #[test]
    fn test_service_failed_indices_are_ignored() {
        let report = ReplicationReport {
            rule: Some(rule(0, 0, &[".tasks"])),
            ..Default::default()
        };
        assert_eq!(report.health(), ReplicationHealth::Up);
        assert!(report.needs_restart().is_none());
    }

    #[test]
    fn test_non_green_index_is_degraded() {
        let report = ReplicationReport {
            rule: Some(rule(1, 0, &[])),
            unhealthy_indices: vec!["app-1".to_string()],
            ..Default::default()
        };
        assert_eq!(report.health(), ReplicationHealth::Degraded);
    }

    #[test]
    fn test_failed_index_status_is_degraded_and_restarts() {
        let report = ReplicationReport {
            rule: Some(rule(1, 0, &[])),
            index_statuses: vec![("app-1".to_string(), status("FAILED", None))],
            ..Default::default()
        };
        assert_eq!(report.health(), ReplicationHealth::Degraded);
        assert!(report.needs_restart().is_some());
    }

    #[test]
    fn test_paused_by_missing_leader_is_tolerated() {
        let report = ReplicationReport {
            rule: Some(rule(1, 0, &[])),
            index_statuses: vec![(
                "app-1".to_string(),
                status("PAUSED", Some("IndexNotFoundException[no such index]")),
            )],
            ..Default::default()
        };
        assert_eq!(report.health(), ReplicationHealth::Up);
        assert!(report.needs_restart().is_none());
    }

    #[test]
    fn test_paused_for_other_reason_restarts() {
        let report = ReplicationReport {
            rule: Some(rule(1, 0, &[])),
            index_statuses: vec![(
                "app-1".to_string(),
                status("PAUSED", Some("user requested")),
            )],
            ..Default::default()
        };
        assert_eq!(report.health(), ReplicationHealth::Up);
        assert!(report.needs_restart().is_some());
    }

    #[test]
    fn test_healthy_replication_is_up() {
        let report = ReplicationReport {
            rule: Some(rule(2, 0, &[])),
            index_statuses: vec![("app-1".to_string(), status("SYNCING", None))],
            ..Default::default()
        };
        assert_eq!(report.health(), ReplicationHealth::Up);
        assert_eq!(ReplicationHealth::Up.gauge_value(), 2);
    }
}
