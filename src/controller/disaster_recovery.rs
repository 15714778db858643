//! Active/standby switchover
//!
//! A switchover runs when the desired mode differs from the recorded one,
//! when the last attempt is still marked running or failed, or when the
//! replication config map changed. The attempt holds the replication lock
//! for its whole duration and keeps client traffic off while it works; the
//! outcome always lands in `status.disasterRecoveryStatus`.

use std::time::Duration;

use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use super::cluster::ClusterAccess;
use super::conditions::{
    set_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE, CONDITION_TYPE_SWITCHOVER,
};
use super::hashes::{hash_data, DR_CONFIG_HASH};
use super::session::ObjectSession;
use super::store::{scale_deployment_and_wait, update_status_with_retry};
use super::traffic::{enable_client_traffic, TrafficGate};
use super::users_recovery::recover_users;
use crate::config::Timings;
use crate::crd::{
    DisasterRecoveryConfig, DisasterRecoveryStatus, DrMode, OpenSearchService, SwitchoverStatus,
};
use crate::error::{Error, Result};
use crate::opensearch::{ReplicationChecker, ReplicationHealth, ReplicationManager};

pub const SWITCHOVER_STARTED: &str = "The switchover process for OpenSearch has been started";
pub const REPLICATION_FINISHED: &str = "replication has finished successfully";
pub const CHANGED_WITHOUT_CHECK: &str = "Switchover mode has been changed without replication check";

const TASKS_INDEX_PATTERN: &str = ".tasks";

/// Whether the recorded status disagrees with the desired mode or a previous attempt did not finish
pub fn has_drift(dr: &DisasterRecoveryConfig, status: &DisasterRecoveryStatus) -> bool {
    status.mode != Some(dr.mode)
        || matches!(
            status.status,
            SwitchoverStatus::Running | SwitchoverStatus::Failed
        )
}

/// Activation waits for healthy replication unless `noWait` is set; a
/// failed activation is checked again on retry
pub fn replication_check_needed(dr: &DisasterRecoveryConfig, status: &DisasterRecoveryStatus) -> bool {
    !dr.no_wait
        && dr.mode == DrMode::Active
        && (status.mode != Some(DrMode::Active) || status.status == SwitchoverStatus::Failed)
}

/// Stop everything replication-related on the local cluster
///
/// Every step is safe to repeat on a cluster that does not replicate.
pub(crate) async fn teardown(manager: &ReplicationManager) -> Result<()> {
    manager.remove_replication_rule().await?;
    info!("Autofollow rule was removed");

    manager.stop_replication().await?;
    info!(
        pattern = manager.pattern(),
        "Stopping replication for all indices matching the pattern"
    );
    manager.stop_indices_by_pattern(manager.pattern()).await?;
    manager.delete_admin_replication_tasks().await?;

    info!("Replication has been stopped");
    Ok(())
}

/// Replace local copies of the replicated indices with a fresh autofollow
pub(crate) async fn run_replication_process(
    manager: &ReplicationManager,
    settle: Duration,
) -> Result<()> {
    info!("Delete replication indices");
    manager.delete_indices().await?;
    tokio::time::sleep(settle).await;

    info!("Configure replication connection between clusters");
    manager.configure().await?;

    info!("Start autofollow replication");
    manager.start().await?;

    info!("Replication has been started");
    Ok(())
}

/// Fail when the peer is still following this cluster
pub(crate) async fn check_existing_replications(manager: &ReplicationManager) -> Result<()> {
    let stats = manager.leader_stats().await?;
    if !stats.index_stats.is_empty() {
        error!(
            "There is active replication on the other side. Move the opposite side into active mode first"
        );
        return Err(Error::ReplicationError(
            "there is active replication on the other side".into(),
        ));
    }
    info!("There are no replications from the other side");
    Ok(())
}

/// Poll replication health until it is `up`
pub(crate) async fn wait_for_healthy_replication(
    manager: &ReplicationManager,
    timings: &Timings,
) -> Result<()> {
    let checker = ReplicationChecker::new(manager.clone());
    let deadline = Instant::now() + timings.replication_poll_timeout;
    loop {
        match checker.health().await {
            Ok(ReplicationHealth::Up) => {
                info!("Replication is healthy");
                return Ok(());
            }
            Ok(health) => info!(%health, "Replication is not healthy yet"),
            Err(e) => warn!("Unable to get replication state: {e}"),
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout("replication to become healthy".into()));
        }
        tokio::time::sleep(timings.replication_poll_interval).await;
    }
}

/// Teardown plus removal of the task indices left behind by replication
async fn stop_replication(manager: &ReplicationManager) -> Result<()> {
    teardown(manager).await?;
    info!("Delete indices by pattern `{TASKS_INDEX_PATTERN}`");
    if let Err(e) = manager.delete_indices_by_pattern(TASKS_INDEX_PATTERN).await {
        warn!("Cannot delete task indices: {e}");
    }
    Ok(())
}

async fn persist_dr_status(
    access: &ClusterAccess,
    cr: &OpenSearchService,
    mode: DrMode,
    status: SwitchoverStatus,
    comment: &str,
) -> Result<()> {
    let namespace = cr.namespace().unwrap_or_default();
    let in_progress = status == SwitchoverStatus::Running;
    update_status_with_retry(
        access.store.as_ref(),
        &namespace,
        &cr.name_any(),
        access.config.timings.status_conflict_attempts,
        |s| {
            s.disaster_recovery_status.mode = Some(mode);
            s.disaster_recovery_status.status = status;
            s.disaster_recovery_status.comment = Some(comment.to_string());
            let (condition, reason) = if in_progress {
                (CONDITION_STATUS_TRUE, "SwitchoverStarted")
            } else {
                (CONDITION_STATUS_FALSE, "SwitchoverFinished")
            };
            set_condition(
                &mut s.conditions,
                CONDITION_TYPE_SWITCHOVER,
                condition,
                reason,
                comment,
            );
        },
    )
    .await
}

/// Inputs of one switchover attempt, fixed when it starts
struct Attempt<'a> {
    access: &'a ClusterAccess,
    cr: &'a OpenSearchService,
    dr: &'a DisasterRecoveryConfig,
    previous: DisasterRecoveryStatus,
    check_needed: bool,
    drift: bool,
}

impl Attempt<'_> {
    fn timings(&self) -> &Timings {
        &self.access.config.timings
    }

    /// Mode-specific steps; returns the comment for a successful attempt
    async fn switch_mode(&self) -> Result<&'static str> {
        let manager = self.access.replication_manager(self.cr).await?;
        match self.dr.mode {
            DrMode::Standby => {
                self.become_standby(&manager).await?;
                Ok(REPLICATION_FINISHED)
            }
            DrMode::Active | DrMode::Disable => self.become_leader(&manager).await,
        }
    }

    async fn become_standby(&self, manager: &ReplicationManager) -> Result<()> {
        if self.previous.mode != Some(DrMode::Active) {
            info!("Removing previous replication rule");
            teardown(manager).await?;
        }
        info!("Checking existence of active replications");
        check_existing_replications(manager).await?;
        run_replication_process(manager, self.timings().settle_delay).await?;
        if !self.dr.no_wait {
            wait_for_healthy_replication(manager, self.timings()).await?;
        }
        Ok(())
    }

    async fn become_leader(&self, manager: &ReplicationManager) -> Result<&'static str> {
        let comment = if self.check_needed {
            info!("Start replication check");
            wait_for_healthy_replication(manager, self.timings()).await?;
            REPLICATION_FINISHED
        } else {
            CHANGED_WITHOUT_CHECK
        };

        stop_replication(manager).await?;

        if self.dr.mode == DrMode::Active && self.drift {
            if let Some(adapter) = &self.cr.spec.dbaas_adapter {
                let namespace = self.cr.namespace().unwrap_or_default();
                scale_deployment_and_wait(
                    self.access.store.as_ref(),
                    &namespace,
                    &adapter.name,
                    1,
                    self.dr.no_wait,
                    self.timings(),
                )
                .await?;
                info!("Start users recovery");
                recover_users(self.access, self.cr, adapter).await?;
            }
        }
        Ok(comment)
    }

    /// Cut traffic, switch, and restore traffic whatever the outcome
    async fn run_gated(&self) -> Result<&'static str> {
        let namespace = self.cr.namespace().unwrap_or_default();
        let name = self.cr.name_any();
        let gate = TrafficGate::close(self.access.store.clone(), &namespace, &name).await?;
        tokio::time::sleep(self.timings().settle_delay).await;

        let outcome = self.switch_mode().await;
        if let Err(e) = gate.open().await {
            warn!("Failed to re-enable client traffic: {e}");
        }
        outcome
    }
}

/// Run one switchover attempt under the replication lock and record its outcome
async fn switchover(
    access: &ClusterAccess,
    session: &ObjectSession,
    cr: &OpenSearchService,
    dr: &DisasterRecoveryConfig,
    drift: bool,
) -> Result<()> {
    session.watcher.pause();
    let _lock = session.replication_lock.lock().await;

    let previous = cr.dr_status();
    let attempt = Attempt {
        access,
        cr,
        dr,
        check_needed: replication_check_needed(dr, &previous),
        previous,
        drift,
    };

    persist_dr_status(access, cr, dr.mode, SwitchoverStatus::Running, SWITCHOVER_STARTED).await?;
    info!(mode = %dr.mode, "Switchover started");

    let outcome = attempt.run_gated().await;

    if dr.mode == DrMode::Active {
        let namespace = cr.namespace().unwrap_or_default();
        if let Err(e) = enable_client_traffic(access.store.as_ref(), &namespace, &cr.name_any()).await {
            warn!("Failed to enable client traffic of the active cluster: {e}");
        }
    }

    #[cfg(feature = "metrics")]
    super::metrics::inc_switchover(dr.mode.as_str(), outcome.is_ok());

    match outcome {
        Ok(comment) => {
            persist_dr_status(access, cr, dr.mode, SwitchoverStatus::Done, comment).await?;
            info!(mode = %dr.mode, "Switchover finished");
            Ok(())
        }
        Err(e) => {
            error!(mode = %dr.mode, "Switchover failed: {e}");
            let comment = format!("Error occurred during OpenSearch switching: {e}");
            if let Err(status_err) =
                persist_dr_status(access, cr, dr.mode, SwitchoverStatus::Failed, &comment).await
            {
                warn!("Cannot record failed switchover: {status_err}");
            }
            Err(e)
        }
    }
}

/// Run a switchover when needed, then (re)arm the replication watcher
#[instrument(skip_all, fields(namespace = %cr.namespace().unwrap_or_default(), name = %cr.name_any()))]
pub async fn reconcile_disaster_recovery(
    access: &ClusterAccess,
    session: &ObjectSession,
    cr: &OpenSearchService,
) -> Result<()> {
    let Some(dr) = cr.spec.disaster_recovery.as_ref() else {
        return Ok(());
    };
    let namespace = cr.namespace().unwrap_or_default();

    let config = access
        .store
        .config_map_data(&namespace, &dr.config_map_name)
        .await?;
    let config_hash = hash_data(&config)?;
    let config_changed = session.hash_changed(DR_CONFIG_HASH, &config_hash);
    let drift = has_drift(dr, &cr.dr_status());

    let result = if drift || config_changed {
        if config_changed {
            info!("Replication configuration changed");
        }
        switchover(access, session, cr, dr, drift).await
    } else {
        Ok(())
    };

    session.set_hash(DR_CONFIG_HASH, &config_hash);

    if dr.replication_watcher_enabled {
        session
            .watcher
            .start(access.config.timings.watcher_interval(dr.replication_watcher_interval));
    } else {
        session.watcher.pause();
    }
    result
}
