//! Replication watcher for standby clusters
//!
//! A supervisor task owns the [`WatcherState`]. The cloneable
//! [`ReplicationWatcher`] handle only sends commands, so `start` and `pause`
//! never block. Every `Paused -> Running` transition spawns a watch loop
//! tagged with a new generation; a loop exits as soon as the published state
//! no longer carries its generation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn, Instrument};

use super::cluster::ClusterAccess;
use super::disaster_recovery::{run_replication_process, teardown};
use crate::crd::{DrMode, OpenSearchService, SwitchoverStatus};
use crate::error::Result;
use crate::opensearch::ReplicationChecker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherState {
    Paused,
    Running { generation: u64 },
}

#[derive(Debug)]
enum WatcherCommand {
    Start(Duration),
    Pause,
}

/// Handle to the watcher of one resource
#[derive(Clone)]
pub struct ReplicationWatcher {
    commands: mpsc::UnboundedSender<WatcherCommand>,
    state: watch::Receiver<WatcherState>,
}

/// What a watch loop needs to inspect and repair replication
#[derive(Clone)]
struct WatchTarget {
    access: ClusterAccess,
    namespace: String,
    name: String,
    replication_lock: Arc<Mutex<()>>,
}

impl ReplicationWatcher {
    /// Spawn the supervisor for `namespace/name`; it stops when every handle is dropped
    pub fn spawn(
        access: ClusterAccess,
        namespace: &str,
        name: &str,
        replication_lock: Arc<Mutex<()>>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(WatcherState::Paused);
        let target = WatchTarget {
            access,
            namespace: namespace.to_string(),
            name: name.to_string(),
            replication_lock,
        };
        let span = tracing::info_span!("replication_watcher", namespace, name);
        tokio::spawn(supervise(target, rx, state_tx).instrument(span));
        Self { commands, state }
    }

    /// Start watching with `interval` between checks; no-op while running
    pub fn start(&self, interval: Duration) {
        if self.commands.send(WatcherCommand::Start(interval)).is_err() {
            warn!("Replication watcher supervisor is gone");
        }
    }

    pub fn pause(&self) {
        if self.commands.send(WatcherCommand::Pause).is_err() {
            warn!("Replication watcher supervisor is gone");
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.state.clone()
    }
}

async fn supervise(
    target: WatchTarget,
    mut commands: mpsc::UnboundedReceiver<WatcherCommand>,
    state: watch::Sender<WatcherState>,
) {
    let mut generation = 0u64;
    while let Some(command) = commands.recv().await {
        match (command, *state.borrow()) {
            (WatcherCommand::Start(_), WatcherState::Running { .. }) => {}
            (WatcherCommand::Start(interval), WatcherState::Paused) => {
                generation += 1;
                info!(generation, ?interval, "Start Replication Watcher");
                state.send_replace(WatcherState::Running { generation });
                let rx = state.subscribe();
                tokio::spawn(
                    watch_loop(target.clone(), generation, interval, rx).in_current_span(),
                );
            }
            (WatcherCommand::Pause, WatcherState::Running { .. }) => {
                info!("Stop Replication Watcher");
                state.send_replace(WatcherState::Paused);
            }
            (WatcherCommand::Pause, WatcherState::Paused) => {}
        }
    }
    debug!("All watcher handles dropped, stopping supervisor");
    state.send_replace(WatcherState::Paused);
}

fn is_current(state: &watch::Receiver<WatcherState>, generation: u64) -> bool {
    *state.borrow() == WatcherState::Running { generation }
}

async fn watch_loop(
    target: WatchTarget,
    generation: u64,
    interval: Duration,
    mut state: watch::Receiver<WatcherState>,
) {
    loop {
        if !is_current(&state, generation) {
            info!(generation, "Replication Watcher was stopped, exit from watch loop");
            return;
        }
        if let Err(e) = check_once(&target, generation, &state).await {
            warn!(generation, "Replication check failed: {e}");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// The watcher only acts on a standby cluster whose last switchover finished
fn is_watchable(cr: &OpenSearchService) -> bool {
    let status = cr.dr_status();
    cr.spec
        .disaster_recovery
        .as_ref()
        .is_some_and(|dr| dr.mode == DrMode::Standby)
        && status.mode == Some(DrMode::Standby)
        && status.status == SwitchoverStatus::Done
}

async fn check_once(
    target: &WatchTarget,
    generation: u64,
    state: &watch::Receiver<WatcherState>,
) -> Result<()> {
    let cr = target
        .access
        .store
        .get_service(&target.namespace, &target.name)
        .await?;
    if !is_watchable(&cr) {
        debug!("Cluster is not a settled standby, skipping replication check");
        return Ok(());
    }

    let _guard = target.replication_lock.lock().await;
    if !is_current(state, generation) {
        return Ok(());
    }

    info!("Start checking for replication status");
    let manager = target.access.replication_manager(&cr).await?;
    let report = ReplicationChecker::new(manager.clone()).inspect().await?;

    #[cfg(feature = "metrics")]
    super::metrics::set_replication_health(
        &target.namespace,
        &target.name,
        report.health().gauge_value(),
    );

    let Some(reason) = report.needs_restart() else {
        info!("Replication works correctly");
        return Ok(());
    };

    info!(%reason, "Try to restart replication");
    let settle = target.access.config.timings.settle_delay;
    if let Err(e) = teardown(&manager).await {
        error!("Previous replication cannot be stopped: {e}");
        return Ok(());
    }
    if let Err(e) = run_replication_process(&manager, settle).await {
        error!("Replication cannot be started: {e}");
        return Ok(());
    }
    info!("Replication was restarted");

    #[cfg(feature = "metrics")]
    super::metrics::inc_replication_restart(&target.namespace, &target.name);

    // Give the new rule time to bootstrap before anyone touches replication again.
    tokio::time::sleep(target.access.config.timings.watcher_cooldown).await;
    Ok(())
}
