//! Controller module for OpenSearchService reconciliation
//! This module contains the main controller loop, the disaster recovery
//! switchover and the replication watcher.

pub mod cluster;
pub mod conditions;
pub mod disaster_recovery;
#[cfg(test)]
pub(crate) mod fake;
pub mod feature;
pub mod hashes;
#[cfg(feature = "metrics")]
pub mod metrics;
mod opensearch_core;
mod reconciler;
pub mod session;
pub mod store;
pub mod traffic;
mod users_recovery;
pub mod watcher;

pub use cluster::ClusterAccess;
pub use disaster_recovery::reconcile_disaster_recovery;
pub use reconciler::{run_controller, ControllerState};
pub use session::{ObjectSession, SessionRegistry};
pub use store::{KubeStore, ResourceStore};
pub use watcher::{ReplicationWatcher, WatcherState};
