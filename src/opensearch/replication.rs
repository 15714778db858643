//! Cross-cluster replication lifecycle on the local (follower) cluster

use std::collections::BTreeMap;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::rest_client::{Response, RestClient};
use crate::error::{Error, Result};

pub const LEADER_ALIAS: &str = "leader-cluster";
pub const REPLICATION_RULE_NAME: &str = "dr-replication";

const AUTOFOLLOW_PATH: &str = "_plugins/_replication/_autofollow";
const AUTOFOLLOW_STATS_PATH: &str = "_plugins/_replication/autofollow_stats";
const LEADER_STATS_PATH: &str = "_plugins/_replication/leader_stats";
const CANCEL_REPLICATION_TASKS_PATH: &str = "_tasks/_cancel?actions=*replication*";

/// Config map keys holding the replication parameters
pub const REMOTE_CLUSTER_KEY: &str = "remoteCluster";
pub const INDICES_PATTERN_KEY: &str = "indicesPattern";

pub const STATUS_SYNCING: &str = "SYNCING";
pub const STATUS_BOOTSTRAPPING: &str = "BOOTSTRAPPING";
pub const STATUS_PAUSED: &str = "PAUSED";
pub const STATUS_FAILED: &str = "FAILED";
pub const STATUS_NOT_IN_PROGRESS: &str = "REPLICATION NOT IN PROGRESS";

/// Remote seed and index pattern, read from the DR config map once per attempt
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// `host:port` of the peer's transport endpoint
    pub remote_cluster: String,
    pub indices_pattern: String,
}

impl ReplicationConfig {
    pub fn from_config_map_data(data: &BTreeMap<String, String>) -> Self {
        Self {
            remote_cluster: data.get(REMOTE_CLUSTER_KEY).cloned().unwrap_or_default(),
            indices_pattern: data.get(INDICES_PATTERN_KEY).cloned().unwrap_or_default(),
        }
    }
}

/// Per-rule statistics of `autofollow_stats`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RuleStats {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pattern: String,
    #[serde(default, rename = "num_success_start_replication")]
    pub success_start: u64,
    #[serde(default, rename = "num_failed_start_replication")]
    pub failed_start: u64,
    #[serde(default)]
    pub failed_indices: Vec<String>,
}

impl RuleStats {
    /// Failed indices without the `.`-prefixed service indices
    pub fn failed_user_indices(&self) -> Vec<String> {
        self.failed_indices
            .iter()
            .filter(|i| !is_service_index(i))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
struct AutofollowStats {
    #[serde(default)]
    autofollow_stats: Vec<RuleStats>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct IndexReplicationStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl IndexReplicationStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status.as_str(),
            STATUS_SYNCING | STATUS_BOOTSTRAPPING | STATUS_PAUSED
        )
    }

    /// Paused because the leader index disappeared on the active side
    pub fn is_paused_by_missing_leader(&self) -> bool {
        self.status == STATUS_PAUSED
            && self
                .reason
                .as_deref()
                .is_some_and(|r| r.contains("IndexNotFoundException"))
    }
}

/// Statistics of indices this cluster is serving as a leader
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LeaderStats {
    #[serde(default)]
    pub num_replicated_indices: u64,
    #[serde(default)]
    pub index_stats: Map<String, Value>,
}

/// One row of `_cat/indices`
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CatIndex {
    pub index: String,
    #[serde(default)]
    pub health: Option<String>,
}

pub fn is_service_index(name: &str) -> bool {
    name.starts_with('.')
}

#[derive(Clone, Debug)]
pub struct ReplicationManager {
    client: RestClient,
    config: ReplicationConfig,
}

impl ReplicationManager {
    pub fn new(client: RestClient, config: ReplicationConfig) -> Self {
        Self { client, config }
    }

    pub fn pattern(&self) -> &str {
        &self.config.indices_pattern
    }

    pub fn client(&self) -> &RestClient {
        &self.client
    }

    /// Register the peer as the `leader-cluster` remote
    pub async fn configure(&self) -> Result<()> {
        let body = json!({
            "persistent": {
                "cluster": {
                    "remote": {
                        LEADER_ALIAS: { "seeds": [self.config.remote_cluster] }
                    }
                }
            }
        });
        let response = self
            .client
            .send(Method::PUT, "_cluster/settings", Some(&body))
            .await?;
        accept_existing(Method::PUT, "_cluster/settings", response)
    }

    /// Create the autofollow rule for the configured pattern; an existing rule is kept
    pub async fn start(&self) -> Result<()> {
        let body = json!({
            "leader_alias": LEADER_ALIAS,
            "pattern": self.config.indices_pattern,
            "name": REPLICATION_RULE_NAME,
            "use_roles": {
                "leader_cluster_role": "all_access",
                "follower_cluster_role": "all_access"
            }
        });
        let response = self
            .client
            .send(Method::POST, AUTOFOLLOW_PATH, Some(&body))
            .await?;
        accept_existing(Method::POST, AUTOFOLLOW_PATH, response)
    }

    pub async fn autofollow_task_exists(&self) -> Result<bool> {
        Ok(self.get_auto_follow_rule_stats().await?.is_some())
    }

    /// Delete the autofollow rule; absent rules are left alone
    pub async fn remove_replication_rule(&self) -> Result<()> {
        if !self.autofollow_task_exists().await? {
            debug!("Autofollow rule is absent, nothing to remove");
            return Ok(());
        }
        let body = json!({ "leader_alias": LEADER_ALIAS, "name": REPLICATION_RULE_NAME });
        let response = self
            .client
            .send(Method::DELETE, AUTOFOLLOW_PATH, Some(&body))
            .await?;
        accept_absent(Method::DELETE, AUTOFOLLOW_PATH, response)
    }

    /// Stop replication of every index that is currently replicated
    pub async fn stop_replication(&self) -> Result<()> {
        for index in self.get_replicated_indices().await? {
            self.stop_index_replication(&index).await?;
        }
        Ok(())
    }

    /// Stop replication of every user index matching `pattern` that still has a replication task
    pub async fn stop_indices_by_pattern(&self, pattern: &str) -> Result<()> {
        for index in self.get_indices_by_pattern_exclude_service(pattern).await? {
            match self.get_index_replication_status(&index).await {
                Ok(status) if status.status == STATUS_NOT_IN_PROGRESS => continue,
                Ok(_) => {}
                Err(e) => warn!(index, "Cannot get replication status, stopping anyway: {e}"),
            }
            self.stop_index_replication(&index).await?;
        }
        Ok(())
    }

    pub async fn stop_index_replication(&self, index: &str) -> Result<()> {
        let path = format!("_plugins/_replication/{index}/_stop");
        let response = self
            .client
            .send(Method::POST, &path, Some(&json!({})))
            .await?;
        accept_absent(Method::POST, &path, response)?;
        info!(index, "Replication stopped");
        Ok(())
    }

    /// Cancel leftover replication tasks of the cluster
    pub async fn delete_admin_replication_tasks(&self) -> Result<()> {
        self.client
            .send_checked(Method::POST, CANCEL_REPLICATION_TASKS_PATH, None)
            .await?;
        Ok(())
    }

    /// Delete every user index matching the configured pattern
    pub async fn delete_indices(&self) -> Result<()> {
        for index in self
            .get_indices_by_pattern_exclude_service(&self.config.indices_pattern)
            .await?
        {
            let response = self.client.send(Method::DELETE, &index, None).await?;
            accept_absent(Method::DELETE, &index, response)?;
            debug!(index, "Index deleted");
        }
        Ok(())
    }

    pub async fn delete_indices_by_pattern(&self, pattern: &str) -> Result<()> {
        let path = format!("{pattern}?ignore_unavailable=true&allow_no_indices=true");
        let response = self.client.send(Method::DELETE, &path, None).await?;
        accept_absent(Method::DELETE, &path, response)
    }

    /// Stats of the `dr-replication` rule, `None` when the rule does not exist
    pub async fn get_auto_follow_rule_stats(&self) -> Result<Option<RuleStats>> {
        let stats: AutofollowStats = self.client.get_json(AUTOFOLLOW_STATS_PATH).await?;
        Ok(stats
            .autofollow_stats
            .into_iter()
            .find(|rule| rule.name == REPLICATION_RULE_NAME))
    }

    pub async fn get_indices_by_pattern(&self, pattern: &str) -> Result<Vec<CatIndex>> {
        let path = format!("_cat/indices/{pattern}?h=index,health&format=json");
        let response = self.client.send(Method::GET, &path, None).await?;
        if response.status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.is_success() {
            return Err(remote_error(Method::GET, &path, response));
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    pub async fn get_indices_by_pattern_exclude_service(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .get_indices_by_pattern(pattern)
            .await?
            .into_iter()
            .map(|i| i.index)
            .filter(|i| !is_service_index(i))
            .collect())
    }

    pub async fn get_index_replication_status(&self, index: &str) -> Result<IndexReplicationStatus> {
        self.client
            .get_json(&format!("_plugins/_replication/{index}/_status"))
            .await
    }

    /// Indices of the configured pattern with a live replication task
    pub async fn get_replicated_indices(&self) -> Result<Vec<String>> {
        let mut replicated = Vec::new();
        for index in self
            .get_indices_by_pattern_exclude_service(&self.config.indices_pattern)
            .await?
        {
            match self.get_index_replication_status(&index).await {
                Ok(status) if status.is_active() => replicated.push(index),
                Ok(_) => {}
                Err(e) => warn!(index, "Cannot get replication status: {e}"),
            }
        }
        Ok(replicated)
    }

    pub async fn leader_stats(&self) -> Result<LeaderStats> {
        self.client.get_json(LEADER_STATS_PATH).await
    }
}

/// Treat "already absent" answers as success
fn accept_absent(method: Method, path: &str, response: Response) -> Result<()> {
    if response.is_success() || response.status == StatusCode::NOT_FOUND {
        return Ok(());
    }
    if response.status == StatusCode::BAD_REQUEST && is_not_replicated_message(&response.body) {
        debug!(path, "Index is not replicated, nothing to stop");
        return Ok(());
    }
    Err(remote_error(method, path, response))
}

/// Treat "already exists" answers as success
fn accept_existing(method: Method, path: &str, response: Response) -> Result<()> {
    if response.is_success() {
        return Ok(());
    }
    if response.status == StatusCode::BAD_REQUEST && is_already_exists_message(&response.body) {
        debug!(path, "Already in place, nothing to create");
        return Ok(());
    }
    Err(remote_error(method, path, response))
}

fn is_already_exists_message(body: &str) -> bool {
    let body = body.to_lowercase();
    body.contains("resource_already_exists_exception") || body.contains("already exists")
}

fn is_not_replicated_message(body: &str) -> bool {
    let body = body.to_lowercase();
    body.contains("no replication in progress")
        || body.contains("not replicated")
        || body.contains("not being replicated")
}

fn remote_error(method: Method, path: &str, response: Response) -> Error {
    Error::RemoteApi {
        method: method.to_string(),
        path: path.to_string(),
        status: response.status.as_u16(),
        body: response.body,
    }
}
