//! Shared types for the OpenSearchService CRD
//!
//! These types are used in both the spec and status of the custom resource.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ============================================================================
// OpenSearch core configuration
// ============================================================================

/// Parameters necessary for interaction with the OpenSearch cluster itself
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenSearchConfig {
    #[serde(default)]
    pub dedicated_client_pod: bool,

    #[serde(default)]
    pub dedicated_data_pod: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<SnapshotsConfig>,

    /// Secret holding `config.yml` with the security plugin configuration
    #[serde(default)]
    pub security_configuration_name: String,

    /// Report a 7.10.2-compatible version from the root endpoint
    #[serde(default)]
    pub compatibility_mode_enabled: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotsConfig {
    pub repository_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

/// Object storage backend for the snapshot repository
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub gcs_enabled: bool,
    #[serde(default)]
    pub path_style_access: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub region: String,
    /// Secret with `s3-key-id` and `s3-key-secret`
    #[serde(default)]
    pub secret_name: String,
}

// ============================================================================
// Dependent workloads
// ============================================================================

/// A deployment that is rolled whenever its credentials change
/// (Dashboards, Monitoring, Curator)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadConfig {
    /// Name of the deployment
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// DBaaS adapter deployment and the endpoints used for users recovery
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DbaasAdapterConfig {
    pub name: String,
    pub secret_name: String,
    #[serde(default)]
    pub adapter_address: String,
    #[serde(default)]
    pub aggregator_address: String,
    #[serde(default)]
    pub physical_database_identifier: String,
}

// ============================================================================
// Disaster Recovery
// ============================================================================

/// Role of this cluster in an active/standby pair
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DrMode {
    /// Serves client traffic; replication towards this cluster is stopped
    Active,
    /// Follows the peer cluster through an autofollow rule
    Standby,
    /// Neither serves as leader nor follows
    Disable,
}

impl DrMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrMode::Active => "active",
            DrMode::Standby => "standby",
            DrMode::Disable => "disable",
        }
    }
}

impl fmt::Display for DrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DrMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(DrMode::Active),
            "standby" => Ok(DrMode::Standby),
            "disable" => Ok(DrMode::Disable),
            other => Err(format!(
                "'{other}' mode is not in the allowed list. Please, use 'active', 'standby' or 'disable'"
            )),
        }
    }
}

/// Desired disaster recovery state, set by an administrator or the site manager
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisasterRecoveryConfig {
    pub mode: DrMode,

    /// Skip the replication health wait and readiness checks
    #[serde(default)]
    pub no_wait: bool,

    /// Config map with `remoteCluster` and `indicesPattern`
    #[serde(default)]
    pub config_map_name: String,

    #[serde(default)]
    pub replication_watcher_enabled: bool,

    /// Watch interval in seconds; values <= 0 fall back to the default
    #[serde(default)]
    pub replication_watcher_interval: i64,
}

/// Progress of a switchover attempt
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SwitchoverStatus {
    #[default]
    Idle,
    Running,
    Done,
    Failed,
}

impl SwitchoverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchoverStatus::Idle => "idle",
            SwitchoverStatus::Running => "running",
            SwitchoverStatus::Done => "done",
            SwitchoverStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SwitchoverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the password restoration procedure run on activation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UsersRecoveryState {
    Idle,
    Running,
    Done,
    Failed,
}

impl UsersRecoveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UsersRecoveryState::Done | UsersRecoveryState::Failed)
    }
}

impl FromStr for UsersRecoveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_matches('"').to_lowercase().as_str() {
            "idle" => Ok(UsersRecoveryState::Idle),
            "running" => Ok(UsersRecoveryState::Running),
            "done" => Ok(UsersRecoveryState::Done),
            "failed" => Ok(UsersRecoveryState::Failed),
            other => Err(format!("unknown users recovery state '{other}'")),
        }
    }
}

/// Observed disaster recovery state, owned by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisasterRecoveryStatus {
    /// Mode of the last switchover attempt (absent before the first one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DrMode>,

    #[serde(default)]
    pub status: SwitchoverStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Absent until the first activation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users_recovery_state: Option<UsersRecoveryState>,
}

// ============================================================================
// Conditions
// ============================================================================

/// Reports the status of a condition on the OpenSearchService resource.
/// Follows Kubernetes convention for condition reporting.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Progressing", "Degraded")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
}
