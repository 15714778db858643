//! Request and response bodies of the REST API

use serde::{Deserialize, Serialize};

/// Health of the OpenSearch StatefulSets or of the replication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }
}

/// Switchover request sent by the site manager
#[derive(Debug, Clone, Deserialize)]
pub struct SwitchoverRequest {
    pub mode: String,
    /// Defaults to `true` when absent
    #[serde(rename = "no-wait")]
    pub no_wait: Option<bool>,
}

/// Mode, status and comment of the last switchover, or a rejection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwitchoverState {
    pub mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

impl SwitchoverState {
    pub fn accepted(mode: &str) -> Self {
        Self {
            mode: mode.to_string(),
            ..Default::default()
        }
    }

    pub fn failed(mode: &str, comment: impl Into<String>) -> Self {
        Self {
            mode: mode.to_string(),
            status: "failed".to_string(),
            comment: comment.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationHealthQuery {
    pub mode: Option<String>,
}
