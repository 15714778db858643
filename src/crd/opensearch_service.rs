//! OpenSearchService Custom Resource Definition
//!
//! The OpenSearchService CRD describes one managed OpenSearch deployment and
//! the optional components around it (Dashboards, Monitoring, DBaaS adapter,
//! Curator) together with its disaster recovery role.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, DbaasAdapterConfig, DisasterRecoveryConfig, DisasterRecoveryStatus,
    OpenSearchConfig, SwitchoverStatus, WorkloadConfig,
};

/// Annotation stamped by the site manager API to force a retry of the same switchover
pub const SWITCHOVER_RETRY_ANNOTATION: &str = "switchoverRetry";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "qubership.org",
    version = "v1",
    kind = "OpenSearchService",
    namespaced,
    status = "OpenSearchServiceStatus",
    shortname = "oss",
    printcolumn = r#"{"name":"DR Mode","type":"string","jsonPath":".status.disasterRecoveryStatus.mode"}"#,
    printcolumn = r#"{"name":"DR Status","type":"string","jsonPath":".status.disasterRecoveryStatus.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpenSearchServiceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opensearch: Option<OpenSearchConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboards: Option<WorkloadConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<WorkloadConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dbaas_adapter: Option<DbaasAdapterConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub curator: Option<WorkloadConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub disaster_recovery: Option<DisasterRecoveryConfig>,
}

/// Observed state of the OpenSearchService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenSearchServiceStatus {
    #[serde(default)]
    pub disaster_recovery_status: DisasterRecoveryStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl OpenSearchService {
    /// Observed DR status, defaulted when the status subresource is empty
    pub fn dr_status(&self) -> DisasterRecoveryStatus {
        self.status
            .as_ref()
            .map(|s| s.disaster_recovery_status.clone())
            .unwrap_or_default()
    }

    /// True while a switchover is (or very recently was) in flight
    pub fn switchover_running(&self) -> bool {
        self.dr_status().status == SwitchoverStatus::Running
    }

    /// Name of the secret with the credentials currently applied to the cluster
    pub fn credentials_secret_name(&self) -> String {
        format!("{}-secret-old", self.metadata.name.as_deref().unwrap_or_default())
    }

    /// Name of the secret with the desired cluster credentials
    pub fn desired_credentials_secret_name(&self) -> String {
        format!("{}-secret", self.metadata.name.as_deref().unwrap_or_default())
    }
}
