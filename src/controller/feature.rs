//! Per-component reconcilers driven by the main reconcile loop
//!
//! Every optional section of the OpenSearchService spec maps to one
//! [`FeatureReconciler`]. The driver runs `reconcile_config` on all of them,
//! waits for the cluster to answer, then runs `apply_configuration` and
//! `observe_status` in the same order.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use super::cluster::ClusterAccess;
use super::disaster_recovery::reconcile_disaster_recovery;
use super::hashes::{
    hash_data, CURATOR_SECRET_HASH, DASHBOARDS_SECRET_HASH, DBAAS_ADAPTER_SECRET_HASH,
    DR_CONFIG_HASH, MONITORING_SECRET_HASH, OPENSEARCH_OLD_SECRET_HASH, OPENSEARCH_SECRET_HASH,
};
use super::opensearch_core::OpenSearchCore;
use super::session::ObjectSession;
use super::store::{scale_deployment_and_wait, AdoptedKind};
use crate::crd::{DrMode, OpenSearchService, SwitchoverStatus};
use crate::error::Result;

#[async_trait]
pub trait FeatureReconciler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Detect configuration changes; runs before the cluster readiness probe
    async fn reconcile_config(&self) -> Result<()>;

    async fn observe_status(&self) -> Result<()> {
        Ok(())
    }

    /// Push configuration to the running cluster and its workloads
    async fn apply_configuration(&self) -> Result<()>;
}

/// Everything a feature reconciler needs for one cycle of one resource
#[derive(Clone)]
pub struct ReconcileScope {
    pub access: ClusterAccess,
    pub session: Arc<ObjectSession>,
    pub cr: Arc<OpenSearchService>,
    /// Hash of `{name}-secret` computed at the start of the cycle
    pub opensearch_secret_hash: String,
}

impl ReconcileScope {
    pub fn namespace(&self) -> String {
        self.cr.namespace().unwrap_or_default()
    }

    /// Owner reference that lets changes of adopted objects trigger reconciles
    fn owner_reference(&self) -> Option<OwnerReference> {
        self.cr.controller_owner_ref(&()).map(|mut owner| {
            // Secrets may be shared by several resources; only one can be the controller.
            owner.controller = None;
            owner
        })
    }

    pub(crate) async fn adopt(&self, kind: AdoptedKind, name: &str) -> Result<()> {
        let Some(owner) = self.owner_reference() else {
            return Ok(());
        };
        self.access
            .store
            .adopt(kind, &self.namespace(), name, owner)
            .await
    }

    /// Hash of a secret's data; the secret is adopted the first time it is seen
    pub async fn secret_hash(&self, secret: &str, key: &str) -> Result<String> {
        if self.session.hash(key).is_none() {
            self.adopt(AdoptedKind::Secret, secret).await?;
        }
        let data = self.access.store.secret_data(&self.namespace(), secret).await?;
        hash_data(&data)
    }

    pub fn opensearch_secret_changed(&self) -> bool {
        self.session
            .hash_changed(OPENSEARCH_SECRET_HASH, &self.opensearch_secret_hash)
    }
}

/// Reconcilers for the sections present in the spec, in execution order
pub fn build_reconcilers(scope: &ReconcileScope) -> Vec<Box<dyn FeatureReconciler>> {
    let spec = &scope.cr.spec;
    let mut reconcilers: Vec<Box<dyn FeatureReconciler>> = Vec::new();
    if spec.opensearch.is_some() {
        reconcilers.push(Box::new(OpenSearchCore::new(scope.clone())));
    }
    if spec.disaster_recovery.is_some() {
        reconcilers.push(Box::new(DisasterRecovery {
            scope: scope.clone(),
        }));
    }
    let workloads = [
        (spec.dashboards.is_some(), Workload::Dashboards),
        (spec.monitoring.is_some(), Workload::Monitoring),
        (spec.dbaas_adapter.is_some(), Workload::DbaasAdapter),
        (spec.curator.is_some(), Workload::Curator),
    ];
    for (present, kind) in workloads {
        if present {
            reconcilers.push(Box::new(WorkloadReconciler {
                scope: scope.clone(),
                kind,
            }));
        }
    }
    reconcilers
}

/// Switchover state machine, see [`reconcile_disaster_recovery`]
pub struct DisasterRecovery {
    scope: ReconcileScope,
}

#[async_trait]
impl FeatureReconciler for DisasterRecovery {
    fn name(&self) -> &'static str {
        "disaster-recovery"
    }

    async fn reconcile_config(&self) -> Result<()> {
        let Some(dr) = &self.scope.cr.spec.disaster_recovery else {
            return Ok(());
        };
        if self.scope.session.hash(DR_CONFIG_HASH).is_none() {
            self.scope
                .adopt(AdoptedKind::ConfigMap, &dr.config_map_name)
                .await?;
        }
        Ok(())
    }

    async fn apply_configuration(&self) -> Result<()> {
        reconcile_disaster_recovery(&self.scope.access, &self.scope.session, &self.scope.cr).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    Dashboards,
    Monitoring,
    DbaasAdapter,
    Curator,
}

/// Deployment that is rolled when the credentials it consumes change
pub struct WorkloadReconciler {
    scope: ReconcileScope,
    kind: Workload,
}

impl WorkloadReconciler {
    /// Deployment name, credentials secret and the hash key of that secret
    fn target(&self) -> Option<(String, Option<String>, &'static str)> {
        let spec = &self.scope.cr.spec;
        match self.kind {
            Workload::Dashboards => spec
                .dashboards
                .as_ref()
                .map(|w| (w.name.clone(), w.secret_name.clone(), DASHBOARDS_SECRET_HASH)),
            Workload::Monitoring => spec
                .monitoring
                .as_ref()
                .map(|w| (w.name.clone(), w.secret_name.clone(), MONITORING_SECRET_HASH)),
            Workload::Curator => spec
                .curator
                .as_ref()
                .map(|w| (w.name.clone(), w.secret_name.clone(), CURATOR_SECRET_HASH)),
            Workload::DbaasAdapter => spec.dbaas_adapter.as_ref().map(|a| {
                (
                    a.name.clone(),
                    Some(a.secret_name.clone()),
                    DBAAS_ADAPTER_SECRET_HASH,
                )
            }),
        }
    }

    /// Replica count the DR role asks for, `None` when the workload is left alone
    fn dr_replicas(&self) -> Option<i32> {
        let dr = self.scope.cr.spec.disaster_recovery.as_ref()?;
        let status = self.scope.cr.dr_status();
        let applies = match self.kind {
            Workload::DbaasAdapter => status.mode.is_some(),
            Workload::Curator => {
                status.mode != Some(dr.mode) || status.status == SwitchoverStatus::Failed
            }
            Workload::Dashboards | Workload::Monitoring => false,
        };
        applies.then_some(if dr.mode == DrMode::Active { 1 } else { 0 })
    }
}

#[async_trait]
impl FeatureReconciler for WorkloadReconciler {
    fn name(&self) -> &'static str {
        match self.kind {
            Workload::Dashboards => "dashboards",
            Workload::Monitoring => "monitoring",
            Workload::DbaasAdapter => "dbaas-adapter",
            Workload::Curator => "curator",
        }
    }

    async fn reconcile_config(&self) -> Result<()> {
        let Some((deployment, secret, hash_key)) = self.target() else {
            return Ok(());
        };
        let scope = &self.scope;
        let session = &scope.session;

        let own_hash = match secret.filter(|s| !s.is_empty()) {
            Some(secret) => scope.secret_hash(&secret, hash_key).await?,
            None => String::new(),
        };
        let mut changed = scope.opensearch_secret_changed() || session.hash_changed(hash_key, &own_hash);

        let mut annotations = BTreeMap::from([
            (OPENSEARCH_SECRET_HASH.to_string(), scope.opensearch_secret_hash.clone()),
            (hash_key.to_string(), own_hash.clone()),
        ]);

        if self.kind == Workload::Monitoring {
            let old_hash = scope
                .secret_hash(&scope.cr.credentials_secret_name(), OPENSEARCH_OLD_SECRET_HASH)
                .await?;
            changed |= session.hash_changed(OPENSEARCH_OLD_SECRET_HASH, &old_hash);
            annotations.insert(OPENSEARCH_OLD_SECRET_HASH.to_string(), old_hash.clone());
            session.set_hash(OPENSEARCH_OLD_SECRET_HASH, &old_hash);
        }

        if changed {
            info!(deployment, "Credentials changed, rolling deployment");
            scope
                .access
                .store
                .annotate_deployment_template(&scope.namespace(), &deployment, annotations)
                .await?;
        }
        session.set_hash(hash_key, &own_hash);
        Ok(())
    }

    async fn apply_configuration(&self) -> Result<()> {
        let Some(replicas) = self.dr_replicas() else {
            return Ok(());
        };
        let Some((deployment, _, _)) = self.target() else {
            return Ok(());
        };
        let no_wait = self
            .scope
            .cr
            .spec
            .disaster_recovery
            .as_ref()
            .is_some_and(|dr| dr.no_wait);
        debug!(deployment, replicas, no_wait, "Scaling deployment for DR role");
        scale_deployment_and_wait(
            self.scope.access.store.as_ref(),
            &self.scope.namespace(),
            &deployment,
            replicas,
            no_wait,
            &self.scope.access.config.timings,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::cluster::testing::access;
    use crate::controller::fake::{dr_service, service, FakeStore, NAMESPACE};
    use crate::crd::{
        DbaasAdapterConfig, DisasterRecoveryStatus, OpenSearchConfig, OpenSearchServiceStatus,
        WorkloadConfig,
    };

    fn scope(cr: OpenSearchService, store: Arc<FakeStore>, secret_hash: &str) -> ReconcileScope {
        let access = access(store, "http://127.0.0.1:9");
        let session = Arc::new(ObjectSession::new(access.clone(), NAMESPACE, "opensearch"));
        ReconcileScope {
            access,
            session,
            cr: Arc::new(cr),
            opensearch_secret_hash: secret_hash.to_string(),
        }
    }

    fn with_uid(mut cr: OpenSearchService) -> OpenSearchService {
        cr.metadata.uid = Some("0b6f0a1e".to_string());
        cr
    }

    #[tokio::test]
    async fn test_reconcilers_follow_spec_sections() {
        let mut cr = dr_service("opensearch", DrMode::Active);
        cr.spec.opensearch = Some(OpenSearchConfig::default());
        cr.spec.curator = Some(WorkloadConfig {
            name: "curator".to_string(),
            secret_name: None,
        });
        cr.spec.dashboards = Some(WorkloadConfig::default());
        let store = Arc::new(FakeStore::default());

        let names: Vec<_> = build_reconcilers(&scope(cr, store, ""))
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(
            names,
            vec!["opensearch", "disaster-recovery", "dashboards", "curator"]
        );
    }

    #[tokio::test]
    async fn test_dashboards_rolled_only_after_secret_change() {
        let mut cr = with_uid(service("opensearch"));
        cr.spec.dashboards = Some(WorkloadConfig {
            name: "dashboards".to_string(),
            secret_name: Some("dashboards-secret".to_string()),
        });
        let store = Arc::new(FakeStore::with_service(cr.clone()));
        store.set_secret("dashboards-secret", &[("password", "one")]);
        let scope = scope(cr, store.clone(), "os-hash");
        let reconciler = WorkloadReconciler {
            scope: scope.clone(),
            kind: Workload::Dashboards,
        };

        reconciler.reconcile_config().await.unwrap();
        assert!(store.template_annotations("dashboards").is_empty());
        assert_eq!(
            store.adopted(),
            vec![(AdoptedKind::Secret, "dashboards-secret".to_string())]
        );

        reconciler.reconcile_config().await.unwrap();
        assert!(store.template_annotations("dashboards").is_empty());

        store.set_secret("dashboards-secret", &[("password", "two")]);
        reconciler.reconcile_config().await.unwrap();
        let annotations = store.template_annotations("dashboards");
        assert_eq!(annotations.get(OPENSEARCH_SECRET_HASH).map(String::as_str), Some("os-hash"));
        assert!(annotations.contains_key(DASHBOARDS_SECRET_HASH));
    }

    #[tokio::test]
    async fn test_opensearch_secret_change_rolls_workloads() {
        let mut cr = with_uid(service("opensearch"));
        cr.spec.curator = Some(WorkloadConfig {
            name: "curator".to_string(),
            secret_name: None,
        });
        let store = Arc::new(FakeStore::with_service(cr.clone()));
        let scope = scope(cr, store.clone(), "new-hash");
        scope.session.set_hash(OPENSEARCH_SECRET_HASH, "old-hash");

        WorkloadReconciler {
            scope,
            kind: Workload::Curator,
        }
        .reconcile_config()
        .await
        .unwrap();

        assert_eq!(
            store
                .template_annotations("curator")
                .get(OPENSEARCH_SECRET_HASH)
                .map(String::as_str),
            Some("new-hash")
        );
    }

    #[tokio::test]
    async fn test_adapter_follows_dr_role() {
        let mut cr = dr_service("opensearch", DrMode::Standby);
        cr.spec.dbaas_adapter = Some(DbaasAdapterConfig {
            name: "dbaas-adapter".to_string(),
            secret_name: "dbaas-secret".to_string(),
            ..Default::default()
        });
        let store = Arc::new(FakeStore::with_service(cr.clone()));

        // No recorded mode yet: the adapter is left alone.
        let fresh = WorkloadReconciler {
            scope: scope(cr.clone(), store.clone(), ""),
            kind: Workload::DbaasAdapter,
        };
        fresh.apply_configuration().await.unwrap();
        assert_eq!(store.deployment_replicas("dbaas-adapter"), None);

        cr.status = Some(OpenSearchServiceStatus {
            disaster_recovery_status: DisasterRecoveryStatus {
                mode: Some(DrMode::Standby),
                status: SwitchoverStatus::Done,
                ..Default::default()
            },
            ..Default::default()
        });
        let settled = WorkloadReconciler {
            scope: scope(cr, store.clone(), ""),
            kind: Workload::DbaasAdapter,
        };
        settled.apply_configuration().await.unwrap();
        assert_eq!(store.deployment_replicas("dbaas-adapter"), Some(0));
    }

    #[tokio::test]
    async fn test_curator_scaled_only_on_role_change() {
        let mut cr = dr_service("opensearch", DrMode::Active);
        cr.spec.curator = Some(WorkloadConfig {
            name: "curator".to_string(),
            secret_name: None,
        });
        cr.status = Some(OpenSearchServiceStatus {
            disaster_recovery_status: DisasterRecoveryStatus {
                mode: Some(DrMode::Active),
                status: SwitchoverStatus::Done,
                ..Default::default()
            },
            ..Default::default()
        });
        let store = Arc::new(FakeStore::with_service(cr.clone()));

        let settled = WorkloadReconciler {
            scope: scope(cr.clone(), store.clone(), ""),
            kind: Workload::Curator,
        };
        settled.apply_configuration().await.unwrap();
        assert_eq!(store.deployment_replicas("curator"), None);

        cr.status
            .as_mut()
            .unwrap()
            .disaster_recovery_status
            .mode = Some(DrMode::Standby);
        let switching = WorkloadReconciler {
            scope: scope(cr, store.clone(), ""),
            kind: Workload::Curator,
        };
        switching.apply_configuration().await.unwrap();
        assert_eq!(store.deployment_replicas("curator"), Some(1));
    }
}
