//! Access to the Kubernetes objects the operator reads and mutates
//!
//! Everything that talks to the API server goes through [`ResourceStore`] so
//! the switchover protocol, the watcher and the admin API can run against an
//! in-memory store in tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Timings;
use crate::crd::{OpenSearchService, OpenSearchServiceStatus};
use crate::error::{Error, Result};
use crate::opensearch::Credentials;

/// Ready vs. total count of a workload group
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub ready: usize,
    pub total: usize,
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<OpenSearchService>;

    async fn list_services(&self, namespace: &str) -> Result<Vec<OpenSearchService>>;

    /// Replace metadata and spec; fails with a conflict when the object changed meanwhile
    async fn replace_service(&self, service: &OpenSearchService) -> Result<OpenSearchService>;

    /// Replace the status subresource; fails with a conflict when the object changed meanwhile
    async fn replace_status(&self, service: &OpenSearchService) -> Result<()>;

    async fn config_map_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>>;

    async fn secret_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>>;

    /// Overwrite the given keys of an existing secret
    async fn patch_secret_data(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Add (`Some`) or remove (`None`) a single selector label of a Service
    async fn set_service_selector(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()>;

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    async fn deployment_ready(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Merge annotations into the pod template of a deployment
    async fn annotate_deployment_template(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    async fn statefulset_readiness(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Readiness>;

    /// Add `owner` to the owner references of a Secret or ConfigMap so its
    /// changes trigger reconciles of the owning resource
    async fn adopt(
        &self,
        kind: AdoptedKind,
        namespace: &str,
        name: &str,
        owner: OwnerReference,
    ) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdoptedKind {
    Secret,
    ConfigMap,
}

/// [`ResourceStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<OpenSearchService> {
        let api: Api<OpenSearchService> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<OpenSearchService>> {
        let api: Api<OpenSearchService> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn replace_service(&self, service: &OpenSearchService) -> Result<OpenSearchService> {
        let (namespace, name) = object_ref(service)?;
        let api: Api<OpenSearchService> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.replace(name, &PostParams::default(), service).await?)
    }

    async fn replace_status(&self, service: &OpenSearchService) -> Result<()> {
        let (namespace, name) = object_ref(service)?;
        let api: Api<OpenSearchService> = Api::namespaced(self.client.clone(), namespace);
        let data = serde_json::to_vec(service)?;
        api.replace_status(name, &PostParams::default(), data).await?;
        Ok(())
    }

    async fn config_map_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?.data.unwrap_or_default())
    }

    async fn secret_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await?;
        Ok(decode_secret_data(secret.data.unwrap_or_default()))
    }

    async fn patch_secret_data(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "stringData": data });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_service_selector(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "selector": { key: value } } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn deployment_ready(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = api.get(name).await?;
        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let status = deployment.status.unwrap_or_default();
        let available = status
            .ready_replicas
            .unwrap_or(0)
            .min(status.updated_replicas.unwrap_or(0));
        Ok(desired == available)
    }

    async fn annotate_deployment_template(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "spec": { "template": { "metadata": { "annotations": annotations } } }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn statefulset_readiness(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Readiness> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let sets = api.list(&ListParams::default().labels(&selector)).await?;

        let total = sets.items.len();
        let ready = sets.items.iter().filter(|s| statefulset_ready(s)).count();
        Ok(Readiness { ready, total })
    }

    async fn adopt(
        &self,
        kind: AdoptedKind,
        namespace: &str,
        name: &str,
        owner: OwnerReference,
    ) -> Result<()> {
        let existing = match kind {
            AdoptedKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                api.get_metadata(name).await?.metadata.owner_references
            }
            AdoptedKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                api.get_metadata(name).await?.metadata.owner_references
            }
        };
        let mut references = existing.unwrap_or_default();
        if references.iter().any(|r| r.uid == owner.uid) {
            return Ok(());
        }
        references.push(owner);

        let patch = json!({ "metadata": { "ownerReferences": references } });
        let params = PatchParams::default();
        match kind {
            AdoptedKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                api.patch(name, &params, &Patch::Merge(&patch)).await?;
            }
            AdoptedKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                api.patch(name, &params, &Patch::Merge(&patch)).await?;
            }
        }
        debug!(namespace, name, ?kind, "Owner reference added");
        Ok(())
    }
}

fn object_ref(service: &OpenSearchService) -> Result<(&str, &str)> {
    let namespace = service
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::ValidationError("OpenSearchService has no namespace".into()))?;
    let name = service
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::ValidationError("OpenSearchService has no name".into()))?;
    Ok((namespace, name))
}

fn decode_secret_data(data: BTreeMap<String, ByteString>) -> BTreeMap<String, String> {
    data.into_iter()
        .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
        .collect()
}

/// A StatefulSet with a non-zero replica count whose replicas are all ready and updated
pub fn statefulset_ready(set: &StatefulSet) -> bool {
    let replicas = set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = set.status.clone().unwrap_or_default();
    let available = status
        .ready_replicas
        .unwrap_or(0)
        .min(status.updated_replicas.unwrap_or(0));
    replicas != 0 && replicas == available
}

/// Read-modify-write of the status subresource, retried on optimistic-concurrency conflicts
pub async fn update_status_with_retry<F>(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
    attempts: u32,
    mutate: F,
) -> Result<()>
where
    F: Fn(&mut OpenSearchServiceStatus) + Send + Sync,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut service = store.get_service(namespace, name).await?;
        let mut status = service.status.take().unwrap_or_default();
        mutate(&mut status);
        service.status = Some(status);

        match store.replace_status(&service).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(namespace, name, attempt, "Status update conflict, retrying");
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Username and password stored under `username_key`/`password_key`; `None` when either is missing
pub async fn secret_credentials(
    store: &dyn ResourceStore,
    namespace: &str,
    secret: &str,
    username_key: &str,
    password_key: &str,
) -> Option<Credentials> {
    match store.secret_data(namespace, secret).await {
        Ok(data) => {
            let username = data.get(username_key).cloned().unwrap_or_default();
            let password = data.get(password_key).cloned().unwrap_or_default();
            (!username.is_empty() && !password.is_empty())
                .then(|| Credentials::new(username, password))
        }
        Err(e) => {
            warn!(namespace, secret, "Cannot read credentials: {e}");
            None
        }
    }
}

/// Scale a deployment and, unless `no_wait`, wait until its replicas are ready
pub async fn scale_deployment_and_wait(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
    replicas: i32,
    no_wait: bool,
    timings: &Timings,
) -> Result<()> {
    store.scale_deployment(namespace, name, replicas).await?;
    info!(namespace, deployment = name, replicas, "Deployment scaled");
    if no_wait {
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + timings.scale_timeout;
    loop {
        match store.deployment_ready(namespace, name).await {
            Ok(true) => return Ok(()),
            Ok(false) => debug!(deployment = name, "Deployment is not ready yet"),
            Err(e) => warn!(deployment = name, "Cannot check deployment status: {e}"),
        }
        if tokio::time::Instant::now() >= deadline {
            let direction = if replicas == 0 { "down" } else { "up" };
            return Err(Error::Timeout(format!(
                "deployment {name} to scale {direction}"
            )));
        }
        tokio::time::sleep(timings.scale_poll_interval).await;
    }
}
