//! In-memory [`ResourceStore`] used by unit tests

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ErrorResponse;

use super::store::{AdoptedKind, Readiness, ResourceStore};
use crate::crd::{
    DisasterRecoveryConfig, DisasterRecoveryStatus, DrMode, OpenSearchService,
    OpenSearchServiceSpec,
};
use crate::error::{Error, Result};

pub const NAMESPACE: &str = "ns";

/// A resource named `name` in [`NAMESPACE`] without any optional section
pub fn service(name: &str) -> OpenSearchService {
    let mut svc = OpenSearchService::new(name, OpenSearchServiceSpec::default());
    svc.metadata.namespace = Some(NAMESPACE.to_string());
    svc.metadata.resource_version = Some("1".to_string());
    svc
}

/// A resource with a disaster recovery section in `mode`
pub fn dr_service(name: &str, mode: DrMode) -> OpenSearchService {
    let mut svc = service(name);
    svc.spec.disaster_recovery = Some(DisasterRecoveryConfig {
        mode,
        no_wait: false,
        config_map_name: format!("{name}-replication-config"),
        replication_watcher_enabled: false,
        replication_watcher_interval: 0,
    });
    svc
}

fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

/// Selector mutations observed on Services, in order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectorChange {
    Set(String, String),
    Removed(String),
}

#[derive(Default)]
struct State {
    services: BTreeMap<String, OpenSearchService>,
    config_maps: HashMap<String, BTreeMap<String, String>>,
    secrets: HashMap<String, BTreeMap<String, String>>,
    selectors: HashMap<String, BTreeMap<String, String>>,
    selector_changes: Vec<(String, SelectorChange)>,
    deployments_ready: HashMap<String, bool>,
    deployment_replicas: HashMap<String, i32>,
    annotations: HashMap<String, BTreeMap<String, String>>,
    statefulsets: Readiness,
    adopted: Vec<(AdoptedKind, String)>,
    pending_conflicts: u32,
    status_history: Vec<DisasterRecoveryStatus>,
}

#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    pub fn with_service(svc: OpenSearchService) -> Self {
        let store = Self::default();
        store.put_service(svc);
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn put_service(&self, svc: OpenSearchService) {
        let name = svc.metadata.name.clone().unwrap_or_default();
        self.lock().services.insert(name, svc);
    }

    /// Current copy of the only (or first) stored resource
    pub fn current(&self) -> OpenSearchService {
        self.lock().services.values().next().cloned().unwrap()
    }

    pub fn dr_status(&self) -> DisasterRecoveryStatus {
        self.current().dr_status()
    }

    /// Every DR status written through `replace_status`, oldest first
    pub fn status_history(&self) -> Vec<DisasterRecoveryStatus> {
        self.lock().status_history.clone()
    }

    /// Mutate the stored resource in place, as an administrator would
    pub fn edit(&self, f: impl FnOnce(&mut OpenSearchService)) {
        let mut state = self.lock();
        if let Some(svc) = state.services.values_mut().next() {
            f(svc);
            bump_version(svc);
        }
    }

    pub fn fail_status_updates_with_conflict(&self, count: u32) {
        self.lock().pending_conflicts = count;
    }

    pub fn set_config_map(&self, name: &str, data: &[(&str, &str)]) {
        self.lock().config_maps.insert(name.to_string(), to_map(data));
    }

    pub fn set_secret(&self, name: &str, data: &[(&str, &str)]) {
        self.lock().secrets.insert(name.to_string(), to_map(data));
    }

    pub fn secret(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.lock().secrets.get(name).cloned()
    }

    pub fn service_selector(&self, name: &str) -> BTreeMap<String, String> {
        self.lock().selectors.get(name).cloned().unwrap_or_default()
    }

    pub fn selector_changes(&self) -> Vec<(String, SelectorChange)> {
        self.lock().selector_changes.clone()
    }

    pub fn set_deployment_ready(&self, name: &str, ready: bool) {
        self.lock().deployments_ready.insert(name.to_string(), ready);
    }

    pub fn deployment_replicas(&self, name: &str) -> Option<i32> {
        self.lock().deployment_replicas.get(name).copied()
    }

    pub fn template_annotations(&self, name: &str) -> BTreeMap<String, String> {
        self.lock().annotations.get(name).cloned().unwrap_or_default()
    }

    pub fn set_statefulsets(&self, ready: usize, total: usize) {
        self.lock().statefulsets = Readiness { ready, total };
    }

    pub fn adopted(&self) -> Vec<(AdoptedKind, String)> {
        self.lock().adopted.clone()
    }
}

fn to_map(data: &[(&str, &str)]) -> BTreeMap<String, String> {
    data.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn bump_version(svc: &mut OpenSearchService) {
    let next = svc
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    svc.metadata.resource_version = Some(next.to_string());
}

fn check_version(stored: &OpenSearchService, incoming: &OpenSearchService) -> Result<()> {
    if incoming.metadata.resource_version.is_some()
        && incoming.metadata.resource_version != stored.metadata.resource_version
    {
        return Err(api_error(409, "Conflict"));
    }
    Ok(())
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn get_service(&self, _namespace: &str, name: &str) -> Result<OpenSearchService> {
        self.lock()
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))
    }

    async fn list_services(&self, _namespace: &str) -> Result<Vec<OpenSearchService>> {
        Ok(self.lock().services.values().cloned().collect())
    }

    async fn replace_service(&self, service: &OpenSearchService) -> Result<OpenSearchService> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let mut state = self.lock();
        let stored = state
            .services
            .get_mut(&name)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        check_version(stored, service)?;
        stored.metadata = service.metadata.clone();
        stored.spec = service.spec.clone();
        bump_version(stored);
        Ok(stored.clone())
    }

    async fn replace_status(&self, service: &OpenSearchService) -> Result<()> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let mut state = self.lock();
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            if let Some(stored) = state.services.get_mut(&name) {
                bump_version(stored);
            }
            return Err(api_error(409, "Conflict"));
        }
        let stored = state
            .services
            .get_mut(&name)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        check_version(stored, service)?;
        stored.status = service.status.clone();
        bump_version(stored);
        let dr = stored.dr_status();
        state.status_history.push(dr);
        Ok(())
    }

    async fn config_map_data(&self, _namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        self.lock()
            .config_maps
            .get(name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))
    }

    async fn secret_data(&self, _namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        self.lock()
            .secrets
            .get(name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))
    }

    async fn patch_secret_data(
        &self,
        _namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.lock();
        let secret = state
            .secrets
            .get_mut(name)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        secret.extend(data);
        Ok(())
    }

    async fn set_service_selector(
        &self,
        _namespace: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let mut state = self.lock();
        let selector = state.selectors.entry(name.to_string()).or_default();
        let change = match value {
            Some(v) => {
                selector.insert(key.to_string(), v.to_string());
                SelectorChange::Set(key.to_string(), v.to_string())
            }
            None => {
                selector.remove(key);
                SelectorChange::Removed(key.to_string())
            }
        };
        state.selector_changes.push((name.to_string(), change));
        Ok(())
    }

    async fn scale_deployment(&self, _namespace: &str, name: &str, replicas: i32) -> Result<()> {
        self.lock()
            .deployment_replicas
            .insert(name.to_string(), replicas);
        Ok(())
    }

    async fn deployment_ready(&self, _namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .lock()
            .deployments_ready
            .get(name)
            .copied()
            .unwrap_or(true))
    }

    async fn annotate_deployment_template(
        &self,
        _namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        self.lock()
            .annotations
            .entry(name.to_string())
            .or_default()
            .extend(annotations);
        Ok(())
    }

    async fn statefulset_readiness(
        &self,
        _namespace: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<Readiness> {
        Ok(self.lock().statefulsets)
    }

    async fn adopt(
        &self,
        kind: AdoptedKind,
        _namespace: &str,
        name: &str,
        _owner: OwnerReference,
    ) -> Result<()> {
        let mut state = self.lock();
        let entry = (kind, name.to_string());
        if !state.adopted.contains(&entry) {
            state.adopted.push(entry);
        }
        Ok(())
    }
}
