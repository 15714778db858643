//! Clients for the systems a resource talks to: its OpenSearch cluster and,
//! for users recovery, the DBaaS adapter and aggregator.

use std::sync::Arc;

use kube::ResourceExt;

use super::store::{secret_credentials, ResourceStore};
use crate::config::OperatorConfig;
use crate::crd::{DbaasAdapterConfig, OpenSearchService};
use crate::error::{Error, Result};
use crate::opensearch::{ReplicationConfig, ReplicationManager, RestClient, RetryPolicy};

pub(crate) const USERNAME_KEY: &str = "username";
pub(crate) const PASSWORD_KEY: &str = "password";
const AGGREGATOR_USERNAME_KEY: &str = "registration-auth-username";
const AGGREGATOR_PASSWORD_KEY: &str = "registration-auth-password";

/// Shared handles used by the reconcilers, the watcher and the admin API
#[derive(Clone)]
pub struct ClusterAccess {
    pub store: Arc<dyn ResourceStore>,
    pub config: Arc<OperatorConfig>,
    opensearch_http: reqwest::Client,
    dbaas_http: reqwest::Client,
}

impl ClusterAccess {
    pub fn new(store: Arc<dyn ResourceStore>, config: Arc<OperatorConfig>) -> Result<Self> {
        let opensearch_http = config.opensearch_http_client()?;
        let dbaas_http = config.dbaas_http_client()?;
        Ok(Self {
            store,
            config,
            opensearch_http,
            dbaas_http,
        })
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.timings)
    }

    /// Client for the cluster of `cr`, authenticated with the credentials currently applied to it
    pub async fn opensearch_client(&self, cr: &OpenSearchService) -> RestClient {
        let namespace = cr.namespace().unwrap_or_default();
        let credentials = secret_credentials(
            self.store.as_ref(),
            &namespace,
            &cr.credentials_secret_name(),
            USERNAME_KEY,
            PASSWORD_KEY,
        )
        .await;
        RestClient::new(
            self.config.opensearch_url(&cr.name_any()),
            self.opensearch_http.clone(),
            credentials,
            self.retry(),
        )
    }

    /// Replication parameters from the DR config map of `cr`
    pub async fn replication_config(&self, cr: &OpenSearchService) -> Result<ReplicationConfig> {
        let dr = cr.spec.disaster_recovery.as_ref().ok_or_else(|| {
            Error::ConfigError("disaster recovery is not configured".to_string())
        })?;
        let namespace = cr.namespace().unwrap_or_default();
        let data = self
            .store
            .config_map_data(&namespace, &dr.config_map_name)
            .await?;
        Ok(ReplicationConfig::from_config_map_data(&data))
    }

    pub async fn replication_manager(&self, cr: &OpenSearchService) -> Result<ReplicationManager> {
        let config = self.replication_config(cr).await?;
        Ok(ReplicationManager::new(self.opensearch_client(cr).await, config))
    }

    pub async fn aggregator_client(&self, cr: &OpenSearchService, adapter: &DbaasAdapterConfig) -> RestClient {
        let namespace = cr.namespace().unwrap_or_default();
        let credentials = secret_credentials(
            self.store.as_ref(),
            &namespace,
            &adapter.secret_name,
            AGGREGATOR_USERNAME_KEY,
            AGGREGATOR_PASSWORD_KEY,
        )
        .await;
        RestClient::new(
            adapter.aggregator_address.clone(),
            self.dbaas_http.clone(),
            credentials,
            self.retry(),
        )
    }

    pub async fn adapter_client(&self, cr: &OpenSearchService, adapter: &DbaasAdapterConfig) -> RestClient {
        let namespace = cr.namespace().unwrap_or_default();
        let credentials = secret_credentials(
            self.store.as_ref(),
            &namespace,
            &adapter.secret_name,
            USERNAME_KEY,
            PASSWORD_KEY,
        )
        .await;
        RestClient::new(
            adapter.adapter_address.clone(),
            self.dbaas_http.clone(),
            credentials,
            self.retry(),
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::Timings;
    use crate::controller::fake::FakeStore;

    /// Access pointing at `url` with millisecond timings
    pub fn access(store: Arc<FakeStore>, url: &str) -> ClusterAccess {
        let config = OperatorConfig {
            namespace: crate::controller::fake::NAMESPACE.to_string(),
            opensearch_host: Some(url.to_string()),
            timings: Timings::fast(),
            ..Default::default()
        };
        ClusterAccess::new(store, Arc::new(config)).unwrap()
    }
}
