//! Settings pushed to the OpenSearch cluster itself: admin credentials,
//! security plugin configuration, snapshot repository and compatibility mode

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use super::cluster::{PASSWORD_KEY, USERNAME_KEY};
use super::feature::{FeatureReconciler, ReconcileScope};
use super::hashes::{hash_data, SECURITY_CONFIG_HASH};
use super::store::{secret_credentials, AdoptedKind};
use crate::crd::{OpenSearchConfig, SnapshotsConfig};
use crate::error::{Error, Result};
use crate::opensearch::{Credentials, RestClient};

const INTERNAL_USERS_PATH: &str = "_plugins/_security/api/internalusers";
const SECURITY_CONFIG_PATH: &str = "_plugins/_security/api/securityconfig/config";
const SECURITY_CONFIG_FILE: &str = "config.yml";
const SNAPSHOTS_LOCATION: &str = "/usr/share/opensearch/snapshots";
const S3_KEY_ID: &str = "s3-key-id";
const S3_KEY_SECRET: &str = "s3-key-secret";

pub struct OpenSearchCore {
    scope: ReconcileScope,
}

impl OpenSearchCore {
    pub fn new(scope: ReconcileScope) -> Self {
        Self { scope }
    }

    fn config(&self) -> Option<&OpenSearchConfig> {
        self.scope.cr.spec.opensearch.as_ref()
    }

    /// Move the cluster to the credentials of `{name}-secret`
    ///
    /// Returns a client authenticated with whatever credentials are in effect afterwards.
    #[instrument(skip(self))]
    async fn rotate_credentials(&self) -> Result<RestClient> {
        let store = self.scope.access.store.as_ref();
        let namespace = self.scope.namespace();
        let cr = &self.scope.cr;
        let applied_secret = cr.credentials_secret_name();

        let applied =
            secret_credentials(store, &namespace, &applied_secret, USERNAME_KEY, PASSWORD_KEY).await;
        let desired = secret_credentials(
            store,
            &namespace,
            &cr.desired_credentials_secret_name(),
            USERNAME_KEY,
            PASSWORD_KEY,
        )
        .await;
        let client = self.scope.access.opensearch_client(cr).await;

        let Some(desired) = desired else {
            return Ok(client);
        };
        if applied.as_ref() == Some(&desired) {
            return Ok(client);
        }

        match &applied {
            Some(applied) if applied.username == desired.username => {
                change_password(&client, &desired).await?;
            }
            _ => {
                create_user(&client, &desired).await?;
                if let Some(applied) = &applied {
                    remove_user(&client, &applied.username).await?;
                }
            }
        }

        let data = BTreeMap::from([
            (USERNAME_KEY.to_string(), desired.username.clone()),
            (PASSWORD_KEY.to_string(), desired.password.clone()),
        ]);
        store
            .patch_secret_data(&namespace, &applied_secret, data)
            .await?;
        info!(username = %desired.username, "Cluster credentials were rotated");

        Ok(self.scope.access.opensearch_client(cr).await)
    }

    /// Push the `config` section of the security configuration after it changed
    async fn update_security_configuration(&self, client: &RestClient) -> Result<()> {
        let Some(secret) = self
            .config()
            .map(|c| c.security_configuration_name.clone())
            .filter(|name| !name.is_empty())
        else {
            return Ok(());
        };
        let session = &self.scope.session;
        if session.hash(SECURITY_CONFIG_HASH).is_none() {
            self.scope.adopt(AdoptedKind::Secret, &secret).await?;
        }

        let data = self
            .scope
            .access
            .store
            .secret_data(&self.scope.namespace(), &secret)
            .await?;
        let hash = hash_data(&data)?;
        if session.hash_changed(SECURITY_CONFIG_HASH, &hash) {
            push_security_config(client, data.get(SECURITY_CONFIG_FILE).map(String::as_str)).await?;
        }
        session.set_hash(SECURITY_CONFIG_HASH, &hash);
        Ok(())
    }

    async fn s3_credentials(&self, secret: &str) -> (String, String) {
        match self
            .scope
            .access
            .store
            .secret_data(&self.scope.namespace(), secret)
            .await
        {
            Ok(data) => (
                data.get(S3_KEY_ID).cloned().unwrap_or_default(),
                data.get(S3_KEY_SECRET).cloned().unwrap_or_default(),
            ),
            Err(e) => {
                info!("Cannot read s3 credentials secret, using empty credentials: {e}");
                (String::new(), String::new())
            }
        }
    }

    async fn create_snapshot_repository(
        &self,
        client: &RestClient,
        snapshots: &SnapshotsConfig,
    ) -> Result<()> {
        info!(repository = %snapshots.repository_name, "Create a snapshot repository");
        let (key_id, key_secret) = match &snapshots.s3 {
            Some(s3) if s3.enabled && !s3.gcs_enabled => self.s3_credentials(&s3.secret_name).await,
            _ => (String::new(), String::new()),
        };
        let body = snapshot_repository_body(snapshots, &key_id, &key_secret);
        let path = format!("_snapshot/{}", snapshots.repository_name);

        let timings = &self.scope.access.config.timings;
        let mut last = None;
        for attempt in 1..=timings.snapshot_repository_attempts {
            match client.send(Method::PUT, &path, Some(&body)).await {
                Ok(response) if response.status == StatusCode::OK => {
                    info!("Snapshot repository is created");
                    return Ok(());
                }
                Ok(response) => {
                    warn!(attempt, status = response.status.as_u16(), "Snapshot repository is not created");
                    last = Some(response);
                }
                Err(e) => warn!(attempt, "Snapshot repository is not created: {e}"),
            }
            if attempt < timings.snapshot_repository_attempts {
                tokio::time::sleep(timings.snapshot_repository_retry_interval).await;
            }
        }
        Err(Error::RemoteApi {
            method: Method::PUT.to_string(),
            path,
            status: last.as_ref().map(|r| r.status.as_u16()).unwrap_or_default(),
            body: last.map(|r| r.body).unwrap_or_default(),
        })
    }
}

async fn create_user(client: &RestClient, credentials: &Credentials) -> Result<()> {
    let body = json!({
        "password": credentials.password,
        "description": "Admin user",
        "backend_roles": ["admin"],
        "opendistro_security_roles": ["all_access", "manage_snapshots"]
    });
    client
        .send_checked(
            Method::PUT,
            &format!("{INTERNAL_USERS_PATH}/{}", credentials.username),
            Some(&body),
        )
        .await?;
    info!(username = %credentials.username, "The user is successfully created");
    Ok(())
}

async fn change_password(client: &RestClient, credentials: &Credentials) -> Result<()> {
    let body = json!([{ "op": "add", "path": "/password", "value": credentials.password }]);
    client
        .send_checked(
            Method::PATCH,
            &format!("{INTERNAL_USERS_PATH}/{}", credentials.username),
            Some(&body),
        )
        .await?;
    info!(username = %credentials.username, "The password for user is successfully updated");
    Ok(())
}

async fn remove_user(client: &RestClient, username: &str) -> Result<()> {
    let path = format!("{INTERNAL_USERS_PATH}/{username}");
    let response = client.send(Method::DELETE, &path, None).await?;
    if response.is_success() || response.status == StatusCode::NOT_FOUND {
        info!(username, "The user is successfully deleted");
        return Ok(());
    }
    Err(Error::RemoteApi {
        method: Method::DELETE.to_string(),
        path,
        status: response.status.as_u16(),
        body: response.body,
    })
}

async fn push_security_config(client: &RestClient, config_yaml: Option<&str>) -> Result<()> {
    let parsed: Option<Value> = config_yaml
        .map(serde_yaml::from_str)
        .transpose()
        .map_err(|e| Error::ConfigError(format!("invalid security configuration: {e}")))?;
    let Some(config) = parsed
        .as_ref()
        .and_then(|v| v.get("config"))
        .filter(|c| !c.is_null())
    else {
        info!("Security configuration is empty, so there is nothing to update");
        return Ok(());
    };
    client
        .send_checked(Method::PUT, SECURITY_CONFIG_PATH, Some(config))
        .await?;
    info!("Security configuration is successfully updated");
    Ok(())
}

/// Repository definition for `PUT _snapshot/{name}`: GCS, S3 or the shared filesystem
pub fn snapshot_repository_body(snapshots: &SnapshotsConfig, key_id: &str, key_secret: &str) -> Value {
    match &snapshots.s3 {
        Some(s3) if s3.gcs_enabled => json!({
            "type": "gcs",
            "settings": { "bucket": s3.bucket, "client": "default" }
        }),
        Some(s3) if s3.enabled => json!({
            "type": "s3",
            "settings": {
                "base_path": s3.base_path,
                "bucket": s3.bucket,
                "region": s3.region,
                "endpoint": s3.url,
                "protocol": "http",
                "access_key": key_id,
                "secret_key": key_secret,
                "compress": true,
                "path_style_access": s3.path_style_access.to_string()
            }
        }),
        _ => json!({
            "type": "fs",
            "settings": { "location": SNAPSHOTS_LOCATION, "compress": true }
        }),
    }
}

async fn enable_compatibility_mode(client: &RestClient) -> Result<()> {
    let body = json!({ "persistent": { "compatibility.override_main_response_version": true } });
    client
        .send_checked(Method::PUT, "_cluster/settings", Some(&body))
        .await?;
    info!("Compatibility mode is enabled");
    Ok(())
}

#[async_trait]
impl FeatureReconciler for OpenSearchCore {
    fn name(&self) -> &'static str {
        "opensearch"
    }

    async fn reconcile_config(&self) -> Result<()> {
        Ok(())
    }

    async fn apply_configuration(&self) -> Result<()> {
        let Some(config) = self.config() else {
            return Ok(());
        };
        let client = self.rotate_credentials().await?;
        self.update_security_configuration(&client).await?;

        if let Some(snapshots) = &config.snapshots {
            self.create_snapshot_repository(&client, snapshots).await?;
        }
        if config.compatibility_mode_enabled {
            enable_compatibility_mode(&client).await?;
        }
        Ok(())
    }
}
