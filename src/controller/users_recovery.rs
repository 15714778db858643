//! Restoration of database user passwords after a cluster becomes active
//!
//! The DBaaS aggregator is asked to push the stored passwords back through the
//! adapter; the adapter then reports the progress of that procedure.

use reqwest::Method;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use super::cluster::ClusterAccess;
use super::store::update_status_with_retry;
use crate::crd::{DbaasAdapterConfig, OpenSearchService, UsersRecoveryState};
use crate::error::{Error, Result};
use crate::opensearch::RestClient;

const RESTORE_PASSWORD_PATH: &str = "api/v3/dbaas/internal/physical_databases/users/restore-password";
const RESTORE_STATE_PATH: &str = "api/v2/dbaas/adapter/opensearch/users/restore-password/state";

async fn persist_state(
    access: &ClusterAccess,
    cr: &OpenSearchService,
    state: UsersRecoveryState,
) -> Result<()> {
    let namespace = cr.metadata.namespace.as_deref().unwrap_or_default();
    let name = cr.metadata.name.as_deref().unwrap_or_default();
    update_status_with_retry(
        access.store.as_ref(),
        namespace,
        name,
        access.config.timings.status_conflict_attempts,
        |status| status.disaster_recovery_status.users_recovery_state = Some(state),
    )
    .await
}

/// Ask the aggregator to restore passwords, retrying until it answers 200
async fn request_password_restore(
    aggregator: &RestClient,
    body: &Value,
    access: &ClusterAccess,
) -> Result<()> {
    let timings = &access.config.timings;
    let deadline = Instant::now() + timings.users_recovery_timeout;
    loop {
        match aggregator
            .send(Method::POST, RESTORE_PASSWORD_PATH, Some(body))
            .await
        {
            Ok(response) if response.status == reqwest::StatusCode::OK => return Ok(()),
            Ok(response) => error!(
                status = response.status.as_u16(),
                body = %response.body,
                "Unable to restore user passwords via DBaaS aggregator"
            ),
            Err(e) => error!("Unable to restore user passwords via DBaaS aggregator: {e}"),
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout("DBaaS aggregator to accept password restoration".into()));
        }
        tokio::time::sleep(timings.aggregator_retry_interval).await;
    }
}

async fn fetch_state(adapter: &RestClient) -> Option<UsersRecoveryState> {
    match adapter.send(Method::GET, RESTORE_STATE_PATH, None).await {
        Ok(response) if response.is_success() => match response.body.parse() {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Unexpected users recovery state: {e}");
                None
            }
        },
        Ok(response) => {
            warn!(
                status = response.status.as_u16(),
                body = %response.body,
                "Unable to get state of users recovery procedure"
            );
            None
        }
        Err(e) => {
            warn!("Unable to get state of users recovery procedure: {e}");
            None
        }
    }
}

/// Run users recovery to a terminal state and record it in the status
///
/// A resource that never recorded a recovery state is a fresh installation;
/// it is marked `done` without contacting anyone.
#[instrument(skip_all, fields(name = %cr.metadata.name.as_deref().unwrap_or_default()))]
pub async fn recover_users(
    access: &ClusterAccess,
    cr: &OpenSearchService,
    adapter: &DbaasAdapterConfig,
) -> Result<()> {
    let Some(recorded) = cr.dr_status().users_recovery_state else {
        persist_state(access, cr, UsersRecoveryState::Done).await?;
        info!("Users recovery is not run during installation");
        return Ok(());
    };

    let mut state = match recorded {
        UsersRecoveryState::Running => UsersRecoveryState::Running,
        _ => UsersRecoveryState::Idle,
    };

    let aggregator = access.aggregator_client(cr, adapter).await;
    let adapter_client = access.adapter_client(cr, adapter).await;
    let body = json!({
        "physicalDbId": adapter.physical_database_identifier,
        "type": "opensearch",
        "settings": {}
    });

    let timings = &access.config.timings;
    let deadline = Instant::now() + timings.users_recovery_timeout;
    while !state.is_terminal() {
        if Instant::now() >= deadline {
            warn!("Users recovery did not finish in {:?}", timings.users_recovery_timeout);
            state = UsersRecoveryState::Failed;
            break;
        }
        if state == UsersRecoveryState::Idle {
            if let Err(e) = request_password_restore(&aggregator, &body, access).await {
                error!("Users recovery was not accepted: {e}");
                state = UsersRecoveryState::Failed;
                continue;
            }
            persist_state(access, cr, UsersRecoveryState::Running).await?;
        }
        tokio::time::sleep(timings.users_recovery_poll_interval).await;
        if let Some(reported) = fetch_state(&adapter_client).await {
            state = reported;
        }
    }

    persist_state(access, cr, state).await?;
    info!(?state, "Users recovery is finished");
    if state == UsersRecoveryState::Failed {
        return Err(Error::UsersRecoveryError(
            "unable to restore OpenSearch users during switchover".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::cluster::testing::access;
    use crate::controller::fake::{dr_service, FakeStore};
    use crate::crd::{DisasterRecoveryStatus, DrMode, OpenSearchServiceStatus};
    use std::sync::Arc;
    use wiremock::matchers::{basic_auth, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> DbaasAdapterConfig {
        DbaasAdapterConfig {
            name: "dbaas-opensearch-adapter".to_string(),
            secret_name: "dbaas-adapter-secret".to_string(),
            adapter_address: server.uri(),
            aggregator_address: server.uri(),
            physical_database_identifier: "opensearch-1".to_string(),
        }
    }

    fn with_recovery_state(state: Option<UsersRecoveryState>) -> OpenSearchService {
        let mut cr = dr_service("opensearch", DrMode::Active);
        cr.status = Some(OpenSearchServiceStatus {
            disaster_recovery_status: DisasterRecoveryStatus {
                users_recovery_state: state,
                ..Default::default()
            },
            ..Default::default()
        });
        cr
    }

    fn store_for(cr: OpenSearchService) -> Arc<FakeStore> {
        let store = Arc::new(FakeStore::with_service(cr));
        store.set_secret(
            "dbaas-adapter-secret",
            &[
                ("username", "adapter"),
                ("password", "adapter-pass"),
                ("registration-auth-username", "agg"),
                ("registration-auth-password", "agg-pass"),
            ],
        );
        store
    }

    #[tokio::test]
    async fn test_fresh_install_is_marked_done_without_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cr = with_recovery_state(None);
        let store = store_for(cr.clone());
        let access = access(store.clone(), &server.uri());

        recover_users(&access, &cr, &adapter(&server)).await.unwrap();
        assert_eq!(
            store.dr_status().users_recovery_state,
            Some(UsersRecoveryState::Done)
        );
    }

    #[tokio::test]
    async fn test_recovery_runs_until_adapter_reports_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{RESTORE_PASSWORD_PATH}")))
            .and(basic_auth("agg", "agg-pass"))
            .and(body_partial_json(json!({"physicalDbId": "opensearch-1", "type": "opensearch"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/{RESTORE_STATE_PATH}")))
            .and(basic_auth("adapter", "adapter-pass"))
            .respond_with(ResponseTemplate::new(200).set_body_string("\"done\""))
            .mount(&server)
            .await;

        let cr = with_recovery_state(Some(UsersRecoveryState::Done));
        let store = store_for(cr.clone());
        let access = access(store.clone(), &server.uri());

        recover_users(&access, &cr, &adapter(&server)).await.unwrap();

        let states: Vec<_> = store
            .status_history()
            .into_iter()
            .filter_map(|s| s.users_recovery_state)
            .collect();
        assert_eq!(
            states,
            vec![UsersRecoveryState::Running, UsersRecoveryState::Done]
        );
    }

    #[tokio::test]
    async fn test_running_recovery_only_polls_adapter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/{RESTORE_STATE_PATH}")))
            .respond_with(ResponseTemplate::new(200).set_body_string("done"))
            .mount(&server)
            .await;

        let cr = with_recovery_state(Some(UsersRecoveryState::Running));
        let store = store_for(cr.clone());
        let access = access(store.clone(), &server.uri());

        recover_users(&access, &cr, &adapter(&server)).await.unwrap();
        assert_eq!(
            store.dr_status().users_recovery_state,
            Some(UsersRecoveryState::Done)
        );
    }

    #[tokio::test]
    async fn test_failed_procedure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/{RESTORE_STATE_PATH}")))
            .respond_with(ResponseTemplate::new(200).set_body_string("failed"))
            .mount(&server)
            .await;

        let cr = with_recovery_state(Some(UsersRecoveryState::Idle));
        let store = store_for(cr.clone());
        let access = access(store.clone(), &server.uri());

        let err = recover_users(&access, &cr, &adapter(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UsersRecoveryError(_)));
        assert_eq!(
            store.dr_status().users_recovery_state,
            Some(UsersRecoveryState::Failed)
        );
    }

    #[tokio::test]
    async fn test_unavailable_aggregator_fails_after_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cr = with_recovery_state(Some(UsersRecoveryState::Failed));
        let store = store_for(cr.clone());
        let access = access(store.clone(), &server.uri());

        let err = recover_users(&access, &cr, &adapter(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UsersRecoveryError(_)));
    }
}
