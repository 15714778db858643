//! Main reconciler for OpenSearchService resources
//!
//! Implements the controller pattern using kube-rs runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use reqwest::{Method, StatusCode};
use tracing::{debug, error, info, instrument, warn};

use super::cluster::ClusterAccess;
use super::conditions::{find_condition, mark_not_ready, mark_ready, CONDITION_TYPE_READY};
use super::feature::{build_reconcilers, ReconcileScope};
use super::hashes::{hash_data, OPENSEARCH_SECRET_HASH};
use super::session::SessionRegistry;
use super::store::update_status_with_retry;
use crate::crd::{Condition, OpenSearchService};
use crate::error::{Error, Result};

/// Shared state for the controller and the admin API
pub struct ControllerState {
    pub access: ClusterAccess,
    pub sessions: SessionRegistry,
}

impl ControllerState {
    pub fn new(access: ClusterAccess) -> Self {
        Self {
            access,
            sessions: SessionRegistry::default(),
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(client: Client, state: Arc<ControllerState>) -> Result<()> {
    let namespace = state.access.config.namespace.clone();
    let services: Api<OpenSearchService> = Api::namespaced(client.clone(), &namespace);

    info!(namespace, "Starting OpenSearchService controller");

    // Verify CRD exists
    match services.list(&Default::default()).await {
        Ok(_) => info!("OpenSearchService CRD is available"),
        Err(e) => {
            error!(
                "OpenSearchService CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "OpenSearchService CRD not installed".to_string(),
            ));
        }
    }

    Controller::new(services, Config::default())
        // Adopted secrets and config maps carry an owner reference to the resource
        .owns::<Secret>(Api::namespaced(client.clone(), &namespace), Config::default())
        .owns::<ConfigMap>(Api::namespaced(client.clone(), &namespace), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function
///
/// This function is called whenever:
/// - An OpenSearchService is created, updated, or deleted
/// - An adopted Secret or ConfigMap changes
/// - The requeue timer expires
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub(crate) async fn reconcile(
    obj: Arc<OpenSearchService>,
    ctx: Arc<ControllerState>,
) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();

    if obj.metadata.deletion_timestamp.is_some() {
        info!("OpenSearchService {}/{} is being deleted", namespace, name);
        ctx.sessions.remove(&namespace, &name);
        return Ok(Action::await_change());
    }

    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let outcome = reconcile_cycle(&ctx, obj.clone()).await;

    #[cfg(feature = "metrics")]
    {
        super::metrics::observe_reconcile_duration_seconds(
            "opensearch",
            started.elapsed().as_secs_f64(),
        );
        if let Err(e) = &outcome {
            super::metrics::inc_reconcile_error("opensearch", e.kind());
        }
    }

    if let Err(e) = record_ready_condition(&ctx.access, &obj, outcome.as_ref().err()).await {
        warn!("Cannot update conditions: {e}");
    }

    outcome?;
    Ok(Action::requeue(ctx.access.config.timings.resync_interval))
}

/// One pass over every feature reconciler of the resource
async fn reconcile_cycle(ctx: &ControllerState, cr: Arc<OpenSearchService>) -> Result<()> {
    let namespace = cr.namespace().unwrap_or_default();
    let name = cr.name_any();
    info!("Reconciling OpenSearchService {}/{}", namespace, name);

    let session = ctx.sessions.get_or_create(&ctx.access, &namespace, &name);
    let mut scope = ReconcileScope {
        access: ctx.access.clone(),
        session: session.clone(),
        cr: cr.clone(),
        opensearch_secret_hash: String::new(),
    };
    scope.opensearch_secret_hash = opensearch_secret_hash(&scope).await?;

    let reconcilers = build_reconcilers(&scope);
    for reconciler in &reconcilers {
        debug!(feature = reconciler.name(), "Reconcile configuration");
        reconciler.reconcile_config().await?;
    }

    if cr.spec.opensearch.is_some() {
        probe_opensearch(&ctx.access, &cr).await?;
    }

    for reconciler in &reconcilers {
        debug!(feature = reconciler.name(), "Apply configuration");
        reconciler.apply_configuration().await?;
    }
    for reconciler in &reconcilers {
        reconciler.observe_status().await?;
    }

    session.set_hash(OPENSEARCH_SECRET_HASH, &scope.opensearch_secret_hash);
    info!("Reconciliation of OpenSearchService {}/{} finished", namespace, name);
    Ok(())
}

/// Hash of `{name}-secret`; a missing secret hashes like an empty one
async fn opensearch_secret_hash(scope: &ReconcileScope) -> Result<String> {
    let secret = scope.cr.desired_credentials_secret_name();
    match scope.secret_hash(&secret, OPENSEARCH_SECRET_HASH).await {
        Err(e) if e.is_not_found() => {
            debug!(secret, "OpenSearch secret does not exist");
            hash_data(&BTreeMap::new())
        }
        other => other,
    }
}

/// Fail with [`Error::NotReady`] unless the cluster answers `GET /` with 200
async fn probe_opensearch(access: &ClusterAccess, cr: &OpenSearchService) -> Result<()> {
    let client = access.opensearch_client(cr).await;
    match client.send(Method::GET, "", None).await {
        Ok(response) if response.status == StatusCode::OK => Ok(()),
        Ok(response) => Err(Error::NotReady(format!(
            "{} answered with [{}]",
            client.base_url(),
            response.status.as_u16()
        ))),
        Err(e) => Err(Error::NotReady(format!("{} is unreachable: {e}", client.base_url()))),
    }
}

/// Write the Ready condition, skipping the update when nothing would change
async fn record_ready_condition(
    access: &ClusterAccess,
    cr: &OpenSearchService,
    error: Option<&Error>,
) -> Result<()> {
    let mut desired = cr
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let before = find_condition(&desired, CONDITION_TYPE_READY).cloned();
    apply_ready(&mut desired, error);
    if same_condition(before.as_ref(), find_condition(&desired, CONDITION_TYPE_READY)) {
        return Ok(());
    }

    update_status_with_retry(
        access.store.as_ref(),
        &cr.namespace().unwrap_or_default(),
        &cr.name_any(),
        access.config.timings.status_conflict_attempts,
        |status| apply_ready(&mut status.conditions, error),
    )
    .await
}

fn apply_ready(conditions: &mut Vec<Condition>, error: Option<&Error>) {
    match error {
        None => mark_ready(conditions),
        Some(Error::NotReady(message)) => mark_not_ready(conditions, "OpenSearchNotReady", message),
        Some(e) => mark_not_ready(conditions, "ReconcileFailed", &e.to_string()),
    }
}

fn same_condition(a: Option<&Condition>, b: Option<&Condition>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.status == b.status && a.reason == b.reason && a.message == b.message,
        (None, None) => true,
        _ => false,
    }
}

/// Error policy for the controller
pub(crate) fn error_policy(
    obj: Arc<OpenSearchService>,
    error: &Error,
    ctx: Arc<ControllerState>,
) -> Action {
    let timings = &ctx.access.config.timings;
    let retry_duration = match error {
        Error::NotReady(_) => {
            info!("OpenSearch of {} is not ready yet: {}", obj.name_any(), error);
            timings.not_ready_requeue
        }
        e if e.is_retriable() => {
            warn!("Reconciliation error for {}: {:?}", obj.name_any(), error);
            timings.retriable_error_requeue
        }
        _ => {
            error!("Reconciliation error for {}: {:?}", obj.name_any(), error);
            timings.error_requeue
        }
    };

    Action::requeue(retry_duration)
}
