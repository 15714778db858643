//! HTTP handlers for the REST API

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kube::ResourceExt;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::controller::store::update_status_with_retry;
use crate::controller::ControllerState;
use crate::crd::{
    DisasterRecoveryConfig, DrMode, OpenSearchService, SwitchoverStatus,
    SWITCHOVER_RETRY_ANNOTATION,
};
use crate::error::Result;
use crate::opensearch::{ReplicationChecker, ReplicationHealth};

use super::dto::{HealthResponse, ReplicationHealthQuery, SwitchoverRequest, SwitchoverState};

pub const REQUEST_ACCEPTED: &str = "The request is accepted";
pub const RETRY_FAILED: &str = "retry failed";
pub const SWITCHOVER_IN_PROGRESS: &str =
    "Switchover process in progress. Please, wait until it will be finished";
pub const SWITCHOVER_ALREADY_DONE: &str = "Switchover process has already done";

fn respond<T: Serialize>(state: &ControllerState, status: StatusCode, body: T) -> Response {
    if state.access.config.debug {
        if let Ok(json) = serde_json::to_string(&body) {
            info!(status = status.as_u16(), "Response body: {json}");
        }
    }
    (status, Json(body)).into_response()
}

/// The managed resource; the operator serves a single one per namespace
async fn custom_resource(state: &ControllerState) -> Result<Option<OpenSearchService>> {
    let namespace = &state.access.config.namespace;
    let mut services = state.access.store.list_services(namespace).await?;
    services.sort_by_key(|s| s.name_any());
    Ok(services.into_iter().next())
}

fn missing_resource_comment(state: &ControllerState, err: Option<String>) -> String {
    format!(
        "Custom resource OpenSearchService is not found in the namespace - {}. Error is [{}]",
        state.access.config.namespace,
        err.unwrap_or_else(|| "<nil>".to_string())
    )
}

/// Readiness of the OpenSearch StatefulSets
#[instrument(skip(state))]
pub async fn healthz(State(state): State<Arc<ControllerState>>) -> Response {
    let cr = match custom_resource(&state).await {
        Ok(Some(cr)) => cr,
        Ok(None) => return respond(&state, StatusCode::INTERNAL_SERVER_ERROR, HealthResponse::new("down")),
        Err(e) => {
            warn!("Cannot read OpenSearchService: {e}");
            return respond(&state, StatusCode::INTERNAL_SERVER_ERROR, HealthResponse::new("down"));
        }
    };

    let labels = BTreeMap::from([("app".to_string(), cr.name_any())]);
    match state
        .access
        .store
        .statefulset_readiness(&state.access.config.namespace, &labels)
        .await
    {
        Ok(readiness) => {
            let status = if readiness.ready == 0 {
                "down"
            } else if readiness.ready < readiness.total {
                "degraded"
            } else {
                "up"
            };
            respond(&state, StatusCode::OK, HealthResponse::new(status))
        }
        Err(e) => {
            warn!("Cannot read OpenSearch StatefulSets: {e}");
            respond(&state, StatusCode::INTERNAL_SERVER_ERROR, HealthResponse::new("down"))
        }
    }
}

/// Current switchover mode, status and comment
#[instrument(skip(state))]
pub async fn get_switchover_state(State(state): State<Arc<ControllerState>>) -> Response {
    match custom_resource(&state).await {
        Ok(Some(cr)) => {
            let dr = cr.dr_status();
            let body = SwitchoverState {
                mode: dr.mode.map(|m| m.to_string()).unwrap_or_default(),
                status: dr.status.to_string(),
                comment: dr.comment.unwrap_or_default(),
            };
            respond(&state, StatusCode::OK, body)
        }
        Ok(None) => respond(
            &state,
            StatusCode::INTERNAL_SERVER_ERROR,
            SwitchoverState::failed("", missing_resource_comment(&state, None)),
        ),
        Err(e) => respond(
            &state,
            StatusCode::INTERNAL_SERVER_ERROR,
            SwitchoverState::failed("", missing_resource_comment(&state, Some(e.to_string()))),
        ),
    }
}

/// A repeated request for the mode already desired whose switchover did not complete
fn is_retry(cr: &OpenSearchService, mode: DrMode) -> bool {
    cr.spec.disaster_recovery.as_ref().map(|dr| dr.mode) == Some(mode)
        && cr.dr_status().status != SwitchoverStatus::Done
}

/// Accept a switchover request from the site manager
#[instrument(skip(state, body))]
pub async fn set_switchover_mode(State(state): State<Arc<ControllerState>>, body: Bytes) -> Response {
    let request: SwitchoverRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return respond(
                &state,
                StatusCode::BAD_REQUEST,
                SwitchoverState::failed(
                    "",
                    format!("Unmarshalling data from request failed. Error is [{e}]"),
                ),
            )
        }
    };
    let raw_mode = request.mode.as_str();
    let mode = match DrMode::from_str(raw_mode) {
        Ok(mode) if mode.as_str() == raw_mode => mode,
        Ok(_) | Err(_) => {
            return respond(
                &state,
                StatusCode::BAD_REQUEST,
                SwitchoverState::failed(
                    raw_mode,
                    format!(
                        "'{raw_mode}' mode is not in the allowed list. Please, use 'active', 'standby' or 'disable'"
                    ),
                ),
            )
        }
    };

    let mut cr = match custom_resource(&state).await {
        Ok(Some(cr)) => cr,
        Ok(None) => {
            return respond(
                &state,
                StatusCode::INTERNAL_SERVER_ERROR,
                SwitchoverState::failed(raw_mode, missing_resource_comment(&state, None)),
            )
        }
        Err(e) => {
            return respond(
                &state,
                StatusCode::INTERNAL_SERVER_ERROR,
                SwitchoverState::failed(raw_mode, missing_resource_comment(&state, Some(e.to_string()))),
            )
        }
    };

    let observed = cr.dr_status();
    if observed.status == SwitchoverStatus::Running {
        return respond(
            &state,
            StatusCode::CONFLICT,
            SwitchoverState::failed(raw_mode, SWITCHOVER_IN_PROGRESS),
        );
    }
    let desired_mode = cr.spec.disaster_recovery.as_ref().map(|dr| dr.mode);
    if observed.mode == desired_mode
        && observed.mode == Some(mode)
        && observed.status == SwitchoverStatus::Done
    {
        return respond(
            &state,
            StatusCode::CONFLICT,
            SwitchoverState::failed(raw_mode, SWITCHOVER_ALREADY_DONE),
        );
    }

    let no_wait = request.no_wait.unwrap_or(true);
    let retry = is_retry(&cr, mode);
    match cr.spec.disaster_recovery.as_mut() {
        Some(dr) => {
            dr.mode = mode;
            dr.no_wait = no_wait;
        }
        None => {
            cr.spec.disaster_recovery = Some(DisasterRecoveryConfig {
                mode,
                no_wait,
                config_map_name: String::new(),
                replication_watcher_enabled: false,
                replication_watcher_interval: 0,
            });
        }
    }
    if retry {
        let stamp = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string();
        cr.annotations_mut()
            .insert(SWITCHOVER_RETRY_ANNOTATION.to_string(), stamp);
    }

    if let Err(e) = state.access.store.replace_service(&cr).await {
        error!("Cannot update OpenSearchService: {e}");
        return respond(
            &state,
            StatusCode::INTERNAL_SERVER_ERROR,
            SwitchoverState::failed(raw_mode, e.to_string()),
        );
    }

    let mode_changes = observed.mode != Some(mode);
    let retry_failed = observed.status == SwitchoverStatus::Failed;
    let namespace = cr.namespace().unwrap_or_default();
    let status_update = update_status_with_retry(
        state.access.store.as_ref(),
        &namespace,
        &cr.name_any(),
        state.access.config.timings.status_conflict_attempts,
        |status| {
            let dr = &mut status.disaster_recovery_status;
            if mode_changes {
                dr.status = SwitchoverStatus::Running;
                dr.comment = Some(REQUEST_ACCEPTED.to_string());
            } else if retry_failed {
                dr.comment = Some(RETRY_FAILED.to_string());
            }
        },
    )
    .await;
    if let Err(e) = status_update {
        error!("Cannot update OpenSearchService status: {e}");
        return respond(
            &state,
            StatusCode::INTERNAL_SERVER_ERROR,
            SwitchoverState::failed(raw_mode, e.to_string()),
        );
    }

    info!(%mode, no_wait, retry, "Switchover request is accepted");
    respond(&state, StatusCode::OK, SwitchoverState::accepted(raw_mode))
}

/// Replication health as seen by an external traffic manager
#[instrument(skip(state))]
pub async fn replication_health(
    State(state): State<Arc<ControllerState>>,
    Query(query): Query<ReplicationHealthQuery>,
) -> Response {
    let mode = match query.mode.as_deref().map(DrMode::from_str) {
        Some(Ok(mode)) => mode,
        Some(Err(comment)) => {
            return respond(&state, StatusCode::BAD_REQUEST, SwitchoverState::failed("", comment))
        }
        None => {
            return respond(
                &state,
                StatusCode::BAD_REQUEST,
                SwitchoverState::failed("", "query parameter 'mode' is required"),
            )
        }
    };
    if mode != DrMode::Standby {
        return respond(&state, StatusCode::OK, HealthResponse::new(ReplicationHealth::Up.as_str()));
    }

    let health = async {
        let cr = custom_resource(&state).await?.ok_or_else(|| {
            crate::error::Error::ConfigError(missing_resource_comment(&state, None))
        })?;
        let manager = state.access.replication_manager(&cr).await?;
        ReplicationChecker::new(manager).health().await
    }
    .await;

    match health {
        Ok(health) => respond(&state, StatusCode::OK, HealthResponse::new(health.as_str())),
        Err(e) => {
            warn!("Cannot check replication health: {e}");
            respond(
                &state,
                StatusCode::INTERNAL_SERVER_ERROR,
                HealthResponse::new(ReplicationHealth::Down.as_str()),
            )
        }
    }
}
