//! Tests for replication health inspection against a mocked cluster

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::checker::{ReplicationChecker, ReplicationHealth};
use super::replication::{ReplicationConfig, ReplicationManager};
use super::rest_client::{RestClient, RetryPolicy};
use crate::config::Timings;

fn checker(server: &MockServer) -> ReplicationChecker {
    let client = RestClient::new(
        server.uri(),
        reqwest::Client::new(),
        None,
        RetryPolicy::from(&Timings::fast()),
    );
    ReplicationChecker::new(ReplicationManager::new(
        client,
        ReplicationConfig {
            remote_cluster: "peer:9300".to_string(),
            indices_pattern: "app-*".to_string(),
        },
    ))
}

async fn mount_rule(server: &MockServer, success: u64, failed: u64, failed_indices: &[&str]) {
    Mock::given(method("GET"))
        .and(path("/_plugins/_replication/autofollow_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "autofollow_stats": [{
                "name": "dr-replication",
                "pattern": "app-*",
                "num_success_start_replication": success,
                "num_failed_start_replication": failed,
                "failed_indices": failed_indices
            }]
        })))
        .mount(server)
        .await;
}

async fn mount_indices(server: &MockServer, indices: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/_cat/indices/app-*"))
        .respond_with(ResponseTemplate::new(200).set_body_json(indices))
        .mount(server)
        .await;
}

async fn mount_status(server: &MockServer, index: &str, status: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/_plugins/_replication/{index}/_status")))
        .respond_with(ResponseTemplate::new(200).set_body_json(status))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_healthy_cluster_reports_up() {
    let server = MockServer::start().await;
    mount_rule(&server, 2, 0, &[]).await;
    mount_indices(
        &server,
        json!([{"index": "app-1", "health": "green"}, {"index": ".tasks", "health": "yellow"}]),
    )
    .await;
    mount_status(&server, "app-1", json!({"status": "SYNCING"})).await;

    let report = checker(&server).inspect().await.unwrap();
    assert_eq!(report.health(), ReplicationHealth::Up);
    assert!(report.needs_restart().is_none());
    assert_eq!(report.index_statuses.len(), 1);
}

#[tokio::test]
async fn test_missing_rule_reports_down() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_plugins/_replication/autofollow_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"autofollow_stats": []})))
        .mount(&server)
        .await;

    let health = checker(&server).health().await.unwrap();
    assert_eq!(health, ReplicationHealth::Down);
}

#[tokio::test]
async fn test_yellow_index_reports_degraded() {
    let server = MockServer::start().await;
    mount_rule(&server, 1, 0, &[]).await;
    mount_indices(&server, json!([{"index": "app-1", "health": "yellow"}])).await;
    mount_status(&server, "app-1", json!({"status": "SYNCING"})).await;

    let health = checker(&server).health().await.unwrap();
    assert_eq!(health, ReplicationHealth::Degraded);
}

#[tokio::test]
async fn test_status_lookup_failure_is_skipped() {
    let server = MockServer::start().await;
    mount_rule(&server, 1, 0, &[]).await;
    mount_indices(
        &server,
        json!([{"index": "app-1", "health": "green"}, {"index": "app-2", "health": "green"}]),
    )
    .await;
    mount_status(&server, "app-1", json!({"status": "SYNCING"})).await;
    Mock::given(method("GET"))
        .and(path("/_plugins/_replication/app-2/_status"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let report = checker(&server).inspect().await.unwrap();
    assert_eq!(report.index_statuses.len(), 1);
    assert_eq!(report.health(), ReplicationHealth::Up);
}

#[tokio::test]
async fn test_failed_index_status_reports_degraded() {
    let server = MockServer::start().await;
    mount_rule(&server, 1, 0, &[]).await;
    mount_indices(&server, json!([{"index": "app-1", "health": "green"}])).await;
    mount_status(&server, "app-1", json!({"status": "FAILED"})).await;

    let report = checker(&server).inspect().await.unwrap();
    assert_eq!(report.health(), ReplicationHealth::Degraded);
    assert!(report.needs_restart().is_some());
}

#[tokio::test]
async fn test_stats_server_error_propagates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_plugins/_replication/autofollow_stats"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    assert!(checker(&server).inspect().await.is_err());
}
