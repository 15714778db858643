//! REST access to OpenSearch: the HTTP client, the replication lifecycle
//! manager and the replication health checker.

pub mod checker;
pub mod replication;
pub mod rest_client;

#[cfg(test)]
mod checker_test;

pub use checker::{ReplicationChecker, ReplicationHealth, ReplicationReport};
pub use replication::{ReplicationConfig, ReplicationManager};
pub use rest_client::{Credentials, RestClient, RetryPolicy};
