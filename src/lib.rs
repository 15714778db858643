//! OpenSearch operator: Kubernetes operator for OpenSearch with
//! active/standby disaster recovery
//!
//! This crate reconciles `OpenSearchService` resources, switches clusters
//! between the active and standby roles and keeps cross-cluster replication
//! healthy while a cluster is in standby.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod opensearch;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
