//! Custom Resource Definitions for the OpenSearch operator
//!
//! This module defines the Kubernetes CRD for managing OpenSearch and its
//! disaster recovery role.

mod opensearch_service;
pub mod types;


pub use opensearch_service::{
    OpenSearchService, OpenSearchServiceSpec, OpenSearchServiceStatus,
    SWITCHOVER_RETRY_ANNOTATION,
};
pub use types::*;
