//! REST API module for external integrations
//!
//! Serves the site manager switchover endpoints and the health checks
//! consumed by external traffic managers.

mod dto;
mod handlers;
mod server;

pub use dto::{HealthResponse, SwitchoverRequest, SwitchoverState};
pub use server::{router, run_server};
