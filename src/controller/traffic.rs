//! Client traffic gating during a switchover
//!
//! Traffic is cut by adding a sentinel selector label to the client Service
//! named after the resource; no pod carries the label, so the Service has no
//! endpoints until the label is removed again.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::store::ResourceStore;
use crate::error::Result;

pub const SENTINEL_SELECTOR_KEY: &str = "none";
pub const SENTINEL_SELECTOR_VALUE: &str = "true";

#[instrument(skip(store))]
pub async fn disable_client_traffic(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
) -> Result<()> {
    info!("Disable client service");
    store
        .set_service_selector(
            namespace,
            name,
            SENTINEL_SELECTOR_KEY,
            Some(SENTINEL_SELECTOR_VALUE),
        )
        .await
}

#[instrument(skip(store))]
pub async fn enable_client_traffic(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
) -> Result<()> {
    info!("Enable client service");
    store
        .set_service_selector(namespace, name, SENTINEL_SELECTOR_KEY, None)
        .await
}

/// Holds client traffic off for as long as it is alive
///
/// [`TrafficGate::open`] re-enables traffic and reports the outcome. A gate
/// that is dropped without being opened (early return, panic, cancelled
/// future) re-enables traffic from a background task.
pub struct TrafficGate {
    store: Arc<dyn ResourceStore>,
    namespace: String,
    name: String,
    armed: bool,
}

impl TrafficGate {
    pub async fn close(store: Arc<dyn ResourceStore>, namespace: &str, name: &str) -> Result<Self> {
        // Arm before the call so a partial failure still gets reverted.
        let gate = Self {
            store,
            namespace: namespace.to_string(),
            name: name.to_string(),
            armed: true,
        };
        disable_client_traffic(gate.store.as_ref(), namespace, name).await?;
        Ok(gate)
    }

    pub async fn open(mut self) -> Result<()> {
        self.armed = false;
        enable_client_traffic(self.store.as_ref(), &self.namespace, &self.name).await
    }
}

impl Drop for TrafficGate {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let namespace = std::mem::take(&mut self.namespace);
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = enable_client_traffic(store.as_ref(), &namespace, &name).await {
                        warn!(namespace, name, "Failed to re-enable client traffic: {e}");
                    }
                });
            }
            Err(_) => warn!(namespace, name, "No runtime to re-enable client traffic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::{service, FakeStore, SelectorChange, NAMESPACE};

    #[tokio::test]
    async fn test_gate_open_restores_selector() {
        let store = Arc::new(FakeStore::with_service(service("opensearch")));
        let gate = TrafficGate::close(store.clone(), NAMESPACE, "opensearch")
            .await
            .unwrap();
        assert_eq!(
            store.service_selector("opensearch").get(SENTINEL_SELECTOR_KEY),
            Some(&"true".to_string())
        );

        gate.open().await.unwrap();
        assert!(store.service_selector("opensearch").is_empty());
    }

    #[tokio::test]
    async fn test_dropped_gate_reenables_traffic() {
        let store = Arc::new(FakeStore::with_service(service("opensearch")));
        {
            let _gate = TrafficGate::close(store.clone(), NAMESPACE, "opensearch")
                .await
                .unwrap();
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(
            store.selector_changes().last(),
            Some(&(
                "opensearch".to_string(),
                SelectorChange::Removed(SENTINEL_SELECTOR_KEY.to_string())
            ))
        );
    }
}
