//! Change detection for the config maps and secrets a resource depends on

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

use crate::error::Result;

pub const DR_CONFIG_HASH: &str = "config.disasterRecovery";
pub const OPENSEARCH_SECRET_HASH: &str = "secret.opensearch";
pub const OPENSEARCH_OLD_SECRET_HASH: &str = "secret.opensearchOld";
pub const SECURITY_CONFIG_HASH: &str = "config.security";
pub const DASHBOARDS_SECRET_HASH: &str = "secret.dashboards";
pub const MONITORING_SECRET_HASH: &str = "secret.monitoring";
pub const DBAAS_ADAPTER_SECRET_HASH: &str = "secret.dbaasAdapter";
pub const CURATOR_SECRET_HASH: &str = "secret.curator";

/// Lowercase hex SHA-256 of the JSON form of `data`
pub fn hash_data(data: &BTreeMap<String, String>) -> Result<String> {
    let json = serde_json::to_vec(data)?;
    Ok(hex::encode(Sha256::digest(&json)))
}

/// Last seen hash per logical resource key, scoped to one resource
#[derive(Clone, Debug, Default)]
pub struct ResourceHashes {
    hashes: HashMap<String, String>,
}

impl ResourceHashes {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.hashes.get(key).map(String::as_str)
    }

    /// True only when a hash was stored before and differs from `hash`
    pub fn changed(&self, key: &str, hash: &str) -> bool {
        self.get(key).is_some_and(|stored| stored != hash)
    }

    pub fn set(&mut self, key: impl Into<String>, hash: impl Into<String>) {
        self.hashes.insert(key.into(), hash.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_hash_is_stable_and_content_sensitive() {
        let a = hash_data(&data(&[("remoteCluster", "peer:9300"), ("indicesPattern", "*")])).unwrap();
        let b = hash_data(&data(&[("indicesPattern", "*"), ("remoteCluster", "peer:9300")])).unwrap();
        let c = hash_data(&data(&[("remoteCluster", "other:9300"), ("indicesPattern", "*")])).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
    }

    #[test]
    fn test_first_observation_is_not_a_change() {
        let mut hashes = ResourceHashes::default();
        assert!(!hashes.changed(DR_CONFIG_HASH, "abc"));

        hashes.set(DR_CONFIG_HASH, "abc");
        assert!(!hashes.changed(DR_CONFIG_HASH, "abc"));
        assert!(hashes.changed(DR_CONFIG_HASH, "def"));
    }
}
