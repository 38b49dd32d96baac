//! Feature flag repository: individual flag configs plus the per-environment
//! collection used for bulk SDK bootstrap.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{feature_config_key, feature_configs_key};
use crate::cache::TypedCache;
use crate::error::CacheError;

/// A single feature flag's evaluation config. `extra` carries every field
/// the control plane sends beyond the ones this proxy needs to route and
/// cache by — variations, rules, default serves, and the like are opaque
/// payload as far as this proxy is concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub identifier: String,
    pub environment: String,
    #[serde(default)]
    pub version: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub struct FlagRepo<C> {
    cache: Arc<C>,
}

impl<C: TypedCache> FlagRepo<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self { cache }
    }

    pub async fn get(&self, env_id: &str, identifier: &str) -> Result<FeatureFlag, CacheError> {
        self.cache.get(&feature_config_key(env_id, identifier)).await
    }

    pub async fn list(&self, env_id: &str) -> Result<Vec<FeatureFlag>, CacheError> {
        self.cache.get(&feature_configs_key(env_id)).await
    }

    pub async fn put(&self, env_id: &str, flag: &FeatureFlag) -> Result<(), CacheError> {
        self.cache
            .set(&feature_config_key(env_id, &flag.identifier), flag)
            .await
    }

    pub async fn delete(&self, env_id: &str, identifier: &str) -> Result<(), CacheError> {
        self.cache
            .delete(&feature_config_key(env_id, identifier))
            .await
    }

    /// Replace the full collection for `env_id` and keep the individual
    /// per-flag keys in sync, so a reader hitting the collection key and
    /// one hitting a single-flag key never disagree.
    pub async fn put_collection(
        &self,
        env_id: &str,
        flags: Vec<FeatureFlag>,
    ) -> Result<(), CacheError> {
        for flag in &flags {
            self.put(env_id, flag).await?;
        }
        self.cache.set(&feature_configs_key(env_id), &flags).await
    }

    /// Drop every key this repo owns for `env_id` (individual flags plus
    /// the collection), used when an environment is removed from scope.
    pub async fn clear_environment(&self, env_id: &str) -> Result<(), CacheError> {
        let flags: Vec<FeatureFlag> = match self.list(env_id).await {
            Ok(flags) => flags,
            Err(CacheError::NotFound) => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut by_id: HashMap<&str, &FeatureFlag> = HashMap::new();
        for flag in &flags {
            by_id.insert(flag.identifier.as_str(), flag);
        }
        for identifier in by_id.keys() {
            self.delete(env_id, identifier).await?;
        }
        self.cache.delete(&feature_configs_key(env_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, InMemoryStore};

    fn flag(id: &str) -> FeatureFlag {
        FeatureFlag {
            identifier: id.to_string(),
            environment: "env-1".to_string(),
            version: 1,
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let repo = FlagRepo::new(Arc::new(InMemoryStore::new()));
        repo.put("env-1", &flag("f1")).await.unwrap();
        let fetched = repo.get("env-1", "f1").await.unwrap();
        assert_eq!(fetched.identifier, "f1");
    }

    #[tokio::test]
    async fn put_collection_keeps_individual_keys_in_sync() {
        let repo = FlagRepo::new(Arc::new(InMemoryStore::new()));
        repo.put_collection("env-1", vec![flag("f1"), flag("f2")])
            .await
            .unwrap();

        assert_eq!(repo.get("env-1", "f1").await.unwrap().identifier, "f1");
        assert_eq!(repo.list("env-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_control_plane_fields_survive_a_round_trip() {
        let cache = Arc::new(InMemoryStore::new());
        let repo = FlagRepo::new(cache.clone());

        let mut extra = serde_json::Map::new();
        extra.insert("kind".to_string(), serde_json::json!("boolean"));
        extra.insert(
            "variations".to_string(),
            serde_json::json!([{"identifier": "on"}, {"identifier": "off"}]),
        );
        let mut flag = flag("f1");
        flag.extra = extra.clone();
        repo.put("env-1", &flag).await.unwrap();

        let raw = cache.get_raw(&feature_config_key("env-1", "f1")).await.unwrap();
        let decoded: FeatureFlag = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded.extra, extra);

        let fetched = repo.get("env-1", "f1").await.unwrap();
        assert_eq!(fetched.extra, extra);
    }

    #[tokio::test]
    async fn clear_environment_removes_everything() {
        let repo = FlagRepo::new(Arc::new(InMemoryStore::new()));
        repo.put_collection("env-1", vec![flag("f1")]).await.unwrap();
        repo.clear_environment("env-1").await.unwrap();

        assert!(matches!(
            repo.get("env-1", "f1").await,
            Err(CacheError::NotFound)
        ));
        assert!(matches!(
            repo.list("env-1").await,
            Err(CacheError::NotFound)
        ));
    }
}
