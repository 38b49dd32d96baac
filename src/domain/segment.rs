//! Target segment repository: mirrors `FlagRepo` for segments, the other
//! collection type the control plane and the SSE refresher deal in.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{segment_key, segments_key};
use crate::cache::TypedCache;
use crate::error::CacheError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub identifier: String,
    pub environment: String,
    #[serde(default)]
    pub version: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub struct SegmentRepo<C> {
    cache: Arc<C>,
}

impl<C: TypedCache> SegmentRepo<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self { cache }
    }

    pub async fn get(&self, env_id: &str, identifier: &str) -> Result<Segment, CacheError> {
        self.cache.get(&segment_key(env_id, identifier)).await
    }

    pub async fn list(&self, env_id: &str) -> Result<Vec<Segment>, CacheError> {
        self.cache.get(&segments_key(env_id)).await
    }

    pub async fn put(&self, env_id: &str, segment: &Segment) -> Result<(), CacheError> {
        self.cache
            .set(&segment_key(env_id, &segment.identifier), segment)
            .await
    }

    pub async fn delete(&self, env_id: &str, identifier: &str) -> Result<(), CacheError> {
        self.cache.delete(&segment_key(env_id, identifier)).await
    }

    pub async fn put_collection(
        &self,
        env_id: &str,
        segments: Vec<Segment>,
    ) -> Result<(), CacheError> {
        for segment in &segments {
            self.put(env_id, segment).await?;
        }
        self.cache.set(&segments_key(env_id), &segments).await
    }

    pub async fn clear_environment(&self, env_id: &str) -> Result<(), CacheError> {
        let segments: Vec<Segment> = match self.list(env_id).await {
            Ok(segments) => segments,
            Err(CacheError::NotFound) => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut by_id: HashMap<&str, &Segment> = HashMap::new();
        for segment in &segments {
            by_id.insert(segment.identifier.as_str(), segment);
        }
        for identifier in by_id.keys() {
            self.delete(env_id, identifier).await?;
        }
        self.cache.delete(&segments_key(env_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, InMemoryStore};

    fn segment(id: &str) -> Segment {
        Segment {
            identifier: id.to_string(),
            environment: "env-1".to_string(),
            version: 1,
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let repo = SegmentRepo::new(Arc::new(InMemoryStore::new()));
        repo.put("env-1", &segment("s1")).await.unwrap();
        assert_eq!(repo.get("env-1", "s1").await.unwrap().identifier, "s1");
    }

    #[tokio::test]
    async fn unknown_control_plane_fields_survive_a_round_trip() {
        let cache = Arc::new(InMemoryStore::new());
        let repo = SegmentRepo::new(cache.clone());

        let mut extra = serde_json::Map::new();
        extra.insert("name".to_string(), serde_json::json!("beta-users"));
        extra.insert(
            "rules".to_string(),
            serde_json::json!([{"attribute": "email", "op": "endsWith"}]),
        );
        let mut segment = segment("s1");
        segment.extra = extra.clone();
        repo.put("env-1", &segment).await.unwrap();

        let raw = cache.get_raw(&segment_key("env-1", "s1")).await.unwrap();
        let decoded: Segment = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded.extra, extra);

        let fetched = repo.get("env-1", "s1").await.unwrap();
        assert_eq!(fetched.extra, extra);
    }

    #[tokio::test]
    async fn clear_environment_removes_everything() {
        let repo = SegmentRepo::new(Arc::new(InMemoryStore::new()));
        repo.put_collection("env-1", vec![segment("s1")])
            .await
            .unwrap();
        repo.clear_environment("env-1").await.unwrap();
        assert!(matches!(
            repo.list("env-1").await,
            Err(CacheError::NotFound)
        ));
    }
}
