//! In-memory `Cache` implementation, used when no Redis URL is configured
//! and in tests throughout the crate.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Cache, KeyPage, TypedCache};
use crate::error::CacheError;

#[derive(Default)]
pub struct InMemoryStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryStore {
    async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        self.data
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or(CacheError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let guard = self.data.read().await;
        Ok(guard
            .keys()
            .filter(|k| k.starts_with(pattern))
            .cloned()
            .collect())
    }

    async fn scan(&self, pattern: &str, cursor: Option<&str>) -> Result<KeyPage, CacheError> {
        const PAGE_SIZE: usize = 100;
        let guard = self.data.read().await;
        let mut matching: Vec<&String> = guard.keys().filter(|k| k.starts_with(pattern)).collect();
        matching.sort();

        let start = match cursor {
            Some(c) => matching
                .iter()
                .position(|k| k.as_str() > c)
                .unwrap_or(matching.len()),
            None => 0,
        };

        let page: Vec<String> = matching
            .iter()
            .skip(start)
            .take(PAGE_SIZE)
            .map(|k| k.to_string())
            .collect();

        let next_cursor = if start + page.len() < matching.len() {
            page.last().cloned()
        } else {
            None
        };

        Ok(KeyPage {
            keys: page,
            cursor: next_cursor,
        })
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

impl TypedCache for InMemoryStore {}
