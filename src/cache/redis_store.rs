//! Redis-backed `Cache` implementation for multi-process / multi-replica
//! deployments.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{Cache, KeyPage, TypedCache};
use crate::error::CacheError;

pub struct RedisStore {
    conn: ConnectionManager,
    ttl: Option<Duration>,
}

impl RedisStore {
    /// Connect to `url` (a `redis://` or `rediss://` connection string),
    /// applying `ttl` to every `set_bytes` call (`None` = no expiry).
    pub async fn connect(url: &str, ttl: Option<Duration>) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::ConnRefused(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CacheError::ConnRefused(e.to_string()))?;
        Ok(Self { conn, ttl })
    }
}

fn map_err(e: redis::RedisError) -> CacheError {
    CacheError::Internal(e.to_string())
}

#[async_trait]
impl Cache for RedisStore {
    async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match self.ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                conn.set_ex::<_, _, ()>(key, value, secs)
                    .await
                    .map_err(map_err)?;
            }
            None => {
                conn.set::<_, _, ()>(key, value).await.map_err(map_err)?;
            }
        }
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(map_err)?;
        value.ok_or(CacheError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(map_err)?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let glob = format!("{pattern}*");
        conn.keys(glob).await.map_err(map_err)
    }

    async fn scan(&self, pattern: &str, cursor: Option<&str>) -> Result<KeyPage, CacheError> {
        let mut conn = self.conn.clone();
        let glob = format!("{pattern}*");
        let start: u64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(start)
            .arg("MATCH")
            .arg(&glob)
            .arg("COUNT")
            .arg(100)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;

        Ok(KeyPage {
            keys,
            cursor: if next == 0 { None } else { Some(next.to_string()) },
        })
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| CacheError::ConnRefused(e.to_string()))?;
        Ok(())
    }
}

impl TypedCache for RedisStore {}
