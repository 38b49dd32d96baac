//! Auth key repository: the `hashed-api-key -> envID` direct mapping
//! plus the per-environment reverse list that lets the refresher answer
//! "which keys currently belong to this environment" without a full
//! key-space scan.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{api_configs_key, auth_key};
use crate::cache::TypedCache;
use crate::error::CacheError;
use crate::util::sha256_hex;

/// One API key to register: the raw key as issued by the control plane
/// (hashed before it ever touches the cache) and the environment it
/// authorizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub raw_key: String,
    pub environment_id: String,
}

/// `added`/`removed` as accepted by `PatchAPIConfigForEnvironment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchAction {
    Added,
    Removed,
}

pub struct AuthRepo<C> {
    cache: Arc<C>,
    /// When set, `get` reports keys belonging to environments outside this
    /// set as not-found even though the direct mapping still resolves —
    /// used by read paths scoped to a single proxy key's environments.
    allowed_environments: Option<HashSet<String>>,
}

impl<C: TypedCache> AuthRepo<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self {
            cache,
            allowed_environments: None,
        }
    }

    pub fn with_allowed_environments(cache: Arc<C>, allowed: HashSet<String>) -> Self {
        Self {
            cache,
            allowed_environments: Some(allowed),
        }
    }

    /// Write each direct mapping and append the hashed key to its
    /// environment's reverse list (idempotently — see
    /// `patch_api_config_for_environment`).
    pub async fn add(&self, configs: &[AuthConfig]) -> Result<(), CacheError> {
        for config in configs {
            let hash = sha256_hex(config.raw_key.as_bytes());
            self.cache
                .set(&auth_key(&hash), &config.environment_id)
                .await?;
            self.patch_api_config_for_environment(
                &config.environment_id,
                &hash,
                PatchAction::Added,
            )
            .await?;
        }
        Ok(())
    }

    /// Resolve a hashed API key to its environment. `(envID, true)` if
    /// found and (when an allow-list is configured) in scope; `(_, false)`
    /// otherwise.
    pub async fn get(&self, hashed_key: &str) -> Result<(String, bool), CacheError> {
        match self.cache.get::<String>(&auth_key(hashed_key)).await {
            Ok(env_id) => {
                if let Some(allowed) = &self.allowed_environments {
                    if !allowed.contains(&env_id) {
                        return Ok((String::new(), false));
                    }
                }
                Ok((env_id, true))
            }
            Err(CacheError::NotFound) => Ok((String::new(), false)),
            Err(e) => Err(e),
        }
    }

    /// The reverse list for `env_id` — every cache key (`auth-key-{hash}`)
    /// currently recorded as valid for that environment.
    pub async fn get_keys_for_environment(&self, env_id: &str) -> Result<Vec<String>, CacheError> {
        match self
            .cache
            .get::<Vec<String>>(&api_configs_key(env_id))
            .await
        {
            Ok(keys) => Ok(keys),
            Err(CacheError::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Delete every key this environment's reverse list names, plus the
    /// reverse list itself.
    pub async fn remove_all_keys_for_environment(&self, env_id: &str) -> Result<(), CacheError> {
        let keys = self.get_keys_for_environment(env_id).await?;
        for key in &keys {
            self.cache.delete(key).await?;
        }
        self.cache.delete(&api_configs_key(env_id)).await
    }

    /// Delete the direct mappings for `hashed_keys` (callers are
    /// responsible for also patching the owning environment's reverse
    /// list — the refresher's `apiKeyRemoved` handler does both).
    pub async fn remove(&self, hashed_keys: &[String]) -> Result<(), CacheError> {
        for hash in hashed_keys {
            self.cache.delete(&auth_key(hash)).await?;
        }
        Ok(())
    }

    /// Idempotently add or remove `hashed_key` from `env_id`'s reverse
    /// list. `added` is a no-op if the key is already present; `removed`
    /// deletes the list key entirely rather than leaving an empty list
    /// behind.
    pub async fn patch_api_config_for_environment(
        &self,
        env_id: &str,
        hashed_key: &str,
        action: PatchAction,
    ) -> Result<(), CacheError> {
        let list_key = api_configs_key(env_id);
        let entry = auth_key(hashed_key);
        let existing = match self.cache.get::<Vec<String>>(&list_key).await {
            Ok(keys) => Some(keys),
            Err(CacheError::NotFound) => None,
            Err(e) => return Err(e),
        };

        match action {
            PatchAction::Added => {
                let mut keys = existing.unwrap_or_default();
                if !keys.iter().any(|k| k == &entry) {
                    keys.push(entry);
                }
                self.cache.set(&list_key, &keys).await
            }
            PatchAction::Removed => {
                let Some(mut keys) = existing else {
                    return Ok(());
                };
                let before = keys.len();
                keys.retain(|k| k != &entry);
                if keys.len() == before {
                    return Ok(());
                }
                if keys.is_empty() {
                    self.cache.delete(&list_key).await
                } else {
                    self.cache.set(&list_key, &keys).await
                }
            }
        }
    }
}
