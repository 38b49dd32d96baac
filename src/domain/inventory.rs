//! Proxy-key inventory: the set of cache asset IDs — every key a proxy
//! key's environments currently own — recorded under `key-{proxyKey}-
//! inventory`. The refresher consults and rewrites it so that, after any
//! full refresh, a diff against the freshly fetched config can delete
//! exactly the stale keys and nothing else.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    api_configs_key, auth_key, feature_config_key, feature_configs_key, inventory_key,
    segment_key, segments_key,
};
use crate::cache::TypedCache;
use crate::control_plane::ProxyConfigEnvironment;
use crate::error::CacheError;
use crate::util::{latest_key, sha256_hex};

/// Map from cache asset id (a full cache key) to an opaque version/etag
/// used only to detect "this asset changed" — equality, not ordering,
/// matters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub assets: BTreeMap<String, String>,
}

pub struct InventoryRepo<C> {
    cache: Arc<C>,
}

impl<C: TypedCache> InventoryRepo<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self { cache }
    }

    pub async fn get(&self, proxy_key: &str) -> Result<Inventory, CacheError> {
        match self.cache.get(&inventory_key(proxy_key)).await {
            Ok(inventory) => Ok(inventory),
            Err(CacheError::NotFound) => Ok(Inventory::default()),
            Err(e) => Err(e),
        }
    }

    /// Merge `assets` into the proxy key's recorded inventory.
    pub async fn add(
        &self,
        proxy_key: &str,
        assets: BTreeMap<String, String>,
    ) -> Result<(), CacheError> {
        let mut inventory = self.get(proxy_key).await?;
        inventory.assets.extend(assets);
        self.cache.set(&inventory_key(proxy_key), &inventory).await
    }

    pub async fn remove(&self, proxy_key: &str) -> Result<(), CacheError> {
        self.cache.delete(&inventory_key(proxy_key)).await
    }

    /// Read-modify-write the asset map. Races between concurrent `patch`
    /// calls on the same proxy key can interleave (see spec §5); each add
    /// or remove this repo's callers perform through `f` is itself
    /// idempotent, so a lost update only means a future refresh or
    /// cleanup corrects it.
    pub async fn patch(
        &self,
        proxy_key: &str,
        f: impl FnOnce(BTreeMap<String, String>) -> BTreeMap<String, String>,
    ) -> Result<(), CacheError> {
        let mut inventory = self.get(proxy_key).await?;
        inventory.assets = f(inventory.assets);
        self.cache.set(&inventory_key(proxy_key), &inventory).await
    }

    /// Derive the expected asset set — every cache key these environments
    /// own, and a cheap etag for each — from a page of proxy-config
    /// environments as returned by the control plane.
    pub fn build_asset_list_from_config(
        configs: &[ProxyConfigEnvironment],
    ) -> BTreeMap<String, String> {
        let mut assets = BTreeMap::new();

        for env in configs {
            if !env.api_keys.is_empty() {
                let hashes: Vec<String> = env
                    .api_keys
                    .iter()
                    .map(|k| sha256_hex(k.as_bytes()))
                    .collect();
                for hash in &hashes {
                    assets.insert(auth_key(hash), env.id.clone());
                }
                let mut sorted_hashes = hashes.clone();
                sorted_hashes.sort();
                assets.insert(
                    api_configs_key(&env.id),
                    sha256_hex(sorted_hashes.join(",").as_bytes()),
                );
            }

            for flag in &env.feature_configs {
                assets.insert(
                    feature_config_key(&env.id, &flag.identifier),
                    flag.version.to_string(),
                );
            }
            if !env.feature_configs.is_empty() {
                let collection_key = feature_configs_key(&env.id);
                let etag = sha256_hex(
                    &crate::util::canonical_json(&env.feature_configs).unwrap_or_default(),
                );
                assets.insert(latest_key(&collection_key), etag.clone());
                assets.insert(collection_key, etag);
            }

            for segment in &env.segments {
                assets.insert(
                    segment_key(&env.id, &segment.identifier),
                    segment.version.to_string(),
                );
            }
            if !env.segments.is_empty() {
                let collection_key = segments_key(&env.id);
                let etag =
                    sha256_hex(&crate::util::canonical_json(&env.segments).unwrap_or_default());
                assets.insert(latest_key(&collection_key), etag.clone());
                assets.insert(collection_key, etag);
            }
        }

        assets
    }

    /// Delete every cache entry this proxy key's inventory currently
    /// records that is absent from `expected`, then rewrite the inventory
    /// to equal `expected` exactly.
    pub async fn cleanup(
        &self,
        proxy_key: &str,
        expected: BTreeMap<String, String>,
    ) -> Result<(), CacheError> {
        let current = self.get(proxy_key).await?;
        for asset_id in current.assets.keys() {
            if !expected.contains_key(asset_id) {
                self.cache.delete(asset_id).await?;
            }
        }
        self.cache
            .set(&inventory_key(proxy_key), &Inventory { assets: expected })
            .await
    }
}
