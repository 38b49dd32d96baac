//! Component F: turns an SSE message from the control plane into cache
//! writes. One `Refresher` instance is shared by the stream subscriber
//! and (via the same message shape) a read replica's upstream relay.

use std::sync::Arc;

use serde::Deserialize;

use crate::cache::TypedCache;
use crate::control_plane::ControlPlaneClient;
use crate::domain::{
    api_configs_key, auth_key, feature_config_key, feature_configs_key, segment_key,
    segments_key, AuthConfig, AuthRepo, FlagRepo, InventoryRepo, PatchAction, SegmentRepo,
};
use crate::error::{CacheError, RefresherError};
use crate::metrics::Metrics;
use crate::util::{latest_key, sha256_hex};

/// A single event off the control plane's SSE stream.
#[derive(Debug, Clone, Deserialize)]
pub struct SSEMessage {
    pub domain: String,
    pub event: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub environments: Option<Vec<String>>,
    #[serde(default, rename = "apiKey")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
}

/// What handling a message asked the caller to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefresherOutcome {
    Handled,
    /// `proxy`/`proxyKeyDeleted` — the caller's loop should stop cleanly.
    ShutdownRequested,
}

pub struct Refresher<CP, C> {
    control_plane: Arc<CP>,
    auth: AuthRepo<C>,
    flags: FlagRepo<C>,
    segments: SegmentRepo<C>,
    inventory: InventoryRepo<C>,
    proxy_key: String,
    metrics: Option<Arc<Metrics>>,
}

impl<CP: ControlPlaneClient, C: TypedCache> Refresher<CP, C> {
    pub fn new(control_plane: Arc<CP>, cache: Arc<C>, proxy_key: String) -> Self {
        Self {
            control_plane,
            auth: AuthRepo::new(cache.clone()),
            flags: FlagRepo::new(cache.clone()),
            segments: SegmentRepo::new(cache.clone()),
            inventory: InventoryRepo::new(cache),
            proxy_key,
            metrics: None,
        }
    }

    /// Like `new`, but records each handled message's outcome on
    /// `metrics.refresher_events_total{domain,event,result}`.
    pub fn with_metrics(
        control_plane: Arc<CP>,
        cache: Arc<C>,
        proxy_key: String,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::new(control_plane, cache, proxy_key)
        }
    }

    /// Full re-fetch of every environment this proxy key is scoped to, for
    /// use at process startup (the system carries no on-disk persistence,
    /// so every restart rebuilds the cache from the control plane rather
    /// than resuming from a snapshot).
    pub async fn resync_all(&self) -> Result<(), RefresherError> {
        self.handle_environments_added(Vec::new()).await
    }

    pub async fn handle(&self, msg: SSEMessage) -> Result<RefresherOutcome, RefresherError> {
        let domain = msg.domain.clone();
        let event = msg.event.clone();
        let result = self.dispatch(msg).await;

        if let Some(metrics) = &self.metrics {
            let outcome = if result.is_ok() { "ok" } else { "error" };
            metrics
                .refresher_events_total
                .with_label_values(&[&domain, &event, outcome])
                .inc();
        }

        result
    }

    async fn dispatch(&self, msg: SSEMessage) -> Result<RefresherOutcome, RefresherError> {
        match msg.domain.as_str() {
            "flag" => {
                self.handle_flag(msg).await?;
                Ok(RefresherOutcome::Handled)
            }
            "target-segment" => {
                self.handle_segment(msg).await?;
                Ok(RefresherOutcome::Handled)
            }
            "proxy" => self.handle_proxy(msg).await,
            other => Err(RefresherError::UnexpectedMessageDomain(other.to_string())),
        }
    }

    async fn handle_flag(&self, msg: SSEMessage) -> Result<(), RefresherError> {
        let env_id = msg.environment.ok_or_else(|| RefresherError::UnexpectedEventType {
            domain: "flag".to_string(),
            event: msg.event.clone(),
        })?;

        match msg.event.as_str() {
            "delete" => {
                let identifier = msg.identifier.ok_or_else(|| RefresherError::UnexpectedEventType {
                    domain: "flag".to_string(),
                    event: "delete".to_string(),
                })?;
                // Fetch the list first for consistency with the mutation,
                // then drop just the per-identifier key — the collection
                // is left for a later full refresh, per spec.
                let flags = self
                    .control_plane
                    .feature_configs(&env_id)
                    .await
                    .map_err(RefresherError::ControlPlane)?;
                self.flags.put_collection(&env_id, flags).await?;
                self.flags.delete(&env_id, &identifier).await?;
                Ok(())
            }
            "create" | "patch" => {
                let flags = self
                    .control_plane
                    .feature_configs(&env_id)
                    .await
                    .map_err(RefresherError::ControlPlane)?;
                self.flags.put_collection(&env_id, flags).await?;
                Ok(())
            }
            other => Err(RefresherError::UnexpectedEventType {
                domain: "flag".to_string(),
                event: other.to_string(),
            }),
        }
    }

    async fn handle_segment(&self, msg: SSEMessage) -> Result<(), RefresherError> {
        let env_id = msg.environment.ok_or_else(|| RefresherError::UnexpectedEventType {
            domain: "target-segment".to_string(),
            event: msg.event.clone(),
        })?;

        match msg.event.as_str() {
            "delete" => {
                let identifier = msg.identifier.ok_or_else(|| RefresherError::UnexpectedEventType {
                    domain: "target-segment".to_string(),
                    event: "delete".to_string(),
                })?;
                let segments = self
                    .control_plane
                    .target_segments(&env_id)
                    .await
                    .map_err(RefresherError::ControlPlane)?;
                self.segments.put_collection(&env_id, segments).await?;
                self.segments.delete(&env_id, &identifier).await?;
                Ok(())
            }
            "create" | "patch" => {
                let segments = self
                    .control_plane
                    .target_segments(&env_id)
                    .await
                    .map_err(RefresherError::ControlPlane)?;
                self.segments.put_collection(&env_id, segments).await?;
                Ok(())
            }
            other => Err(RefresherError::UnexpectedEventType {
                domain: "target-segment".to_string(),
                event: other.to_string(),
            }),
        }
    }

    async fn handle_proxy(&self, msg: SSEMessage) -> Result<RefresherOutcome, RefresherError> {
        match msg.event.as_str() {
            "proxyKeyDeleted" => Ok(RefresherOutcome::ShutdownRequested),
            "environmentsAdded" => {
                self.handle_environments_added(msg.environments.unwrap_or_default())
                    .await?;
                Ok(RefresherOutcome::Handled)
            }
            "environmentsRemoved" => {
                self.handle_environments_removed(&msg.environments.unwrap_or_default())
                    .await?;
                Ok(RefresherOutcome::Handled)
            }
            "apiKeyAdded" => {
                self.handle_api_key_added(msg).await?;
                Ok(RefresherOutcome::Handled)
            }
            "apiKeyRemoved" => {
                self.handle_api_key_removed(msg).await?;
                Ok(RefresherOutcome::Handled)
            }
            other => Err(RefresherError::UnexpectedEventType {
                domain: "proxy".to_string(),
                event: other.to_string(),
            }),
        }
    }

    /// Fetch every page of this proxy key's config, seed the Auth/Flag/
    /// Segment repos for the environments named in `env_ids` (or all
    /// pages, if `env_ids` is empty), and merge the resulting asset set
    /// into the proxy key's inventory.
    async fn handle_environments_added(&self, env_ids: Vec<String>) -> Result<(), RefresherError> {
        let configs = self
            .control_plane
            .proxy_config(&self.proxy_key, None)
            .await
            .map_err(RefresherError::ControlPlane)?;

        let relevant: Vec<_> = if env_ids.is_empty() {
            configs
        } else {
            configs.into_iter().filter(|c| env_ids.contains(&c.id)).collect()
        };

        for env in &relevant {
            if !env.api_keys.is_empty() {
                let auth_configs: Vec<AuthConfig> = env
                    .api_keys
                    .iter()
                    .map(|raw_key| AuthConfig {
                        raw_key: raw_key.clone(),
                        environment_id: env.id.clone(),
                    })
                    .collect();
                self.auth.add(&auth_configs).await?;
            }
            if !env.feature_configs.is_empty() {
                self.flags
                    .put_collection(&env.id, env.feature_configs.clone())
                    .await?;
            }
            if !env.segments.is_empty() {
                self.segments
                    .put_collection(&env.id, env.segments.clone())
                    .await?;
            }
        }

        let assets = InventoryRepo::<C>::build_asset_list_from_config(&relevant);
        self.inventory.add(&self.proxy_key, assets).await?;
        Ok(())
    }

    /// Best-effort cleanup across all four repos for each removed
    /// environment: one repo's error never stops the others, and the
    /// first non-`NotFound` error is the one that surfaces.
    async fn handle_environments_removed(&self, env_ids: &[String]) -> Result<(), RefresherError> {
        let mut first_error: Option<RefresherError> = None;

        for env_id in env_ids {
            let owned_auth_keys = self
                .auth
                .get_keys_for_environment(env_id)
                .await
                .unwrap_or_default();
            let owned_flags: Vec<String> = self
                .flags
                .list(env_id)
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|f| feature_config_key(env_id, &f.identifier))
                .collect();
            let owned_segments: Vec<String> = self
                .segments
                .list(env_id)
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|s| segment_key(env_id, &s.identifier))
                .collect();

            for result in [
                self.auth.remove_all_keys_for_environment(env_id).await,
                self.flags.clear_environment(env_id).await,
                self.segments.clear_environment(env_id).await,
            ] {
                if let Err(e) = result {
                    if !matches!(e, CacheError::NotFound) && first_error.is_none() {
                        first_error = Some(RefresherError::Cache(e));
                    }
                }
            }

            let feature_configs_key = feature_configs_key(env_id);
            let segments_key = segments_key(env_id);
            let api_configs_key = api_configs_key(env_id);
            let drop_keys: Vec<String> = owned_auth_keys
                .into_iter()
                .chain(owned_flags)
                .chain(owned_segments)
                .chain([
                    api_configs_key,
                    latest_key(&feature_configs_key),
                    feature_configs_key,
                    latest_key(&segments_key),
                    segments_key,
                ])
                .collect();

            let patch_result = self
                .inventory
                .patch(&self.proxy_key, |mut assets| {
                    for key in &drop_keys {
                        assets.remove(key);
                    }
                    assets
                })
                .await;
            if let Err(e) = patch_result {
                if first_error.is_none() {
                    first_error = Some(RefresherError::Cache(e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn handle_api_key_added(&self, msg: SSEMessage) -> Result<(), RefresherError> {
        let env_id = msg
            .environment
            .ok_or_else(|| RefresherError::UnexpectedEventType {
                domain: "proxy".to_string(),
                event: "apiKeyAdded".to_string(),
            })?;
        let raw_key = msg
            .api_key
            .ok_or_else(|| RefresherError::UnexpectedEventType {
                domain: "proxy".to_string(),
                event: "apiKeyAdded".to_string(),
            })?;
        let hash = sha256_hex(raw_key.as_bytes());

        self.auth
            .add(&[AuthConfig {
                raw_key,
                environment_id: env_id.clone(),
            }])
            .await?;
        self.auth
            .patch_api_config_for_environment(&env_id, &hash, PatchAction::Added)
            .await?;

        let asset_key = auth_key(&hash);
        self.inventory
            .patch(&self.proxy_key, move |mut assets| {
                assets.insert(asset_key, env_id.clone());
                assets
            })
            .await?;
        Ok(())
    }

    async fn handle_api_key_removed(&self, msg: SSEMessage) -> Result<(), RefresherError> {
        let env_id = msg
            .environment
            .ok_or_else(|| RefresherError::UnexpectedEventType {
                domain: "proxy".to_string(),
                event: "apiKeyRemoved".to_string(),
            })?;
        let raw_key = msg
            .api_key
            .ok_or_else(|| RefresherError::UnexpectedEventType {
                domain: "proxy".to_string(),
                event: "apiKeyRemoved".to_string(),
            })?;
        let hash = sha256_hex(raw_key.as_bytes());

        self.auth.remove(&[hash.clone()]).await?;
        self.auth
            .patch_api_config_for_environment(&env_id, &hash, PatchAction::Removed)
            .await?;

        let asset_key = auth_key(&hash);
        self.inventory
            .patch(&self.proxy_key, move |mut assets| {
                assets.remove(&asset_key);
                assets
            })
            .await?;
        Ok(())
    }
}
