//! Client for the upstream control plane: the thing the refresher calls
//! to bootstrap state and the thing the proxy authenticates against on
//! startup. Shapes only, per the crate's scope — request routing and
//! evaluation math live upstream, not here.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{FeatureFlag, Segment};
use crate::error::ControlPlaneError;

/// One environment's slice of a `/proxy/config` page: its scoped API
/// keys (raw, not yet hashed) plus the full flag and segment sets the
/// refresher needs to seed the cache on `environmentsAdded`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfigEnvironment {
    pub id: String,
    #[serde(default, rename = "apiKeys")]
    pub api_keys: Vec<String>,
    #[serde(default, rename = "featureConfigs")]
    pub feature_configs: Vec<FeatureFlag>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// `POST /proxy/auth` — exchange a proxy key for a bearer token.
    async fn authenticate(&self, proxy_key: &str) -> Result<String, ControlPlaneError>;

    /// Paged `GET /proxy/config` — every environment this proxy key is
    /// scoped to serve, each with its API keys and full flag/segment
    /// sets. Implementations page until `pageNumber >= pageCount - 1`.
    async fn proxy_config(
        &self,
        proxy_key: &str,
        cluster: Option<&str>,
    ) -> Result<Vec<ProxyConfigEnvironment>, ControlPlaneError>;

    /// `GET /client/env/{env}/feature-configs`
    async fn feature_configs(&self, env_id: &str) -> Result<Vec<FeatureFlag>, ControlPlaneError>;

    /// `GET /client/env/{env}/target-segments`
    async fn target_segments(&self, env_id: &str) -> Result<Vec<Segment>, ControlPlaneError>;
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(rename = "authToken")]
    auth_token: String,
}

#[derive(Deserialize)]
struct ProxyConfigPage {
    environments: Vec<ProxyConfigEnvironment>,
    #[serde(rename = "pageCount")]
    page_count: u32,
}

pub struct HttpControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    sdk_info: String,
    bearer_token: String,
}

impl HttpControlPlaneClient {
    /// `bearer_token` authenticates every call except `/proxy/auth` itself
    /// (minted once at startup via `Config::bearer_token` and held for the
    /// life of the process — this client does not re-authenticate).
    pub fn new(base_url: String, account_id: String, sdk_info: String, bearer_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            account_id,
            sdk_info,
            bearer_token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str, authenticated: bool) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .http
            .request(method, url)
            .header("Harness-Accountid", &self.account_id)
            .header("Harness-Sdk-Info", &self.sdk_info);
        if authenticated {
            builder = builder.bearer_auth(&self.bearer_token);
        }
        builder
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ControlPlaneError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(ControlPlaneError::from_status(status, body))
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn authenticate(&self, proxy_key: &str) -> Result<String, ControlPlaneError> {
        let resp = self
            .request(reqwest::Method::POST, "/proxy/auth", false)
            .json(&serde_json::json!({ "key": proxy_key }))
            .send()
            .await
            .map_err(|e| ControlPlaneError::Internal(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        let parsed: AuthResponse = resp
            .json()
            .await
            .map_err(|e| ControlPlaneError::Internal(e.to_string()))?;
        Ok(parsed.auth_token)
    }

    async fn proxy_config(
        &self,
        proxy_key: &str,
        cluster: Option<&str>,
    ) -> Result<Vec<ProxyConfigEnvironment>, ControlPlaneError> {
        let mut environments = Vec::new();
        let mut page_number: u32 = 0;
        const PAGE_SIZE: u32 = 100;

        loop {
            let mut query = vec![
                ("key", proxy_key.to_string()),
                ("pageNumber", page_number.to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
            ];
            if let Some(cluster) = cluster {
                query.push(("cluster", cluster.to_string()));
            }

            let resp = self
                .request(reqwest::Method::GET, "/proxy/config", true)
                .query(&query)
                .send()
                .await
                .map_err(|e| ControlPlaneError::Internal(e.to_string()))?;
            let resp = Self::check_status(resp).await?;
            let parsed: ProxyConfigPage = resp
                .json()
                .await
                .map_err(|e| ControlPlaneError::Internal(e.to_string()))?;

            environments.extend(parsed.environments);
            if page_number >= parsed.page_count.saturating_sub(1) {
                break;
            }
            page_number += 1;
        }

        Ok(environments)
    }

    async fn feature_configs(&self, env_id: &str) -> Result<Vec<FeatureFlag>, ControlPlaneError> {
        let path = format!("/client/env/{env_id}/feature-configs");
        let resp = self
            .request(reqwest::Method::GET, &path, true)
            .header("Harness-Environmentid", env_id)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Internal(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| ControlPlaneError::Internal(e.to_string()))
    }

    async fn target_segments(&self, env_id: &str) -> Result<Vec<Segment>, ControlPlaneError> {
        let path = format!("/client/env/{env_id}/target-segments");
        let resp = self
            .request(reqwest::Method::GET, &path, true)
            .header("Harness-Environmentid", env_id)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Internal(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| ControlPlaneError::Internal(e.to_string()))
    }
}

/// In-memory double used by refresher and subscriber tests.
#[derive(Default)]
pub struct FakeControlPlaneClient {
    pub proxy_config: Mutex<Vec<ProxyConfigEnvironment>>,
    pub feature_configs: Mutex<std::collections::HashMap<String, Vec<FeatureFlag>>>,
    pub target_segments: Mutex<std::collections::HashMap<String, Vec<Segment>>>,
}

#[async_trait]
impl ControlPlaneClient for FakeControlPlaneClient {
    async fn authenticate(&self, _proxy_key: &str) -> Result<String, ControlPlaneError> {
        Ok("fake-token".to_string())
    }

    async fn proxy_config(
        &self,
        _proxy_key: &str,
        _cluster: Option<&str>,
    ) -> Result<Vec<ProxyConfigEnvironment>, ControlPlaneError> {
        Ok(self
            .proxy_config
            .lock()
            .expect("fake mutex poisoned")
            .clone())
    }

    async fn feature_configs(&self, env_id: &str) -> Result<Vec<FeatureFlag>, ControlPlaneError> {
        Ok(self
            .feature_configs
            .lock()
            .expect("fake mutex poisoned")
            .get(env_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn target_segments(&self, env_id: &str) -> Result<Vec<Segment>, ControlPlaneError> {
        Ok(self
            .target_segments
            .lock()
            .expect("fake mutex poisoned")
            .get(env_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_client_serves_preset_proxy_config() {
        let fake = FakeControlPlaneClient::default();
        *fake.proxy_config.lock().unwrap() = vec![ProxyConfigEnvironment {
            id: "env-1".to_string(),
            ..Default::default()
        }];
        let configs = fake.proxy_config("pk", None).await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].id, "env-1");
    }
}
