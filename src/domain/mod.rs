//! Domain repositories (component E): typed views over the cache stack
//! for auth keys, feature flags, target segments, and proxy-key
//! inventory. Each repo owns nothing but key-shape knowledge and an
//! `Arc` to the shared, already-composed cache.

pub mod auth;
pub mod flag;
pub mod inventory;
pub mod segment;

pub use auth::{AuthConfig, AuthRepo, PatchAction};
pub use flag::{FeatureFlag, FlagRepo};
pub use inventory::{Inventory, InventoryRepo};
pub use segment::{Segment, SegmentRepo};

pub fn auth_key(hash: &str) -> String {
    format!("auth-key-{hash}")
}

pub fn api_configs_key(env_id: &str) -> String {
    format!("env-{env_id}-api-configs")
}

pub fn feature_config_key(env_id: &str, id: &str) -> String {
    format!("env-{env_id}-feature-config-{id}")
}

pub fn feature_configs_key(env_id: &str) -> String {
    format!("env-{env_id}-feature-configs")
}

pub fn segment_key(env_id: &str, id: &str) -> String {
    format!("env-{env_id}-segment-{id}")
}

pub fn segments_key(env_id: &str) -> String {
    format!("env-{env_id}-segments")
}

pub fn inventory_key(proxy_key: &str) -> String {
    format!("key-{proxy_key}-inventory")
}
