//! The GPU provider capability set and the registry that picks
//! the active one.
//!
//! A narrow trait-object interface registered into a name -> constructor
//! table, so a concrete provider implementation can be linked in without
//! this crate needing to know about it at compile time.

mod local_process;

pub use local_process::LocalProcessProvider;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::paths;

/// A single GPU offer returned by `get_gpu_availability`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuOffer {
    pub gpu_type: String,
    pub gpu_name: String,
    pub gpu_count: u32,
    pub price_hr: f64,
    pub cloud_id: String,
    pub region: Option<String>,
}

/// Filters accepted by `get_gpu_availability`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailabilityFilter {
    pub gpu_type: Option<String>,
    pub min_gpu_count: Option<u32>,
    pub max_price_hr: Option<f64>,
}

/// Parameters accepted by `create_pod`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSpec {
    pub name: String,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub cloud_id: String,
}

/// Provider-reported pod status, pre-normalization. The monitor
/// maps this to the normalized `PodState`; the provider is free to return
/// whatever vocabulary its backend uses.
pub type RawStatus = String;

/// A provider-managed GPU host instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub status: RawStatus,
    pub gpu_name: String,
    pub gpu_count: u32,
    pub price_hr: f64,
    pub ssh_connection: Option<String>,
    pub ip: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A page of `get_pods` results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodPage {
    pub pods: Vec<Pod>,
    pub total: usize,
}

/// The narrow interface the execution/session core consumes from a GPU
/// cloud provider. Concrete REST/GraphQL clients (RunPod, Lambda
/// Labs, Vast.ai) are out of scope and are not implemented here;
/// only the trait and a local-process test double ship in this crate.
pub trait GPUProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn api_key_env_name(&self) -> &'static str;
    fn supports_ssh(&self) -> bool;
    fn dashboard_url(&self) -> &'static str;
    fn is_configured(&self) -> bool;

    fn get_gpu_availability(
        &self,
        filters: &AvailabilityFilter,
    ) -> Result<Vec<GpuOffer>, ProviderError>;

    fn create_pod(&self, spec: &PodSpec) -> Result<Pod, ProviderError>;

    fn get_pod(&self, id: &str) -> Result<Pod, ProviderError>;

    fn get_pods(
        &self,
        status: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<PodPage, ProviderError>;

    fn delete_pod(&self, id: &str) -> Result<(), ProviderError>;

    /// Optional: most providers support pausing a pod without deleting it.
    fn stop_pod(&self, _id: &str) -> Result<(), ProviderError> {
        Err(ProviderError::NotConfigured(
            "stop_pod is not supported by this provider".to_string(),
        ))
    }

    /// Optional: resume a previously stopped pod.
    fn resume_pod(&self, _id: &str) -> Result<Pod, ProviderError> {
        Err(ProviderError::NotConfigured(
            "resume_pod is not supported by this provider".to_string(),
        ))
    }
}

/// Persisted registry configuration: which provider is active, keyed by
/// provider name, plus (for providers that need one) an API key.
///
/// Written atomically with `0600` permissions to
/// `<config_dir>/forge/providers.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub active: Option<String>,
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

impl ProviderConfig {
    fn path() -> std::io::Result<std::path::PathBuf> {
        Ok(paths::config_dir()?.join("providers.json"))
    }

    pub fn load() -> std::io::Result<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::path()?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        paths::atomic_write(&path, json.as_bytes(), Some(0o600))
    }
}

/// Name → constructor table plus active-provider selection.
/// No concrete cloud provider ships in this crate, so the registry is
/// seeded with `LocalProcessProvider` (a development fallback and test
/// double) under the name `"local"`.
pub struct ProviderRegistry {
    constructors: HashMap<&'static str, fn() -> Arc<dyn GPUProvider>>,
    cache: RwLock<HashMap<String, Arc<dyn GPUProvider>>>,
    active: RwLock<Option<String>>,
}

impl ProviderRegistry {
    /// Build a registry seeded with the built-in `local` provider and load
    /// the persisted active-provider selection, if any.
    pub fn load() -> std::io::Result<Self> {
        let mut constructors: HashMap<&'static str, fn() -> Arc<dyn GPUProvider>> =
            HashMap::new();
        constructors.insert("local", || Arc::new(LocalProcessProvider::new()));

        let config = ProviderConfig::load()?;

        Ok(Self {
            constructors,
            cache: RwLock::new(HashMap::new()),
            active: RwLock::new(config.active),
        })
    }

    /// Register a provider constructor under `name` (used by callers that
    /// link in a concrete REST/GraphQL provider implementation).
    pub fn register(&mut self, name: &'static str, ctor: fn() -> Arc<dyn GPUProvider>) {
        self.constructors.insert(name, ctor);
    }

    /// Fetch (constructing and caching if necessary) the provider
    /// registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn GPUProvider>> {
        if let Some(provider) = self.cache.read().unwrap().get(name) {
            return Some(provider.clone());
        }
        let ctor = self.constructors.get(name)?;
        let provider = ctor();
        self.cache
            .write()
            .unwrap()
            .insert(name.to_string(), provider.clone());
        Some(provider)
    }

    /// Currently active provider name, if any has been selected.
    pub fn active_name(&self) -> Option<String> {
        self.active.read().unwrap().clone()
    }

    /// The active provider instance, if one is both selected and known.
    pub fn active(&self) -> Option<Arc<dyn GPUProvider>> {
        let name = self.active_name()?;
        self.get(&name)
    }

    /// Select `name` as the active provider and persist the choice.
    pub fn set_active(&self, name: &str) -> std::io::Result<()> {
        if !self.constructors.contains_key(name) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown provider: {name}"),
            ));
        }
        *self.active.write().unwrap() = Some(name.to_string());

        let mut config = ProviderConfig::load().unwrap_or_default();
        config.active = Some(name.to_string());
        config.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_provider_round_trips_a_pod() {
        let registry = ProviderRegistry {
            constructors: {
                let mut m: HashMap<&'static str, fn() -> Arc<dyn GPUProvider>> = HashMap::new();
                m.insert("local", || Arc::new(LocalProcessProvider::new()));
                m
            },
            cache: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
        };

        let provider = registry.get("local").unwrap();
        assert!(provider.is_configured());

        let pod = provider
            .create_pod(&PodSpec {
                name: "test".to_string(),
                gpu_type: "none".to_string(),
                gpu_count: 0,
                cloud_id: "local".to_string(),
            })
            .unwrap();

        let fetched = provider.get_pod(&pod.id).unwrap();
        assert_eq!(fetched.id, pod.id);

        provider.delete_pod(&pod.id).unwrap();
        assert!(provider.get_pod(&pod.id).is_err());
    }

    #[test]
    fn unknown_provider_name_is_none() {
        let registry = ProviderRegistry {
            constructors: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
        };
        assert!(registry.get("nonexistent").is_none());
    }
}
