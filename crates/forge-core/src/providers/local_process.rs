//! A `GPUProvider` test double that stands in a plain child process for a
//! "pod". Used by the registry's own tests and as a development fallback
//! when no real cloud credentials are configured — concrete REST/GraphQL
//! providers (RunPod, Lambda Labs, Vast.ai) are out of scope.

use std::collections::HashMap;
use std::process::Child;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ProviderError;

use super::{AvailabilityFilter, GPUProvider, GpuOffer, Pod, PodPage, PodSpec};

struct TrackedPod {
    child: Child,
    name: String,
    created_at: String,
}

/// Spawns a long-lived, harmless child process (`sleep` on Unix, `timeout`
/// on Windows) per "pod" and tracks it by a generated id. `supports_ssh` is
/// `false` since there is no real remote host to reach.
pub struct LocalProcessProvider {
    pods: Mutex<HashMap<String, TrackedPod>>,
}

impl LocalProcessProvider {
    pub fn new() -> Self {
        Self {
            pods: Mutex::new(HashMap::new()),
        }
    }

    fn now_rfc3339_ish() -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("{secs}")
    }
}

impl Default for LocalProcessProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GPUProvider for LocalProcessProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn display_name(&self) -> &'static str {
        "Local Process"
    }

    fn api_key_env_name(&self) -> &'static str {
        "FORGE_LOCAL_API_KEY"
    }

    fn supports_ssh(&self) -> bool {
        false
    }

    fn dashboard_url(&self) -> &'static str {
        ""
    }

    fn is_configured(&self) -> bool {
        // No credentials needed for the local test double.
        true
    }

    fn get_gpu_availability(
        &self,
        _filters: &AvailabilityFilter,
    ) -> Result<Vec<GpuOffer>, ProviderError> {
        Ok(vec![GpuOffer {
            gpu_type: "none".to_string(),
            gpu_name: "Local CPU".to_string(),
            gpu_count: 0,
            price_hr: 0.0,
            cloud_id: "local".to_string(),
            region: None,
        }])
    }

    fn create_pod(&self, spec: &PodSpec) -> Result<Pod, ProviderError> {
        let id = uuid::Uuid::new_v4().to_string();

        #[cfg(unix)]
        let child = std::process::Command::new("sleep")
            .arg("86400")
            .spawn();
        #[cfg(windows)]
        let child = std::process::Command::new("timeout")
            .args(["/T", "86400", "/NOBREAK"])
            .spawn();

        let child = child.map_err(|e| {
            ProviderError::Transport(format!("failed to spawn local pod process: {e}"))
        })?;

        let now = Self::now_rfc3339_ish();
        let mut pods = self.pods.lock().unwrap();
        pods.insert(
            id.clone(),
            TrackedPod {
                child,
                name: spec.name.clone(),
                created_at: now.clone(),
            },
        );

        Ok(Pod {
            id,
            name: spec.name.clone(),
            status: "running".to_string(),
            gpu_name: "Local CPU".to_string(),
            gpu_count: spec.gpu_count,
            price_hr: 0.0,
            ssh_connection: None,
            ip: Some("127.0.0.1".to_string()),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    fn get_pod(&self, id: &str) -> Result<Pod, ProviderError> {
        let mut pods = self.pods.lock().unwrap();
        let tracked = pods
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;

        let status = match tracked.child.try_wait() {
            Ok(None) => "running",
            Ok(Some(_)) => "exited",
            Err(_) => "error",
        };

        Ok(Pod {
            id: id.to_string(),
            name: tracked.name.clone(),
            status: status.to_string(),
            gpu_name: "Local CPU".to_string(),
            gpu_count: 0,
            price_hr: 0.0,
            ssh_connection: None,
            ip: Some("127.0.0.1".to_string()),
            created_at: tracked.created_at.clone(),
            updated_at: Self::now_rfc3339_ish(),
        })
    }

    fn get_pods(
        &self,
        status: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<PodPage, ProviderError> {
        let ids: Vec<String> = self.pods.lock().unwrap().keys().cloned().collect();
        let mut pods = Vec::new();
        for id in ids {
            if let Ok(pod) = self.get_pod(&id) {
                if status.is_none_or(|s| pod.status.eq_ignore_ascii_case(s)) {
                    pods.push(pod);
                }
            }
        }
        let total = pods.len();
        let page = pods.into_iter().skip(offset).take(limit).collect();
        Ok(PodPage { pods: page, total })
    }

    fn delete_pod(&self, id: &str) -> Result<(), ProviderError> {
        let mut pods = self.pods.lock().unwrap();
        let mut tracked = pods
            .remove(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        let _ = tracked.child.kill();
        let _ = tracked.child.wait();
        Ok(())
    }
}
