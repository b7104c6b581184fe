//! Polls a GPU provider for pod status and normalizes it across providers.
//!
//! `PodMonitor` doesn't know about `forge-server`'s `ServerMessage`
//! broadcast channel — that would make this crate depend on the server
//! crate. Instead it invokes a plain callback with a normalized
//! [`PodStatusUpdate`]; `forge-server::routes` wraps that callback to wrap
//! each update into a `ServerMessage` and broadcast it, so the existing
//! WebSocket fan-out carries pod events for free.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::providers::GPUProvider;

/// Normalized pod lifecycle state.
///
/// Serializes as its plain uppercase string form (`"ACTIVE"`,
/// `"PROVISIONING"`, ...) rather than as a tagged enum, since it's
/// transmitted to clients as a plain status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedStatus {
    Pending,
    Starting,
    Active,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
    Error,
    /// A provider-specific string this table doesn't recognize; passed
    /// through uppercased.
    Unknown(String),
}

impl serde::Serialize for NormalizedStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for NormalizedStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::normalize(&s))
    }
}

impl NormalizedStatus {
    /// Map a provider's raw status string onto the normalized vocabulary.
    /// Unknown strings are uppercased and passed through.
    pub fn normalize(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "running" | "active" | "ready" => Self::Active,
            "starting" | "loading" | "booting" => Self::Starting,
            "pending" => Self::Pending,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "terminating" => Self::Terminating,
            "exited" | "terminated" => Self::Terminated,
            "error" | "failed" => Self::Error,
            other => Self::Unknown(other.to_ascii_uppercase()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Terminated)
    }
}

impl std::fmt::Display for NormalizedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Starting => write!(f, "STARTING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Terminating => write!(f, "TERMINATING"),
            Self::Terminated => write!(f, "TERMINATED"),
            Self::Error => write!(f, "ERROR"),
            Self::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// A single normalized poll result, emitted to all connected clients as
/// `pod_status_update`.
#[derive(Debug, Clone)]
pub struct PodStatusUpdate {
    pub pod_id: String,
    pub name: String,
    pub status: NormalizedStatus,
    pub ssh_connection: Option<String>,
    pub ip: Option<String>,
    pub gpu_name: String,
    pub gpu_count: u32,
    pub price_hr: f64,
}

type UpdateCallback = Arc<dyn Fn(PodStatusUpdate) + Send + Sync>;

/// One `tokio::time::interval` task per pod id; duplicate `start` is a
/// no-op. Exits when the pod reaches a terminal state, or
/// becomes `ACTIVE` with an SSH endpoint available.
pub struct PodMonitor {
    provider: Arc<dyn GPUProvider>,
    callback: UpdateCallback,
    poll_interval: Duration,
    tasks: Mutex<HashMap<String, AbortHandle>>,
}

impl PodMonitor {
    pub fn new(provider: Arc<dyn GPUProvider>, callback: UpdateCallback) -> Self {
        Self {
            provider,
            callback,
            poll_interval: Duration::from_secs(5),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling `pod_id` if it isn't already being monitored.
    pub fn start(self: &Arc<Self>, pod_id: String) {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&pod_id) {
            return;
        }

        let this = self.clone();
        let key = pod_id.clone();
        let handle = tokio::spawn(async move { this.poll_loop(pod_id).await });
        tasks.insert(key, handle.abort_handle());
    }

    /// Stop polling `pod_id`, if it is currently monitored.
    pub fn stop(&self, pod_id: &str) {
        if let Some(handle) = self.tasks.lock().unwrap().remove(pod_id) {
            handle.abort();
        }
    }

    async fn poll_loop(self: Arc<Self>, pod_id: String) {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;

            let pod = match self.provider.get_pod(&pod_id) {
                Ok(pod) => pod,
                Err(e) => {
                    tracing::warn!("pod monitor: failed to poll {pod_id}: {e}");
                    continue;
                }
            };

            let status = NormalizedStatus::normalize(&pod.status);
            let ready = status == NormalizedStatus::Active && pod.ssh_connection.is_some();
            let terminal = status.is_terminal();

            (self.callback)(PodStatusUpdate {
                pod_id: pod_id.clone(),
                name: pod.name,
                status,
                ssh_connection: pod.ssh_connection.clone(),
                ip: pod.ip,
                gpu_name: pod.gpu_name,
                gpu_count: pod.gpu_count,
                price_hr: pod.price_hr,
            });

            if terminal || ready {
                self.tasks.lock().unwrap().remove(&pod_id);
                break;
            }
        }
    }
}
