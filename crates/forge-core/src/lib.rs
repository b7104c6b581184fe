//! Core execution/session engine for the Forge GPU notebook environment.
//!
//! # ⚠️ API Stability Warning
//!
//! **This crate contains internal APIs that are UNSTABLE and may change without notice.**
//!
//! For notebook development, use the `forge` CLI instead; this crate is
//! intended for:
//! - Building custom notebook tools and extensions
//! - Advanced integrations with Forge internals
//! - Contributing to Forge development
//!
//! **Stability guarantees:**
//! - ❌ **No SemVer guarantees** - breaking changes may occur in minor versions (0.x.y)
//! - ❌ **No deprecation warnings** - APIs may be removed without warning
//! - ❌ **Internal implementation details** - subject to refactoring
//!
//! ---
//!
//! This crate provides:
//! - The worker command/event protocol (length-prefixed bincode framing)
//! - The Kernel Client façade that owns a worker's channels
//! - The persisted notebook document model
//! - The GPU provider capability set, registry, and pod monitor
//! - The SSH-based Remote Bridge for routing execution to a remote GPU host

pub mod error;
pub mod kernel;
pub mod monitor;
pub mod notebook;
pub mod paths;
pub mod protocol;
pub mod providers;
pub mod remote;

pub use error::{Error, ProviderError, RemoteError, RemoteResult, Result};
pub use kernel::{Endpoints, KernelClient, KernelState, KillHandle};
pub use monitor::{NormalizedStatus, PodMonitor, PodStatusUpdate};
pub use notebook::{Cell, CellId, CellKind, Notebook, Output, StreamName as OutputStreamName};
pub use protocol::{
    ErrorInfo, ExecutionResultInfo, ExecutionStatus, StreamName, WorkerCommand, WorkerEvent,
    WorkerReply,
};
pub use providers::{
    AvailabilityFilter, GPUProvider, GpuOffer, LocalProcessProvider, Pod, PodPage, PodSpec,
    ProviderConfig, ProviderRegistry,
};
pub use remote::{resolve_ssh_key, RemoteBridge};
