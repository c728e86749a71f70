//! Caller-supplied sandbox creation parameters and the persisted descriptor.

use serde::{Deserialize, Serialize};

/// Parameters a caller may request when creating a sandbox. Bounds are
/// enforced by the manager against its configured min/max/default values.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub template: String,
    pub memory_mib: u32,
    pub vcpu_count: u8,
    pub workspace_id: Option<String>,
}

/// The sandbox lifecycle state. Serializes in `snake_case` so `state.json`
/// stays human-diffable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Destroying,
    Destroyed,
    Failed,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Starting => "starting",
            SandboxStatus::Running => "running",
            SandboxStatus::Pausing => "pausing",
            SandboxStatus::Paused => "paused",
            SandboxStatus::Resuming => "resuming",
            SandboxStatus::Destroying => "destroying",
            SandboxStatus::Destroyed => "destroyed",
            SandboxStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The sandbox descriptor, persisted as `state.json` in the sandbox's
/// working directory on every status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxDescriptor {
    pub sandbox_id: String,
    pub workspace_id: String,
    pub template: String,
    pub memory_mib: u32,
    pub vcpu_count: u8,
    pub vsock_cid: u32,
    pub status: SandboxStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub vmm_pid: Option<u32>,
}
