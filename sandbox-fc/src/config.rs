use std::path::PathBuf;
use std::time::Duration;

/// Fixed configuration for the Firecracker backend, independent of any one
/// sandbox. Caller-supplied per-sandbox parameters (`template`, `memory_mib`,
/// `vcpu_count`) arrive separately via `sandbox::SandboxConfig`.
#[derive(Debug, Clone)]
pub struct FirecrackerConfig {
    /// Path to the `firecracker` binary.
    pub binary_path: PathBuf,
    /// Root of the artifact store (`kernels/`, `rootfs/`, `sandboxes/`,
    /// `snapshots/`).
    pub base_dir: PathBuf,
    /// How long to wait for the VMM's API socket to appear after spawn.
    pub boot_timeout: Duration,
}
