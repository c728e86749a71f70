use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::sandbox::Sandbox;

/// Builds sandboxes for one VMM backend. `sandbox-fc::FirecrackerFactory`
/// is the only implementation; the trait exists so `sandbox-manager`
/// depends on an interface, not a concrete VMM backend.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Human-readable name for this factory implementation (e.g. "firecracker").
    fn name(&self) -> &str;

    /// Check host prerequisites (binaries, `/dev/kvm`, required tools).
    /// Called once at service startup, before any `create()`.
    async fn startup(&self) -> Result<()>;

    /// Spawn, configure, and start a fresh sandbox: overlay creation,
    /// VMM spawn, machine/boot/drive/vsock configuration, `InstanceStart`,
    /// and an initial guest `ping`. On any failure, rolls back whatever
    /// was already created and returns the error.
    async fn create(
        &self,
        config: &SandboxConfig,
        sandbox_id: &str,
        vsock_cid: u32,
    ) -> Result<Box<dyn Sandbox>>;

    /// Rebuild a `Sandbox` handle for a sandbox whose VMM child survived a
    /// host restart (crash recovery reattachment). Does not touch the
    /// VMM's running state.
    async fn reattach(
        &self,
        descriptor: crate::config::SandboxDescriptor,
    ) -> Result<Box<dyn Sandbox>>;
}
