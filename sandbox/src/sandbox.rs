use async_trait::async_trait;

use crate::config::SandboxDescriptor;
use crate::error::Result;
use crate::types::{ExecRequest, ExecResult, FileEntry, StatInfo};

/// A single running (or pausing/resuming) sandbox: one Firecracker child
/// plus the guest transport connected to it. Implemented by
/// `sandbox-fc::FirecrackerSandbox`; `sandbox-manager` holds these behind
/// `Box<dyn Sandbox>` so it never depends on the VMM backend directly.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    fn descriptor(&self) -> SandboxDescriptor;

    async fn exec(&self, request: ExecRequest<'_>) -> Result<ExecResult>;
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>>;
    async fn mkdir(&self, path: &str, parents: bool) -> Result<()>;
    async fn stat(&self, path: &str) -> Result<StatInfo>;
    async fn delete_file(&self, path: &str, recursive: bool) -> Result<()>;

    /// Pause the VM, snapshot it, and stop the VMM child. Caller has
    /// already checked the sandbox was `Running`.
    async fn pause(&mut self) -> Result<()>;
    /// Spawn a fresh VMM child, load the snapshot with `resume=true`, and
    /// reconnect the guest transport. Caller has already checked the
    /// sandbox was `Paused`.
    async fn resume(&mut self) -> Result<()>;
    /// Idempotent: graceful shutdown, force-kill if still alive, remove
    /// the sandbox directory. Safe to call more than once.
    async fn destroy(&mut self) -> Result<()>;
}
