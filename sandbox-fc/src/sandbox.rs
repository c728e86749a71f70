use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

use sandbox::{
    ExecRequest, ExecResult, FileEntry, Sandbox, SandboxConfig, SandboxDescriptor, SandboxError,
    SandboxStatus, StatInfo,
};
use vsock_host::VsockHost;

use crate::api::{ApiClient, ApiError};
use crate::config::FirecrackerConfig;
use crate::paths::{Paths, SandboxPaths, SnapshotPaths};
use crate::{overlay, process};

/// Kernel command line used for every sandbox. No `ip=` arguments: guest
/// networking is out of scope.
const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off init=/sbin/init";

/// Timeout applied to the initial post-start `ping` and to every file
/// operation that does not carry its own caller-supplied timeout.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between `SendCtrlAltDel` and a force-kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn vmm_err(e: ApiError) -> SandboxError {
    SandboxError::VmmProtocol(e.to_string())
}

/// One Firecracker-backed sandbox: the VMM child process (by pid, not a
/// retained `Child` handle — see [`spawn_firecracker`]), the guest vsock
/// transport, and the paths that locate both.
pub struct FirecrackerSandbox {
    sandbox_id: String,
    workspace_id: String,
    template: String,
    memory_mib: u32,
    vcpu_count: u8,
    vsock_cid: u32,
    created_at: chrono::DateTime<chrono::Utc>,
    config: FirecrackerConfig,
    paths: SandboxPaths,
    snapshot_paths: SnapshotPaths,
    status: std::sync::Mutex<SandboxStatus>,
    vmm_pid: std::sync::Mutex<Option<u32>>,
    transport: tokio::sync::Mutex<Option<VsockHost>>,
}

impl FirecrackerSandbox {
    /// Spawn, configure, start, and ping a brand-new sandbox.
    pub(crate) async fn start_fresh(
        fc_config: FirecrackerConfig,
        sandbox_config: &SandboxConfig,
        sandbox_id: String,
        vsock_cid: u32,
        paths: &Paths,
    ) -> sandbox::Result<Self> {
        let sandbox_paths = paths.sandbox(&sandbox_id);
        let workspace_id = sandbox_config
            .workspace_id
            .clone()
            .unwrap_or_else(|| sandbox_id.clone());
        let snapshot_paths = paths.snapshot(&workspace_id);

        if !sandbox_paths.sockets_fit_sun_path() {
            return Err(SandboxError::InvalidRequest(format!(
                "base_dir too long for unix socket paths: {}",
                paths.base().display()
            )));
        }

        tokio::fs::create_dir_all(sandbox_paths.dir())
            .await
            .map_err(SandboxError::Io)?;

        let kernel_path = paths.kernel_path(&sandbox_config.template);
        if !kernel_path.exists() {
            return Err(SandboxError::ArtifactMissing(format!(
                "kernel not found: {}",
                kernel_path.display()
            )));
        }
        let base_rootfs = paths.base_rootfs_path(&sandbox_config.template);

        let result = Self::start_fresh_inner(
            &fc_config,
            sandbox_config,
            &sandbox_paths,
            &kernel_path,
            &base_rootfs,
            vsock_cid,
        )
        .await;

        let pid = match result {
            Ok(pid) => pid,
            Err(e) => {
                let _ = overlay::destroy_overlay(sandbox_paths.dir()).await;
                return Err(e);
            }
        };

        let transport = match VsockHost::connect(&sandbox_paths.vsock()).await {
            Ok(mut t) => match t.ping(DEFAULT_CALL_TIMEOUT).await {
                Ok(()) => t,
                Err(e) => {
                    process::kill_pid(pid);
                    let _ = overlay::destroy_overlay(sandbox_paths.dir()).await;
                    return Err(e);
                }
            },
            Err(e) => {
                process::kill_pid(pid);
                let _ = overlay::destroy_overlay(sandbox_paths.dir()).await;
                return Err(e);
            }
        };

        info!(sandbox_id = %sandbox_id, pid, "sandbox started");

        Ok(Self {
            sandbox_id,
            workspace_id,
            template: sandbox_config.template.clone(),
            memory_mib: sandbox_config.memory_mib,
            vcpu_count: sandbox_config.vcpu_count,
            vsock_cid,
            created_at: chrono::Utc::now(),
            config: fc_config,
            paths: sandbox_paths,
            snapshot_paths,
            status: std::sync::Mutex::new(SandboxStatus::Running),
            vmm_pid: std::sync::Mutex::new(Some(pid)),
            transport: tokio::sync::Mutex::new(Some(transport)),
        })
    }

    async fn start_fresh_inner(
        fc_config: &FirecrackerConfig,
        sandbox_config: &SandboxConfig,
        sandbox_paths: &SandboxPaths,
        kernel_path: &Path,
        base_rootfs: &Path,
        vsock_cid: u32,
    ) -> sandbox::Result<u32> {
        overlay::create_overlay(base_rootfs, sandbox_paths.dir()).await?;

        let pid = spawn_firecracker(&fc_config.binary_path, sandbox_paths).await?;

        let api = ApiClient::new(&sandbox_paths.api_sock());
        if api.wait_for_ready(fc_config.boot_timeout).await.is_err() {
            process::kill_pid(pid);
            return Err(SandboxError::VmmUnresponsive);
        }

        if let Err(e) = configure_vm(
            &api,
            kernel_path,
            &sandbox_paths.overlay(),
            sandbox_config.vcpu_count,
            sandbox_config.memory_mib,
            vsock_cid,
            &sandbox_paths.vsock(),
        )
        .await
        {
            process::kill_pid(pid);
            return Err(e);
        }

        if let Err(e) = api.start_instance().await.map_err(vmm_err) {
            process::kill_pid(pid);
            return Err(e);
        }

        Ok(pid)
    }

    /// Rebuild a handle for a sandbox whose VMM child was confirmed alive
    /// (by pid and API-socket responsiveness) during crash-recovery.
    /// Never touches the VMM's running state.
    pub(crate) async fn reattach(
        fc_config: FirecrackerConfig,
        descriptor: SandboxDescriptor,
        paths: &Paths,
    ) -> sandbox::Result<Self> {
        let sandbox_paths = paths.sandbox(&descriptor.sandbox_id);
        let snapshot_paths = paths.snapshot(&descriptor.workspace_id);

        let transport = if descriptor.status == SandboxStatus::Running {
            let mut t = VsockHost::connect(&sandbox_paths.vsock()).await?;
            t.ping(DEFAULT_CALL_TIMEOUT).await?;
            Some(t)
        } else {
            None
        };

        info!(sandbox_id = %descriptor.sandbox_id, status = %descriptor.status, "sandbox reattached");

        Ok(Self {
            sandbox_id: descriptor.sandbox_id,
            workspace_id: descriptor.workspace_id,
            template: descriptor.template,
            memory_mib: descriptor.memory_mib,
            vcpu_count: descriptor.vcpu_count,
            vsock_cid: descriptor.vsock_cid,
            created_at: descriptor.created_at,
            config: fc_config,
            paths: sandbox_paths,
            snapshot_paths,
            status: std::sync::Mutex::new(descriptor.status),
            vmm_pid: std::sync::Mutex::new(descriptor.vmm_pid),
            transport: tokio::sync::Mutex::new(transport),
        })
    }

    fn status(&self) -> SandboxStatus {
        *lock(&self.status)
    }

    fn set_status(&self, status: SandboxStatus) {
        *lock(&self.status) = status;
    }

    fn vmm_pid(&self) -> Option<u32> {
        *lock(&self.vmm_pid)
    }

    fn set_vmm_pid(&self, pid: Option<u32>) {
        *lock(&self.vmm_pid) = pid;
    }
}

fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Sequence of `PUT` requests Firecracker requires, in this exact order:
/// machine-config, boot-source, rootfs drive, vsock device.
async fn configure_vm(
    api: &ApiClient,
    kernel_path: &Path,
    overlay_path: &Path,
    vcpu_count: u8,
    memory_mib: u32,
    vsock_cid: u32,
    vsock_path: &Path,
) -> sandbox::Result<()> {
    api.configure_machine(vcpu_count, memory_mib)
        .await
        .map_err(vmm_err)?;
    api.configure_boot_source(&kernel_path.display().to_string(), BOOT_ARGS)
        .await
        .map_err(vmm_err)?;
    api.configure_drive(
        "rootfs",
        &overlay_path.display().to_string(),
        true,
        false,
    )
    .await
    .map_err(vmm_err)?;
    api.configure_vsock(vsock_cid, &vsock_path.display().to_string())
        .await
        .map_err(vmm_err)?;
    Ok(())
}

/// Spawn the Firecracker binary and detach ownership of its `Child` handle
/// into a background reaper task, so the process keeps running (and is
/// properly `wait()`-ed when it exits) independent of this struct's
/// lifetime. Killing it later is done by raw pid via [`process::kill_pid`],
/// which also works for a child reattached after a host restart.
async fn spawn_firecracker(binary_path: &Path, paths: &SandboxPaths) -> sandbox::Result<u32> {
    let mut child = tokio::process::Command::new(binary_path)
        .arg("--api-sock")
        .arg(paths.api_sock())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| SandboxError::VmmSpawn(e.to_string()))?;

    let pid = child
        .id()
        .ok_or_else(|| SandboxError::VmmSpawn("child exited before pid was observable".into()))?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    info!(target: "firecracker", "{line}");
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    warn!(target: "firecracker", "stderr: {line}");
                }
            }
        });
    }

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => info!(pid, %status, "firecracker process exited"),
            Err(e) => warn!(pid, error = %e, "failed to wait on firecracker child"),
        }
    });

    Ok(pid)
}

#[async_trait]
impl Sandbox for FirecrackerSandbox {
    fn id(&self) -> &str {
        &self.sandbox_id
    }

    fn descriptor(&self) -> SandboxDescriptor {
        SandboxDescriptor {
            sandbox_id: self.sandbox_id.clone(),
            workspace_id: self.workspace_id.clone(),
            template: self.template.clone(),
            memory_mib: self.memory_mib,
            vcpu_count: self.vcpu_count,
            vsock_cid: self.vsock_cid,
            status: self.status(),
            created_at: self.created_at,
            vmm_pid: self.vmm_pid(),
        }
    }

    async fn exec(&self, request: ExecRequest<'_>) -> sandbox::Result<ExecResult> {
        let mut guard = self.transport.lock().await;
        let host = guard
            .as_mut()
            .ok_or_else(|| SandboxError::Transport("no guest transport".into()))?;
        host.exec(request).await
    }

    async fn read_file(&self, path: &str) -> sandbox::Result<Vec<u8>> {
        let mut guard = self.transport.lock().await;
        let host = guard
            .as_mut()
            .ok_or_else(|| SandboxError::Transport("no guest transport".into()))?;
        host.read_file(path, DEFAULT_CALL_TIMEOUT).await
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> sandbox::Result<()> {
        let mut guard = self.transport.lock().await;
        let host = guard
            .as_mut()
            .ok_or_else(|| SandboxError::Transport("no guest transport".into()))?;
        host.write_file(path, content, DEFAULT_CALL_TIMEOUT).await
    }

    async fn list_files(&self, path: &str) -> sandbox::Result<Vec<FileEntry>> {
        let mut guard = self.transport.lock().await;
        let host = guard
            .as_mut()
            .ok_or_else(|| SandboxError::Transport("no guest transport".into()))?;
        host.list_files(path, DEFAULT_CALL_TIMEOUT).await
    }

    async fn mkdir(&self, path: &str, parents: bool) -> sandbox::Result<()> {
        let mut guard = self.transport.lock().await;
        let host = guard
            .as_mut()
            .ok_or_else(|| SandboxError::Transport("no guest transport".into()))?;
        host.mkdir(path, parents, DEFAULT_CALL_TIMEOUT).await
    }

    async fn stat(&self, path: &str) -> sandbox::Result<StatInfo> {
        let mut guard = self.transport.lock().await;
        let host = guard
            .as_mut()
            .ok_or_else(|| SandboxError::Transport("no guest transport".into()))?;
        host.stat(path, DEFAULT_CALL_TIMEOUT).await
    }

    async fn delete_file(&self, path: &str, recursive: bool) -> sandbox::Result<()> {
        let mut guard = self.transport.lock().await;
        let host = guard
            .as_mut()
            .ok_or_else(|| SandboxError::Transport("no guest transport".into()))?;
        host.delete_file(path, recursive, DEFAULT_CALL_TIMEOUT).await
    }

    async fn pause(&mut self) -> sandbox::Result<()> {
        self.set_status(SandboxStatus::Pausing);

        let pid = self
            .vmm_pid()
            .ok_or_else(|| SandboxError::VmmProtocol("no VMM pid to pause".into()))?;
        let api = ApiClient::new(&self.paths.api_sock());

        api.pause().await.map_err(vmm_err)?;

        tokio::fs::create_dir_all(self.snapshot_paths.dir())
            .await
            .map_err(SandboxError::Io)?;
        api.create_snapshot(
            &self.snapshot_paths.snapshot().display().to_string(),
            &self.snapshot_paths.memory().display().to_string(),
        )
        .await
        .map_err(vmm_err)?;

        // Best-effort graceful shutdown, then force-kill after the grace
        // period; either way the child must be gone before we report Paused.
        let _ = api.send_ctrl_alt_del().await;
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        if process::is_alive(pid) {
            process::kill_pid(pid);
        }

        *self.transport.lock().await = None;
        self.set_vmm_pid(None);
        self.set_status(SandboxStatus::Paused);
        info!(sandbox_id = %self.sandbox_id, "sandbox paused");
        Ok(())
    }

    async fn resume(&mut self) -> sandbox::Result<()> {
        self.set_status(SandboxStatus::Resuming);

        if !self.snapshot_paths.is_valid() {
            self.set_status(SandboxStatus::Failed);
            return Err(SandboxError::ArtifactMissing(format!(
                "no valid snapshot for workspace {}",
                self.workspace_id
            )));
        }

        let result = self.resume_inner().await;
        match result {
            Ok(pid) => {
                self.set_vmm_pid(Some(pid));
                self.set_status(SandboxStatus::Running);
                info!(sandbox_id = %self.sandbox_id, pid, "sandbox resumed");
                Ok(())
            }
            Err(e) => {
                self.set_status(SandboxStatus::Failed);
                Err(e)
            }
        }
    }

    async fn destroy(&mut self) -> sandbox::Result<()> {
        if self.status() == SandboxStatus::Destroyed {
            return Ok(());
        }
        self.set_status(SandboxStatus::Destroying);

        *self.transport.lock().await = None;

        if let Some(pid) = self.vmm_pid() {
            let api = ApiClient::new(&self.paths.api_sock());
            let _ = api.send_ctrl_alt_del().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            if process::is_alive(pid) {
                process::kill_pid(pid);
            }
        }

        overlay::destroy_overlay(self.paths.dir()).await?;
        let _ = tokio::fs::remove_dir_all(self.snapshot_paths.dir()).await;

        self.set_vmm_pid(None);
        self.set_status(SandboxStatus::Destroyed);
        info!(sandbox_id = %self.sandbox_id, "sandbox destroyed");
        Ok(())
    }
}

impl FirecrackerSandbox {
    async fn resume_inner(&self) -> sandbox::Result<u32> {
        let pid = spawn_firecracker(&self.config.binary_path, &self.paths).await?;

        let api = ApiClient::new(&self.paths.api_sock());
        if api.wait_for_ready(self.config.boot_timeout).await.is_err() {
            process::kill_pid(pid);
            return Err(SandboxError::VmmUnresponsive);
        }

        if let Err(e) = api
            .load_snapshot(
                &self.snapshot_paths.snapshot().display().to_string(),
                &self.snapshot_paths.memory().display().to_string(),
                true,
            )
            .await
            .map_err(vmm_err)
        {
            process::kill_pid(pid);
            return Err(e);
        }

        let mut transport = match VsockHost::connect(&self.paths.vsock()).await {
            Ok(t) => t,
            Err(e) => {
                process::kill_pid(pid);
                return Err(e);
            }
        };
        if let Err(e) = transport.ping(DEFAULT_CALL_TIMEOUT).await {
            process::kill_pid(pid);
            return Err(e);
        }

        *self.transport.lock().await = Some(transport);
        Ok(pid)
    }
}
