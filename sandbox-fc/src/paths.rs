//! Filesystem layout under the configured base directory.
//!
//! ```text
//! {base}/kernels/{template}-vmlinux.bin
//! {base}/rootfs/{template}-rootfs.ext4
//! {base}/sandboxes/{id}/{rootfs.ext4,firecracker.sock,vsock.sock,state.json}
//! {base}/snapshots/{workspace_id}/{snapshot,memory}
//! ```

use std::path::{Path, PathBuf};

/// `AF_UNIX` socket paths are limited to `sizeof(sun_path)`, 108 bytes
/// including the NUL terminator on Linux.
const MAX_SUN_PATH_LEN: usize = 107;

/// Root of the artifact store: kernels, base rootfs images, sandboxes,
/// snapshots.
#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn kernels_dir(&self) -> PathBuf {
        self.base.join("kernels")
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.base.join("rootfs")
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.base.join("sandboxes")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.base.join("snapshots")
    }

    /// Read-only shared kernel image for `template`.
    pub fn kernel_path(&self, template: &str) -> PathBuf {
        self.kernels_dir().join(format!("{template}-vmlinux.bin"))
    }

    /// Read-only shared base rootfs image for `template`.
    pub fn base_rootfs_path(&self, template: &str) -> PathBuf {
        self.rootfs_dir().join(format!("{template}-rootfs.ext4"))
    }

    pub fn sandbox(&self, sandbox_id: &str) -> SandboxPaths {
        SandboxPaths::new(self.sandboxes_dir().join(sandbox_id))
    }

    pub fn snapshot(&self, workspace_id: &str) -> SnapshotPaths {
        SnapshotPaths::new(self.snapshots_dir().join(workspace_id))
    }
}

/// Per-sandbox working directory: `{base}/sandboxes/{id}/`.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    dir: PathBuf,
}

impl SandboxPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn overlay(&self) -> PathBuf {
        self.dir.join("rootfs.ext4")
    }

    pub fn api_sock(&self) -> PathBuf {
        self.dir.join("firecracker.sock")
    }

    pub fn vsock(&self) -> PathBuf {
        self.dir.join("vsock.sock")
    }

    pub fn state_json(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    /// Whether the socket paths under this directory fit in `sun_path`.
    /// Constructed sandbox ids are short (8 hex chars) but `base_dir` is
    /// operator-controlled, so this is worth checking rather than assuming.
    pub fn sockets_fit_sun_path(&self) -> bool {
        self.api_sock().as_os_str().len() <= MAX_SUN_PATH_LEN
            && self.vsock().as_os_str().len() <= MAX_SUN_PATH_LEN
    }
}

/// Per-workspace snapshot directory: `{base}/snapshots/{workspace_id}/`.
#[derive(Debug, Clone)]
pub struct SnapshotPaths {
    dir: PathBuf,
}

impl SnapshotPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot(&self) -> PathBuf {
        self.dir.join("snapshot")
    }

    pub fn memory(&self) -> PathBuf {
        self.dir.join("memory")
    }

    /// A snapshot pair is only valid when both files exist and are non-empty.
    pub fn is_valid(&self) -> bool {
        let ok = |p: PathBuf| p.metadata().map(|m| m.len() > 0).unwrap_or(false);
        ok(self.snapshot()) && ok(self.memory())
    }
}
