//! Produces a per-sandbox writable rootfs as a copy-on-write copy of the
//! immutable base image.

use std::path::{Path, PathBuf};

use sandbox::SandboxError;
use tracing::info;

/// Copy `base_rootfs_path` into `sandbox_dir/rootfs.ext4`.
///
/// Prefers a reflink (CoW) copy when the underlying filesystem supports it;
/// falls back to a sparse byte-wise copy otherwise. The overlay is never
/// shared between sandboxes — each call produces an independent file.
pub async fn create_overlay(
    base_rootfs_path: &Path,
    sandbox_dir: &Path,
) -> sandbox::Result<PathBuf> {
    if !base_rootfs_path.exists() {
        return Err(SandboxError::ArtifactMissing(format!(
            "base rootfs not found: {}",
            base_rootfs_path.display()
        )));
    }

    let overlay_path = sandbox_dir.join("rootfs.ext4");

    let output = tokio::process::Command::new("cp")
        .arg("--reflink=auto")
        .arg("--sparse=always")
        .arg(base_rootfs_path)
        .arg(&overlay_path)
        .output()
        .await
        .map_err(SandboxError::Io)?;

    if output.status.success() {
        info!(overlay = %overlay_path.display(), "overlay created");
        return Ok(overlay_path);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No space left on device") {
        return Err(SandboxError::DiskFull);
    }
    Err(SandboxError::Io(std::io::Error::other(format!(
        "cp failed: {}",
        stderr.trim()
    ))))
}

/// Remove a sandbox's entire working directory, including its overlay.
/// The base image is never touched.
pub async fn destroy_overlay(sandbox_dir: &Path) -> sandbox::Result<()> {
    match tokio::fs::remove_dir_all(sandbox_dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SandboxError::Io(e)),
    }
}
