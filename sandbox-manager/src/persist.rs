//! `state.json` persistence: write-to-temp-then-rename so readers never see
//! a partial write, plus the directory layout used to scan for recovery.

use std::path::{Path, PathBuf};

use sandbox::{SandboxDescriptor, SandboxError};

pub(crate) fn sandboxes_dir(base_dir: &Path) -> PathBuf {
    base_dir.join("sandboxes")
}

pub(crate) fn sandbox_dir(base_dir: &Path, sandbox_id: &str) -> PathBuf {
    sandboxes_dir(base_dir).join(sandbox_id)
}

pub(crate) fn state_json_path(base_dir: &Path, sandbox_id: &str) -> PathBuf {
    sandbox_dir(base_dir, sandbox_id).join("state.json")
}

pub(crate) fn snapshot_dir(base_dir: &Path, workspace_id: &str) -> PathBuf {
    base_dir.join("snapshots").join(workspace_id)
}

/// Persist a descriptor to its sandbox's `state.json`, atomically.
pub(crate) async fn save(base_dir: &Path, descriptor: &SandboxDescriptor) -> sandbox::Result<()> {
    let dir = sandbox_dir(base_dir, &descriptor.sandbox_id);
    let final_path = dir.join("state.json");
    let tmp_path = dir.join("state.json.tmp");

    let body = serde_json::to_vec_pretty(descriptor).map_err(|e| {
        SandboxError::Io(std::io::Error::other(format!("serialize state.json: {e}")))
    })?;

    tokio::fs::create_dir_all(&dir).await.map_err(SandboxError::Io)?;
    tokio::fs::write(&tmp_path, body)
        .await
        .map_err(SandboxError::Io)?;
    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .map_err(SandboxError::Io)?;
    Ok(())
}

/// Scan `{base_dir}/sandboxes/*/state.json`, returning every descriptor
/// found. Entries that fail to parse are skipped and logged by the caller.
pub(crate) async fn scan(base_dir: &Path) -> sandbox::Result<Vec<SandboxDescriptor>> {
    let dir = sandboxes_dir(base_dir);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SandboxError::Io(e)),
    };

    let mut descriptors = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(SandboxError::Io)? {
        let state_path = entry.path().join("state.json");
        let body = match tokio::fs::read(&state_path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(SandboxError::Io(e)),
        };
        match serde_json::from_slice::<SandboxDescriptor>(&body) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(e) => {
                tracing::warn!(path = %state_path.display(), error = %e, "skipping unparseable state.json");
            }
        }
    }
    Ok(descriptors)
}
