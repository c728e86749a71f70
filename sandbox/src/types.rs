//! Backend-agnostic request/response types for the guest agent's action
//! table. Wire encoding lives in `vsock-proto`; these are what callers in
//! `sandbox-manager` and `facade` actually hold.

/// `exec` request. `working_dir` and `timeout_s` are always given explicit
/// values by the caller; the guest agent's own defaults (300s, `/workspace`)
/// only matter to callers that skip `sandbox-manager` entirely.
pub struct ExecRequest<'a> {
    pub command: &'a str,
    pub timeout_s: u32,
    pub working_dir: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StatInfo {
    pub exists: bool,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: i64,
}
