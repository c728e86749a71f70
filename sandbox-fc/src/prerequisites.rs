use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use sandbox::SandboxError;

use crate::config::FirecrackerConfig;

/// Verify that all required system prerequisites are present before
/// creating the factory.
///
/// Checks the firecracker binary and `/dev/kvm`. Collects all failures and
/// returns them in a single `BackendNotAvailable`-style error (there is no
/// dedicated error kind for this, so it is surfaced as `InvalidRequest` —
/// the caller treats it as fatal factory construction failure, not a
/// per-request error).
pub async fn check_prerequisites(config: &FirecrackerConfig) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    check_file_exists(&config.binary_path, "firecracker binary", &mut errors);
    check_executable(&config.binary_path, "firecracker binary", &mut errors);
    check_kvm(&mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::InvalidRequest(errors.join("; ")))
    }
}

fn check_file_exists(path: &Path, label: &str, errors: &mut Vec<String>) {
    if !path.exists() {
        errors.push(format!("{label} not found: {}", path.display()));
    }
}

fn check_executable(path: &Path, label: &str, errors: &mut Vec<String>) {
    if let Ok(meta) = path.metadata()
        && meta.permissions().mode() & 0o111 == 0
    {
        errors.push(format!("{label} is not executable: {}", path.display()));
    }
}

fn check_kvm(errors: &mut Vec<String>) {
    let kvm = Path::new("/dev/kvm");
    if !kvm.exists() {
        errors.push("/dev/kvm not found (KVM not available)".to_string());
    } else if let Err(e) = std::fs::File::options().read(true).write(true).open(kvm) {
        errors.push(format!("/dev/kvm not accessible: {e}"));
    }
}
