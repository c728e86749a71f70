/// Send `SIGKILL` directly to a bare pid (used when reattaching to a
/// surviving VMM child across a host restart, where no `tokio::process::Child`
/// handle exists).
pub(crate) fn kill_pid(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL);
    }
}

/// Whether a process with the given pid is still alive, via `kill(pid, 0)`.
pub(crate) fn is_alive(pid: u32) -> bool {
    match i32::try_from(pid) {
        Ok(pid) => nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok(),
        Err(_) => false,
    }
}
