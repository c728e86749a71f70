//! Guest agent binary: listens on vsock port 5000 inside the sandbox VM and
//! serves the host's exec/file-op requests until the VM is torn down.

use guest_agent::{log, VsockListener};

/// When set, bind a Unix-domain socket at this path instead of `AF_VSOCK`.
/// Used for local development and tests run outside a Firecracker VM.
const DEV_SOCKET_ENV: &str = "GUEST_AGENT_DEV_SOCKET";

fn main() {
    if let Ok(path) = std::env::var(DEV_SOCKET_ENV) {
        log("INFO", &format!("dev mode: listening on unix socket {path}"));
        let listener = match vsock_guest::bind_unix(&path) {
            Ok(l) => l,
            Err(e) => {
                log("ERROR", &format!("failed to bind {path}: {e}"));
                std::process::exit(1);
            }
        };
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = guest_agent::handle_connection(stream) {
                        log("WARN", &format!("connection error: {e}"));
                    }
                }
                Err(e) => log("WARN", &format!("accept failed: {e}")),
            }
        }
    }

    let listener = match VsockListener::bind() {
        Ok(l) => l,
        Err(e) => {
            log("ERROR", &format!("failed to bind vsock listener: {e}"));
            std::process::exit(1);
        }
    };

    if let Err(e) = guest_agent::run(&listener) {
        log("ERROR", &format!("fatal: {e}"));
        std::process::exit(1);
    }
}
