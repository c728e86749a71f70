//! Vsock guest library: the in-guest half of the host-guest control plane.
//!
//! Binds an `AF_VSOCK` listener on the well-known guest port, accepts one
//! connection at a time, and dispatches each framed JSON request to a
//! filesystem or process action. Protocol encoding/decoding is handled by
//! the `vsock-proto` crate.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use vsock_proto::{Decoder, ProtocolError, Request};

/// Exit code surfaced to callers when a command exceeds its timeout.
const EXIT_CODE_TIMEOUT: i32 = -1;

/// Maximum length for command preview in logs.
const COMMAND_PREVIEW_MAX_LEN: usize = 100;

/// Delay between reconnection attempts after a connection closes.
const RECONNECT_DELAY_MS: u64 = 10;

/// Log a message to stderr. The guest has no logging infrastructure beyond
/// whatever the host captures from the VM console, so this stays plain.
pub fn log(level: &str, msg: &str) {
    eprintln!("[guest-agent] [{level}] {msg}");
}

fn truncate_preview(s: &str) -> String {
    if s.len() <= COMMAND_PREVIEW_MAX_LEN {
        return s.to_string();
    }
    let end = s
        .char_indices()
        .take_while(|(i, _)| *i < COMMAND_PREVIEW_MAX_LEN)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(COMMAND_PREVIEW_MAX_LEN);
    format!("{}...", &s[..end])
}

#[cfg(unix)]
fn extract_exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| status.signal().map(|sig| 128 + sig).unwrap_or(1))
}

#[cfg(not(unix))]
fn extract_exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Run `command` via `/bin/sh -c` in `working_dir`, killing the whole
/// process group if it outlives `timeout_s`.
fn handle_exec(command: &str, timeout_s: u32, working_dir: &str) -> vsock_proto::ExecResponse {
    log(
        "INFO",
        &format!(
            "exec: {} (timeout={}s, cwd={})",
            truncate_preview(command),
            timeout_s,
            working_dir
        ),
    );

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return vsock_proto::ExecResponse {
                success: false,
                error: Some(format!("failed to spawn: {e}")),
                ..Default::default()
            };
        }
    };

    let child_id = child.id();
    let timed_out = std::sync::Arc::new(AtomicBool::new(false));
    let timed_out_clone = std::sync::Arc::clone(&timed_out);
    let (tx, rx) = mpsc::channel::<()>();

    thread::spawn(move || {
        if rx
            .recv_timeout(Duration::from_secs(timeout_s as u64))
            .is_err()
        {
            timed_out_clone.store(true, Ordering::SeqCst);
            // SAFETY: child_id came from Command::spawn; negative pid targets
            // the process group created by process_group(0) above.
            unsafe {
                libc::kill(-(child_id as i32), libc::SIGKILL);
            }
        }
    });

    let output = child.wait_with_output();
    let _ = tx.send(());

    match output {
        Ok(output) if timed_out.load(Ordering::SeqCst) => vsock_proto::ExecResponse {
            success: false,
            exit_code: EXIT_CODE_TIMEOUT,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            error: Some("Command timed out".to_string()),
            ..Default::default()
        },
        Ok(output) => vsock_proto::ExecResponse {
            success: true,
            exit_code: extract_exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            error: None,
        },
        Err(e) => vsock_proto::ExecResponse {
            success: false,
            error: Some(format!("failed to wait: {e}")),
            ..Default::default()
        },
    }
}

fn handle_read_file(path: &str) -> vsock_proto::ReadFileResponse {
    match fs::read(path) {
        Ok(bytes) => {
            use base64::Engine;
            vsock_proto::ReadFileResponse {
                success: true,
                content: base64::engine::general_purpose::STANDARD.encode(bytes),
                error: None,
            }
        }
        Err(e) => vsock_proto::ReadFileResponse {
            success: false,
            content: String::new(),
            error: Some(e.to_string()),
        },
    }
}

fn handle_write_file(
    path: &str,
    content: &str,
    is_base64: bool,
) -> vsock_proto::WriteFileResponse {
    let bytes = if is_base64 {
        use base64::Engine;
        match base64::engine::general_purpose::STANDARD.decode(content) {
            Ok(b) => b,
            Err(e) => {
                return vsock_proto::WriteFileResponse {
                    success: false,
                    error: Some(format!("invalid base64: {e}")),
                };
            }
        }
    } else {
        content.as_bytes().to_vec()
    };

    if let Some(parent) = std::path::Path::new(path).parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = fs::create_dir_all(parent)
    {
        return vsock_proto::WriteFileResponse {
            success: false,
            error: Some(format!("failed to create parent directories: {e}")),
        };
    }

    match fs::write(path, bytes) {
        Ok(()) => vsock_proto::WriteFileResponse {
            success: true,
            error: None,
        },
        Err(e) => vsock_proto::WriteFileResponse {
            success: false,
            error: Some(e.to_string()),
        },
    }
}

fn handle_list_files(path: &str) -> vsock_proto::ListFilesResponse {
    let entries = match fs::read_dir(path) {
        Ok(rd) => rd,
        Err(e) => {
            return vsock_proto::ListFilesResponse {
                success: false,
                entries: Vec::new(),
                error: Some(e.to_string()),
            };
        }
    };

    let mut result = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        result.push(vsock_proto::FileEntryWire {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
        });
    }

    vsock_proto::ListFilesResponse {
        success: true,
        entries: result,
        error: None,
    }
}

fn handle_mkdir(path: &str, parents: bool) -> vsock_proto::MkdirResponse {
    let result = if parents {
        fs::create_dir_all(path)
    } else {
        fs::create_dir(path)
    };
    match result {
        Ok(()) => vsock_proto::MkdirResponse {
            success: true,
            error: None,
        },
        Err(e) => vsock_proto::MkdirResponse {
            success: false,
            error: Some(e.to_string()),
        },
    }
}

fn handle_stat(path: &str) -> vsock_proto::StatResponse {
    match fs::metadata(path) {
        Ok(metadata) => {
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            vsock_proto::StatResponse {
                success: true,
                exists: true,
                is_dir: metadata.is_dir(),
                size: metadata.len(),
                mtime,
                error: None,
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => vsock_proto::StatResponse {
            success: true,
            exists: false,
            ..Default::default()
        },
        Err(e) => vsock_proto::StatResponse {
            success: false,
            error: Some(e.to_string()),
            ..Default::default()
        },
    }
}

fn handle_delete_file(path: &str, recursive: bool) -> vsock_proto::DeleteFileResponse {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) => {
            return vsock_proto::DeleteFileResponse {
                success: false,
                error: Some(e.to_string()),
            };
        }
    };

    let result = if metadata.is_dir() {
        if recursive {
            fs::remove_dir_all(path)
        } else {
            fs::remove_dir(path)
        }
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => vsock_proto::DeleteFileResponse {
            success: true,
            error: None,
        },
        Err(e) => vsock_proto::DeleteFileResponse {
            success: false,
            error: Some(e.to_string()),
        },
    }
}

/// Dispatch one decoded request to its handler and serialize the response.
fn dispatch(body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let request: Request = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            log("WARN", &format!("malformed or unknown request: {e}"));
            return vsock_proto::encode_frame(&serde_json::json!({
                "success": false,
                "error": format!("unrecognized request: {e}"),
            }));
        }
    };

    match request {
        Request::Ping => vsock_proto::encode_frame(&vsock_proto::PingResponse {
            success: true,
            error: None,
        }),
        Request::Exec {
            command,
            timeout,
            working_dir,
        } => vsock_proto::encode_frame(&handle_exec(&command, timeout, &working_dir)),
        Request::ReadFile { path } => vsock_proto::encode_frame(&handle_read_file(&path)),
        Request::WriteFile {
            path,
            content,
            is_base64,
        } => vsock_proto::encode_frame(&handle_write_file(&path, &content, is_base64)),
        Request::ListFiles { path } => vsock_proto::encode_frame(&handle_list_files(&path)),
        Request::Mkdir { path, parents } => {
            vsock_proto::encode_frame(&handle_mkdir(&path, parents))
        }
        Request::Stat { path } => vsock_proto::encode_frame(&handle_stat(&path)),
        Request::DeleteFile { path, recursive } => {
            vsock_proto::encode_frame(&handle_delete_file(&path, recursive))
        }
    }
}

/// Serve one connection to completion: read frames, dispatch, reply, until
/// the peer closes the stream. Exactly one request is in flight at a time.
pub fn handle_connection(mut stream: impl Read + Write) -> io::Result<()> {
    let mut decoder = Decoder::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }

        let frames = decoder
            .decode(buf.get(..n).unwrap_or_default())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        for body in frames {
            let response = dispatch(&body)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            stream.write_all(&response)?;
        }
    }
}

/// A listening `AF_VSOCK` socket bound to [`vsock_proto::GUEST_PORT`].
#[cfg(target_os = "linux")]
pub struct VsockListener {
    fd: std::os::fd::RawFd,
}

#[cfg(target_os = "linux")]
impl VsockListener {
    /// Bind and listen on the guest's well-known vsock port, any CID.
    pub fn bind() -> io::Result<Self> {
        // SAFETY: valid arguments to socket(2); the fd is checked below.
        let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let addr = libc::sockaddr_vm {
            svm_family: libc::AF_VSOCK as u16,
            svm_reserved1: 0,
            svm_port: vsock_proto::GUEST_PORT,
            svm_cid: libc::VMADDR_CID_ANY,
            svm_zero: [0; 4],
        };

        // SAFETY: fd is the socket just created; addr is a fully initialized
        // sockaddr_vm of the correct size.
        let bind_ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_vm as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_vm>() as u32,
            )
        };
        if bind_ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is a valid open descriptor and we are abandoning it.
            unsafe { libc::close(fd) };
            return Err(err);
        }

        // SAFETY: fd is a valid bound socket.
        let listen_ret = unsafe { libc::listen(fd, 16) };
        if listen_ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is a valid open descriptor and we are abandoning it.
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Self { fd })
    }

    /// Block until a host connection arrives, then return it as a stream.
    pub fn accept(&self) -> io::Result<UnixStream> {
        use std::os::unix::io::FromRawFd;
        // SAFETY: self.fd is a valid listening socket for the lifetime of self.
        let client_fd =
            unsafe { libc::accept(self.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if client_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: client_fd is a newly accepted, valid, connected stream
        // socket descriptor; ownership transfers to UnixStream.
        Ok(unsafe { UnixStream::from_raw_fd(client_fd) })
    }
}

#[cfg(target_os = "linux")]
impl Drop for VsockListener {
    fn drop(&mut self) {
        // SAFETY: self.fd is owned by this struct and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Stub for non-Linux platforms (IDE / host-side compilation support only).
#[cfg(not(target_os = "linux"))]
pub struct VsockListener;

#[cfg(not(target_os = "linux"))]
impl VsockListener {
    pub fn bind() -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "vsock is only supported on Linux",
        ))
    }

    pub fn accept(&self) -> io::Result<UnixStream> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "vsock is only supported on Linux",
        ))
    }
}

/// Listen on a Unix-domain socket path instead of `AF_VSOCK` (for testing
/// outside a VM, and for local dev mode).
pub fn bind_unix(path: &str) -> io::Result<std::os::unix::net::UnixListener> {
    let _ = std::fs::remove_file(path);
    std::os::unix::net::UnixListener::bind(path)
}

/// Accept connections forever, handling one at a time. A fresh connection
/// after the previous one closes is expected behavior (e.g. after the VM
/// is paused and resumed, Firecracker's multiplexed UDS reconnects).
pub fn run(listener: &VsockListener) -> io::Result<()> {
    log("INFO", "vsock-guest listening");
    loop {
        match listener.accept() {
            Ok(stream) => {
                log("INFO", "accepted connection");
                if let Err(e) = handle_connection(stream) {
                    log("WARN", &format!("connection error: {e}"));
                }
                log("INFO", "connection closed, awaiting next");
            }
            Err(e) => {
                log("WARN", &format!("accept failed: {e}, retrying"));
                thread::sleep(Duration::from_millis(RECONNECT_DELAY_MS));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn roundtrip(request: serde_json::Value) -> serde_json::Value {
        let (mut client, server) = StdUnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            handle_connection(server).unwrap();
        });

        let frame = vsock_proto::encode_frame(&request).unwrap();
        client.write_all(&frame).unwrap();

        let mut header = [0u8; 4];
        client.read_exact(&mut header).unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).unwrap();

        drop(client);
        handle.join().unwrap();

        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn ping_succeeds() {
        let resp = roundtrip(serde_json::json!({"action": "ping"}));
        assert_eq!(resp["success"], true);
    }

    #[test]
    fn exec_runs_shell_command() {
        let resp = roundtrip(serde_json::json!({
            "action": "exec",
            "command": "echo hello",
            "working_dir": "/tmp"
        }));
        assert_eq!(resp["success"], true);
        assert_eq!(resp["exit_code"], 0);
        assert_eq!(resp["stdout"], "hello\n");
    }

    #[test]
    fn exec_honors_timeout() {
        let resp = roundtrip(serde_json::json!({
            "action": "exec",
            "command": "sleep 5",
            "timeout": 1,
            "working_dir": "/tmp"
        }));
        assert_eq!(resp["success"], false);
        assert_eq!(resp["exit_code"], -1);
        assert!(resp["error"].as_str().unwrap().contains("timed out"));
    }

    #[test]
    fn write_then_read_file_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        let path_str = path.to_str().unwrap();

        use base64::Engine;
        let content = base64::engine::general_purpose::STANDARD.encode(b"hello world");
        let write_resp = roundtrip(serde_json::json!({
            "action": "write_file",
            "path": path_str,
            "content": content,
            "is_base64": true
        }));
        assert_eq!(write_resp["success"], true);

        let read_resp = roundtrip(serde_json::json!({
            "action": "read_file",
            "path": path_str
        }));
        assert_eq!(read_resp["success"], true);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(read_resp["content"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"hello world");
    }

    #[test]
    fn write_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/file.txt");
        let path_str = path.to_str().unwrap();

        let resp = roundtrip(serde_json::json!({
            "action": "write_file",
            "path": path_str,
            "content": "hi",
            "is_base64": false
        }));
        assert_eq!(resp["success"], true);
        assert_eq!(fs::read_to_string(&path).unwrap(), "hi");
    }

    #[test]
    fn list_files_reports_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let resp = roundtrip(serde_json::json!({
            "action": "list_files",
            "path": dir.path().to_str().unwrap()
        }));
        assert_eq!(resp["success"], true);
        let entries = resp["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn mkdir_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c");

        let resp = roundtrip(serde_json::json!({
            "action": "mkdir",
            "path": path.to_str().unwrap(),
            "parents": true
        }));
        assert_eq!(resp["success"], true);
        assert!(path.is_dir());
    }

    #[test]
    fn stat_reports_missing_path_without_error() {
        let resp = roundtrip(serde_json::json!({
            "action": "stat",
            "path": "/does/not/exist"
        }));
        assert_eq!(resp["success"], true);
        assert_eq!(resp["exists"], false);
    }

    #[test]
    fn delete_file_removes_directory_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();

        let resp = roundtrip(serde_json::json!({
            "action": "delete_file",
            "path": dir.path().join("a").to_str().unwrap(),
            "recursive": true
        }));
        assert_eq!(resp["success"], true);
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn unrecognized_action_returns_error_response_not_a_protocol_failure() {
        let resp = roundtrip(serde_json::json!({"action": "teleport"}));
        assert_eq!(resp["success"], false);
        assert!(resp["error"].as_str().is_some());
    }
}
