#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable
)]

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sandbox::{ExecRequest, SandboxError};
use vsock_host::VsockHost;

/// In production Firecracker answers the `CONNECT <port>\n` handshake line
/// itself and only forwards the framed conversation to the guest. With no
/// Firecracker in the loop here, this thread has to speak both halves: read
/// the handshake line, reply `OK <port>\n`, then hand the rest of the
/// stream to the real dispatch loop.
fn serve_one(mut stream: UnixStream) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let port = line
        .trim_end_matches(['\r', '\n'])
        .strip_prefix("CONNECT ")
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad handshake"))?;
    stream.write_all(format!("OK {port}\n").as_bytes())?;
    vsock_guest::handle_connection(stream)
}

/// Bind the guest-side listener synchronously (so the socket file exists
/// before the host dials in) and accept exactly one connection in a
/// background thread.
fn start_guest(path: &std::path::Path) -> JoinHandle<io::Result<()>> {
    let listener: UnixListener =
        vsock_guest::bind_unix(path.to_str().expect("non-utf8 path")).expect("bind failed");
    thread::spawn(move || {
        let (stream, _) = listener.accept()?;
        serve_one(stream)
    })
}

/// Test harness: temp dir, a guest thread, and a connected `VsockHost`.
///
/// `Drop` joins the guest thread and removes the temp dir even on panic.
struct Harness {
    _dir: tempfile::TempDir,
    host: Option<VsockHost>,
    guest: Option<JoinHandle<io::Result<()>>>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let socket_path = dir.path().join("vsock.sock");

        let guest = start_guest(&socket_path);
        let host = VsockHost::connect(&socket_path)
            .await
            .expect("host connect failed");

        Self {
            _dir: dir,
            host: Some(host),
            guest: Some(guest),
        }
    }

    fn finish(mut self) {
        drop(self.host.take());
        if let Some(g) = self.guest.take() {
            g.join()
                .expect("guest thread panicked")
                .expect("guest returned error");
        }
    }
}

impl std::ops::Deref for Harness {
    type Target = VsockHost;
    fn deref(&self) -> &VsockHost {
        self.host.as_ref().expect("host already taken")
    }
}

impl std::ops::DerefMut for Harness {
    fn deref_mut(&mut self) -> &mut VsockHost {
        self.host.as_mut().expect("host already taken")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        drop(self.host.take());
        if let Some(g) = self.guest.take() {
            let _ = g.join();
        }
    }
}

fn exec(command: &str) -> ExecRequest<'_> {
    ExecRequest {
        command,
        timeout_s: 5,
        working_dir: "/tmp",
    }
}

// ── exec ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn exec_returns_stdout() {
    let mut h = Harness::new().await;

    let result = h.exec(exec("echo hello")).await.expect("exec failed");

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "hello\n");
    assert!(result.stderr.is_empty());
    h.finish();
}

#[tokio::test]
async fn exec_captures_stderr_and_nonzero_exit() {
    let mut h = Harness::new().await;

    let result = h
        .exec(exec("echo oops >&2 && exit 3"))
        .await
        .expect("exec failed");

    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stderr, "oops\n");
    h.finish();
}

#[tokio::test]
async fn exec_pipe_chain() {
    let mut h = Harness::new().await;

    let result = h
        .exec(exec("echo 'hello world' | tr 'a-z' 'A-Z'"))
        .await
        .expect("exec failed");

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "HELLO WORLD\n");
    h.finish();
}

#[tokio::test]
async fn exec_sequential_calls_share_one_connection() {
    let mut h = Harness::new().await;

    for i in 0..5 {
        let result = h
            .exec(exec(&format!("echo {i}")))
            .await
            .expect("exec failed");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, format!("{i}\n"));
    }
    h.finish();
}

#[tokio::test]
async fn exec_guest_side_timeout_surfaces_as_guest_error() {
    let mut h = Harness::new().await;

    let err = h
        .exec(ExecRequest {
            command: "sleep 10",
            timeout_s: 1,
            working_dir: "/tmp",
        })
        .await
        .expect_err("expected timeout to surface as an error");

    match err {
        SandboxError::GuestError(msg) => assert!(msg.contains("timed out")),
        other => panic!("expected GuestError, got {other:?}"),
    }
    h.finish();
}

#[tokio::test]
async fn exec_unicode_output() {
    let mut h = Harness::new().await;

    let result = h
        .exec(exec("printf '\u{4f60}\u{597d}\u{4e16}\u{754c}\n'"))
        .await
        .expect("exec failed");

    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.contains('\u{4f60}'));
    h.finish();
}

// ── file operations ──────────────────────────────────────────────────

#[tokio::test]
async fn write_then_read_file_roundtrips() {
    let mut h = Harness::new().await;

    let path = h._dir.path().join("hello.txt");
    let path_str = path.to_string_lossy().to_string();
    let content = b"hello from vsock-test";

    h.write_file(&path_str, content, Duration::from_secs(5))
        .await
        .expect("write_file failed");

    let read_back = h
        .read_file(&path_str, Duration::from_secs(5))
        .await
        .expect("read_file failed");

    assert_eq!(read_back, content);
    h.finish();
}

#[tokio::test]
async fn write_file_creates_parent_directories() {
    let mut h = Harness::new().await;

    let path = h._dir.path().join("a/b/c/nested.txt");
    let path_str = path.to_string_lossy().to_string();

    h.write_file(&path_str, b"nested content", Duration::from_secs(5))
        .await
        .expect("write_file failed");

    let written = std::fs::read(&path).expect("failed to read written file");
    assert_eq!(written, b"nested content");
    h.finish();
}

#[tokio::test]
async fn write_file_large_payload() {
    let mut h = Harness::new().await;

    let path = h._dir.path().join("large.bin");
    let path_str = path.to_string_lossy().to_string();
    let content = vec![b'x'; 100_000];

    h.write_file(&path_str, &content, Duration::from_secs(5))
        .await
        .expect("write_file failed");

    let read_back = h
        .read_file(&path_str, Duration::from_secs(5))
        .await
        .expect("read_file failed");
    assert_eq!(read_back.len(), 100_000);
    assert_eq!(read_back, content);
    h.finish();
}

#[tokio::test]
async fn read_file_missing_path_is_guest_error() {
    let mut h = Harness::new().await;

    let err = h
        .read_file("/does/not/exist", Duration::from_secs(5))
        .await
        .expect_err("expected a guest error");
    assert!(matches!(err, SandboxError::GuestError(_)));
    h.finish();
}

#[tokio::test]
async fn list_files_reports_entries() {
    let mut h = Harness::new().await;

    std::fs::write(h._dir.path().join("a.txt"), b"x").expect("setup write");
    std::fs::create_dir(h._dir.path().join("sub")).expect("setup mkdir");

    let entries = h
        .list_files(
            h._dir.path().to_str().expect("utf8 path"),
            Duration::from_secs(5),
        )
        .await
        .expect("list_files failed");

    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.name == "a.txt" && !e.is_dir));
    assert!(entries.iter().any(|e| e.name == "sub" && e.is_dir));
    h.finish();
}

#[tokio::test]
async fn mkdir_then_stat_reports_directory() {
    let mut h = Harness::new().await;

    let dir = h._dir.path().join("created/nested");
    let dir_str = dir.to_string_lossy().to_string();

    h.mkdir(&dir_str, true, Duration::from_secs(5))
        .await
        .expect("mkdir failed");

    let info = h
        .stat(&dir_str, Duration::from_secs(5))
        .await
        .expect("stat failed");
    assert!(info.exists);
    assert!(info.is_dir);
    h.finish();
}

#[tokio::test]
async fn stat_reports_missing_path_without_error() {
    let mut h = Harness::new().await;

    let info = h
        .stat(
            h._dir.path().join("gone").to_str().expect("utf8 path"),
            Duration::from_secs(5),
        )
        .await
        .expect("stat failed");
    assert!(!info.exists);
    h.finish();
}

#[tokio::test]
async fn delete_file_removes_directory_recursively() {
    let mut h = Harness::new().await;

    let nested = h._dir.path().join("a/b");
    std::fs::create_dir_all(&nested).expect("setup mkdir");

    h.delete_file(
        h._dir.path().join("a").to_str().expect("utf8 path"),
        true,
        Duration::from_secs(5),
    )
    .await
    .expect("delete_file failed");

    assert!(!h._dir.path().join("a").exists());
    h.finish();
}

// ── ping / liveness ──────────────────────────────────────────────────

#[tokio::test]
async fn ping_succeeds_after_handshake() {
    let mut h = Harness::new().await;
    h.ping(Duration::from_secs(5)).await.expect("ping failed");
    h.finish();
}

#[tokio::test]
async fn ping_then_exec_reuse_same_connection() {
    let mut h = Harness::new().await;

    h.ping(Duration::from_secs(5)).await.expect("ping failed");
    let result = h.exec(exec("echo still alive")).await.expect("exec failed");
    assert_eq!(result.stdout, "still alive\n");
    h.finish();
}
