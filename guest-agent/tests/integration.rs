//! Exercises the dev-mode path `main.rs` takes when `GUEST_AGENT_DEV_SOCKET`
//! is set: bind a real Unix-domain socket on disk and dispatch connections
//! straight into `handle_connection`, with no `CONNECT`/`OK` handshake (that
//! handshake is Firecracker's job in production, not the dev-socket path's).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;

use serde_json::{json, Value};

fn roundtrip(socket_path: &std::path::Path, request: Value) -> Value {
    let mut client = UnixStream::connect(socket_path).expect("connect failed");
    let frame = vsock_proto::encode_frame(&request).expect("encode failed");
    client.write_all(&frame).expect("write failed");

    let mut header = [0u8; 4];
    client.read_exact(&mut header).expect("read header failed");
    let len = u32::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    client.read_exact(&mut body).expect("read body failed");

    serde_json::from_slice(&body).expect("response was not valid JSON")
}

#[test]
fn dev_socket_serves_one_connection_per_accept() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("guest-agent.sock");

    let listener = vsock_guest::bind_unix(socket_path.to_str().expect("utf8 path"))
        .expect("bind failed");

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept failed");
        guest_agent::handle_connection(stream).expect("handle_connection failed");
    });

    let resp = roundtrip(&socket_path, json!({"action": "ping"}));
    assert_eq!(resp["success"], true);

    server.join().expect("server thread panicked");
}

#[test]
fn dev_socket_exec_round_trips_through_the_real_listener() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("guest-agent.sock");

    let listener = vsock_guest::bind_unix(socket_path.to_str().expect("utf8 path"))
        .expect("bind failed");

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept failed");
        guest_agent::handle_connection(stream).expect("handle_connection failed");
    });

    let resp = roundtrip(
        &socket_path,
        json!({
            "action": "exec",
            "command": "echo from-dev-socket",
            "working_dir": "/tmp"
        }),
    );
    assert_eq!(resp["success"], true);
    assert_eq!(resp["exit_code"], 0);
    assert_eq!(resp["stdout"], "from-dev-socket\n");

    server.join().expect("server thread panicked");
}

#[test]
fn bind_unix_replaces_a_stale_socket_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("guest-agent.sock");
    std::fs::write(&socket_path, b"not a socket").expect("write stale file");

    let listener = vsock_guest::bind_unix(socket_path.to_str().expect("utf8 path"))
        .expect("bind should remove the stale file and bind fresh");
    drop(listener);
}

#[test]
fn log_does_not_panic_on_any_level() {
    guest_agent::log("INFO", "dev mode: listening on unix socket /tmp/x");
    guest_agent::log("WARN", "accept failed: connection reset");
    guest_agent::log("ERROR", "fatal: bind failed");
}
