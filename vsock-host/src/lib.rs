//! Host-side vsock RPC client for a guest agent reachable over a
//! Firecracker-multiplexed Unix-domain socket.
//!
//! ## Connection Flow
//!
//! 1. Host connects to `vsock.sock`.
//! 2. Host sends `CONNECT <port>\n` and reads `OK <port>\n` (Firecracker's
//!    vsock-over-UDS multiplex convention); any other reply is fatal.
//! 3. The framed JSON conversation begins: exactly one request per
//!    connection at a time.
//!
//! During guest boot the UDS listener on the other end may not exist yet,
//! or the guest agent may not have bound the vsock port yet, so `connect`
//! retries with exponential backoff.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{self, Instant};

use tracing::{debug, warn};

use sandbox::{ExecRequest, ExecResult, FileEntry, Result, SandboxError, StatInfo};
use vsock_proto::{Request, GUEST_PORT};

/// Cap on the exponential backoff between connect attempts.
const CONNECT_BACKOFF_CAP: Duration = Duration::from_millis(200);

/// Total time budget for establishing the initial connection while the
/// guest is still booting.
const CONNECT_BUDGET: Duration = Duration::from_secs(15);

/// Host-side endpoint for one sandbox's vsock transport.
///
/// Holds an open connection to the guest agent and amortizes the
/// `CONNECT`/`OK` handshake across calls; callers serialize access through
/// a `tokio::sync::Mutex<VsockHost>` (the transport mutex), held only
/// across a single round trip.
pub struct VsockHost {
    stream: UnixStream,
    read_buf: Vec<u8>,
}

impl VsockHost {
    /// Connect to the guest agent via `vsock_path`, retrying the initial
    /// `CONNECT` handshake with capped exponential backoff until
    /// `CONNECT_BUDGET` elapses.
    pub async fn connect(vsock_path: &Path) -> Result<Self> {
        let deadline = Instant::now() + CONNECT_BUDGET;
        let mut backoff = Duration::from_millis(10);

        loop {
            match Self::try_connect(vsock_path).await {
                Ok(host) => return Ok(host),
                Err(err) => {
                    if Instant::now() >= deadline {
                        warn!(path = %vsock_path.display(), "vsock connect exhausted retry budget");
                        return Err(SandboxError::Transport(format!(
                            "vsock connect to {} did not succeed within {:?}: {err}",
                            vsock_path.display(),
                            CONNECT_BUDGET
                        )));
                    }
                    debug!(path = %vsock_path.display(), backoff_ms = backoff.as_millis() as u64, "vsock connect retrying");
                    time::sleep(backoff).await;
                    backoff = (backoff * 2).min(CONNECT_BACKOFF_CAP);
                }
            }
        }
    }

    async fn try_connect(vsock_path: &Path) -> Result<Self> {
        let mut stream = UnixStream::connect(vsock_path)
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        let line = vsock_proto::connect_line(GUEST_PORT);
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        let reply = Self::read_handshake_line(&mut stream).await?;
        vsock_proto::parse_ok_line(&reply)
            .map_err(|e| SandboxError::VmmProtocol(e.to_string()))?;

        Ok(Self {
            stream,
            read_buf: Vec::with_capacity(64 * 1024),
        })
    }

    async fn read_handshake_line(stream: &mut UnixStream) -> Result<String> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;
        if line.is_empty() {
            return Err(SandboxError::Transport(
                "connection closed during handshake".to_string(),
            ));
        }
        Ok(line)
    }

    /// Send a request, wait for the single framed response, and deserialize
    /// it as `R`. On timeout or protocol error the connection must be
    /// considered unusable by the caller.
    async fn call<R: serde::de::DeserializeOwned>(
        &mut self,
        request: &Request,
        timeout: Duration,
    ) -> Result<R> {
        let frame = vsock_proto::encode_frame(request)
            .map_err(|e| SandboxError::Protocol(e.to_string()))?;

        time::timeout(timeout, self.stream.write_all(&frame))
            .await
            .map_err(|_| SandboxError::Timeout)?
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        let body = time::timeout(timeout, self.read_frame())
            .await
            .map_err(|_| SandboxError::Timeout)??;

        serde_json::from_slice(&body).map_err(|e| SandboxError::Protocol(e.to_string()))
    }

    /// Read exactly one length-prefixed frame body off the stream.
    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(body) = self.try_extract_frame()? {
                return Ok(body);
            }
            let mut chunk = [0u8; 16 * 1024];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| SandboxError::Transport(e.to_string()))?;
            if n == 0 {
                return Err(SandboxError::Transport(
                    "connection closed mid-response".to_string(),
                ));
            }
            self.read_buf
                .extend_from_slice(chunk.get(..n).unwrap_or_default());
        }
    }

    fn try_extract_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.read_buf.len() < vsock_proto::HEADER_SIZE {
            return Ok(None);
        }
        let len_bytes: [u8; 4] = self
            .read_buf
            .get(..vsock_proto::HEADER_SIZE)
            .and_then(|s| s.try_into().ok())
            .unwrap_or([0; 4]);
        let length = u32::from_be_bytes(len_bytes) as usize;
        if length > vsock_proto::MAX_FRAME_SIZE {
            return Err(SandboxError::MessageTooLarge);
        }
        let total = vsock_proto::HEADER_SIZE + length;
        if self.read_buf.len() < total {
            return Ok(None);
        }
        let body = self
            .read_buf
            .get(vsock_proto::HEADER_SIZE..total)
            .unwrap_or_default()
            .to_vec();
        self.read_buf.drain(..total);
        Ok(Some(body))
    }

    /// Liveness check; used after boot and to probe a reattached sandbox.
    pub async fn ping(&mut self, timeout: Duration) -> Result<()> {
        let resp: vsock_proto::PingResponse = self.call(&Request::Ping, timeout).await?;
        if resp.success {
            Ok(())
        } else {
            Err(SandboxError::GuestError(
                resp.error.unwrap_or_else(|| "ping failed".to_string()),
            ))
        }
    }

    pub async fn exec(&mut self, request: ExecRequest<'_>) -> Result<ExecResult> {
        let req = Request::Exec {
            command: request.command.to_string(),
            timeout: request.timeout_s,
            working_dir: request.working_dir.to_string(),
        };
        let timeout = Duration::from_secs(request.timeout_s as u64) + Duration::from_secs(5);
        let resp: vsock_proto::ExecResponse = self.call(&req, timeout).await?;
        if !resp.success {
            return Err(SandboxError::GuestError(
                resp.error.unwrap_or_else(|| "exec failed".to_string()),
            ));
        }
        Ok(ExecResult {
            exit_code: resp.exit_code,
            stdout: resp.stdout,
            stderr: resp.stderr,
        })
    }

    pub async fn read_file(&mut self, path: &str, timeout: Duration) -> Result<Vec<u8>> {
        let req = Request::ReadFile {
            path: path.to_string(),
        };
        let resp: vsock_proto::ReadFileResponse = self.call(&req, timeout).await?;
        if !resp.success {
            return Err(SandboxError::GuestError(
                resp.error.unwrap_or_else(|| "read_file failed".to_string()),
            ));
        }
        base64_decode(&resp.content)
    }

    pub async fn write_file(
        &mut self,
        path: &str,
        content: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let req = Request::WriteFile {
            path: path.to_string(),
            content: base64_encode(content),
            is_base64: true,
        };
        let resp: vsock_proto::WriteFileResponse = self.call(&req, timeout).await?;
        if resp.success {
            Ok(())
        } else {
            Err(SandboxError::GuestError(
                resp.error.unwrap_or_else(|| "write_file failed".to_string()),
            ))
        }
    }

    pub async fn list_files(&mut self, path: &str, timeout: Duration) -> Result<Vec<FileEntry>> {
        let req = Request::ListFiles {
            path: path.to_string(),
        };
        let resp: vsock_proto::ListFilesResponse = self.call(&req, timeout).await?;
        if !resp.success {
            return Err(SandboxError::GuestError(
                resp.error.unwrap_or_else(|| "list_files failed".to_string()),
            ));
        }
        Ok(resp
            .entries
            .into_iter()
            .map(|e| FileEntry {
                name: e.name,
                is_dir: e.is_dir,
                size: e.size,
            })
            .collect())
    }

    pub async fn mkdir(&mut self, path: &str, parents: bool, timeout: Duration) -> Result<()> {
        let req = Request::Mkdir {
            path: path.to_string(),
            parents,
        };
        let resp: vsock_proto::MkdirResponse = self.call(&req, timeout).await?;
        if resp.success {
            Ok(())
        } else {
            Err(SandboxError::GuestError(
                resp.error.unwrap_or_else(|| "mkdir failed".to_string()),
            ))
        }
    }

    pub async fn stat(&mut self, path: &str, timeout: Duration) -> Result<StatInfo> {
        let req = Request::Stat {
            path: path.to_string(),
        };
        let resp: vsock_proto::StatResponse = self.call(&req, timeout).await?;
        if !resp.success {
            return Err(SandboxError::GuestError(
                resp.error.unwrap_or_else(|| "stat failed".to_string()),
            ));
        }
        Ok(StatInfo {
            exists: resp.exists,
            is_dir: resp.is_dir,
            size: resp.size,
            mtime: resp.mtime,
        })
    }

    pub async fn delete_file(
        &mut self,
        path: &str,
        recursive: bool,
        timeout: Duration,
    ) -> Result<()> {
        let req = Request::DeleteFile {
            path: path.to_string(),
            recursive,
        };
        let resp: vsock_proto::DeleteFileResponse = self.call(&req, timeout).await?;
        if resp.success {
            Ok(())
        } else {
            Err(SandboxError::GuestError(
                resp.error.unwrap_or_else(|| "delete_file failed".to_string()),
            ))
        }
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(data: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| SandboxError::Protocol(format!("invalid base64 in response: {e}")))
}
