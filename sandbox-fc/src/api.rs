//! HTTP-over-UDS client for the Firecracker VMM control socket.
//!
//! Firecracker rejects configuration requests after `InstanceStart` and
//! rejects `/snapshot/create` unless the VM is paused, so callers must issue
//! these in the exact order documented on each method; any failure aborts
//! the sequence rather than retrying.

use std::path::Path;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::Serialize;
use tokio::net::UnixStream;
use tokio::time::{self, Instant};

type HyperClient = Client<UnixConnector, Full<Bytes>>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("firecracker API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("API socket did not become ready within {0:?}")]
    NotReady(Duration),
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Serialize)]
struct MachineConfig {
    vcpu_count: u8,
    mem_size_mib: u32,
    smt: bool,
}

#[derive(Serialize)]
struct BootSource {
    kernel_image_path: String,
    boot_args: String,
}

#[derive(Serialize)]
struct Drive {
    drive_id: String,
    path_on_host: String,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Serialize)]
struct Vsock {
    vsock_id: String,
    guest_cid: u32,
    uds_path: String,
}

#[derive(Serialize)]
struct Action {
    action_type: String,
}

#[derive(Serialize)]
struct VmState {
    state: String,
}

#[derive(Serialize)]
struct SnapshotCreate {
    snapshot_type: String,
    snapshot_path: String,
    mem_file_path: String,
}

#[derive(Serialize)]
struct SnapshotLoad {
    snapshot_path: String,
    mem_file_path: String,
    resume_vm: bool,
}

/// One client per sandbox, bound to that sandbox's `firecracker.sock`.
pub struct ApiClient {
    client: HyperClient,
    socket_path: String,
}

impl ApiClient {
    pub fn new(socket_path: &Path) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket_path: socket_path.to_string_lossy().into_owned(),
        }
    }

    /// Poll for the API socket to accept connections, up to `timeout`.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ApiError::NotReady(timeout));
            }
            time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn put<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        self.request(hyper::Method::PUT, endpoint, body).await
    }

    async fn patch<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        self.request(hyper::Method::PATCH, endpoint, body).await
    }

    async fn request<T: Serialize>(
        &self,
        method: hyper::Method,
        endpoint: &str,
        body: &T,
    ) -> Result<()> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let json = serde_json::to_vec(body)?;

        let req = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| ApiError::Request(e.to_string()))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        let status = res.status();
        if status.is_success() {
            return Ok(());
        }

        let body_bytes = res
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
        })
    }

    pub async fn configure_machine(&self, vcpu_count: u8, mem_size_mib: u32) -> Result<()> {
        self.put(
            "/machine-config",
            &MachineConfig {
                vcpu_count,
                mem_size_mib,
                smt: false,
            },
        )
        .await
    }

    pub async fn configure_boot_source(&self, kernel_image_path: &str, boot_args: &str) -> Result<()> {
        self.put(
            "/boot-source",
            &BootSource {
                kernel_image_path: kernel_image_path.to_string(),
                boot_args: boot_args.to_string(),
            },
        )
        .await
    }

    pub async fn configure_drive(
        &self,
        drive_id: &str,
        path_on_host: &str,
        is_root_device: bool,
        is_read_only: bool,
    ) -> Result<()> {
        let endpoint = format!("/drives/{drive_id}");
        self.put(
            &endpoint,
            &Drive {
                drive_id: drive_id.to_string(),
                path_on_host: path_on_host.to_string(),
                is_root_device,
                is_read_only,
            },
        )
        .await
    }

    pub async fn configure_vsock(&self, guest_cid: u32, uds_path: &str) -> Result<()> {
        self.put(
            "/vsock",
            &Vsock {
                vsock_id: "vsock0".to_string(),
                guest_cid,
                uds_path: uds_path.to_string(),
            },
        )
        .await
    }

    pub async fn start_instance(&self) -> Result<()> {
        self.put(
            "/actions",
            &Action {
                action_type: "InstanceStart".to_string(),
            },
        )
        .await
    }

    /// Graceful shutdown request; the caller is responsible for force-killing
    /// the process if it has not exited after its own grace period.
    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.put(
            "/actions",
            &Action {
                action_type: "SendCtrlAltDel".to_string(),
            },
        )
        .await
    }

    pub async fn pause(&self) -> Result<()> {
        self.patch(
            "/vm",
            &VmState {
                state: "Paused".to_string(),
            },
        )
        .await
    }

    pub async fn resume(&self) -> Result<()> {
        self.patch(
            "/vm",
            &VmState {
                state: "Resumed".to_string(),
            },
        )
        .await
    }

    /// Requires the VM to already be paused.
    pub async fn create_snapshot(&self, snapshot_path: &str, mem_file_path: &str) -> Result<()> {
        self.put(
            "/snapshot/create",
            &SnapshotCreate {
                snapshot_type: "Full".to_string(),
                snapshot_path: snapshot_path.to_string(),
                mem_file_path: mem_file_path.to_string(),
            },
        )
        .await
    }

    /// Must be called on a freshly spawned VMM with no machine configured yet.
    pub async fn load_snapshot(
        &self,
        snapshot_path: &str,
        mem_file_path: &str,
        resume_vm: bool,
    ) -> Result<()> {
        self.put(
            "/snapshot/load",
            &SnapshotLoad {
                snapshot_path: snapshot_path.to_string(),
                mem_file_path: mem_file_path.to_string(),
                resume_vm,
            },
        )
        .await
    }
}
