use axum::extract::{Path, Query, State};
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};

use sandbox::{ExecRequest, SandboxConfig, SandboxDescriptor};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateSandboxBody {
    pub template: String,
    pub memory_mb: u32,
    pub vcpu_count: u8,
    pub workspace_id: Option<String>,
}

pub async fn create_sandbox(
    State(state): State<AppState>,
    Json(body): Json<CreateSandboxBody>,
) -> Result<Json<SandboxDescriptor>, ApiError> {
    let descriptor = state
        .manager
        .create(SandboxConfig {
            template: body.template,
            memory_mib: body.memory_mb,
            vcpu_count: body.vcpu_count,
            workspace_id: body.workspace_id,
        })
        .await?;
    Ok(Json(descriptor))
}

pub async fn get_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SandboxDescriptor>, ApiError> {
    Ok(Json(state.manager.get(&id).await?))
}

pub async fn destroy_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(), ApiError> {
    state.manager.destroy(&id).await?;
    Ok(())
}

#[derive(Deserialize)]
pub struct ExecBody {
    pub command: String,
    pub timeout_seconds: Option<u32>,
    pub working_dir: Option<String>,
}

#[derive(Serialize)]
pub struct ExecResponseBody {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

pub async fn exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExecBody>,
) -> Result<Json<ExecResponseBody>, ApiError> {
    let working_dir = body.working_dir.unwrap_or_else(|| "/workspace".to_string());
    let start = std::time::Instant::now();
    let result = state
        .manager
        .exec(
            &id,
            ExecRequest {
                command: &body.command,
                timeout_s: body.timeout_seconds.unwrap_or(300),
                working_dir: &working_dir,
            },
        )
        .await?;
    Ok(Json(ExecResponseBody {
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
        duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
    }))
}

#[derive(Deserialize)]
pub struct WriteFileBody {
    pub path: String,
    /// Base64-encoded, same convention as the guest agent wire protocol.
    pub content: String,
}

pub async fn write_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<WriteFileBody>,
) -> Result<(), ApiError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body.content.as_bytes())
        .map_err(|e| ApiError(sandbox::SandboxError::InvalidRequest(format!("bad base64: {e}"))))?;
    state.manager.write_file(&id, &body.path, &bytes).await?;
    Ok(())
}

#[derive(Deserialize)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Serialize)]
pub struct ReadFileResponse {
    pub content: String,
}

pub async fn read_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<ReadFileResponse>, ApiError> {
    let bytes = state.manager.read_file(&id, &query.path).await?;
    Ok(Json(ReadFileResponse {
        content: base64::engine::general_purpose::STANDARD.encode(bytes),
    }))
}

#[derive(Serialize)]
pub struct FileEntryDto {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Serialize)]
pub struct ListFilesResponse {
    pub entries: Vec<FileEntryDto>,
}

pub async fn list_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<ListFilesResponse>, ApiError> {
    let entries = state.manager.list_files(&id, &query.path).await?;
    Ok(Json(ListFilesResponse {
        entries: entries
            .into_iter()
            .map(|e| FileEntryDto {
                name: e.name,
                is_dir: e.is_dir,
                size: e.size,
            })
            .collect(),
    }))
}

pub async fn pause(State(state): State<AppState>, Path(id): Path<String>) -> Result<(), ApiError> {
    state.manager.pause(&id).await?;
    Ok(())
}

pub async fn resume(State(state): State<AppState>, Path(id): Path<String>) -> Result<(), ApiError> {
    state.manager.resume(&id).await?;
    Ok(())
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sandboxes: usize,
    pub max_sandboxes: usize,
    pub memory_used_mb: u32,
    pub memory_available_mb: u32,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let h = state.manager.health().await;
    Json(HealthResponse {
        status: "ok",
        active_sandboxes: h.active_sandboxes,
        max_sandboxes: h.max_sandboxes,
        memory_used_mb: h.memory_used_mib,
        memory_available_mb: h.memory_available_mib,
    })
}
