//! Error taxonomy shared by every crate in the workspace.
//!
//! Each variant maps to exactly one of the kinds surfaced from the core;
//! the façade maps these to HTTP status codes.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("wrong state: expected {expected}, actual {actual}")]
    WrongState { expected: String, actual: String },

    #[error("at capacity")]
    AtCapacity,

    #[error("artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("failed to spawn VMM: {0}")]
    VmmSpawn(String),

    #[error("VMM protocol violation: {0}")]
    VmmProtocol(String),

    #[error("VMM unresponsive")]
    VmmUnresponsive,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation timed out")]
    Timeout,

    #[error("message exceeds maximum frame size")]
    MessageTooLarge,

    #[error("guest error: {0}")]
    GuestError(String),

    #[error("disk full")]
    DiskFull,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
