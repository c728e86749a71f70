mod api;
mod config;
mod factory;
mod overlay;
mod paths;
mod prerequisites;
mod process;
mod sandbox;

pub use api::{ApiClient, ApiError};
pub use config::FirecrackerConfig;
pub use factory::FirecrackerFactory;
pub use paths::{Paths, SandboxPaths, SnapshotPaths};
pub use sandbox::FirecrackerSandbox;
