use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value:?} ({source})")]
    Invalid {
        var: &'static str,
        value: String,
        source: std::num::ParseIntError,
    },
}

/// Service configuration, loaded once at startup from environment
/// variables (spec.md §6). Bounds (`min_memory_mib`..`max_memory_mib`,
/// `min_vcpu`..`max_vcpu`) constrain every `SandboxConfig` the manager
/// accepts; `memory_budget_mib`/`max_sandboxes` bound the registry as a
/// whole.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub base_dir: PathBuf,
    pub firecracker_bin: PathBuf,

    pub max_sandboxes: usize,
    pub memory_budget_mib: u32,
    pub default_memory_mib: u32,
    pub max_memory_mib: u32,
    pub min_memory_mib: u32,
    pub default_vcpu: u8,
    pub max_vcpu: u8,
    pub min_vcpu: u8,

    pub boot_timeout: Duration,
    pub exec_timeout: Duration,
    /// Carried through from the environment per spec.md §6; the source
    /// leaves the idle-reaping policy itself unspecified, so no background
    /// sweep consumes this value yet.
    pub idle_timeout: Duration,

    pub api_key: Option<String>,
}

impl ManagerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            base_dir: env_or(
                "BASE_DIR",
                PathBuf::from("/var/lib/firecracker-workspaces"),
                PathBuf::from,
            ),
            firecracker_bin: env_or(
                "FIRECRACKER_BIN",
                PathBuf::from("/usr/local/bin/firecracker"),
                PathBuf::from,
            ),

            max_sandboxes: env_parsed("MAX_SANDBOXES", 16)?,
            memory_budget_mib: env_parsed("MEMORY_BUDGET_MIB", 8192)?,
            default_memory_mib: env_parsed("DEFAULT_MEMORY_MIB", 512)?,
            max_memory_mib: env_parsed("MAX_MEMORY_MIB", 4096)?,
            min_memory_mib: env_parsed("MIN_MEMORY_MIB", 128)?,
            default_vcpu: env_parsed("DEFAULT_VCPU", 1)?,
            max_vcpu: env_parsed("MAX_VCPU", 4)?,
            min_vcpu: env_parsed("MIN_VCPU", 1)?,

            boot_timeout: Duration::from_secs(env_parsed("BOOT_TIMEOUT_S", 30)?),
            exec_timeout: Duration::from_secs(env_parsed("EXEC_TIMEOUT_S", 300)?),
            idle_timeout: Duration::from_secs(env_parsed("IDLE_TIMEOUT_S", 0)?),

            api_key: std::env::var("API_KEY").ok(),
        })
    }
}

fn env_or<T>(var: &'static str, default: T, parse: impl FnOnce(String) -> T) -> T {
    std::env::var(var).map(parse).unwrap_or(default)
}

fn env_parsed<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = std::num::ParseIntError>,
{
    match std::env::var(var) {
        Ok(value) => value.parse().map_err(|source| ConfigError::Invalid {
            var,
            value,
            source,
        }),
        Err(_) => Ok(default),
    }
}
