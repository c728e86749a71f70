use async_trait::async_trait;
use tracing::info;

use sandbox::{Sandbox, SandboxConfig, SandboxDescriptor, SandboxError, SandboxFactory};

use crate::config::FirecrackerConfig;
use crate::paths::Paths;
use crate::prerequisites::check_prerequisites;
use crate::sandbox::FirecrackerSandbox;

/// [`SandboxFactory`] backed by real Firecracker microVMs.
///
/// Unlike a pooled-resource factory, this one holds no pre-warmed state:
/// every `create` does its own overlay copy and VMM spawn on demand, since
/// there is no network namespace or blank-filesystem setup left to
/// amortize across sandboxes.
pub struct FirecrackerFactory {
    config: FirecrackerConfig,
    paths: Paths,
}

impl FirecrackerFactory {
    /// Construct a factory. Prerequisite checks (binary present and
    /// executable, `/dev/kvm` accessible) happen in `startup`, not here, so
    /// that construction itself can't fail on environment issues.
    pub fn new(config: FirecrackerConfig) -> Self {
        let paths = Paths::new(config.base_dir.clone());
        Self { config, paths }
    }
}

#[async_trait]
impl SandboxFactory for FirecrackerFactory {
    fn name(&self) -> &str {
        "firecracker"
    }

    async fn startup(&self) -> sandbox::Result<()> {
        check_prerequisites(&self.config).await?;
        tokio::fs::create_dir_all(self.paths.kernels_dir())
            .await
            .map_err(SandboxError::Io)?;
        tokio::fs::create_dir_all(self.paths.rootfs_dir())
            .await
            .map_err(SandboxError::Io)?;
        tokio::fs::create_dir_all(self.paths.sandboxes_dir())
            .await
            .map_err(SandboxError::Io)?;
        tokio::fs::create_dir_all(self.paths.snapshots_dir())
            .await
            .map_err(SandboxError::Io)?;
        info!(base_dir = %self.config.base_dir.display(), "firecracker factory started");
        Ok(())
    }

    async fn create(
        &self,
        config: &SandboxConfig,
        sandbox_id: &str,
        vsock_cid: u32,
    ) -> sandbox::Result<Box<dyn Sandbox>> {
        let sandbox = FirecrackerSandbox::start_fresh(
            self.config.clone(),
            config,
            sandbox_id.to_string(),
            vsock_cid,
            &self.paths,
        )
        .await?;
        Ok(Box::new(sandbox))
    }

    async fn reattach(&self, descriptor: SandboxDescriptor) -> sandbox::Result<Box<dyn Sandbox>> {
        let sandbox =
            FirecrackerSandbox::reattach(self.config.clone(), descriptor, &self.paths).await?;
        Ok(Box::new(sandbox))
    }
}
