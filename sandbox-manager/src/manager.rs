use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use sandbox::{
    ExecRequest, ExecResult, FileEntry, SandboxConfig, SandboxDescriptor, SandboxError,
    SandboxFactory, SandboxStatus, StatInfo,
};

use crate::config::ManagerConfig;
use crate::persist;
use crate::registry::RegistryState;

/// `GET /health` payload, per spec.md §6.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub active_sandboxes: usize,
    pub max_sandboxes: usize,
    pub memory_used_mib: u32,
    pub memory_available_mib: u32,
}

/// Owns the sandbox registry: the state machine, CID allocation, capacity
/// accounting, and crash recovery. Backend-agnostic — talks to sandboxes
/// only through `Box<dyn Sandbox>` and to the VMM backend only through
/// `Arc<dyn SandboxFactory>`.
pub struct SandboxManager {
    config: ManagerConfig,
    factory: Arc<dyn SandboxFactory>,
    state: AsyncMutex<RegistryState>,
}

impl SandboxManager {
    pub fn new(config: ManagerConfig, factory: Arc<dyn SandboxFactory>) -> Self {
        Self {
            config,
            factory,
            state: AsyncMutex::new(RegistryState::default()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Check host prerequisites via the factory, then scan `state.json`
    /// files for sandboxes that survived (or didn't) a previous run.
    pub async fn startup(&self) -> sandbox::Result<()> {
        self.factory.startup().await?;
        self.recover().await
    }

    async fn recover(&self) -> sandbox::Result<()> {
        let descriptors = persist::scan(&self.config.base_dir).await?;
        for descriptor in descriptors {
            if descriptor.status == SandboxStatus::Destroyed {
                sweep(&self.config, &descriptor).await;
                continue;
            }

            let sandbox_id = descriptor.sandbox_id.clone();
            let workspace_id = descriptor.workspace_id.clone();
            let memory_mib = descriptor.memory_mib;
            let vsock_cid = descriptor.vsock_cid;

            match self.factory.reattach(descriptor.clone()).await {
                Ok(sandbox) => {
                    let reattached = sandbox.descriptor();
                    let mut state = self.state.lock().await;
                    state.commit_recovered(
                        sandbox_id.clone(),
                        workspace_id,
                        memory_mib,
                        vsock_cid,
                        sandbox,
                    );
                    drop(state);
                    persist::save(&self.config.base_dir, &reattached).await?;
                    info!(sandbox_id, status = %reattached.status, "sandbox reattached on recovery");
                }
                Err(e) => {
                    warn!(sandbox_id, error = %e, "sandbox did not survive restart, sweeping");
                    sweep(&self.config, &descriptor).await;
                }
            }
        }
        Ok(())
    }

    pub async fn create(&self, request: SandboxConfig) -> sandbox::Result<SandboxDescriptor> {
        let sandbox_id = new_sandbox_id();
        let workspace_id = request
            .workspace_id
            .clone()
            .unwrap_or_else(|| sandbox_id.clone());

        let vsock_cid = {
            let mut state = self.state.lock().await;
            state.reserve(&self.config, &request, &sandbox_id)?
        };

        let result = self.factory.create(&request, &sandbox_id, vsock_cid).await;

        let sandbox = match result {
            Ok(sandbox) => sandbox,
            Err(e) => {
                let mut state = self.state.lock().await;
                state.release_reservation(&sandbox_id);
                return Err(e);
            }
        };

        let descriptor = sandbox.descriptor();
        {
            let mut state = self.state.lock().await;
            state.commit(sandbox_id.clone(), workspace_id, sandbox);
        }
        persist::save(&self.config.base_dir, &descriptor).await?;
        info!(sandbox_id, "sandbox created");
        Ok(descriptor)
    }

    pub async fn get(&self, sandbox_id: &str) -> sandbox::Result<SandboxDescriptor> {
        let handle = self.lookup(sandbox_id).await?;
        let guard = handle.lock().await;
        Ok(guard.descriptor())
    }

    pub async fn list(&self) -> Vec<SandboxDescriptor> {
        let ids = self.state.lock().await.ids();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(descriptor) = self.get(&id).await {
                out.push(descriptor);
            }
        }
        out
    }

    pub async fn health(&self) -> HealthStatus {
        let state = self.state.lock().await;
        HealthStatus {
            active_sandboxes: state.active_count(),
            max_sandboxes: self.config.max_sandboxes,
            memory_used_mib: state.memory_used_mib(),
            memory_available_mib: self
                .config
                .memory_budget_mib
                .saturating_sub(state.memory_used_mib()),
        }
    }

    pub async fn exec(
        &self,
        sandbox_id: &str,
        request: ExecRequest<'_>,
    ) -> sandbox::Result<ExecResult> {
        let handle = self.lookup(sandbox_id).await?;
        let guard = handle.lock().await;
        require_running(&guard.descriptor())?;
        guard.exec(request).await
    }

    pub async fn read_file(&self, sandbox_id: &str, path: &str) -> sandbox::Result<Vec<u8>> {
        let handle = self.lookup(sandbox_id).await?;
        let guard = handle.lock().await;
        require_running(&guard.descriptor())?;
        guard.read_file(path).await
    }

    pub async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &[u8],
    ) -> sandbox::Result<()> {
        let handle = self.lookup(sandbox_id).await?;
        let guard = handle.lock().await;
        require_running(&guard.descriptor())?;
        guard.write_file(path, content).await
    }

    pub async fn list_files(&self, sandbox_id: &str, path: &str) -> sandbox::Result<Vec<FileEntry>> {
        let handle = self.lookup(sandbox_id).await?;
        let guard = handle.lock().await;
        require_running(&guard.descriptor())?;
        guard.list_files(path).await
    }

    pub async fn mkdir(&self, sandbox_id: &str, path: &str, parents: bool) -> sandbox::Result<()> {
        let handle = self.lookup(sandbox_id).await?;
        let guard = handle.lock().await;
        require_running(&guard.descriptor())?;
        guard.mkdir(path, parents).await
    }

    pub async fn stat(&self, sandbox_id: &str, path: &str) -> sandbox::Result<StatInfo> {
        let handle = self.lookup(sandbox_id).await?;
        let guard = handle.lock().await;
        require_running(&guard.descriptor())?;
        guard.stat(path).await
    }

    pub async fn delete_file(
        &self,
        sandbox_id: &str,
        path: &str,
        recursive: bool,
    ) -> sandbox::Result<()> {
        let handle = self.lookup(sandbox_id).await?;
        let guard = handle.lock().await;
        require_running(&guard.descriptor())?;
        guard.delete_file(path, recursive).await
    }

    pub async fn pause(&self, sandbox_id: &str) -> sandbox::Result<()> {
        let handle = self.lookup(sandbox_id).await?;
        let mut guard = handle.lock().await;
        let current = guard.descriptor().status;
        if current != SandboxStatus::Running {
            return Err(SandboxError::WrongState {
                expected: "running".to_string(),
                actual: current.to_string(),
            });
        }
        guard.pause().await?;
        let descriptor = guard.descriptor();
        drop(guard);
        persist::save(&self.config.base_dir, &descriptor).await?;
        Ok(())
    }

    pub async fn resume(&self, sandbox_id: &str) -> sandbox::Result<()> {
        let handle = self.lookup(sandbox_id).await?;
        let mut guard = handle.lock().await;
        let current = guard.descriptor().status;
        if current != SandboxStatus::Paused {
            return Err(SandboxError::WrongState {
                expected: "paused".to_string(),
                actual: current.to_string(),
            });
        }
        guard.resume().await?;
        let descriptor = guard.descriptor();
        drop(guard);
        persist::save(&self.config.base_dir, &descriptor).await?;
        Ok(())
    }

    /// Idempotent: returns `Ok(())` even if `sandbox_id` is already gone.
    pub async fn destroy(&self, sandbox_id: &str) -> sandbox::Result<()> {
        let handle = {
            let state = self.state.lock().await;
            state.get(sandbox_id)
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        {
            let mut guard = handle.lock().await;
            guard.destroy().await?;
        }

        let mut state = self.state.lock().await;
        state.remove(sandbox_id);
        info!(sandbox_id, "sandbox removed from registry");
        Ok(())
    }

    async fn lookup(
        &self,
        sandbox_id: &str,
    ) -> sandbox::Result<Arc<AsyncMutex<Box<dyn sandbox::Sandbox>>>> {
        let state = self.state.lock().await;
        state
            .get(sandbox_id)
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))
    }
}

fn require_running(descriptor: &SandboxDescriptor) -> sandbox::Result<()> {
    if descriptor.status == SandboxStatus::Running {
        Ok(())
    } else {
        Err(SandboxError::WrongState {
            expected: "running".to_string(),
            actual: descriptor.status.to_string(),
        })
    }
}

fn new_sandbox_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

async fn sweep(config: &ManagerConfig, descriptor: &SandboxDescriptor) {
    let sandbox_dir = persist::sandbox_dir(&config.base_dir, &descriptor.sandbox_id);
    if let Err(e) = tokio::fs::remove_dir_all(&sandbox_dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(sandbox_id = %descriptor.sandbox_id, error = %e, "failed to sweep sandbox directory");
    }
    let snapshot_dir = persist::snapshot_dir(&config.base_dir, &descriptor.workspace_id);
    if let Err(e) = tokio::fs::remove_dir_all(&snapshot_dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(workspace_id = %descriptor.workspace_id, error = %e, "failed to sweep snapshot directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sandbox::Sandbox;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct MockInner {
        descriptor: SandboxDescriptor,
        files: HashMap<String, Vec<u8>>,
    }

    struct MockSandbox {
        sandbox_id: String,
        inner: StdMutex<MockInner>,
    }

    #[async_trait]
    impl Sandbox for MockSandbox {
        fn id(&self) -> &str {
            &self.sandbox_id
        }

        fn descriptor(&self) -> SandboxDescriptor {
            self.inner.lock().unwrap().descriptor.clone()
        }

        async fn exec(&self, _request: ExecRequest<'_>) -> sandbox::Result<ExecResult> {
            Ok(ExecResult {
                exit_code: 0,
                stdout: "Linux\n".to_string(),
                stderr: String::new(),
            })
        }

        async fn read_file(&self, path: &str) -> sandbox::Result<Vec<u8>> {
            self.inner
                .lock()
                .unwrap()
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| SandboxError::GuestError("not found".to_string()))
        }

        async fn write_file(&self, path: &str, content: &[u8]) -> sandbox::Result<()> {
            self.inner
                .lock()
                .unwrap()
                .files
                .insert(path.to_string(), content.to_vec());
            Ok(())
        }

        async fn list_files(&self, _path: &str) -> sandbox::Result<Vec<FileEntry>> {
            Ok(Vec::new())
        }

        async fn mkdir(&self, _path: &str, _parents: bool) -> sandbox::Result<()> {
            Ok(())
        }

        async fn stat(&self, _path: &str) -> sandbox::Result<StatInfo> {
            Ok(StatInfo::default())
        }

        async fn delete_file(&self, _path: &str, _recursive: bool) -> sandbox::Result<()> {
            Ok(())
        }

        async fn pause(&mut self) -> sandbox::Result<()> {
            self.inner.lock().unwrap().descriptor.status = SandboxStatus::Paused;
            Ok(())
        }

        async fn resume(&mut self) -> sandbox::Result<()> {
            self.inner.lock().unwrap().descriptor.status = SandboxStatus::Running;
            Ok(())
        }

        async fn destroy(&mut self) -> sandbox::Result<()> {
            self.inner.lock().unwrap().descriptor.status = SandboxStatus::Destroyed;
            Ok(())
        }
    }

    struct MockFactory {
        fail_create: std::sync::atomic::AtomicBool,
        fail_reattach: std::sync::atomic::AtomicBool,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                fail_create: std::sync::atomic::AtomicBool::new(false),
                fail_reattach: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl SandboxFactory for MockFactory {
        fn name(&self) -> &str {
            "mock"
        }

        async fn startup(&self) -> sandbox::Result<()> {
            Ok(())
        }

        async fn create(
            &self,
            config: &SandboxConfig,
            sandbox_id: &str,
            vsock_cid: u32,
        ) -> sandbox::Result<Box<dyn Sandbox>> {
            if self.fail_create.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(SandboxError::VmmSpawn("forced failure".to_string()));
            }
            let descriptor = SandboxDescriptor {
                sandbox_id: sandbox_id.to_string(),
                workspace_id: config
                    .workspace_id
                    .clone()
                    .unwrap_or_else(|| sandbox_id.to_string()),
                template: config.template.clone(),
                memory_mib: config.memory_mib,
                vcpu_count: config.vcpu_count,
                vsock_cid,
                status: SandboxStatus::Running,
                created_at: chrono::Utc::now(),
                vmm_pid: Some(999),
            };
            Ok(Box::new(MockSandbox {
                sandbox_id: sandbox_id.to_string(),
                inner: StdMutex::new(MockInner {
                    descriptor,
                    files: HashMap::new(),
                }),
            }))
        }

        async fn reattach(
            &self,
            descriptor: SandboxDescriptor,
        ) -> sandbox::Result<Box<dyn Sandbox>> {
            if self.fail_reattach.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(SandboxError::VmmUnresponsive);
            }
            Ok(Box::new(MockSandbox {
                sandbox_id: descriptor.sandbox_id.clone(),
                inner: StdMutex::new(MockInner {
                    descriptor,
                    files: HashMap::new(),
                }),
            }))
        }
    }

    fn test_config(base_dir: std::path::PathBuf) -> ManagerConfig {
        ManagerConfig {
            base_dir,
            firecracker_bin: "/usr/local/bin/firecracker".into(),
            max_sandboxes: 2,
            memory_budget_mib: 2048,
            default_memory_mib: 512,
            max_memory_mib: 2048,
            min_memory_mib: 128,
            default_vcpu: 1,
            max_vcpu: 4,
            min_vcpu: 1,
            boot_timeout: std::time::Duration::from_secs(5),
            exec_timeout: std::time::Duration::from_secs(300),
            idle_timeout: std::time::Duration::from_secs(0),
            api_key: None,
        }
    }

    fn test_sandbox_config() -> SandboxConfig {
        SandboxConfig {
            template: "python3.11".to_string(),
            memory_mib: 512,
            vcpu_count: 1,
            workspace_id: None,
        }
    }

    fn manager(base_dir: std::path::PathBuf) -> SandboxManager {
        SandboxManager::new(test_config(base_dir), Arc::new(MockFactory::new()))
    }

    #[tokio::test]
    async fn create_exec_destroy_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mgr = manager(tmp.path().to_path_buf());

        let descriptor = mgr.create(test_sandbox_config()).await.expect("create");
        assert_eq!(descriptor.status, SandboxStatus::Running);

        let result = mgr
            .exec(
                &descriptor.sandbox_id,
                ExecRequest {
                    command: "uname -s",
                    timeout_s: 30,
                    working_dir: "/workspace",
                },
            )
            .await
            .expect("exec");
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.starts_with("Linux"));

        mgr.destroy(&descriptor.sandbox_id).await.expect("destroy");
        let err = mgr.get(&descriptor.sandbox_id).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));

        // Idempotent.
        mgr.destroy(&descriptor.sandbox_id).await.expect("destroy again");
    }

    #[tokio::test]
    async fn capacity_rejection_then_success_after_destroy() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mgr = manager(tmp.path().to_path_buf());

        let a = mgr.create(test_sandbox_config()).await.expect("create a");
        let b = mgr.create(test_sandbox_config()).await.expect("create b");
        let err = mgr.create(test_sandbox_config()).await.unwrap_err();
        assert!(matches!(err, SandboxError::AtCapacity));

        mgr.destroy(&a.sandbox_id).await.expect("destroy a");
        let c = mgr.create(test_sandbox_config()).await.expect("create c");
        assert_ne!(c.sandbox_id, b.sandbox_id);
    }

    #[tokio::test]
    async fn exec_against_paused_sandbox_is_wrong_state() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mgr = manager(tmp.path().to_path_buf());

        let descriptor = mgr.create(test_sandbox_config()).await.expect("create");
        mgr.pause(&descriptor.sandbox_id).await.expect("pause");

        let err = mgr
            .exec(
                &descriptor.sandbox_id,
                ExecRequest {
                    command: "true",
                    timeout_s: 5,
                    working_dir: "/workspace",
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::WrongState { .. }));

        let second_pause = mgr.pause(&descriptor.sandbox_id).await.unwrap_err();
        assert!(matches!(second_pause, SandboxError::WrongState { .. }));
    }

    #[tokio::test]
    async fn pause_resume_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mgr = manager(tmp.path().to_path_buf());

        let descriptor = mgr.create(test_sandbox_config()).await.expect("create");
        mgr.pause(&descriptor.sandbox_id).await.expect("pause");
        let paused = mgr.get(&descriptor.sandbox_id).await.expect("get");
        assert_eq!(paused.status, SandboxStatus::Paused);

        mgr.resume(&descriptor.sandbox_id).await.expect("resume");
        let running = mgr.get(&descriptor.sandbox_id).await.expect("get");
        assert_eq!(running.status, SandboxStatus::Running);
    }

    #[tokio::test]
    async fn create_validates_memory_bounds() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mgr = manager(tmp.path().to_path_buf());

        let mut config = test_sandbox_config();
        config.memory_mib = 16;
        let err = mgr.create(config).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn create_failure_releases_reservation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let factory = Arc::new(MockFactory::new());
        factory
            .fail_create
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let mgr = SandboxManager::new(test_config(tmp.path().to_path_buf()), factory.clone());

        let err = mgr.create(test_sandbox_config()).await.unwrap_err();
        assert!(matches!(err, SandboxError::VmmSpawn(_)));

        factory
            .fail_create
            .store(false, std::sync::atomic::Ordering::SeqCst);
        // The failed create's reservation must have been released, so a
        // fresh create should succeed rather than hitting AtCapacity.
        mgr.create(test_sandbox_config()).await.expect("create after rollback");
    }

    #[tokio::test]
    async fn write_then_read_file_round_trips() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mgr = manager(tmp.path().to_path_buf());

        let descriptor = mgr.create(test_sandbox_config()).await.expect("create");
        let content = b"hello from the registry test";

        mgr.write_file(&descriptor.sandbox_id, "/workspace/a.txt", content)
            .await
            .expect("write_file");
        let read_back = mgr
            .read_file(&descriptor.sandbox_id, "/workspace/a.txt")
            .await
            .expect("read_file");

        assert_eq!(read_back, content);
    }

    #[tokio::test]
    async fn read_file_against_paused_sandbox_is_wrong_state() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mgr = manager(tmp.path().to_path_buf());

        let descriptor = mgr.create(test_sandbox_config()).await.expect("create");
        mgr.pause(&descriptor.sandbox_id).await.expect("pause");

        let err = mgr
            .read_file(&descriptor.sandbox_id, "/workspace/a.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::WrongState { .. }));
    }

    #[tokio::test]
    async fn restart_reattaches_surviving_sandboxes() {
        let tmp = tempfile::tempdir().expect("tempdir");

        let descriptor = {
            let mgr = manager(tmp.path().to_path_buf());
            mgr.create(test_sandbox_config()).await.expect("create")
        };

        // Fresh manager, fresh factory: simulates a process restart reading
        // back the `state.json` the first manager left behind.
        let mgr2 = manager(tmp.path().to_path_buf());
        mgr2.startup().await.expect("startup");

        let recovered = mgr2.get(&descriptor.sandbox_id).await.expect("get");
        assert_eq!(recovered.sandbox_id, descriptor.sandbox_id);
        assert_eq!(recovered.status, SandboxStatus::Running);
    }

    #[tokio::test]
    async fn restart_sweeps_sandboxes_that_fail_to_reattach() {
        let tmp = tempfile::tempdir().expect("tempdir");

        let descriptor = {
            let mgr = manager(tmp.path().to_path_buf());
            mgr.create(test_sandbox_config()).await.expect("create")
        };
        let sandbox_dir = tmp.path().join("sandboxes").join(&descriptor.sandbox_id);
        assert!(sandbox_dir.exists());

        let factory = Arc::new(MockFactory::new());
        factory
            .fail_reattach
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let mgr2 = SandboxManager::new(test_config(tmp.path().to_path_buf()), factory);
        mgr2.startup().await.expect("startup");

        let err = mgr2.get(&descriptor.sandbox_id).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
        assert!(!sandbox_dir.exists());
    }

    #[tokio::test]
    async fn concurrent_creates_allocate_distinct_cids() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(tmp.path().to_path_buf());
        config.max_sandboxes = 8;
        config.memory_budget_mib = 8192;
        let mgr = Arc::new(SandboxManager::new(config, Arc::new(MockFactory::new())));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(
                async move { mgr.create(test_sandbox_config()).await.expect("create") },
            ));
        }

        let mut cids = std::collections::HashSet::new();
        for handle in handles {
            let descriptor = handle.await.expect("task panicked");
            assert!(cids.insert(descriptor.vsock_cid), "duplicate CID allocated");
        }
        assert_eq!(cids.len(), 8);
    }
}
