use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sandbox::{Sandbox, SandboxConfig, SandboxError};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::ManagerConfig;

/// The first CID available to guests; 0-2 are reserved.
const FIRST_CID: u32 = 3;

/// A live sandbox: the boxed backend handle behind its own mutex (serializing
/// every call into it, exec/file-op and pause/resume/destroy alike — this is
/// the "per-sandbox transport mutex" of the concurrency model), plus the
/// bookkeeping the registry needs without locking the sandbox itself.
pub(crate) struct Entry {
    pub(crate) sandbox: Arc<AsyncMutex<Box<dyn Sandbox>>>,
    pub(crate) memory_mib: u32,
    pub(crate) vsock_cid: u32,
    pub(crate) workspace_id: String,
}

/// A reservation held during the unlocked "slow work" phase of `create`, so
/// that capacity and CID accounting reflect in-flight creates even before
/// they're registered as entries.
struct Reservation {
    memory_mib: u32,
    vsock_cid: u32,
}

/// Everything protected by the single registry mutex. Metadata only —
/// lookups and accounting are O(1); any I/O happens after the caller has
/// released the lock.
#[derive(Default)]
pub(crate) struct RegistryState {
    entries: HashMap<String, Entry>,
    reservations: HashMap<String, Reservation>,
}

impl RegistryState {
    fn used_cids(&self) -> HashSet<u32> {
        self.entries
            .values()
            .map(|e| e.vsock_cid)
            .chain(self.reservations.values().map(|r| r.vsock_cid))
            .collect()
    }

    fn memory_reserved_mib(&self) -> u64 {
        let committed: u64 = self.entries.values().map(|e| u64::from(e.memory_mib)).sum();
        let pending: u64 = self
            .reservations
            .values()
            .map(|r| u64::from(r.memory_mib))
            .sum();
        committed + pending
    }

    pub(crate) fn active_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn memory_used_mib(&self) -> u32 {
        self.entries.values().map(|e| e.memory_mib).sum()
    }

    pub(crate) fn get(&self, sandbox_id: &str) -> Option<Arc<AsyncMutex<Box<dyn Sandbox>>>> {
        self.entries.get(sandbox_id).map(|e| e.sandbox.clone())
    }

    pub(crate) fn contains(&self, sandbox_id: &str) -> bool {
        self.entries.contains_key(sandbox_id)
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Validate bounds and capacity, then reserve memory and a CID for an
    /// in-flight create. Returns the allocated CID.
    pub(crate) fn reserve(
        &mut self,
        cfg: &ManagerConfig,
        request: &SandboxConfig,
        sandbox_id: &str,
    ) -> sandbox::Result<u32> {
        if request.memory_mib < cfg.min_memory_mib || request.memory_mib > cfg.max_memory_mib {
            return Err(SandboxError::InvalidRequest(format!(
                "memory_mib {} out of range [{}, {}]",
                request.memory_mib, cfg.min_memory_mib, cfg.max_memory_mib
            )));
        }
        if request.vcpu_count < cfg.min_vcpu || request.vcpu_count > cfg.max_vcpu {
            return Err(SandboxError::InvalidRequest(format!(
                "vcpu_count {} out of range [{}, {}]",
                request.vcpu_count, cfg.min_vcpu, cfg.max_vcpu
            )));
        }
        if self.active_count() + self.reservations.len() >= cfg.max_sandboxes {
            return Err(SandboxError::AtCapacity);
        }
        if self.memory_reserved_mib() + u64::from(request.memory_mib)
            > u64::from(cfg.memory_budget_mib)
        {
            return Err(SandboxError::AtCapacity);
        }

        let used = self.used_cids();
        let mut cid = FIRST_CID;
        while used.contains(&cid) {
            cid += 1;
        }

        self.reservations.insert(
            sandbox_id.to_string(),
            Reservation {
                memory_mib: request.memory_mib,
                vsock_cid: cid,
            },
        );
        Ok(cid)
    }

    pub(crate) fn release_reservation(&mut self, sandbox_id: &str) {
        self.reservations.remove(sandbox_id);
    }

    /// Promote a completed reservation into a committed entry.
    pub(crate) fn commit(
        &mut self,
        sandbox_id: String,
        workspace_id: String,
        sandbox: Box<dyn Sandbox>,
    ) {
        let reservation = self.reservations.remove(&sandbox_id);
        let (memory_mib, vsock_cid) = match reservation {
            Some(r) => (r.memory_mib, r.vsock_cid),
            None => (0, 0),
        };
        self.entries.insert(
            sandbox_id,
            Entry {
                sandbox: Arc::new(AsyncMutex::new(sandbox)),
                memory_mib,
                vsock_cid,
                workspace_id,
            },
        );
    }

    /// Register a sandbox recovered from `state.json` at startup, claiming
    /// its memory and CID without going through a reservation (there is no
    /// concurrent create racing against startup recovery).
    pub(crate) fn commit_recovered(
        &mut self,
        sandbox_id: String,
        workspace_id: String,
        memory_mib: u32,
        vsock_cid: u32,
        sandbox: Box<dyn Sandbox>,
    ) {
        self.entries.insert(
            sandbox_id,
            Entry {
                sandbox: Arc::new(AsyncMutex::new(sandbox)),
                memory_mib,
                vsock_cid,
                workspace_id,
            },
        );
    }

    pub(crate) fn remove(&mut self, sandbox_id: &str) -> Option<Entry> {
        self.entries.remove(sandbox_id)
    }
}
