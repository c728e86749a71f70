use std::sync::Arc;

use sandbox_manager::SandboxManager;

/// Shared state injected into every handler. Holds nothing of its own —
/// every real decision is made by `SandboxManager`; this crate only
/// translates HTTP to and from its calls (spec.md's Request Façade is
/// "stateless" beyond that).
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SandboxManager>,
}
