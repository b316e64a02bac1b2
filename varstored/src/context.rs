//! The root context (§9 "Global mutable state" redesign note): every
//! piece of state the command handler touches, threaded through the
//! dispatcher explicitly instead of living behind process-wide statics.

use varstore_core::{AuthEngine, Backend, SecureBootState, VariableStore};
use xenstore::Policy;

pub struct RootContext {
    pub store: VariableStore,
    pub auth: AuthEngine,
    pub sb_state: SecureBootState,
    pub policy: Policy,
    pub backend: Box<dyn Backend>,
    /// Diagnostic-only counter incremented by `NOTIFY_SB_FAILURE` (§4.4);
    /// never influences store state or status codes.
    pub sb_failure_count: u64,
}

impl RootContext {
    pub fn new(store: VariableStore, policy: Policy, backend: Box<dyn Backend>) -> Self {
        let sb_state = SecureBootState::derive(&store);
        let auth = AuthEngine::new(policy.auth_enforce);
        Self { store, auth, sb_state, policy, backend, sb_failure_count: 0 }
    }
}
