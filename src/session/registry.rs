//! Session registry
//!
//! Maps client ids to their sessions. The map lock is only held for lookups
//! and inserts; everything per-session is guarded by the session's own locks.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::{BackendKind, ClientId};
use crate::sandbox::Sandbox;

/// Sandbox currently bound to a session plus the tokens cancelling its work
struct Slot {
    sandbox: Option<Arc<dyn Sandbox>>,
    cancel: CancellationToken,
    init_abort: CancellationToken,
}

/// One client's execution session
pub struct Session {
    id: ClientId,
    created_at: DateTime<Utc>,
    backend_kind: BackendKind,
    /// Serializes init / stop / teardown
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
    /// Serializes runs; tokio's mutex is fair, so queued runs go in order
    pub(crate) run_lock: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
}

impl Session {
    pub fn new(id: impl Into<ClientId>, backend_kind: BackendKind) -> Self {
        Session {
            id: id.into(),
            created_at: Utc::now(),
            backend_kind,
            lifecycle: tokio::sync::Mutex::new(()),
            run_lock: tokio::sync::Mutex::new(()),
            slot: Mutex::new(Slot {
                sandbox: None,
                cancel: CancellationToken::new(),
                init_abort: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Live sandbox and the token its runs observe
    pub fn current(&self) -> Option<(Arc<dyn Sandbox>, CancellationToken)> {
        let slot = self.slot();
        slot.sandbox
            .as_ref()
            .filter(|s| s.is_alive())
            .map(|s| (s.clone(), slot.cancel.clone()))
    }

    pub fn has_sandbox(&self) -> bool {
        self.slot().sandbox.is_some()
    }

    /// Token that aborts an initialisation started now
    pub(crate) fn init_token(&self) -> CancellationToken {
        self.slot().init_abort.clone()
    }

    /// Cancel the in-flight run and initialisation, keeping the sandbox bound
    pub(crate) fn cancel_pending(&self) {
        let mut slot = self.slot();
        slot.cancel.cancel();
        slot.cancel = CancellationToken::new();
        slot.init_abort.cancel();
        slot.init_abort = CancellationToken::new();
    }

    /// Bind a freshly provisioned sandbox
    pub(crate) fn install(&self, sandbox: Arc<dyn Sandbox>) {
        let mut slot = self.slot();
        slot.sandbox = Some(sandbox);
        slot.cancel = CancellationToken::new();
    }

    /// Unbind the sandbox and cancel whatever runs against it
    pub(crate) fn take(&self) -> Option<Arc<dyn Sandbox>> {
        let mut slot = self.slot();
        let sandbox = slot.sandbox.take();
        slot.cancel.cancel();
        slot.cancel = CancellationToken::new();
        sandbox
    }

    /// Like [`take`](Self::take), but only if `sandbox_id` is still the bound sandbox
    pub(crate) fn take_if_current(&self, sandbox_id: &str) -> Option<Arc<dyn Sandbox>> {
        let mut slot = self.slot();
        if slot.sandbox.as_ref().map(|s| s.id()) != Some(sandbox_id) {
            return None;
        }
        let sandbox = slot.sandbox.take();
        slot.cancel.cancel();
        slot.cancel = CancellationToken::new();
        sandbox
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("backend_kind", &self.backend_kind)
            .field("has_sandbox", &self.has_sandbox())
            .finish()
    }
}

/// Concurrency-safe map of live sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ClientId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Existing session for `id`, or a newly registered one
    pub async fn get_or_insert(&self, id: &str, backend_kind: BackendKind) -> Arc<Session> {
        if let Some(session) = self.get(id).await {
            return session;
        }
        self.sessions
            .write()
            .await
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Session::new(id, backend_kind)))
            .clone()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<ClientId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_insert_is_stable() {
        let registry = SessionRegistry::new();
        let a = registry.get_or_insert("client-1", BackendKind::Local).await;
        let b = registry.get_or_insert("client-1", BackendKind::Local).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove("client-1").await.is_some());
        assert!(registry.remove("client-1").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[test]
    fn test_cancel_pending_refreshes_tokens() {
        let session = Session::new("client-1", BackendKind::Local);
        let init = session.init_token();
        session.cancel_pending();
        assert!(init.is_cancelled());
        assert!(!session.init_token().is_cancelled());
    }

    #[test]
    fn test_empty_session_has_no_sandbox() {
        let session = Session::new("client-1", BackendKind::Local);
        assert!(session.current().is_none());
        assert!(session.take().is_none());
        assert!(!session.has_sandbox());
    }
}
