//! Session manager
//!
//! Owns the registry, the selected sandbox backend and the execution engine,
//! and enforces the lifecycle rules: at most one live sandbox per session,
//! runs of one session never overlap, and stop / disconnect always leave
//! nothing behind.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::registry::{Session, SessionRegistry};
use crate::core::{BackendKind, EventSink, ExecutionRequest, ServerEvent};
use crate::engine::{ExecutionEngine, RunOutcome};
use crate::error::Error;
use crate::sandbox::{SandboxBackend, SandboxSpec};

pub struct SessionManager {
    backend: Arc<dyn SandboxBackend>,
    engine: ExecutionEngine,
    registry: SessionRegistry,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn SandboxBackend>, engine: ExecutionEngine) -> Self {
        SessionManager {
            backend,
            engine,
            registry: SessionRegistry::new(),
        }
    }

    /// Strategy serving every session
    pub fn mode(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Number of registered sessions
    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Number of sessions currently holding a sandbox
    pub async fn live_sandboxes(&self) -> usize {
        self.registry
            .all()
            .await
            .iter()
            .filter(|s| s.has_sandbox())
            .count()
    }

    /// Register a newly connected client
    pub async fn connect(&self, client_id: &str) -> Arc<Session> {
        let session = self.registry.get_or_insert(client_id, self.mode()).await;
        info!("Client connected: {}", client_id);
        session
    }

    /// Provision a fresh sandbox for the client, replacing any previous one.
    ///
    /// Reports `session-ready` or `error` through `events`.
    pub async fn init_session(
        &self,
        client_id: &str,
        events: &EventSink,
        language: &str,
        runtime_image: &str,
    ) {
        let session = self.registry.get_or_insert(client_id, self.mode()).await;
        let abort = session.init_token();

        let _lifecycle = tokio::select! {
            guard = session.lifecycle.lock() => guard,
            _ = abort.cancelled() => {
                events.error(Error::Stopped.client_message(self.mode()));
                return;
            }
        };

        self.teardown(&session).await;

        // provisioning runs in its own task so an abort never strands a
        // half-created sandbox
        let spec = SandboxSpec::new(client_id, language, runtime_image);
        let backend = self.backend.clone();
        let mut create = tokio::spawn(async move { backend.create(&spec).await });

        let created = tokio::select! {
            joined = &mut create => joined
                .map_err(|e| Error::Internal(format!("Provisioning task failed: {}", e)))
                .and_then(|created| created),
            _ = abort.cancelled() => {
                info!("Initialisation of {} aborted", client_id);
                tokio::spawn(async move {
                    if let Ok(Ok(sandbox)) = create.await {
                        if let Err(e) = sandbox.destroy().await {
                            warn!("Failed to clean up aborted sandbox {}: {}", sandbox.id(), e);
                        }
                    }
                });
                events.error(Error::Stopped.client_message(self.mode()));
                return;
            }
        };

        match created {
            Ok(sandbox) => {
                info!(
                    "Session {} ready on {} sandbox {}",
                    client_id,
                    self.mode(),
                    sandbox.id()
                );
                session.install(sandbox);
                events.emit(ServerEvent::SessionReady { mode: self.mode() });
            }
            Err(e) => {
                warn!("Failed to initialise session {}: {}", client_id, e);
                events.error(e.client_message(self.mode()));
            }
        }
    }

    /// Run code in the client's sandbox.
    ///
    /// Runs of one session are queued and executed in arrival order.
    pub async fn run_code(&self, client_id: &str, events: &EventSink, request: ExecutionRequest) {
        let Some(session) = self.registry.get(client_id).await else {
            events.error(Error::SessionExpired.client_message(self.mode()));
            return;
        };

        let run_guard = session.run_lock.lock().await;
        let Some((sandbox, cancel)) = session.current() else {
            events.error(Error::SessionExpired.client_message(self.mode()));
            return;
        };

        match self.engine.run(sandbox.as_ref(), &request, events, &cancel).await {
            Ok(RunOutcome::Exited(code)) => debug!("Run in {} exited with {}", client_id, code),
            Ok(RunOutcome::TimedOut) => info!("Run in {} timed out", client_id),
            Ok(RunOutcome::Cancelled) => {
                debug!("Run in {} cancelled", client_id);
                // dropped silently when the client is gone
                events.error(Error::Stopped.client_message(self.mode()));
            }
            Err(e) => {
                if e.is_client_error() {
                    debug!("Run in {} rejected: {}", client_id, e);
                } else {
                    warn!("Run in {} failed: {}", client_id, e);
                }
                events.error(e.client_message(self.mode()));

                if e.is_unrecoverable() {
                    drop(run_guard);
                    if let Some(lost) = session.take_if_current(sandbox.id()) {
                        if let Err(e) = lost.destroy().await {
                            warn!("Failed to clean up lost sandbox {}: {}", lost.id(), e);
                        }
                    }
                }
            }
        }
    }

    /// Abort whatever the client's session is doing right now (a run or an
    /// initialisation) without tearing the sandbox down
    pub async fn cancel_pending(&self, client_id: &str) {
        if let Some(session) = self.registry.get(client_id).await {
            session.cancel_pending();
        }
    }

    /// Tear the client's sandbox down; the client stays registered
    pub async fn stop_session(&self, client_id: &str) {
        if let Some(session) = self.registry.get(client_id).await {
            session.cancel_pending();
            let _lifecycle = session.lifecycle.lock().await;
            self.teardown(&session).await;
            info!("Session stopped: {}", client_id);
        }
    }

    /// Forget the client and tear its sandbox down
    pub async fn disconnect(&self, client_id: &str) {
        if let Some(session) = self.registry.remove(client_id).await {
            session.cancel_pending();
            let _lifecycle = session.lifecycle.lock().await;
            self.teardown(&session).await;
            info!("Client disconnected: {}", client_id);
        }
    }

    /// Tear down every session
    pub async fn shutdown(&self) {
        let ids = self.registry.ids().await;
        info!("Shutting down {} session(s)", ids.len());
        for id in ids {
            self.disconnect(&id).await;
        }
    }

    /// Unbind, cancel, wait for the in-flight run, then destroy.
    ///
    /// Caller holds the session's lifecycle lock.
    async fn teardown(&self, session: &Session) {
        let Some(sandbox) = session.take() else {
            return;
        };

        // the cancelled run releases this once its completion is dropped
        let _run = session.run_lock.lock().await;

        match sandbox.destroy().await {
            Ok(()) => debug!("Destroyed sandbox {} of {}", sandbox.id(), session.id()),
            Err(e) => warn!(
                "Failed to destroy sandbox {} of {}: {}",
                sandbox.id(),
                session.id(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OutputChunk, StreamKind};
    use crate::engine::EngineConfig;
    use crate::error::Result;
    use crate::sandbox::{Completion, Execution, Sandbox};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        live: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    struct FakeBackend {
        counters: Arc<Counters>,
        run_time: Duration,
        create_delay: Duration,
        fail_create: bool,
        lose_sandbox: bool,
    }

    impl FakeBackend {
        fn new(run_time: Duration) -> Self {
            FakeBackend {
                counters: Arc::new(Counters::default()),
                run_time,
                create_delay: Duration::ZERO,
                fail_create: false,
                lose_sandbox: false,
            }
        }
    }

    #[async_trait]
    impl SandboxBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Container
        }

        async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>> {
            tokio::time::sleep(self.create_delay).await;
            if self.fail_create {
                return Err(Error::Provisioning {
                    mode: BackendKind::Container,
                    reason: format!("image {} not found", spec.runtime_image),
                });
            }
            let n = self.counters.created.fetch_add(1, Ordering::SeqCst);
            self.counters.live.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeSandbox {
                id: format!("fake-{}", n),
                counters: self.counters.clone(),
                run_time: self.run_time,
                lost: self.lose_sandbox,
                destroyed: AtomicBool::new(false),
            }))
        }
    }

    struct FakeSandbox {
        id: String,
        counters: Arc<Counters>,
        run_time: Duration,
        lost: bool,
        destroyed: AtomicBool,
    }

    struct TimedCompletion {
        counters: Arc<Counters>,
        run_time: Duration,
    }

    #[async_trait]
    impl Completion for TimedCompletion {
        async fn wait(&mut self) -> Result<i32> {
            tokio::time::sleep(self.run_time).await;
            Ok(0)
        }
    }

    impl Drop for TimedCompletion {
        fn drop(&mut self) {
            self.counters.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Container
        }

        fn workdir(&self) -> &str {
            "/workspace"
        }

        async fn write_file(&self, _name: &str, _contents: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn exec(&self, _command: &str) -> Result<Execution> {
            if self.lost {
                return Err(Error::SandboxLost {
                    mode: BackendKind::Container,
                    reason: "No such container".into(),
                });
            }
            let running = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_running.fetch_max(running, Ordering::SeqCst);

            let (tx, rx) = mpsc::channel(1);
            tx.try_send(OutputChunk::new(StreamKind::Stdout, "ok\n")).unwrap();
            Ok(Execution {
                output: rx,
                completion: Box::new(TimedCompletion {
                    counters: self.counters.clone(),
                    run_time: self.run_time,
                }),
            })
        }

        async fn interrupt(&self) -> Result<()> {
            Ok(())
        }

        async fn read_file(&self, _name: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn remove_file(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn destroy(&self) -> Result<()> {
            if !self.destroyed.swap(true, Ordering::SeqCst) {
                self.counters.live.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn is_alive(&self) -> bool {
            !self.destroyed.load(Ordering::SeqCst)
        }
    }

    fn manager(backend: FakeBackend) -> (Arc<SessionManager>, Arc<Counters>) {
        let counters = backend.counters.clone();
        let engine = ExecutionEngine::new(EngineConfig {
            drain_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        (
            Arc::new(SessionManager::new(Arc::new(backend), engine)),
            counters,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest::new("print('ok')", "py", "python3")
    }

    #[tokio::test]
    async fn test_reinit_keeps_one_sandbox() {
        let (manager, counters) = manager(FakeBackend::new(Duration::ZERO));
        let (events, mut rx) = EventSink::channel();
        manager.connect("c1").await;

        manager.init_session("c1", &events, "python", "python:3.12").await;
        manager.init_session("c1", &events, "python", "python:3.12").await;

        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(counters.live.load(Ordering::SeqCst), 1);
        assert_eq!(manager.live_sandboxes().await, 1);
        assert_eq!(
            drain(&mut rx),
            vec![
                ServerEvent::SessionReady {
                    mode: BackendKind::Container
                };
                2
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_sandbox() {
        let (manager, counters) = manager(FakeBackend::new(Duration::ZERO));
        let (events, _rx) = EventSink::channel();
        manager.init_session("c1", &events, "python", "python:3.12").await;

        manager.stop_session("c1").await;
        manager.stop_session("c1").await;
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert_eq!(manager.session_count().await, 1);

        manager.disconnect("c1").await;
        manager.disconnect("c1").await;
        manager.stop_session("unknown").await;
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_run_without_sandbox_reports_expiry() {
        let (manager, _) = manager(FakeBackend::new(Duration::ZERO));
        let (events, mut rx) = EventSink::channel();

        manager.run_code("nobody", &events, request()).await;
        manager.connect("c1").await;
        manager.run_code("c1", &events, request()).await;

        let received = drain(&mut rx);
        assert_eq!(received.len(), 2);
        for event in received {
            match event {
                ServerEvent::Error { message } => {
                    assert!(message.starts_with("[Container] Session expired"))
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_reported() {
        let mut backend = FakeBackend::new(Duration::ZERO);
        backend.fail_create = true;
        let (manager, _) = manager(backend);
        let (events, mut rx) = EventSink::channel();

        manager.init_session("c1", &events, "python", "nope:latest").await;
        match drain(&mut rx).as_slice() {
            [ServerEvent::Error { message }] => {
                assert!(message.starts_with("[Container] Failed to provision sandbox"))
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(manager.live_sandboxes().await, 0);
    }

    #[tokio::test]
    async fn test_overlapping_runs_are_sequential() {
        let (manager, counters) = manager(FakeBackend::new(Duration::from_millis(100)));
        let (events, mut rx) = EventSink::channel();
        manager.init_session("c1", &events, "python", "python:3.12").await;
        drain(&mut rx);

        let first = {
            let (manager, events) = (manager.clone(), events.clone());
            tokio::spawn(async move { manager.run_code("c1", &events, request()).await })
        };
        let second = {
            let (manager, events) = (manager.clone(), events.clone());
            tokio::spawn(async move { manager.run_code("c1", &events, request()).await })
        };
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(counters.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        let exits = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::Exit { code: 0 }))
            .count();
        assert_eq!(exits, 2);
    }

    #[tokio::test]
    async fn test_stop_during_run_ends_with_error() {
        let (manager, counters) = manager(FakeBackend::new(Duration::from_secs(30)));
        let (events, mut rx) = EventSink::channel();
        manager.init_session("c1", &events, "python", "python:3.12").await;
        drain(&mut rx);

        let run = {
            let (manager, events) = (manager.clone(), events.clone());
            tokio::spawn(async move { manager.run_code("c1", &events, request()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(5), manager.stop_session("c1"))
            .await
            .expect("stop must not wait for the run to finish");
        run.await.unwrap();

        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert_eq!(counters.running.load(Ordering::SeqCst), 0);
        let received = drain(&mut rx);
        let finals: Vec<_> = received
            .iter()
            .filter(|e| matches!(e, ServerEvent::Exit { .. } | ServerEvent::Error { .. }))
            .collect();
        match finals.as_slice() {
            [ServerEvent::Error { message }] => {
                assert!(message.starts_with("[Container] Stopped"))
            }
            other => panic!("unexpected final events {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_during_run_stays_silent() {
        let (manager, counters) = manager(FakeBackend::new(Duration::from_secs(30)));
        let (events, mut rx) = EventSink::channel();
        manager.init_session("c1", &events, "python", "python:3.12").await;
        drain(&mut rx);

        let run = {
            let (manager, events) = (manager.clone(), events.clone());
            tokio::spawn(async move { manager.run_code("c1", &events, request()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drain(&mut rx);

        events.close();
        manager.disconnect("c1").await;
        run.await.unwrap();
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_stop_aborts_slow_initialisation() {
        let mut backend = FakeBackend::new(Duration::ZERO);
        backend.create_delay = Duration::from_secs(30);
        let (manager, counters) = manager(backend);
        let (events, mut rx) = EventSink::channel();
        manager.connect("c1").await;

        let init = {
            let (manager, events) = (manager.clone(), events.clone());
            tokio::spawn(async move {
                manager
                    .init_session("c1", &events, "python", "python:3.12")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(5), manager.stop_session("c1"))
            .await
            .expect("stop must not wait for provisioning");
        tokio::time::timeout(Duration::from_secs(5), init)
            .await
            .expect("init returns once aborted")
            .unwrap();

        match drain(&mut rx).as_slice() {
            [ServerEvent::Error { message }] => {
                assert!(message.starts_with("[Container] Stopped"))
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert_eq!(manager.live_sandboxes().await, 0);
    }

    #[tokio::test]
    async fn test_lost_sandbox_forces_teardown() {
        let mut backend = FakeBackend::new(Duration::ZERO);
        backend.lose_sandbox = true;
        let (manager, counters) = manager(backend);
        let (events, mut rx) = EventSink::channel();
        manager.init_session("c1", &events, "python", "python:3.12").await;
        drain(&mut rx);

        manager.run_code("c1", &events, request()).await;
        match drain(&mut rx).as_slice() {
            [ServerEvent::Error { message }] => assert!(message.contains("Sandbox lost")),
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert_eq!(manager.live_sandboxes().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let (manager, counters) = manager(FakeBackend::new(Duration::ZERO));
        let (events, _rx) = EventSink::channel();
        for id in ["a", "b", "c"] {
            manager.init_session(id, &events, "python", "python:3.12").await;
        }
        assert_eq!(counters.live.load(Ordering::SeqCst), 3);

        manager.shutdown().await;
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert_eq!(manager.session_count().await, 0);
    }
}
