//! Session registry for the streamable HTTP transport.
//!
//! Lifecycle: a transport/handler pair is built before any id is visible,
//! registered once the handler reports a completed `initialize`, reused by
//! every later request carrying that id, and reaped by the periodic sweep.
//! `DELETE` only closes the transport; the sweep still owns removal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::server::McpHandler;
use super::transport::StreamTransport;
use crate::config::SessionSettings;
use crate::error::SessionError;
use crate::state::Gateway;

/// The per-session protocol handler and the transport it publishes to.
#[derive(Clone)]
pub struct SessionHandle {
    pub handler: Arc<McpHandler>,
    pub transport: Arc<StreamTransport>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        self.transport.session_id()
    }
}

/// How an inbound POST was matched to a session.
pub enum Routed {
    /// A registered session, already touched.
    Existing(SessionHandle),
    /// A fresh pair for an `initialize` request, not yet registered.
    Pending(SessionHandle),
    /// A one-shot pair that is never stored.
    Sessionless(SessionHandle),
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RegistryStats {
    pub session_count: usize,
    pub active_streams: usize,
}

struct Session {
    handle: SessionHandle,
    created_at: Instant,
    last_activity: Instant,
    active_streams: usize,
    client_id: Option<String>,
}

pub struct SessionRegistry {
    settings: SessionSettings,
    gateway: Gateway,
    sessions: Mutex<HashMap<String, Session>>,
}

/// Counts one open stream against its session; dropping it ends the count.
pub struct StreamGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.stream_closed(&self.session_id);
    }
}

impl SessionRegistry {
    pub fn new(settings: SessionSettings, gateway: Gateway) -> Arc<Self> {
        Arc::new(Self {
            settings,
            gateway,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn new_pair(&self) -> SessionHandle {
        let transport = StreamTransport::new();
        let handler = Arc::new(McpHandler::new(self.gateway.clone(), Arc::clone(&transport)));
        SessionHandle { handler, transport }
    }

    /// Match a POST to a session. Unknown ids are rejected, never created.
    pub fn route(
        &self,
        session_id: Option<&str>,
        client_id: Option<&str>,
        is_initialize: bool,
    ) -> Result<Routed, SessionError> {
        match session_id {
            Some(id) => self.resolve(id, client_id).map(Routed::Existing),
            None if is_initialize => Ok(Routed::Pending(self.new_pair())),
            None => Ok(Routed::Sessionless(self.new_pair())),
        }
    }

    /// Second phase of initialization: store the session only if its
    /// handler actually completed `initialize`. Returns whether it was stored.
    pub fn complete_initialization(&self, handle: &SessionHandle, client_id: Option<&str>) -> bool {
        if !handle.transport.is_initialized() {
            return false;
        }
        let now = Instant::now();
        let id = handle.session_id().to_string();
        self.lock().insert(
            id.clone(),
            Session {
                handle: handle.clone(),
                created_at: now,
                last_activity: now,
                active_streams: 0,
                client_id: client_id.map(str::to_string),
            },
        );
        tracing::info!(session_id = %id, client_id = client_id.unwrap_or("-"), "session: registered");
        true
    }

    /// Look up a live session, enforce client ownership and refresh activity.
    pub fn resolve(&self, session_id: &str, client_id: Option<&str>) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::Invalid(session_id.to_string()))?;

        if session.handle.transport.is_closed() {
            return Err(SessionError::Closed(session_id.to_string()));
        }

        match (&session.client_id, client_id) {
            (Some(owner), Some(caller)) if owner != caller => {
                tracing::warn!(session_id = %session_id, "session: client id mismatch");
                return Err(SessionError::ClientMismatch);
            }
            (None, Some(caller)) => session.client_id = Some(caller.to_string()),
            _ => {}
        }

        session.last_activity = Instant::now();
        Ok(session.handle.clone())
    }

    /// Resolve and count a new long-lived stream against the session.
    pub fn open_stream(
        self: &Arc<Self>,
        session_id: &str,
        client_id: Option<&str>,
    ) -> Result<(SessionHandle, StreamGuard), SessionError> {
        let handle = self.resolve(session_id, client_id)?;
        if let Some(session) = self.lock().get_mut(session_id) {
            session.active_streams += 1;
            tracing::debug!(session_id = %session_id, streams = session.active_streams, "session: stream opened");
        }
        let guard = StreamGuard {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
        };
        Ok((handle, guard))
    }

    fn stream_closed(&self, session_id: &str) {
        if let Some(session) = self.lock().get_mut(session_id) {
            session.active_streams = session.active_streams.saturating_sub(1);
            session.last_activity = Instant::now();
            tracing::debug!(session_id = %session_id, streams = session.active_streams, "session: stream closed");
        }
    }

    /// Close the session's transport. The entry stays until the sweep reaps it.
    pub fn terminate(&self, session_id: &str, client_id: Option<&str>) -> Result<(), SessionError> {
        let handle = self.resolve(session_id, client_id)?;
        handle.transport.close();
        tracing::info!(session_id = %session_id, "session: terminated by client");
        Ok(())
    }

    /// Remove sessions idle past the timeout with no open streams, and
    /// sessions with open streams idle past timeout + grace.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let timeout = self.settings.inactivity_timeout;
        let hard_limit = timeout + self.settings.grace_period;
        let mut sessions = self.lock();
        let before = sessions.len();

        sessions.retain(|id, s| {
            let idle = now.duration_since(s.last_activity);
            let expired = if s.active_streams == 0 { idle > timeout } else { idle > hard_limit };
            if expired {
                s.handle.transport.close();
                tracing::info!(
                    session_id = %id,
                    idle_ms = idle.as_millis() as u64,
                    age_ms = now.duration_since(s.created_at).as_millis() as u64,
                    streams = s.active_streams,
                    "session: expired"
                );
            } else if s.active_streams > 0 && idle > timeout {
                tracing::debug!(session_id = %id, streams = s.active_streams, "session: kept alive by open streams");
            }
            !expired
        });

        before - sessions.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = registry.settings.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = registry.sweep();
                        if removed > 0 {
                            tracing::info!(removed, remaining = registry.len(), "session sweep");
                        }
                    }
                }
            }
        })
    }

    /// Close every transport (process shutdown).
    pub fn close_all(&self) {
        for session in self.lock().values() {
            session.handle.transport.close();
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn active_streams(&self, session_id: &str) -> Option<usize> {
        self.lock().get(session_id).map(|s| s.active_streams)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions = self.lock();
        RegistryStats {
            session_count: sessions.len(),
            active_streams: sessions.values().map(|s| s.active_streams).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::GatewayConfig;

    fn registry() -> Arc<SessionRegistry> {
        let settings = SessionSettings {
            inactivity_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
        };
        SessionRegistry::new(settings, Gateway::new(&GatewayConfig::default()))
    }

    fn registered(reg: &SessionRegistry, client_id: Option<&str>) -> SessionHandle {
        let Ok(Routed::Pending(handle)) = reg.route(None, client_id, true) else {
            panic!("expected a pending session");
        };
        handle.transport.mark_initialized();
        assert!(reg.complete_initialization(&handle, client_id));
        handle
    }

    #[tokio::test]
    async fn uninitialized_pair_is_not_registered() {
        let reg = registry();
        let Ok(Routed::Pending(handle)) = reg.route(None, None, true) else {
            panic!("expected a pending session");
        };
        assert!(!reg.complete_initialization(&handle, None));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn known_id_reuses_same_handler() {
        let reg = registry();
        let handle = registered(&reg, None);
        let a = reg.resolve(handle.session_id(), None).unwrap();
        let b = reg.resolve(handle.session_id(), None).unwrap();
        assert!(Arc::ptr_eq(&a.handler, &b.handler));
        assert!(Arc::ptr_eq(&a.transport, &handle.transport));
    }

    #[tokio::test]
    async fn unknown_id_is_rejected() {
        let reg = registry();
        assert!(matches!(
            reg.route(Some("nope"), None, false),
            Err(SessionError::Invalid(_))
        ));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn sessionless_requests_are_never_stored() {
        let reg = registry();
        let Ok(Routed::Sessionless(_)) = reg.route(None, None, false) else {
            panic!("expected a sessionless pair");
        };
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn client_mismatch_is_rejected() {
        let reg = registry();
        let handle = registered(&reg, Some("alice"));
        assert!(reg.resolve(handle.session_id(), Some("alice")).is_ok());
        assert!(reg.resolve(handle.session_id(), None).is_ok());
        assert!(matches!(
            reg.resolve(handle.session_id(), Some("mallory")),
            Err(SessionError::ClientMismatch)
        ));
    }

    #[tokio::test]
    async fn terminated_session_rejects_requests_but_stays_until_sweep() {
        let reg = registry();
        let handle = registered(&reg, None);
        reg.terminate(handle.session_id(), None).unwrap();
        assert!(handle.transport.is_closed());
        assert!(reg.contains(handle.session_id()));
        assert!(matches!(
            reg.resolve(handle.session_id(), None),
            Err(SessionError::Closed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_without_streams_is_swept() {
        let reg = registry();
        let handle = registered(&reg, None);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(reg.sweep(), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reg.sweep(), 1);
        assert!(!reg.contains(handle.session_id()));
        assert!(handle.transport.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn open_stream_extends_life_by_grace_period() {
        let reg = registry();
        let handle = registered(&reg, None);
        let (_, guard) = reg.open_stream(handle.session_id(), None).unwrap();
        assert_eq!(reg.stats().active_streams, 1);

        tokio::time::advance(Duration::from_secs(75)).await;
        assert_eq!(reg.sweep(), 0, "stream should keep the session inside the grace window");

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(reg.sweep(), 1);
        drop(guard);
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_stream_decrements_and_touches() {
        let reg = registry();
        let handle = registered(&reg, None);
        let (_, guard) = reg.open_stream(handle.session_id(), None).unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        drop(guard);
        assert_eq!(reg.active_streams(handle.session_id()), Some(0));

        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(reg.sweep(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_until_cancelled() {
        let reg = registry();
        registered(&reg, None);
        let cancel = CancellationToken::new();
        let task = reg.spawn_sweeper(cancel.clone());

        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(reg.is_empty());

        cancel.cancel();
        task.await.unwrap();
    }
}
