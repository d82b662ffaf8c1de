//! Per-session streaming transport.
//!
//! A transport owns the session id, the "initialized" signal the registry
//! waits for before exposing that id, a bounded replay buffer of server
//! events, and the close signal that ends every open stream.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::response::sse::Event;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const REPLAY_CAPACITY: usize = 256;
const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: u64,
    pub data: String,
}

impl StoredEvent {
    fn to_sse(&self) -> Event {
        Event::default()
            .id(self.id.to_string())
            .event("message")
            .data(self.data.clone())
    }
}

pub struct StreamTransport {
    session_id: String,
    initialized: AtomicBool,
    closed: CancellationToken,
    next_event_id: AtomicU64,
    history: Mutex<VecDeque<StoredEvent>>,
    live: broadcast::Sender<StoredEvent>,
}

impl StreamTransport {
    pub fn new() -> Arc<Self> {
        let (live, _) = broadcast::channel(REPLAY_CAPACITY);
        Arc::new(Self {
            session_id: Uuid::new_v4().to_string(),
            initialized: AtomicBool::new(false),
            closed: CancellationToken::new(),
            next_event_id: AtomicU64::new(1),
            history: Mutex::new(VecDeque::with_capacity(REPLAY_CAPACITY)),
            live,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Called by the protocol handler once `initialize` has succeeded.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Id of the most recent event, 0 when nothing has been sent.
    pub fn last_event_id(&self) -> u64 {
        self.next_event_id.load(Ordering::Acquire).saturating_sub(1)
    }

    /// Queue a server-to-client JSON-RPC message for every open stream.
    pub fn send(&self, message: &Value) {
        if self.is_closed() {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        let event = StoredEvent {
            id: self.next_event_id.fetch_add(1, Ordering::AcqRel),
            data: message.to_string(),
        };
        if history.len() >= REPLAY_CAPACITY {
            history.pop_front();
        }
        history.push_back(event.clone());
        // Sent under the history lock so replay + live never reorder.
        let _ = self.live.send(event);
    }

    /// Buffered events with an id greater than `cursor`.
    pub fn replay_after(&self, cursor: u64) -> Vec<StoredEvent> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.iter().filter(|e| e.id > cursor).cloned().collect()
    }

    /// Open an SSE stream: replays events after `cursor` (when resuming),
    /// then forwards live events with a heartbeat comment every `heartbeat`.
    ///
    /// `guard` is held for the life of the stream and dropped when it ends,
    /// whether the client went away, a write failed, or the transport closed.
    pub fn open_stream<G>(
        self: &Arc<Self>,
        cursor: Option<u64>,
        heartbeat: Duration,
        guard: G,
    ) -> mpsc::Receiver<Result<Event, Infallible>>
    where
        G: Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let transport = Arc::clone(self);

        // Subscribe before returning so nothing sent after the GET is missed.
        let (mut live, backlog) = {
            let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
            let live = self.live.subscribe();
            let backlog: Vec<StoredEvent> = match cursor {
                Some(c) => history.iter().filter(|e| e.id > c).cloned().collect(),
                None => Vec::new(),
            };
            (live, backlog)
        };
        let mut last_sent = cursor.unwrap_or_else(|| self.last_event_id());

        tokio::spawn(async move {
            let _guard = guard;
            let session_id = transport.session_id.clone();

            for event in backlog {
                last_sent = event.id;
                if tx.send(Ok(event.to_sse())).await.is_err() {
                    return;
                }
            }

            let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
            loop {
                tokio::select! {
                    _ = transport.closed.cancelled() => {
                        tracing::debug!(session_id = %session_id, "stream: transport closed");
                        break;
                    }
                    _ = tx.closed() => {
                        tracing::debug!(session_id = %session_id, "stream: client disconnected");
                        break;
                    }
                    _ = ticker.tick() => {
                        if tx.send(Ok(Event::default().comment("heartbeat"))).await.is_err() {
                            tracing::debug!(session_id = %session_id, "stream: heartbeat write failed");
                            break;
                        }
                    }
                    received = live.recv() => match received {
                        Ok(event) if event.id > last_sent => {
                            last_sent = event.id;
                            if tx.send(Ok(event.to_sse())).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(session_id = %session_id, skipped, "stream: subscriber lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        rx
    }
}
