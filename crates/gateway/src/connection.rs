//! # Connection manager
//!
//! Guards the single-active-agent invariant (§4.3/§4.7): at most one
//! authenticated Agent session at a time. Replacement policy is "incumbent
//! wins while healthy, else the newcomer takes over" (see DESIGN.md for the
//! Open Question this resolves).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tunnel_protocol::Frame;

/// Published for external observers (status endpoint, UI hub) — the core
/// only writes onto this channel, it doesn't know who (if anyone) reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected { agent_version: String },
}

#[derive(Debug)]
pub struct ActiveSession {
    pub tx: mpsc::UnboundedSender<Frame>,
    pub agent_version: String,
    last_heartbeat_millis: Arc<AtomicI64>,
}

impl ActiveSession {
    pub fn new(tx: mpsc::UnboundedSender<Frame>, agent_version: String, now_millis: i64) -> Self {
        Self {
            tx,
            agent_version,
            last_heartbeat_millis: Arc::new(AtomicI64::new(now_millis)),
        }
    }

    pub fn touch(&self, now_millis: i64) {
        self.last_heartbeat_millis.store(now_millis, Ordering::SeqCst);
    }

    pub fn is_healthy(&self, now_millis: i64, timeout: Duration) -> bool {
        let last = self.last_heartbeat_millis.load(Ordering::SeqCst);
        (now_millis - last) < timeout.as_millis() as i64
    }

    pub fn send(&self, frame: Frame) -> Result<(), mpsc::error::SendError<Frame>> {
        self.tx.send(frame)
    }
}

pub enum RegisterOutcome {
    /// No incumbent, or the incumbent had missed its heartbeat window.
    Accepted,
    /// A healthy incumbent is already connected; the newcomer is rejected.
    Rejected,
}

pub struct ConnectionManager {
    active: Mutex<Option<ActiveSession>>,
    state_tx: watch::Sender<ConnectionState>,
    heartbeat_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        let (state_tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            active: Mutex::new(None),
            state_tx,
            heartbeat_timeout,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Attempts to install `candidate` as the active session, applying the
    /// single-active-agent invariant. Returns the replaced session (if any)
    /// so the caller can close it with `Disconnect{reason="replaced"}`.
    pub async fn try_register(
        &self,
        candidate: ActiveSession,
        now_millis: i64,
    ) -> (RegisterOutcome, Option<ActiveSession>) {
        let mut slot = self.active.lock().await;
        let incumbent_healthy = slot
            .as_ref()
            .map(|s| s.is_healthy(now_millis, self.heartbeat_timeout))
            .unwrap_or(false);

        if incumbent_healthy {
            return (RegisterOutcome::Rejected, None);
        }

        let previous = slot.take();
        let version = candidate.agent_version.clone();
        *slot = Some(candidate);
        let _ = self
            .state_tx
            .send(ConnectionState::Connected { agent_version: version });
        (RegisterOutcome::Accepted, previous)
    }

    pub async fn touch_heartbeat(&self, now_millis: i64) {
        if let Some(session) = self.active.lock().await.as_ref() {
            session.touch(now_millis);
        }
    }

    pub async fn has_active_connection(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), GatewayForwardError> {
        let slot = self.active.lock().await;
        match slot.as_ref() {
            Some(session) => session
                .send(frame)
                .map_err(|_| GatewayForwardError::SessionClosed),
            None => Err(GatewayForwardError::NoActiveSession),
        }
    }

    /// Removes the active session if it is the one identified by `tx`
    /// (compared by pointer via `same_channel`), e.g. when its receive loop
    /// exits. Returns it so the caller can drain pending requests.
    pub async fn remove_if_current(
        &self,
        tx: &mpsc::UnboundedSender<Frame>,
    ) -> Option<ActiveSession> {
        let mut slot = self.active.lock().await;
        let is_current = slot.as_ref().map(|s| s.tx.same_channel(tx)).unwrap_or(false);
        if is_current {
            let removed = slot.take();
            let _ = self.state_tx.send(ConnectionState::Disconnected);
            removed
        } else {
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayForwardError {
    #[error("no active agent session")]
    NoActiveSession,
    #[error("agent session closed")]
    SessionClosed,
}
