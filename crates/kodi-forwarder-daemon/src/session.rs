//! Session lifecycle management for the Kodi host
//!
//! The [`SessionManager`] owns the only piece of state shared across tasks:
//! whether a forwarding session to the host is currently open. Sends are
//! best-effort; if the host cannot be reached the button is dropped, not
//! queued. Any transport failure during a send downgrades the session
//! immediately so the next send re-probes.
//!
//! The session state lives behind a single async mutex, and every send holds
//! the lock across the (timeout-bounded) network call. A liveness-driven
//! downgrade can therefore never interleave with an in-flight send.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors surfaced by the forwarding-session transport.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session IO failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("session operation timed out")]
    Timeout,
}

/// Opens forwarding sessions to the host's event endpoint.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn EventSession>, SessionError>;
}

/// An open forwarding session.
///
/// Implementations map these onto whatever wire protocol the host speaks;
/// the manager only cares that a failed call means the session is dead.
#[async_trait]
pub trait EventSession: Send {
    async fn send_button(&mut self, map: &str, button: &str) -> Result<(), SessionError>;
    async fn send_action(&mut self, payload: &str) -> Result<(), SessionError>;
    async fn release_button(&mut self) -> Result<(), SessionError>;
    async fn ping(&mut self) -> Result<(), SessionError>;
    /// Best-effort orderly teardown; errors are ignored.
    async fn close(&mut self);
}

/// Reachability and power side-channel of the host (JSON-RPC).
#[async_trait]
pub trait ControlPoint: Send + Sync {
    /// Liveness probe. `false` for any failure, including timeouts.
    async fn ping(&self) -> bool;
    /// Ask the host to shut itself down. `false` if the request failed.
    async fn shutdown(&self) -> bool;
}

enum SessionState {
    Disconnected,
    Connected(Box<dyn EventSession>),
}

pub struct SessionManager {
    control: Arc<dyn ControlPoint>,
    transport: Arc<dyn EventTransport>,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(control: Arc<dyn ControlPoint>, transport: Arc<dyn EventTransport>) -> Self {
        Self {
            control,
            transport,
            state: Mutex::new(SessionState::Disconnected),
        }
    }

    /// Lazily (re)establish the session.
    ///
    /// Returns `true` if a session is open on return. A failed probe or a
    /// failed open leaves the state `Disconnected`; the caller is expected
    /// to drop whatever it wanted to send.
    pub async fn ensure_connected(&self) -> bool {
        let mut state = self.state.lock().await;
        self.ensure_locked(&mut state).await
    }

    async fn ensure_locked(&self, state: &mut SessionState) -> bool {
        if matches!(*state, SessionState::Connected(_)) {
            return true;
        }

        if !self.control.ping().await {
            tracing::debug!("Host did not answer liveness probe");
            return false;
        }

        match self.transport.open().await {
            Ok(session) => {
                tracing::info!("Forwarding session opened");
                *state = SessionState::Connected(session);
                true
            }
            Err(e) => {
                tracing::warn!("Host is reachable but session open failed: {}", e);
                false
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.lock().await, SessionState::Connected(_))
    }

    /// Send a named button on the given button map. Dropped if the host is
    /// unreachable.
    pub async fn send_key(&self, map: &str, button: &str) {
        let mut state = self.state.lock().await;
        if !self.ensure_locked(&mut state).await {
            tracing::debug!("Dropping button '{}': no session", button);
            return;
        }

        let failed = match &mut *state {
            SessionState::Connected(session) => session.send_button(map, button).await.err(),
            SessionState::Disconnected => None,
        };
        if let Some(e) = failed {
            tracing::warn!("Button send failed, marking disconnected: {}", e);
            *state = SessionState::Disconnected;
        }
    }

    /// Send a raw action string. Dropped if the host is unreachable.
    pub async fn send_action(&self, payload: &str) {
        let mut state = self.state.lock().await;
        if !self.ensure_locked(&mut state).await {
            tracing::debug!("Dropping action '{}': no session", payload);
            return;
        }

        let failed = match &mut *state {
            SessionState::Connected(session) => session.send_action(payload).await.err(),
            SessionState::Disconnected => None,
        };
        if let Some(e) = failed {
            tracing::warn!("Action send failed, marking disconnected: {}", e);
            *state = SessionState::Disconnected;
        }
    }

    /// Release all buttons held by this client on the host.
    pub async fn release_all(&self) {
        let mut state = self.state.lock().await;
        if !self.ensure_locked(&mut state).await {
            return;
        }

        let failed = match &mut *state {
            SessionState::Connected(session) => session.release_button().await.err(),
            SessionState::Disconnected => None,
        };
        if let Some(e) = failed {
            tracing::warn!("Release failed, marking disconnected: {}", e);
            *state = SessionState::Disconnected;
        }
    }

    /// Ping the open session so the host keeps the client registered.
    ///
    /// Unlike the send operations this never dials: with no session open it
    /// is a no-op, and connecting is left to the next send.
    pub async fn keepalive(&self) {
        let mut state = self.state.lock().await;

        let failed = match &mut *state {
            SessionState::Connected(session) => session.ping().await.err(),
            SessionState::Disconnected => return,
        };
        if let Some(e) = failed {
            tracing::warn!("Keep-alive ping failed, marking disconnected: {}", e);
            *state = SessionState::Disconnected;
        }
    }

    /// Force the session down, closing it in an orderly way if one is open.
    pub async fn mark_disconnected(&self) {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, SessionState::Disconnected);
        if let SessionState::Connected(mut session) = previous {
            session.close().await;
            tracing::info!("Forwarding session closed");
        }
    }
}
