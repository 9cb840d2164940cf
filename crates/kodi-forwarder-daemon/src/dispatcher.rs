//! Debounced action dispatch
//!
//! Physical remotes often emit a press and its release within a couple of
//! milliseconds. Forwarding the release that fast can make the host's own
//! input stack drop the press entirely, so the dispatcher inserts a small
//! fixed delay between forwarding a press and issuing the release-all that
//! completes it.
//!
//! At most one release may be pending at a time. A new press supersedes any
//! release task still sleeping on the debounce timer (last-press-wins), so
//! two timers can never race for the same key.

use std::sync::Arc;
use std::time::Duration;

use kodi_forwarder_config::EventPhase;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::session::SessionManager;

/// Button map every forwarded key is sent on.
pub const BUTTON_MAP: &str = "KB";

struct PendingRelease {
    button: String,
    armed_at: Instant,
}

pub struct Dispatcher {
    session: Arc<SessionManager>,
    tracker: TaskTracker,
    debounce: Duration,
    pending: Option<PendingRelease>,
    release_task: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(session: Arc<SessionManager>, debounce: Duration, tracker: TaskTracker) -> Self {
        Self {
            session,
            tracker,
            debounce,
            pending: None,
            release_task: None,
        }
    }

    /// Forward a button immediately. A press arms the pending release and
    /// supersedes any release still in flight; a hold repeats the button
    /// without touching the armed timer.
    pub async fn on_forward_key(&mut self, button: &str, phase: EventPhase) {
        self.session.send_key(BUTTON_MAP, button).await;

        if phase == EventPhase::Press {
            self.cancel_stale_release();
            self.pending = Some(PendingRelease {
                button: button.to_string(),
                armed_at: Instant::now(),
            });
        }
    }

    /// Complete the pending press: wait out whatever is left of the
    /// debounce interval, then release all buttons on the host.
    ///
    /// The suspension runs as a detached task so a slow release never
    /// stalls the input loop. `button` is the release entry's own button
    /// name when the mapping had one; otherwise the armed press is used.
    pub async fn on_release_sequence(&mut self, button: Option<&str>) {
        let pending = self.pending.take();
        self.cancel_stale_release();

        let armed_at = pending.as_ref().map(|p| p.armed_at);
        let label = button
            .map(str::to_string)
            .or(pending.map(|p| p.button));

        let session = Arc::clone(&self.session);
        let debounce = self.debounce;
        let handle = self.tracker.spawn(async move {
            if let Some(armed_at) = armed_at {
                if let Some(remaining) = debounce.checked_sub(armed_at.elapsed()) {
                    if !remaining.is_zero() {
                        tokio::time::sleep(remaining).await;
                    }
                }
            }
            if let Some(button) = &label {
                tracing::debug!("Releasing '{}'", button);
            }
            session.release_all().await;
        });
        self.release_task = Some(handle);
    }

    /// Forget all pending state. Called when the input source is lost.
    pub fn reset(&mut self) {
        self.cancel_stale_release();
        self.pending = None;
    }

    fn cancel_stale_release(&mut self) {
        if let Some(task) = self.release_task.take() {
            if !task.is_finished() {
                tracing::debug!("Superseding stale release timer");
                task.abort();
            }
        }
    }
}
