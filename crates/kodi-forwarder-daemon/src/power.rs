//! Host power control
//!
//! Mapping entries can name a power command instead of a button. The set of
//! commands is closed: adding one means adding an enum variant, not a
//! config key. An unknown name in a mapping is a configuration mistake and
//! logs a warning; the event is otherwise ignored.
//!
//! Both commands carry a per-command cooldown so a bouncing power button
//! cannot wake or shut the host down twice in a row.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::controller::LinkControl;
use crate::session::{ControlPoint, SessionManager};
use crate::shell::ShellEndpoint;
use crate::wake::WakeEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialCommand {
    PowerOn,
    PowerOff,
}

impl SpecialCommand {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "poweron" => Some(Self::PowerOn),
            "poweroff" => Some(Self::PowerOff),
            _ => None,
        }
    }
}

impl fmt::Display for SpecialCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerOn => write!(f, "poweron"),
            Self::PowerOff => write!(f, "poweroff"),
        }
    }
}

pub struct PowerHandler {
    session: Arc<SessionManager>,
    control: Arc<dyn ControlPoint>,
    wake: Arc<dyn WakeEndpoint>,
    shell: Arc<dyn ShellEndpoint>,
    link: Arc<dyn LinkControl>,
    cooldown: Duration,
    tracker: TaskTracker,
    last_fired: Mutex<HashMap<SpecialCommand, Instant>>,
}

impl PowerHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<SessionManager>,
        control: Arc<dyn ControlPoint>,
        wake: Arc<dyn WakeEndpoint>,
        shell: Arc<dyn ShellEndpoint>,
        link: Arc<dyn LinkControl>,
        cooldown: Duration,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            session,
            control,
            wake,
            shell,
            link,
            cooldown,
            tracker,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch a named command from a mapping entry.
    pub async fn dispatch(&self, name: &str) {
        let Some(command) = SpecialCommand::parse(name) else {
            tracing::warn!("Mapping names unknown special command '{}'", name);
            return;
        };

        if !self.acquire(command).await {
            tracing::debug!("Command '{}' is in cooldown, ignored", command);
            return;
        }

        match command {
            SpecialCommand::PowerOn => self.power_on().await,
            SpecialCommand::PowerOff => self.spawn_power_off(),
        }
    }

    async fn acquire(&self, command: SpecialCommand) -> bool {
        let mut last_fired = self.last_fired.lock().await;
        let now = Instant::now();

        if let Some(last) = last_fired.get(&command) {
            if now.duration_since(*last) < self.cooldown {
                return false;
            }
        }

        last_fired.insert(command, now);
        true
    }

    async fn power_on(&self) {
        tracing::info!("Power-on requested");
        self.wake.send_wake().await;
        // The host takes a while to boot; drop the session now and let the
        // poller rediscover it.
        self.session.mark_disconnected().await;
    }

    /// Power-off can spend many seconds in the SSH fallback, so it runs
    /// detached from the input loop.
    fn spawn_power_off(&self) {
        tracing::info!("Power-off requested");

        let session = Arc::clone(&self.session);
        let control = Arc::clone(&self.control);
        let shell = Arc::clone(&self.shell);
        let link = Arc::clone(&self.link);

        self.tracker.spawn(async move {
            if control.shutdown().await {
                tracing::info!("Host accepted RPC shutdown");
            } else {
                tracing::warn!("RPC shutdown failed, falling back to SSH");
                match shell.run_privileged_shutdown().await {
                    Ok(()) => tracing::info!("Privileged shutdown issued over SSH"),
                    Err(e) => tracing::warn!("Privileged shutdown failed: {}", e),
                }
            }

            // Whatever happened above, the host is going away (or was never
            // there): force the session down and drop the radio link.
            session.mark_disconnected().await;
            link.force_disconnect().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::session::testing::*;
    use crate::shell::ShellError;

    #[derive(Default)]
    struct CountingWake {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WakeEndpoint for CountingWake {
        async fn send_wake(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingShell {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ShellEndpoint for FailingShell {
        async fn run_privileged_shutdown(&self) -> Result<(), ShellError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ShellError::Auth("bad credentials".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingLink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LinkControl for CountingLink {
        async fn force_disconnect(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        handler: PowerHandler,
        session: Arc<SessionManager>,
        wake: Arc<CountingWake>,
        shell: Arc<FailingShell>,
        link: Arc<CountingLink>,
        tracker: TaskTracker,
    }

    fn fixture(control: Arc<FakeControl>) -> Fixture {
        let (session, _) = manager_with(control.clone(), new_log());
        let wake = Arc::new(CountingWake::default());
        let shell = Arc::new(FailingShell {
            calls: AtomicUsize::new(0),
        });
        let link = Arc::new(CountingLink::default());
        let tracker = TaskTracker::new();

        let handler = PowerHandler::new(
            session.clone(),
            control,
            wake.clone(),
            shell.clone(),
            link.clone(),
            Duration::from_secs(30),
            tracker.clone(),
        );

        Fixture {
            handler,
            session,
            wake,
            shell,
            link,
            tracker,
        }
    }

    async fn drain(tracker: &TaskTracker) {
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_poweron_within_cooldown_fires_once() {
        let f = fixture(FakeControl::reachable());

        f.handler.dispatch("poweron").await;
        f.handler.dispatch("poweron").await;
        assert_eq!(f.wake.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        f.handler.dispatch("poweron").await;
        assert_eq!(f.wake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_poweroff_within_cooldown_fires_once() {
        let control = FakeControl::reachable();
        let f = fixture(control.clone());

        f.handler.dispatch("poweroff").await;
        f.handler.dispatch("poweroff").await;
        drain(&f.tracker).await;

        assert_eq!(control.shutdown_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_command_is_a_noop() {
        let f = fixture(FakeControl::reachable());

        f.handler.dispatch("hibernate").await;
        drain(&f.tracker).await;

        assert_eq!(f.wake.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.shell.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn poweron_forces_the_session_down() {
        let f = fixture(FakeControl::reachable());

        // Open a session first.
        f.session.send_key("KB", "up").await;
        assert!(f.session.is_connected().await);

        f.handler.dispatch("poweron").await;

        assert_eq!(f.wake.calls.load(Ordering::SeqCst), 1);
        assert!(!f.session.is_connected().await);
    }

    #[tokio::test]
    async fn poweroff_falls_back_to_ssh_and_disconnects() {
        let control = FakeControl::reachable();
        control
            .shutdown_ok
            .store(false, Ordering::SeqCst);
        let f = fixture(control.clone());

        // Connected before the command lands.
        f.session.send_key("KB", "up").await;
        assert!(f.session.is_connected().await);

        f.handler.dispatch("poweroff").await;
        drain(&f.tracker).await;

        // RPC was tried, failed, the SSH fallback ran (and failed with an
        // auth error), and the session is down regardless.
        assert_eq!(control.shutdown_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.shell.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.link.calls.load(Ordering::SeqCst), 1);
        assert!(!f.session.is_connected().await);
    }
}
