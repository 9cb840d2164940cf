//! The forwarding engine
//!
//! Three long-lived loops run concurrently for the life of the process:
//!
//! - the input monitor, which owns controller acquisition and feeds raw
//!   events through the chord resolver into the dispatcher;
//! - the liveness poller, which periodically probes a connected host and
//!   downgrades the session when it stops answering;
//! - the keep-alive pinger, which keeps an open event-server registration
//!   from expiring.
//!
//! Short-lived tasks (debounce releases, power-off) are spawned into a
//! shared tracker. On shutdown every loop is cancelled and the tracker is
//! awaited with a bounded grace period.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kodi_forwarder_config::{Config, MappingTable};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::controller::{BluetoothLink, Controller, LinkControl};
use crate::dispatcher::Dispatcher;
use crate::eventserver::EventServerTransport;
use crate::power::PowerHandler;
use crate::resolver::{ChordResolver, ResolvedAction};
use crate::rpc::JsonRpcClient;
use crate::session::{ControlPoint, SessionManager};
use crate::shell::SshShutdown;
use crate::wake::WakeOnLan;

/// Client name announced to the host's event server.
const CLIENT_NAME: &str = "kodi-forwarder";

/// How long outstanding detached tasks may run after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Forwarder {
    config: Arc<Config>,
    table: Arc<MappingTable>,
    session: Arc<SessionManager>,
    control: Arc<dyn ControlPoint>,
    power: Arc<PowerHandler>,
    link: Arc<dyn LinkControl>,
    tracker: TaskTracker,
}

impl Forwarder {
    pub fn new(config: Config, table: MappingTable) -> Result<Self> {
        let config = Arc::new(config);
        let table = Arc::new(table);

        let control: Arc<dyn ControlPoint> = Arc::new(
            JsonRpcClient::new(
                &config.kodi.host,
                config.kodi.web_port,
                config.kodi.user.clone(),
                config.kodi.password.clone(),
                config.timing.io_timeout,
            )
            .context("building the JSON-RPC client")?,
        );

        let transport = Arc::new(EventServerTransport::new(
            &config.kodi.host,
            config.kodi.eventserver_port,
            CLIENT_NAME,
            config.timing.io_timeout,
        ));
        let session = Arc::new(SessionManager::new(control.clone(), transport));

        let link: Arc<dyn LinkControl> =
            Arc::new(BluetoothLink::new(&config.controller.identity));
        let wake = Arc::new(WakeOnLan::new(config.kodi.mac.clone()));
        let shell = Arc::new(SshShutdown::new(
            &config.kodi.host,
            &config.kodi.ssh,
            config.timing.io_timeout,
        ));

        let tracker = TaskTracker::new();
        let power = Arc::new(PowerHandler::new(
            session.clone(),
            control.clone(),
            wake,
            shell,
            link.clone(),
            config.timing.command_cooldown,
            tracker.clone(),
        ));

        Ok(Self {
            config,
            table,
            session,
            control,
            power,
            link,
            tracker,
        })
    }

    /// Run until `shutdown` is cancelled, then tear down cooperatively.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let monitor = tokio::spawn(monitor_loop(
            self.config.clone(),
            self.table.clone(),
            self.session.clone(),
            self.power.clone(),
            self.tracker.clone(),
            shutdown.clone(),
        ));
        let poller = tokio::spawn(liveness_loop(
            self.session.clone(),
            self.control.clone(),
            self.link.clone(),
            self.config.timing.liveness_interval,
            shutdown.clone(),
        ));
        let pinger = tokio::spawn(keepalive_loop(
            self.session.clone(),
            self.config.timing.keepalive_interval,
            shutdown.clone(),
        ));

        let (monitor, poller, pinger) = tokio::join!(monitor, poller, pinger);
        for result in [monitor, poller, pinger] {
            if let Err(e) = result {
                tracing::warn!("Forwarder task panicked: {}", e);
            }
        }

        // Loops are down; give outstanding debounce/power-off tasks a
        // bounded window to finish, then say goodbye to the host.
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("Detached tasks did not finish within the shutdown grace period");
        }
        self.session.mark_disconnected().await;

        Ok(())
    }
}

/// Acquire the controller, pump its events through the resolver, and start
/// over (after a short delay) whenever the device disappears.
async fn monitor_loop(
    config: Arc<Config>,
    table: Arc<MappingTable>,
    session: Arc<SessionManager>,
    power: Arc<PowerHandler>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    let identity = config.controller.identity.clone();
    let mut resolver = ChordResolver::new(table);
    let mut dispatcher = Dispatcher::new(session.clone(), config.timing.debounce, tracker);

    while !shutdown.is_cancelled() {
        let mut controller = match Controller::open_by_identity(&identity) {
            Ok(Some(controller)) => controller,
            Ok(None) => {
                tracing::trace!("Controller {} not present", identity);
                if !sleep_or_shutdown(config.timing.reacquire_delay, &shutdown).await {
                    return;
                }
                continue;
            }
            Err(e) => {
                tracing::warn!("Controller scan failed: {:#}", e);
                if !sleep_or_shutdown(config.timing.reacquire_delay, &shutdown).await {
                    return;
                }
                continue;
            }
        };

        let name = controller.name().to_string();
        // Held state from a previous acquisition must not leak into the
        // new event stream.
        resolver.reset();
        dispatcher.reset();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = controller.next_key_event() => match event {
                    Ok(raw) => {
                        if let Some(action) = resolver.resolve(&raw.key, raw.phase) {
                            handle_action(action, &mut dispatcher, &session, &power).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Controller '{}' lost: {}", name, e);
                        break;
                    }
                }
            }
        }

        drop(controller);
        resolver.reset();
        dispatcher.reset();
        if !sleep_or_shutdown(config.timing.reacquire_delay, &shutdown).await {
            return;
        }
    }
}

async fn handle_action(
    action: ResolvedAction,
    dispatcher: &mut Dispatcher,
    session: &SessionManager,
    power: &PowerHandler,
) {
    match action {
        ResolvedAction::ForwardKey { button, phase } => {
            dispatcher.on_forward_key(&button, phase).await;
        }
        ResolvedAction::ReleaseSequence { button } => {
            dispatcher.on_release_sequence(Some(&button)).await;
        }
        ResolvedAction::ReleaseOnly => {
            dispatcher.on_release_sequence(None).await;
        }
        ResolvedAction::Special { command } => {
            power.dispatch(&command).await;
        }
        ResolvedAction::Custom { payload } => {
            session.send_action(&payload).await;
        }
    }
}

/// Periodically probe a connected host; downgrade on failure and drop the
/// controller's radio link so a powered-off host does not keep it bound.
///
/// The poller never upgrades: reconnecting is the job of the next send.
async fn liveness_loop(
    session: Arc<SessionManager>,
    control: Arc<dyn ControlPoint>,
    link: Arc<dyn LinkControl>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately; the first probe
    // belongs one full interval from now.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                if session.is_connected().await && !control.ping().await {
                    tracing::warn!("Host stopped answering the liveness probe");
                    session.mark_disconnected().await;
                    link.force_disconnect().await;
                }
            }
        }
    }
}

/// Ping the open session so the host keeps this client registered.
async fn keepalive_loop(
    session: Arc<SessionManager>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => session.keepalive().await,
        }
    }
}

async fn sleep_or_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use kodi_forwarder_config::{EventPhase, SshConfig};

    use super::*;
    use crate::session::testing::*;

    #[derive(Default)]
    struct CountingLink {
        drops: AtomicUsize,
    }

    #[async_trait]
    impl LinkControl for CountingLink {
        async fn force_disconnect(&self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_table() -> Arc<MappingTable> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("t.json"),
            r#"{
                "name": "t",
                "mapping": {
                    "KEY_A": [ { "key": "a", "flags": 2 } ],
                    "KEY_HOMEPAGE": [ { "action": "ActivateWindow(Home)", "phase": "release" } ]
                }
            }"#,
        )
        .unwrap();
        Arc::new(kodi_forwarder_config::load_mapping(dir.path(), "t").unwrap())
    }

    fn power_stub(session: Arc<SessionManager>, control: Arc<FakeControl>, tracker: TaskTracker) -> PowerHandler {
        PowerHandler::new(
            session,
            control,
            Arc::new(WakeOnLan::new(None)),
            Arc::new(SshShutdown::new(
                "127.0.0.1",
                &SshConfig::default(),
                Duration::from_millis(100),
            )),
            Arc::new(CountingLink::default()),
            Duration::from_secs(30),
            tracker,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn shifted_chord_ends_with_a_send_and_a_release() {
        let log = new_log();
        let control = FakeControl::reachable();
        let (session, _) = manager_with(control.clone(), log.clone());
        let tracker = TaskTracker::new();

        let mut resolver = ChordResolver::new(test_table());
        let mut dispatcher =
            Dispatcher::new(session.clone(), Duration::from_millis(40), tracker.clone());
        let power = power_stub(session.clone(), control, tracker.clone());

        let events = [
            ("KEY_LEFTSHIFT", EventPhase::Press),
            ("KEY_A", EventPhase::Press),
            ("KEY_A", EventPhase::Release),
            ("KEY_LEFTSHIFT", EventPhase::Release),
        ];
        for (key, phase) in events {
            if let Some(action) = resolver.resolve(key, phase) {
                handle_action(action, &mut dispatcher, &session, &power).await;
            }
        }

        tracker.close();
        tracker.wait().await;

        assert_eq!(calls(&log), vec!["open", "button KB a", "release"]);
        assert!(resolver.flags().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_action_goes_straight_to_the_session() {
        let log = new_log();
        let control = FakeControl::reachable();
        let (session, _) = manager_with(control.clone(), log.clone());
        let tracker = TaskTracker::new();

        let mut resolver = ChordResolver::new(test_table());
        let mut dispatcher =
            Dispatcher::new(session.clone(), Duration::from_millis(40), tracker.clone());
        let power = power_stub(session.clone(), control, tracker.clone());

        for (key, phase) in [
            ("KEY_HOMEPAGE", EventPhase::Press),
            ("KEY_HOMEPAGE", EventPhase::Release),
        ] {
            if let Some(action) = resolver.resolve(key, phase) {
                handle_action(action, &mut dispatcher, &session, &power).await;
            }
        }

        tracker.close();
        tracker.wait().await;

        assert_eq!(calls(&log), vec!["open", "action ActivateWindow(Home)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_downgrades_but_never_upgrades() {
        let log = new_log();
        let control = FakeControl::reachable();
        let (session, _) = manager_with(control.clone(), log.clone());
        let link = Arc::new(CountingLink::default());
        let shutdown = CancellationToken::new();

        let poller = tokio::spawn(liveness_loop(
            session.clone(),
            control.clone(),
            link.clone(),
            Duration::from_secs(120),
            shutdown.clone(),
        ));

        // Connect, then survive one healthy probe.
        session.send_key("KB", "up").await;
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(session.is_connected().await);
        assert_eq!(link.drops.load(Ordering::SeqCst), 0);

        // Host goes away: the next probe downgrades and drops the link.
        control.reachable.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!session.is_connected().await);
        assert_eq!(link.drops.load(Ordering::SeqCst), 1);

        // Host is back, but the poller leaves reconnecting to the next
        // send.
        control.reachable.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(240)).await;
        assert!(!session.is_connected().await);

        shutdown.cancel();
        poller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_only_while_connected() {
        let log = new_log();
        let control = FakeControl::reachable();
        let (session, _) = manager_with(control.clone(), log.clone());
        let shutdown = CancellationToken::new();

        let pinger = tokio::spawn(keepalive_loop(
            session.clone(),
            Duration::from_secs(50),
            shutdown.clone(),
        ));

        // Not connected: ticks come and go without touching the transport.
        tokio::time::sleep(Duration::from_secs(101)).await;
        assert!(calls(&log).is_empty());

        session.send_key("KB", "up").await;
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(calls(&log), vec!["open", "button KB up", "ping"]);

        shutdown.cancel();
        pinger.await.unwrap();
    }
}
