//! Launch supervision for dev servers
//!
//! Each target has one [`LaunchSupervisor`]. Requests that arrive before the
//! dev server answers call [`LaunchSupervisor::ensure_launching`], which
//! starts at most one background launch at a time. The launch probes the dev
//! server, spawns it when nothing answers, and polls until it answers, exits
//! or runs out of time. Once a probe succeeds the target is marked reachable
//! for the rest of the proxy's lifetime.

use crate::config::DevServerTarget;
use crate::process::{Launcher, ManagedProcess};
use crate::probe::{LivenessProbe, ProbeOutcome};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Pause between probes while waiting for a launched dev server
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where a supervisor's most recent launch stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPhase {
    /// No launch has been attempted yet
    Idle,
    /// A launch is running in the background
    Launching,
    /// The dev server answered a probe
    Reachable,
    /// The last launch failed or timed out; the next request retries
    GaveUp,
}

struct LaunchState {
    process: Option<Box<dyn ManagedProcess>>,
    in_flight: bool,
    phase: LaunchPhase,
    disposed: bool,
}

pub struct LaunchSupervisor {
    target: Arc<DevServerTarget>,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn LivenessProbe>,
    reachable: AtomicBool,
    state: Mutex<LaunchState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LaunchSupervisor {
    /// Create an idle supervisor for `target`
    pub fn new(
        target: Arc<DevServerTarget>,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn LivenessProbe>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            target,
            launcher,
            probe,
            reachable: AtomicBool::new(false),
            state: Mutex::new(LaunchState {
                process: None,
                in_flight: false,
                phase: LaunchPhase::Idle,
                disposed: false,
            }),
            shutdown_rx,
        })
    }

    /// Get the supervised target
    pub fn target(&self) -> &DevServerTarget {
        &self.target
    }

    /// Whether a probe has ever succeeded. Never goes back to `false`.
    pub fn currently_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    /// Current launch phase
    pub fn phase(&self) -> LaunchPhase {
        if self.currently_reachable() {
            return LaunchPhase::Reachable;
        }
        self.state.lock().phase
    }

    /// Pid of the launched process, if one is held
    pub fn process_id(&self) -> Option<u32> {
        self.state.lock().process.as_ref().and_then(|p| p.pid())
    }

    /// Start a background launch unless one is already running, the dev
    /// server is known to be reachable or the proxy is shutting down.
    /// Returns whether this call started the launch. Never waits for it.
    pub fn ensure_launching(self: &Arc<Self>) -> bool {
        if self.currently_reachable() {
            return false;
        }

        {
            let mut state = self.state.lock();
            if state.in_flight
                || state.disposed
                || self.currently_reachable()
                || *self.shutdown_rx.borrow()
            {
                return false;
            }
            state.in_flight = true;
            state.phase = LaunchPhase::Launching;
        }

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut guard = LaunchGuard {
                supervisor: &supervisor,
                outcome: LaunchPhase::GaveUp,
            };
            guard.outcome = supervisor.launch().await;
        });

        true
    }

    /// Stop the launched process, if any. Later launches are refused.
    pub async fn shutdown(&self) {
        let process = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.process.take()
        };

        if let Some(mut process) = process {
            debug!(dev_server = %self.target.name, "Terminating dev server on shutdown");
            process.ensure_terminated().await;
        }
    }

    async fn launch(&self) -> LaunchPhase {
        let name = &self.target.name;
        let url = self.target.probe_url();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let stale = self.state.lock().process.take();
        if let Some(mut stale) = stale {
            debug!(dev_server = %name, "Stopping process left over from the previous launch");
            stale.ensure_terminated().await;
        }

        let Some(outcome) = self.probe_or_shutdown(&url, &mut shutdown_rx).await else {
            return LaunchPhase::Idle;
        };
        if outcome == ProbeOutcome::Reachable {
            info!(dev_server = %name, url, "Found a dev server already running");
            self.mark_reachable();
            return LaunchPhase::Reachable;
        }

        info!(dev_server = %name, url, "No dev server running, launching one");

        let process = match self.launcher.launch(&self.target) {
            Ok(process) => process,
            Err(e) => {
                error!(
                    dev_server = %name,
                    command = %self.target.launch_command,
                    error = %e,
                    "Failed to launch dev server"
                );
                return LaunchPhase::GaveUp;
            }
        };

        let orphan = {
            let mut state = self.state.lock();
            if state.disposed {
                Some(process)
            } else {
                state.process = Some(process);
                None
            }
        };
        if let Some(mut orphan) = orphan {
            orphan.ensure_terminated().await;
            return LaunchPhase::Idle;
        }

        let started = Instant::now();
        loop {
            let Some(outcome) = self.probe_or_shutdown(&url, &mut shutdown_rx).await else {
                return LaunchPhase::Idle;
            };

            if outcome == ProbeOutcome::Reachable {
                info!(
                    dev_server = %name,
                    url,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Dev server is running"
                );
                self.mark_reachable();
                return LaunchPhase::Reachable;
            }

            if !self.process_running() {
                error!(
                    dev_server = %name,
                    command = %self.target.launch_command,
                    "Dev server process exited before it started answering"
                );
                return LaunchPhase::GaveUp;
            }

            if started.elapsed() >= self.target.max_timeout {
                error!(
                    dev_server = %name,
                    url,
                    timeout_secs = self.target.max_timeout.as_secs(),
                    "Unable to connect to the dev server"
                );
                return LaunchPhase::GaveUp;
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => return LaunchPhase::Idle,
            }
        }
    }

    async fn probe_or_shutdown(
        &self,
        url: &str,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<ProbeOutcome> {
        tokio::select! {
            outcome = self.probe.probe(url) => Some(outcome),
            _ = wait_for_shutdown(shutdown_rx) => {
                debug!(dev_server = %self.target.name, "Launch cancelled by shutdown");
                None
            }
        }
    }

    fn process_running(&self) -> bool {
        self.state
            .lock()
            .process
            .as_mut()
            .map(|p| p.is_running())
            .unwrap_or(false)
    }

    fn mark_reachable(&self) {
        self.reachable.store(true, Ordering::Release);
    }
}

/// Clears the in-flight flag when a launch task ends, however it ends
struct LaunchGuard<'a> {
    supervisor: &'a LaunchSupervisor,
    outcome: LaunchPhase,
}

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.supervisor.state.lock();
        state.in_flight = false;
        state.phase = self.outcome;
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Sender dropped without signalling shutdown
            std::future::pending::<()>().await;
        }
    }
}

/// Supervisors for every target, created on first use
pub struct SupervisorRegistry {
    supervisors: DashMap<String, Arc<LaunchSupervisor>>,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn LivenessProbe>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SupervisorRegistry {
    /// Create an empty registry; supervisors are added on first use
    pub fn new(
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn LivenessProbe>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisors: DashMap::new(),
            launcher,
            probe,
            shutdown_rx,
        })
    }

    /// Get the supervisor for `target`, creating it on first use
    pub fn supervisor_for(&self, target: &Arc<DevServerTarget>) -> Arc<LaunchSupervisor> {
        if let Some(existing) = self.supervisors.get(&target.name) {
            return Arc::clone(existing.value());
        }

        let entry = self
            .supervisors
            .entry(target.name.clone())
            .or_insert_with(|| {
                LaunchSupervisor::new(
                    Arc::clone(target),
                    Arc::clone(&self.launcher),
                    Arc::clone(&self.probe),
                    self.shutdown_rx.clone(),
                )
            });
        Arc::clone(entry.value())
    }

    /// Look up the supervisor of a target by name
    pub fn get(&self, name: &str) -> Option<Arc<LaunchSupervisor>> {
        self.supervisors.get(name).map(|s| Arc::clone(s.value()))
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    /// Stop every launched dev server
    pub async fn shutdown_all(&self) {
        let supervisors: Vec<Arc<LaunchSupervisor>> = self
            .supervisors
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        if !supervisors.is_empty() {
            info!(count = supervisors.len(), "Stopping dev servers");
        }

        for supervisor in supervisors {
            supervisor.shutdown().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::TargetConfig;
    use crate::process::SpawnError;
    use futures::future::BoxFuture;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    /// Records how often it was launched and terminated
    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        pub launches: AtomicUsize,
        pub terminations: Arc<AtomicUsize>,
        pub exits_immediately: bool,
        pub fails: bool,
    }

    struct FakeProcess {
        running: bool,
        terminated: bool,
        terminations: Arc<AtomicUsize>,
    }

    impl ManagedProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn is_running(&mut self) -> bool {
            self.running
        }

        fn ensure_terminated(&mut self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                if !self.terminated {
                    self.terminated = true;
                    self.running = false;
                    self.terminations.fetch_add(1, Ordering::SeqCst);
                }
            })
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, _target: &DevServerTarget) -> Result<Box<dyn ManagedProcess>, SpawnError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fails {
                return Err(SpawnError::EmptyCommand);
            }
            Ok(Box::new(FakeProcess {
                running: !self.exits_immediately,
                terminated: false,
                terminations: Arc::clone(&self.terminations),
            }))
        }
    }

    /// Answers `Reachable` from the given call onwards (0 is the first call)
    pub(crate) struct ScriptedProbe {
        pub calls: AtomicUsize,
        pub reachable_from: Option<usize>,
    }

    impl ScriptedProbe {
        pub fn reachable_from(call: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reachable_from: Some(call),
            }
        }

        pub fn never() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reachable_from: None,
            }
        }
    }

    impl LivenessProbe for ScriptedProbe {
        fn probe<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, ProbeOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let reachable = self.reachable_from.map(|from| call >= from).unwrap_or(false);
            Box::pin(async move {
                if reachable {
                    ProbeOutcome::Reachable
                } else {
                    ProbeOutcome::Unreachable
                }
            })
        }
    }

    pub(crate) fn test_target(max_timeout_secs: u64) -> Arc<DevServerTarget> {
        Arc::new(
            TargetConfig::new("http://127.0.0.1:3000", "npm start")
                .with_max_timeout_secs(max_timeout_secs)
                .resolve("app", &Default::default(), Path::new(".")),
        )
    }

    async fn settle(supervisor: &LaunchSupervisor) {
        while supervisor.phase() == LaunchPhase::Launching {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn supervisor(
        launcher: &Arc<FakeLauncher>,
        probe: &Arc<ScriptedProbe>,
        max_timeout_secs: u64,
    ) -> (Arc<LaunchSupervisor>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let supervisor = LaunchSupervisor::new(
            test_target(max_timeout_secs),
            Arc::clone(launcher) as Arc<dyn Launcher>,
            Arc::clone(probe) as Arc<dyn LivenessProbe>,
            rx,
        );
        (supervisor, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_start_one_launch() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(ScriptedProbe::never());
        let (supervisor, _tx) = supervisor(&launcher, &probe, 5);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move { supervisor.ensure_launching() })
            })
            .collect();

        let mut started = 0;
        for handle in handles {
            if handle.await.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert_eq!(supervisor.phase(), LaunchPhase::Launching);

        settle(&supervisor).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_timeout_and_relaunches() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(ScriptedProbe::never());
        let (supervisor, _tx) = supervisor(&launcher, &probe, 5);

        let started = Instant::now();
        assert!(supervisor.ensure_launching());
        settle(&supervisor).await;

        assert_eq!(supervisor.phase(), LaunchPhase::GaveUp);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(!supervisor.currently_reachable());
        assert!(supervisor.process_id().is_some());

        // The next request retries and the leftover process is stopped first
        assert!(supervisor.ensure_launching());
        settle(&supervisor).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_becomes_reachable_on_second_poll() {
        let launcher = Arc::new(FakeLauncher::default());
        // Call 0 is the pre-launch probe, calls 1 and 2 are polls
        let probe = Arc::new(ScriptedProbe::reachable_from(2));
        let (supervisor, _tx) = supervisor(&launcher, &probe, 120);

        let started = Instant::now();
        assert!(supervisor.ensure_launching());
        settle(&supervisor).await;

        assert!(supervisor.currently_reachable());
        assert_eq!(supervisor.phase(), LaunchPhase::Reachable);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= POLL_INTERVAL);
        assert!(started.elapsed() < POLL_INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reachable_is_sticky() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(ScriptedProbe::reachable_from(1));
        let (supervisor, _tx) = supervisor(&launcher, &probe, 120);

        supervisor.ensure_launching();
        settle(&supervisor).await;
        assert!(supervisor.currently_reachable());
        let calls = probe.calls.load(Ordering::SeqCst);

        // No further launches or probes once reachable
        assert!(!supervisor.ensure_launching());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), calls);
        assert!(supervisor.currently_reachable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_dev_server_is_not_spawned_again() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(ScriptedProbe::reachable_from(0));
        let (supervisor, _tx) = supervisor(&launcher, &probe, 120);

        supervisor.ensure_launching();
        settle(&supervisor).await;

        assert!(supervisor.currently_reachable());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
        assert!(supervisor.process_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exited_process_gives_up_early() {
        let launcher = Arc::new(FakeLauncher {
            exits_immediately: true,
            ..Default::default()
        });
        let probe = Arc::new(ScriptedProbe::never());
        let (supervisor, _tx) = supervisor(&launcher, &probe, 120);

        let started = Instant::now();
        supervisor.ensure_launching();
        settle(&supervisor).await;

        assert_eq!(supervisor.phase(), LaunchPhase::GaveUp);
        assert!(started.elapsed() < POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failure_allows_retry() {
        let launcher = Arc::new(FakeLauncher {
            fails: true,
            ..Default::default()
        });
        let probe = Arc::new(ScriptedProbe::never());
        let (supervisor, _tx) = supervisor(&launcher, &probe, 120);

        assert!(supervisor.ensure_launching());
        settle(&supervisor).await;
        assert_eq!(supervisor.phase(), LaunchPhase::GaveUp);

        assert!(supervisor.ensure_launching());
        settle(&supervisor).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_terminates_process_once() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(ScriptedProbe::never());
        let (supervisor, _tx) = supervisor(&launcher, &probe, 120);

        supervisor.ensure_launching();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(supervisor.process_id().is_some());

        supervisor.shutdown().await;
        supervisor.shutdown().await;
        assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
        assert!(supervisor.process_id().is_none());
        assert!(!supervisor.ensure_launching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signal_cancels_launch() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(ScriptedProbe::never());
        let (supervisor, tx) = supervisor(&launcher, &probe, 120);

        supervisor.ensure_launching();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(true).unwrap();
        settle(&supervisor).await;

        assert_eq!(supervisor.phase(), LaunchPhase::Idle);
        assert!(!supervisor.currently_reachable());
        assert!(!supervisor.ensure_launching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_creates_supervisors_lazily() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(ScriptedProbe::never());
        let (_tx, rx) = watch::channel(false);
        let registry = SupervisorRegistry::new(launcher.clone(), probe.clone(), rx);
        assert!(registry.is_empty());

        let target = test_target(5);
        let first = registry.supervisor_for(&target);
        let second = registry.supervisor_for(&target);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.get("app").is_some());
        assert!(registry.get("other").is_none());

        first.ensure_launching();
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.shutdown_all().await;
        assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
    }
}
