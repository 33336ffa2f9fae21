use crate::config::DevServerTarget;
use crate::watchdog::{self, CleanupWatchdog, WatcherHandle};
use futures::future::BoxFuture;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Errors raised while starting a dev server process
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("launch command is empty")]
    EmptyCommand,

    #[error("invalid arguments '{arguments}': {source}")]
    InvalidArguments {
        arguments: String,
        #[source]
        source: shell_words::ParseError,
    },

    #[error("failed to start '{program}' in '{working_dir}': {source}")]
    Io {
        program: String,
        working_dir: String,
        #[source]
        source: io::Error,
    },
}

/// Split a launch command at its first whitespace into the program and the
/// raw argument string. Returns `None` for a blank command.
pub fn split_launch_command(launch_command: &str) -> Option<(&str, &str)> {
    let trimmed = launch_command.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once(char::is_whitespace) {
        Some((program, arguments)) => Some((program, arguments.trim_start())),
        None => Some((trimmed, "")),
    }
}

/// Windows package-manager shims are `.cmd` scripts, so a bare program
/// name gets the extension appended there.
pub fn resolve_executable(program: &str, windows: bool) -> String {
    if windows && Path::new(program).extension().is_none() {
        format!("{}.cmd", program)
    } else {
        program.to_string()
    }
}

/// A process started from a dev server target
pub trait ManagedProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Whether the process is still running. Never blocks.
    fn is_running(&mut self) -> bool;

    /// Stop the process and its descendants. Safe to call repeatedly.
    fn ensure_terminated(&mut self) -> BoxFuture<'_, ()>;
}

/// Starts dev server processes
pub trait Launcher: Send + Sync {
    fn launch(&self, target: &DevServerTarget) -> Result<Box<dyn ManagedProcess>, SpawnError>;
}

/// A running dev server launched by the proxy.
///
/// On unix the process leads its own process group, so stopping it also
/// reaches whatever it spawned (`npm` starting `node`, for instance).
pub struct DevServerProcess {
    name: String,
    child: Child,
    pid: Option<u32>,
    grace_period: Duration,
    terminated: bool,
    watcher: Option<WatcherHandle>,
}

/// How often termination checks whether the tree is gone
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl DevServerProcess {
    /// Start `launch_command` in `working_dir` as the leader of a new process group
    pub fn spawn(
        name: &str,
        launch_command: &str,
        working_dir: &Path,
        grace_period: Duration,
    ) -> Result<Self, SpawnError> {
        let (program, arguments) =
            split_launch_command(launch_command).ok_or(SpawnError::EmptyCommand)?;
        let program = resolve_executable(program, cfg!(windows));

        let mut cmd = Command::new(&program);
        apply_arguments(&mut cmd, arguments)?;
        cmd.current_dir(working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SpawnError::Io {
            program: program.clone(),
            working_dir: working_dir.display().to_string(),
            source,
        })?;

        let pid = child.id();
        info!(dev_server = name, pid, program = %program, "Dev server process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(name.to_string(), stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(name.to_string(), stderr, true));
        }

        Ok(Self {
            name: name.to_string(),
            child,
            pid,
            grace_period,
            terminated: false,
            watcher: None,
        })
    }

    /// Hand over the cleanup watcher guarding this process. It is stopped
    /// together with the process.
    pub fn attach_watcher(&mut self, watcher: WatcherHandle) {
        self.watcher = Some(watcher);
    }

    pub fn watcher_pid(&self) -> Option<u32> {
        self.watcher.as_ref().map(WatcherHandle::pid)
    }

    /// Stop the whole tree, even when the direct child already exited:
    /// wrapper scripts such as `npm` often exit and leave the real server
    /// running.
    async fn terminate_tree(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        match self.pid {
            Some(pid) => self.stop_tree(pid).await,
            None => {
                let _ = self.child.kill().await;
            }
        }

        if let Some(mut watcher) = self.watcher.take() {
            if let Err(e) = watcher.stop() {
                warn!(dev_server = %self.name, watcher_pid = watcher.pid(), error = %e, "Failed to stop cleanup watchdog");
            }
        }
    }

    async fn stop_tree(&mut self, pid: u32) {
        info!(dev_server = %self.name, pid, "Stopping dev server process tree");

        match request_graceful_exit(pid) {
            Ok(()) => {
                if self.wait_for_tree_exit(pid).await {
                    info!(dev_server = %self.name, "Dev server exited gracefully");
                    return;
                }
                warn!(
                    dev_server = %self.name,
                    grace_period_secs = self.grace_period.as_secs(),
                    "Grace period exceeded, killing process tree"
                );
            }
            Err(e) => {
                warn!(dev_server = %self.name, pid, error = %e, "Graceful stop failed, killing process tree");
            }
        }

        if let Err(e) = force_kill_tree(pid) {
            warn!(
                dev_server = %self.name,
                pid,
                error = %e,
                "Failed to kill dev server process tree; it may need to be stopped manually"
            );
        }
        let _ = self.child.kill().await;
    }

    /// Wait up to the grace period for the child and the rest of its tree
    async fn wait_for_tree_exit(&mut self, pid: u32) -> bool {
        let deadline = tokio::time::Instant::now() + self.grace_period;
        loop {
            let child_exited = !matches!(self.child.try_wait(), Ok(None));
            if child_exited && !tree_alive(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

impl ManagedProcess for DevServerProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&mut self) -> bool {
        !self.terminated && matches!(self.child.try_wait(), Ok(None))
    }

    fn ensure_terminated(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.terminate_tree())
    }
}

#[cfg(not(windows))]
fn apply_arguments(cmd: &mut Command, arguments: &str) -> Result<(), SpawnError> {
    let args = shell_words::split(arguments).map_err(|source| SpawnError::InvalidArguments {
        arguments: arguments.to_string(),
        source,
    })?;
    cmd.args(args);
    Ok(())
}

// Windows programs parse their own command line
#[cfg(windows)]
fn apply_arguments(cmd: &mut Command, arguments: &str) -> Result<(), SpawnError> {
    if !arguments.is_empty() {
        cmd.raw_arg(arguments);
    }
    Ok(())
}

async fn forward_output<R: AsyncRead + Unpin>(name: String, stream: R, stderr: bool) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if stderr => warn!(dev_server = %name, "{}", line),
            Ok(Some(line)) => info!(dev_server = %name, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(dev_server = %name, error = %e, "Stopped reading dev server output");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Whether any process of the group is still running
#[cfg(target_os = "linux")]
fn tree_alive(pid: u32) -> bool {
    match live_group_members(pid) {
        Ok(members) => !members.is_empty(),
        Err(_) => group_exists(pid),
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn tree_alive(pid: u32) -> bool {
    group_exists(pid)
}

/// Pids in process group `pgid` that are not zombies. Orphans of a killed
/// group may never be reaped inside containers, so existence alone is not
/// enough.
#[cfg(target_os = "linux")]
fn live_group_members(pgid: u32) -> io::Result<Vec<u32>> {
    let mut members = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // Processes may exit between listing and reading
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // After the parenthesized command name: state ppid pgrp ...
        let Some((_, rest)) = stat.rsplit_once(')') else {
            continue;
        };
        let mut fields = rest.split_whitespace();
        let state = fields.next();
        let pgrp = fields.nth(1).and_then(|f| f.parse::<u32>().ok());
        if pgrp == Some(pgid) && state != Some("Z") {
            members.push(pid);
        }
    }
    Ok(members)
}

#[cfg(unix)]
fn group_exists(pid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) with signal 0 only checks for existence
    let rc = unsafe { libc::kill(-pgid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(unix)]
fn request_graceful_exit(pid: u32) -> io::Result<()> {
    signal_group(pid, libc::SIGTERM)
}

#[cfg(unix)]
fn force_kill_tree(pid: u32) -> io::Result<()> {
    signal_group(pid, libc::SIGKILL)
}

// Windows has no cheap group check; taskkill /T covers the tree
#[cfg(windows)]
fn tree_alive(_pid: u32) -> bool {
    false
}

#[cfg(windows)]
fn request_graceful_exit(pid: u32) -> io::Result<()> {
    taskkill(&["/T", "/PID", &pid.to_string()])
}

#[cfg(windows)]
fn force_kill_tree(pid: u32) -> io::Result<()> {
    taskkill(&["/T", "/F", "/PID", &pid.to_string()])
}

#[cfg(windows)]
fn taskkill(args: &[&str]) -> io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill {} exited with {}", args.join(" "), status)))
    }
}

/// Launches real dev server processes and registers each with a cleanup
/// watchdog
pub struct ProcessLauncher {
    watchdog: Box<dyn CleanupWatchdog>,
}

impl ProcessLauncher {
    pub fn new(watchdog: Box<dyn CleanupWatchdog>) -> Self {
        Self { watchdog }
    }

    /// Launcher using the watchdog for this platform
    pub fn for_current_platform() -> Self {
        Self::new(watchdog::platform_watchdog())
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, target: &DevServerTarget) -> Result<Box<dyn ManagedProcess>, SpawnError> {
        info!(
            dev_server = %target.name,
            command = %target.launch_command,
            working_dir = %target.working_directory.display(),
            "Launching dev server"
        );

        let mut process = DevServerProcess::spawn(
            &target.name,
            &target.launch_command,
            &target.working_directory,
            target.shutdown_grace_period,
        )?;

        if let Some(pid) = process.pid() {
            match self.watchdog.watch(pid, std::process::id()) {
                Ok(watcher) => {
                    debug!(dev_server = %target.name, pid, watcher_pid = watcher.pid(), "Cleanup watchdog started");
                    process.attach_watcher(watcher);
                }
                Err(e) => {
                    warn!(
                        dev_server = %target.name,
                        pid,
                        error = %e,
                        "Failed to start cleanup watchdog; the dev server may outlive an abrupt exit of the proxy"
                    );
                }
            }
        }

        Ok(Box::new(process))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;
    use crate::watchdog::ShellWatchdog;

    /// Pids of shell watchers guarding `pid`, found by their script text
    #[cfg(target_os = "linux")]
    fn watchers_guarding(pid: u32) -> Vec<String> {
        let needle = format!("list_descendants {}", pid);
        std::fs::read_dir("/proc")
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().parse::<u32>().is_ok())
            .filter(|entry| {
                std::fs::read(entry.path().join("cmdline"))
                    .map(|cmdline| String::from_utf8_lossy(&cmdline).contains(&needle))
                    .unwrap_or(false)
            })
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_split_launch_command() {
        assert_eq!(split_launch_command("npm start"), Some(("npm", "start")));
        assert_eq!(
            split_launch_command("  npm run dev -- --port 5173 "),
            Some(("npm", "run dev -- --port 5173"))
        );
        assert_eq!(split_launch_command("yarn"), Some(("yarn", "")));
        assert_eq!(split_launch_command("   "), None);
    }

    #[test]
    fn test_resolve_executable() {
        assert_eq!(resolve_executable("npm", true), "npm.cmd");
        assert_eq!(resolve_executable("node.exe", true), "node.exe");
        assert_eq!(resolve_executable("npm", false), "npm");
    }

    #[tokio::test]
    async fn test_spawn_empty_command() {
        let result = DevServerProcess::spawn("app", " ", Path::new("."), Duration::from_secs(1));
        assert!(matches!(result, Err(SpawnError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let result = DevServerProcess::spawn(
            "app",
            "definitely-not-a-real-program-4821 --flag",
            Path::new("."),
            Duration::from_secs(1),
        );
        let err = result.err().unwrap();
        assert!(matches!(err, SpawnError::Io { .. }));
        assert!(err.to_string().contains("definitely-not-a-real-program-4821"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_unbalanced_quotes() {
        let result = DevServerProcess::spawn("app", "echo 'oops", Path::new("."), Duration::from_secs(1));
        assert!(matches!(result, Err(SpawnError::InvalidArguments { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let mut process =
            DevServerProcess::spawn("app", "sleep 60", Path::new("."), Duration::from_secs(1)).unwrap();
        assert!(process.pid().is_some());
        assert!(process.is_running());

        process.ensure_terminated().await;
        assert!(!process.is_running());

        // Second call is a no-op
        process.ensure_terminated().await;
        assert!(!process.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_shell_with_children() {
        let mut process = DevServerProcess::spawn(
            "app",
            "sh -c 'sleep 60 & wait'",
            Path::new("."),
            Duration::from_secs(10),
        )
        .unwrap();
        assert!(process.is_running());

        // The whole group gets SIGTERM, so this finishes well inside the grace period
        let started = std::time::Instant::now();
        process.ensure_terminated().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!process.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_process_is_not_running() {
        let mut process =
            DevServerProcess::spawn("app", "true", Path::new("."), Duration::from_secs(1)).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while process.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!process.is_running());
        process.ensure_terminated().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_working_directory_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let mut process = DevServerProcess::spawn(
            "app",
            "sh -c 'touch started.marker'",
            dir.path(),
            Duration::from_secs(1),
        )
        .unwrap();

        let marker = dir.path().join("started.marker");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !marker.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(marker.exists());
        process.ensure_terminated().await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_reaches_group_after_wrapper_exits() {
        let mut process = DevServerProcess::spawn(
            "app",
            "sh -c 'sleep 60 & exit 0'",
            Path::new("."),
            Duration::from_secs(2),
        )
        .unwrap();
        let pgid = process.pid().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while process.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!process.is_running());

        // The wrapper is gone but the server it started keeps the group alive
        assert!(!live_group_members(pgid).unwrap().is_empty());

        process.ensure_terminated().await;
        assert!(live_group_members(pgid).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_cleanup_watcher() {
        let mut process =
            DevServerProcess::spawn("app", "sleep 60", Path::new("."), Duration::from_secs(1)).unwrap();
        let watcher = ShellWatchdog::default()
            .watch(process.pid().unwrap(), std::process::id())
            .unwrap();
        process.attach_watcher(watcher);
        let watcher_pid = libc::pid_t::try_from(process.watcher_pid().unwrap()).unwrap();

        process.ensure_terminated().await;

        assert!(process.watcher_pid().is_none());
        assert_ne!(unsafe { libc::kill(watcher_pid, 0) }, 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_launcher_leaves_no_watcher_behind() {
        let target = TargetConfig::new("http://127.0.0.1:1", "sleep 60").resolve(
            "app",
            &Default::default(),
            Path::new("."),
        );
        let launcher = ProcessLauncher::new(Box::new(ShellWatchdog::default()));

        let mut process = launcher.launch(&target).unwrap();
        let pid = process.pid().unwrap();
        assert_eq!(watchers_guarding(pid).len(), 1);

        process.ensure_terminated().await;
        assert!(watchers_guarding(pid).is_empty(), "watchers left: {:?}", watchers_guarding(pid));
    }
}
