//! Out-of-process cleanup for launched dev servers
//!
//! A graceful shutdown stops dev servers directly. If the proxy itself is
//! killed, a small watcher process notices the proxy is gone and kills the
//! dev server tree on its behalf.

use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("failed to start cleanup watchdog: {0}")]
    Spawn(#[from] io::Error),

    #[error("cleanup watchdog exited immediately with {0}")]
    ExitedEarly(ExitStatus),
}

/// Starts a watcher that kills `child_pid` and its descendants once
/// `parent_pid` no longer exists
pub trait CleanupWatchdog: Send + Sync {
    fn watch(&self, child_pid: u32, parent_pid: u32) -> Result<WatcherHandle, WatchdogError>;
}

/// A running watcher process.
///
/// Dropping the handle leaves the watcher running. Call [`WatcherHandle::stop`]
/// once the dev server it guards has been stopped, so it never acts on a
/// pid that was released and reused.
#[derive(Debug)]
pub struct WatcherHandle {
    child: Child,
}

impl WatcherHandle {
    /// Get the watcher process id
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Kill the watcher and reap it. Does nothing if it already exited.
    pub fn stop(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        // The watcher leads its own group, which also holds its `sleep`
        #[cfg(unix)]
        if let Ok(pgid) = libc::pid_t::try_from(self.child.id()) {
            // SAFETY: kill(2) has no memory-safety preconditions
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }

        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}

/// Watchdog for unix-like systems, driven by a POSIX shell script
#[derive(Debug, Clone)]
pub struct ShellWatchdog {
    shell: PathBuf,
}

impl Default for ShellWatchdog {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl ShellWatchdog {
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self { shell: shell.into() }
    }

    /// Script that polls for the parent once a second, then kills every
    /// descendant of the child, the child's process group and the child.
    pub fn script(child_pid: u32, parent_pid: u32) -> String {
        format!(
            r#"list_descendants() {{
  for pid in $(pgrep -P "$1" 2>/dev/null); do
    echo "$pid"
    list_descendants "$pid"
  done
}}
while kill -0 {parent_pid} 2>/dev/null; do
  sleep 1
done
for pid in $(list_descendants {child_pid}); do
  kill -9 "$pid" 2>/dev/null
done
kill -9 -{child_pid} 2>/dev/null
kill -9 {child_pid} 2>/dev/null
exit 0
"#
        )
    }
}

impl CleanupWatchdog for ShellWatchdog {
    fn watch(&self, child_pid: u32, parent_pid: u32) -> Result<WatcherHandle, WatchdogError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(Self::script(child_pid, parent_pid));
        detach(&mut cmd);
        spawn_watcher(cmd)
    }
}

/// Watchdog for Windows, driven by PowerShell
#[derive(Debug, Clone, Default)]
pub struct PowerShellWatchdog;

impl PowerShellWatchdog {
    pub fn script(child_pid: u32, parent_pid: u32) -> String {
        format!(
            r#"do {{
  try {{ $parent = Get-Process -Id {parent_pid} -ErrorAction Stop }} catch {{ $parent = $null }}
  Start-Sleep -Seconds 1
}} while ($parent -ne $null)
try {{ taskkill /T /F /PID {child_pid} }} catch {{ }}
"#
        )
    }
}

impl CleanupWatchdog for PowerShellWatchdog {
    fn watch(&self, child_pid: u32, parent_pid: u32) -> Result<WatcherHandle, WatchdogError> {
        let mut cmd = Command::new("powershell.exe");
        cmd.args(["-NoProfile", "-NonInteractive", "-Command"])
            .arg(Self::script(child_pid, parent_pid));
        detach(&mut cmd);
        spawn_watcher(cmd)
    }
}

/// Watchdog for the platform this binary was built for
pub fn platform_watchdog() -> Box<dyn CleanupWatchdog> {
    if cfg!(windows) {
        Box::new(PowerShellWatchdog)
    } else {
        Box::new(ShellWatchdog::default())
    }
}

fn spawn_watcher(mut cmd: Command) -> Result<WatcherHandle, WatchdogError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = cmd.spawn()?;
    if let Some(status) = child.try_wait()? {
        return Err(WatchdogError::ExitedEarly(status));
    }
    Ok(WatcherHandle { child })
}

// Keep the watcher out of the proxy's process group and console
#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(any(unix, windows)))]
fn detach(_cmd: &mut Command) {}
