/// Process Lifecycle Manager
///
/// **Core Responsibility:**
/// Stand up and tear down the system under test, and run the pre/post-test
/// hook scripts that prepare its environment.
///
/// **Process groups:**
/// - The server and each hook are spawned as leaders of their own process
///   group, detached from the grader's tree.
/// - Hooks may leave daemons behind (a database, a queue). Those are reaped
///   by signalling the whole group after the post hook, not by tracking pids.
/// - Cleanup is best-effort: a failed kill is recorded in a [`CleanupReport`]
///   and logged, never escalated.
///
/// **Waiting:**
/// Server start sleeps a fixed warm-up; hooks sleep a settle interval after
/// exiting. Hooks are optionally bounded by `hookTimeoutSeconds`.
use crate::config::GraderConfig;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

/// A process group id, as returned for a detached hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup(pub i32);

impl ProcessGroup {
    fn of(child: &Child) -> Option<Self> {
        child.id().map(|pid| ProcessGroup(pid as i32))
    }

    /// Send `signal` to every process in the group.
    ///
    /// A group that no longer exists counts as success.
    pub fn signal(&self, signal: i32) -> std::io::Result<()> {
        // SAFETY: kill(2) with a negative pid targets a process group and
        // touches no memory.
        let rc = unsafe { libc::kill(-self.0, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }

    pub fn terminate(&self) -> std::io::Result<()> {
        self.signal(libc::SIGTERM)
    }

    pub fn kill(&self) -> std::io::Result<()> {
        self.signal(libc::SIGKILL)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub group: ProcessGroup,
    pub error: String,
}

/// Diagnostics from best-effort group termination. Never fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn terminate(&mut self, group: ProcessGroup) {
        match group.terminate() {
            Ok(()) => debug!(pgid = group.0, "Terminated process group"),
            Err(e) => {
                warn!(pgid = group.0, error = %e, "Failed to terminate process group");
                self.failures.push(CleanupFailure {
                    group,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Result of the post hook: its own outcome plus the group cleanup it did.
#[derive(Debug)]
pub struct PostHookOutcome {
    pub hook: Result<()>,
    pub cleanup: CleanupReport,
}

/// A running server under test. Dropping it kills the server process.
#[derive(Debug)]
pub struct ServerHandle {
    child: Child,
    group: Option<ProcessGroup>,
    target: PathBuf,
}

impl ServerHandle {
    pub fn group(&self) -> Option<ProcessGroup> {
        self.group
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

pub struct LifecycleManager<'a> {
    config: &'a GraderConfig,
}

impl<'a> LifecycleManager<'a> {
    pub fn new(config: &'a GraderConfig) -> Self {
        Self { config }
    }

    /// Optionally run the install step, then launch the server in `path` and
    /// wait out the warm-up interval.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn start(&self, path: &Path, install_first: bool) -> Result<ServerHandle> {
        if install_first {
            let status = command_in(&self.config.setup_command, path)?
                .status()
                .await
                .with_context(|| format!("Failed to run install step in {}", path.display()))?;
            if !status.success() {
                bail!("Install step failed in {} ({})", path.display(), status);
            }
            info!("Install step finished");
        }

        let mut command = command_in(&self.config.run_command, path)?;
        command.process_group(0).kill_on_drop(true);
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to launch server in {}", path.display()))?;
        let group = ProcessGroup::of(&child);
        info!(pgid = group.map(|g| g.0), "Server launched, warming up");

        tokio::time::sleep(self.config.server_warmup()).await;

        if let Ok(Some(status)) = child.try_wait() {
            warn!(%status, "Server exited during warm-up");
        }

        Ok(ServerHandle {
            child,
            group,
            target: path.to_path_buf(),
        })
    }

    /// Terminate the server's group and wait for it; escalate to SIGKILL after
    /// the grace period.
    #[instrument(skip(self, handle), fields(path = %handle.target.display()))]
    pub async fn stop(&self, mut handle: ServerHandle) -> Result<()> {
        if let Ok(Some(status)) = handle.child.try_wait() {
            debug!(%status, "Server already exited");
            // Its group may still hold children.
            if let Some(group) = handle.group {
                let _ = group.kill();
            }
            return Ok(());
        }

        if let Some(group) = handle.group {
            group.terminate().context("Failed to signal server")?;
        }

        match tokio::time::timeout(self.config.server_stop_grace(), handle.child.wait()).await {
            Ok(status) => {
                let status = status.context("Failed to wait for server")?;
                info!(%status, "Server stopped");
            }
            Err(_) => {
                warn!("Server ignored SIGTERM, killing");
                if let Some(group) = handle.group {
                    group.kill().context("Failed to kill server")?;
                }
                handle.child.wait().await.context("Failed to wait for server")?;
            }
        }
        Ok(())
    }

    /// Run the pre-test hook in its own process group.
    ///
    /// Returns the group id so the post hook can reap what it left running.
    /// A missing script is skipped. A non-zero exit is an error and the
    /// hook's group is terminated before returning.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn run_pre_hook(&self, path: &Path) -> Result<Option<ProcessGroup>> {
        let script = path.join(&self.config.pre_test_script);
        if !script.exists() {
            info!(script = %script.display(), "No pre-test hook");
            return Ok(None);
        }

        let (group, status) = self.run_hook(&script, path).await?;
        if !status.success() {
            if let Some(group) = group {
                let mut cleanup = CleanupReport::default();
                cleanup.terminate(group);
            }
            bail!("Pre-test hook {} failed ({})", script.display(), status);
        }

        tokio::time::sleep(self.config.hook_settle()).await;
        Ok(group)
    }

    /// Run the post-test hook in its own group, then terminate both its group
    /// and the pre-hook's. Only the hook's own exit status can fail this.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn run_post_hook(
        &self,
        pre_group: Option<ProcessGroup>,
        path: &Path,
    ) -> PostHookOutcome {
        let script = path.join(&self.config.post_test_script);
        let mut cleanup = CleanupReport::default();

        let hook = if script.exists() {
            match self.run_hook(&script, path).await {
                Ok((group, status)) => {
                    tokio::time::sleep(self.config.hook_settle()).await;
                    if let Some(group) = group {
                        cleanup.terminate(group);
                    }
                    if status.success() {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!(
                            "Post-test hook {} failed ({})",
                            script.display(),
                            status
                        ))
                    }
                }
                Err(e) => Err(e),
            }
        } else {
            info!(script = %script.display(), "No post-test hook");
            Ok(())
        };

        if let Some(group) = pre_group {
            cleanup.terminate(group);
        }

        PostHookOutcome { hook, cleanup }
    }

    async fn run_hook(
        &self,
        script: &Path,
        path: &Path,
    ) -> Result<(Option<ProcessGroup>, ExitStatus)> {
        let mut child = Command::new("bash")
            .arg(script)
            .current_dir(path)
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to launch hook {}", script.display()))?;
        let group = ProcessGroup::of(&child);
        info!(script = %script.display(), pgid = group.map(|g| g.0), "Hook started");

        let status = match self.config.hook_timeout() {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    if let Some(group) = group {
                        let _ = group.kill();
                    }
                    let _ = child.wait().await;
                    bail!(
                        "Hook {} timed out after {}",
                        script.display(),
                        format_duration(limit)
                    );
                }
            },
            None => child.wait().await?,
        };

        info!(script = %script.display(), %status, "Hook finished");
        Ok((group, status))
    }
}

/// Build a command from an argv vector, running in `dir`.
fn command_in(argv: &[String], dir: &Path) -> Result<Command> {
    let Some((program, args)) = argv.split_first() else {
        bail!("Empty command");
    };
    let mut command = Command::new(program);
    command.args(args).current_dir(dir);
    Ok(command)
}

fn format_duration(d: Duration) -> String {
    format!("{:.1}s", d.as_secs_f64())
}
