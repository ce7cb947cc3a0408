//! Child process-tree supervision.
//!
//! The child is spawned as the leader of a fresh process group so one
//! signal reaches every descendant. A dedicated waiter task owns the
//! child handle and reaps it the moment it exits, publishing the exit
//! code over a watch channel; teardown never contends with the waiter.
//! Teardown escalates: SIGTERM to the group, liveness polling every
//! 25 ms up to the caller's deadline, then SIGKILL to the group and to
//! the root, with a short grace window for the kernel to reap. `stop` is
//! idempotent; a tree that survives both signals is reported with both
//! failures so the lifecycle can classify the run as failed.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

/// Liveness polling interval during teardown.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Grace window after SIGKILL for the kernel to reap the root.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Supervision errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Spawning the child failed.
    #[error("failed to spawn '{command}': {source}")]
    SpawnFailed {
        /// Command that failed.
        command: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The spawned child reported no PID.
    #[error("spawned child has no pid")]
    NoPid,

    /// The tree outlived both the graceful and forceful signals.
    #[error("process tree survived teardown (graceful: {graceful}; forceful: {forceful})")]
    TreeSurvived {
        /// Result of the graceful group signal.
        graceful: String,
        /// Result of the forceful signals.
        forceful: String,
    },
}

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct ChildSpec {
    /// Program to execute.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory, when set.
    pub dir: Option<PathBuf>,
}

impl ChildSpec {
    /// Builds a spec for `command` with `args`.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            dir: None,
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }
}

/// Exit report published by the waiter: `None` until exit, then
/// `Some(code)` where `code` is `None` for signal deaths.
type ExitReport = Option<Option<i32>>;

/// Supervisor over one spawned child tree.
#[derive(Debug)]
pub struct Supervisor {
    spec: ChildSpec,
    stdout: Mutex<Option<ChildStdout>>,
    stderr: Mutex<Option<ChildStderr>>,
    exit_rx: watch::Receiver<ExitReport>,
    pid: i32,
    pgid: i32,
}

impl Supervisor {
    /// Spawns the child in its own process group.
    ///
    /// Must be called on a tokio runtime: the reaper runs as a spawned
    /// task.
    ///
    /// # Errors
    ///
    /// Fails when the command cannot be spawned or reports no PID.
    pub fn start(spec: ChildSpec) -> Result<Self, SupervisorError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(dir) = &spec.dir {
            cmd.current_dir(dir);
        }
        // SAFETY: setpgid in the forked child before exec touches no
        // parent state; it only makes the child its own group leader so
        // group signals reach the whole tree.
        unsafe {
            cmd.pre_exec(|| {
                if nix::libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
            command: spec.command.clone(),
            source,
        })?;
        let pid = child.id().ok_or(SupervisorError::NoPid)? as i32;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        debug!(pid, command = %spec.command, "child spawned in new process group");

        let (exit_tx, exit_rx) = watch::channel::<ExitReport>(None);
        tokio::spawn(async move {
            let report = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(pid, %err, "waiting on child failed");
                    None
                }
            };
            let _ = exit_tx.send(Some(report));
        });

        Ok(Self {
            spec,
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
            exit_rx,
            pid,
            // The child is its own group leader.
            pgid: pid,
        })
    }

    /// Root PID of the tree.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Process-group ID recorded at start.
    #[must_use]
    pub const fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Spec the child was started from.
    #[must_use]
    pub const fn spec(&self) -> &ChildSpec {
        &self.spec
    }

    /// Hands the piped stdout to the caller (once).
    pub async fn take_stdout(&self) -> Option<ChildStdout> {
        self.stdout.lock().await.take()
    }

    /// Hands the piped stderr to the caller (once).
    pub async fn take_stderr(&self) -> Option<ChildStderr> {
        self.stderr.lock().await.take()
    }

    /// Exit report: `None` while running, `Some(code)` once reaped.
    #[must_use]
    pub fn exit_status(&self) -> ExitReport {
        *self.exit_rx.borrow()
    }

    /// Whether the root has exited and been reaped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Waits for the child to exit without signaling it, returning the
    /// exit code (`None` for signal deaths).
    pub async fn wait(&self) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(report) = *rx.borrow() {
                return report;
            }
            if rx.changed().await.is_err() {
                // Waiter gone; the borrow holds the final value.
                return rx.borrow().unwrap_or(None);
            }
        }
    }

    /// Tears down the whole tree.
    ///
    /// SIGTERM goes to the group first; if the root outlives `timeout`,
    /// SIGKILL goes to the group and then to the root PID. Repeated
    /// calls after a confirmed stop are no-ops.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::TreeSurvived`] when the root is still alive
    /// after the forceful escalation and grace window.
    pub async fn stop(&self, timeout: Duration) -> Result<(), SupervisorError> {
        if self.is_stopped() {
            return Ok(());
        }

        let group = Pid::from_raw(self.pgid);
        let graceful = match killpg(group, Signal::SIGTERM) {
            Ok(()) => "sigterm delivered".to_string(),
            Err(nix::errno::Errno::ESRCH) => "group already gone".to_string(),
            Err(err) => format!("sigterm failed: {err}"),
        };

        if self.poll_exit(timeout).await {
            return Ok(());
        }

        // Grandchildren ignoring SIGTERM still die here; the direct root
        // kill covers a root that escaped its group.
        let group_kill = killpg(group, Signal::SIGKILL);
        let root_kill = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
        let forceful = format!(
            "group sigkill: {}; root sigkill: {}",
            result_label(group_kill),
            result_label(root_kill)
        );

        if self.poll_exit(KILL_GRACE).await {
            return Ok(());
        }

        warn!(pid = self.pid, pgid = self.pgid, "process tree survived teardown");
        Err(SupervisorError::TreeSurvived { graceful, forceful })
    }

    /// Polls the exit report every 25 ms until the child exits or the
    /// deadline passes.
    async fn poll_exit(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_stopped() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn result_label(result: Result<(), nix::errno::Errno>) -> String {
    match result {
        Ok(()) => "delivered".to_string(),
        Err(nix::errno::Errno::ESRCH) => "no such process".to_string(),
        Err(err) => err.to_string(),
    }
}

/// PIDs currently in process group `pgid`, from `/proc`.
///
/// Used to audit stragglers after a failed teardown; descendants that
/// reparented out of the group before the snapshot are not listed and
/// are classified as orphan suspects by the caller.
#[must_use]
pub fn group_member_pids(pgid: i32) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut members = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        // pgrp is the third field after the parenthesized comm.
        let Some(after_comm) = stat.rfind(')').map(|i| &stat[i + 1..]) else {
            continue;
        };
        if let Some(found) = after_comm.split_whitespace().nth(2) {
            if found.parse::<i32>() == Ok(pgid) {
                members.push(pid);
            }
        }
    }
    members
}

/// Guard returned by [`trap_signals`]; dropping it releases the trap.
#[derive(Debug)]
pub struct SignalTrap {
    handle: tokio::task::JoinHandle<()>,
}

impl SignalTrap {
    /// Releases the trap without waiting for a signal.
    pub fn untrap(self) {
        self.handle.abort();
    }
}

impl Drop for SignalTrap {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Installs a scoped signal trap that tears the tree down on
/// SIGINT/SIGTERM (plus any `extra` signals) and then invokes
/// `after_stop`.
///
/// The returned guard releases the trap when dropped, so a normal exit
/// path does not race the handler.
pub fn trap_signals<F>(
    supervisor: std::sync::Arc<Supervisor>,
    timeout: Duration,
    extra: Vec<Signal>,
    after_stop: F,
) -> SignalTrap
where
    F: FnOnce() + Send + 'static,
{
    let handle = tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "failed to register SIGINT trap");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "failed to register SIGTERM trap");
                return;
            }
        };
        let mut extras: Vec<_> = extra
            .into_iter()
            .filter_map(|sig| signal(SignalKind::from_raw(sig as i32)).ok())
            .collect();

        let extra_wait = async {
            if extras.is_empty() {
                std::future::pending::<()>().await;
            } else {
                let mut waits: Vec<_> = extras.iter_mut().map(|s| Box::pin(s.recv())).collect();
                std::future::poll_fn(move |cx| {
                    for fut in &mut waits {
                        if fut.as_mut().poll(cx).is_ready() {
                            return std::task::Poll::Ready(());
                        }
                    }
                    std::task::Poll::Pending
                })
                .await;
            }
        };

        tokio::select! {
            _ = sigint.recv() => debug!("trapped SIGINT"),
            _ = sigterm.recv() => debug!("trapped SIGTERM"),
            () = extra_wait => debug!("trapped user signal"),
        }

        if let Err(err) = supervisor.stop(timeout).await {
            warn!(%err, "teardown from signal trap failed");
        }
        after_stop();
    });
    SignalTrap { handle }
}

/// Reads lines from a child stream into the provided sink until EOF.
pub async fn pump_lines<R, F>(reader: R, mut sink: F)
where
    R: tokio::io::AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(script: &str) -> ChildSpec {
        ChildSpec::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn stop_terminates_process_tree() {
        // The child spawns its own grandchild; both share the group.
        let supervisor = Supervisor::start(spec("sleep 120 & echo $!; wait")).unwrap();
        let mut stdout = supervisor.take_stdout().await.unwrap();
        let mut reader = BufReader::new(&mut stdout).lines();
        let grandchild: i32 = reader
            .next_line()
            .await
            .unwrap()
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        supervisor.stop(Duration::from_secs(2)).await.unwrap();

        assert!(wait_for_exit(supervisor.pid(), Duration::from_secs(2)).await);
        assert!(wait_for_exit(grandchild, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn stop_kills_sigterm_ignoring_tree() {
        // Both levels ignore SIGTERM; only the group SIGKILL gets them.
        let supervisor = Supervisor::start(spec(
            "trap '' TERM; sh -c \"trap '' TERM; sleep 120\" & echo $!; wait",
        ))
        .unwrap();
        let mut stdout = supervisor.take_stdout().await.unwrap();
        let mut reader = BufReader::new(&mut stdout).lines();
        let child: i32 = reader
            .next_line()
            .await
            .unwrap()
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        supervisor.stop(Duration::from_millis(300)).await.unwrap();

        assert!(wait_for_exit(supervisor.pid(), Duration::from_secs(3)).await);
        assert!(wait_for_exit(child, Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let supervisor = Supervisor::start(spec("sleep 120")).unwrap();
        supervisor.stop(Duration::from_millis(500)).await.unwrap();
        supervisor.stop(Duration::from_millis(500)).await.unwrap();
        assert!(supervisor.is_stopped());
    }

    #[tokio::test]
    async fn stop_after_natural_exit_is_a_no_op() {
        let supervisor = Supervisor::start(spec("true")).unwrap();
        let code = supervisor.wait().await;
        assert_eq!(code, Some(0));
        supervisor.stop(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_reports_exit_codes() {
        let supervisor = Supervisor::start(spec("exit 7")).unwrap();
        assert_eq!(supervisor.wait().await, Some(7));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let result = Supervisor::start(ChildSpec::new("nonexistent_command_12345", vec![]));
        assert!(matches!(result, Err(SupervisorError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn group_members_are_visible() {
        let supervisor = Supervisor::start(spec("sleep 120 & sleep 120 & wait")).unwrap();
        // Give the shell a beat to fork its children.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let members = group_member_pids(supervisor.pgid());
        assert!(
            members.len() >= 2,
            "expected the tree in the group, got {members:?}"
        );
        supervisor.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn trap_runs_stop_on_user_signal() {
        let supervisor = std::sync::Arc::new(Supervisor::start(spec("sleep 120")).unwrap());
        let pid = supervisor.pid();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _trap = trap_signals(
            supervisor.clone(),
            Duration::from_millis(500),
            vec![Signal::SIGUSR1],
            move || {
                let _ = tx.send(());
            },
        );
        // Let the handler register before raising the signal.
        tokio::time::sleep(Duration::from_millis(100)).await;
        kill(Pid::from_raw(std::process::id() as i32), Signal::SIGUSR1).unwrap();

        tokio::time::timeout(Duration::from_secs(3), rx)
            .await
            .expect("trap did not fire")
            .unwrap();
        assert!(wait_for_exit(pid, Duration::from_secs(2)).await);
    }

    async fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if kill(Pid::from_raw(pid), None).is_err() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        kill(Pid::from_raw(pid), None).is_err()
    }
}
