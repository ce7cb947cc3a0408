//! `flowforge daemon {start|stop|status|logs}`.
//!
//! The daemon is the HTTP control plane detached into the background
//! via the classic double-fork. Runtime artifacts (PID file, daemon
//! metadata, log file) live under the runtime directory
//! (`FLOWFORGE_RUNTIME_DIR`, defaulting to `~/.flowforge`).
//!
//! Fork safety: the fork happens in the synchronous CLI entry path,
//! BEFORE any tokio runtime exists. `fork()` in a multi-threaded
//! process is undefined behavior — only the calling thread survives
//! into the child, and locks held by other threads stay held forever —
//! so the runtime is constructed strictly after the second fork.

use std::io::{BufRead, Seek};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use flowforge_core::config::Config;
use flowforge_core::crypto::EncryptionPolicy;
use flowforge_core::ledger::Ledger;
use flowforge_core::lifecycle::{LifecycleConfig, LifecycleManager};
use flowforge_core::procstat::process_exists;
use flowforge_core::redact::Redactor;
use flowforge_core::state::ProcessStateHandle;
use flowforge_daemon::AppState;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// How long `start` waits for the daemon to pass its health probe.
const START_HEALTH_DEADLINE: Duration = Duration::from_secs(5);

/// Runtime directory for PID/log/metadata files.
fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FLOWFORGE_RUNTIME_DIR") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".flowforge"))
        .unwrap_or_else(|_| PathBuf::from("/tmp/flowforge"))
}

fn pid_file() -> PathBuf {
    runtime_dir().join("flowforge.pid")
}

fn meta_file() -> PathBuf {
    runtime_dir().join("daemon.json")
}

fn log_file() -> PathBuf {
    runtime_dir().join("flowforge.log")
}

fn read_daemon_pid() -> Option<i32> {
    std::fs::read_to_string(pid_file())
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .filter(|pid| *pid > 0)
}

fn write_meta(pid: i32, port: u16) -> Result<()> {
    let meta = serde_json::json!({
        "pid": pid,
        "port": port,
        "started_at": chrono::Utc::now().to_rfc3339(),
    });
    std::fs::write(meta_file(), meta.to_string()).context("write daemon metadata")?;
    Ok(())
}

fn read_meta() -> Option<serde_json::Value> {
    std::fs::read_to_string(meta_file())
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
}

fn health_url(port: u16) -> String {
    if let Ok(url) = std::env::var("FLOWFORGE_HEALTHCHECK_URL") {
        let trimmed = url.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    format!("http://127.0.0.1:{port}/healthz")
}

fn probe_health(port: u16) -> bool {
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };
    client
        .get(health_url(port))
        .send()
        .map(|response| response.status().is_success())
        .unwrap_or(false)
}

/// Starts the daemon in the background.
pub fn start(port: u16) -> Result<()> {
    if let Some(pid) = read_daemon_pid() {
        if process_exists(pid) {
            println!("flowforge daemon already running (pid {pid})");
            return Ok(());
        }
        let _ = std::fs::remove_file(pid_file());
    }
    std::fs::create_dir_all(runtime_dir()).context("create runtime directory")?;

    match daemonize()? {
        ForkOutcome::Parent => {
            // Parent: wait for the child to come up healthy.
            let deadline = std::time::Instant::now() + START_HEALTH_DEADLINE;
            while std::time::Instant::now() < deadline {
                if probe_health(port) {
                    let pid = read_daemon_pid().unwrap_or_default();
                    println!("flowforge daemon started (pid {pid}, port {port})");
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(200));
            }
            bail!("daemon did not pass its health probe within {START_HEALTH_DEADLINE:?}");
        }
        ForkOutcome::DaemonChild => {
            // Child: record identity, then run the control plane until
            // signaled. Exit instead of returning so the CLI epilogue
            // never runs here.
            let pid = std::process::id() as i32;
            std::fs::write(pid_file(), pid.to_string()).context("write pid file")?;
            write_meta(pid, port)?;
            let result = run_daemon(port);
            let _ = std::fs::remove_file(pid_file());
            let _ = std::fs::remove_file(meta_file());
            std::process::exit(i32::from(result.is_err()));
        }
    }
}

enum ForkOutcome {
    Parent,
    DaemonChild,
}

/// Double-fork into the background.
fn daemonize() -> Result<ForkOutcome> {
    use nix::unistd::{ForkResult, fork, setsid};

    // SAFETY: we are in the synchronous CLI entry path; no tokio
    // runtime or helper threads exist yet, so only this thread is
    // duplicated and no lock can be left behind in the child.
    match unsafe { fork() }.context("first fork")? {
        ForkResult::Parent { .. } => return Ok(ForkOutcome::Parent),
        ForkResult::Child => {}
    }

    // New session: lose the controlling terminal.
    setsid().context("setsid")?;

    // SAFETY: still single-threaded; see above. The second fork keeps
    // the daemon from ever reacquiring a controlling terminal.
    match unsafe { fork() }.context("second fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    std::env::set_current_dir("/").context("chdir to /")?;
    Ok(ForkOutcome::DaemonChild)
}

/// Composes and serves the control plane (daemon child only).
fn run_daemon(port: u16) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;
    runtime.block_on(async move {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file())
            .context("open daemon log file")?;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("info"))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(log)
                    .with_ansi(false),
            )
            .init();

        let config = Config::from_env();
        let encryption = EncryptionPolicy::from_master_key(config.master_key.as_deref())
            .context("invalid FLOWFORGE_MASTER_KEY")?;
        let ledger = Arc::new(
            Ledger::open(&config.db_path, encryption, Redactor::new()).context("open ledger")?,
        );
        let process_state = ProcessStateHandle::new();
        let lifecycle = LifecycleManager::new(
            LifecycleConfig::default(),
            ledger.clone(),
            process_state.clone(),
            None,
        )
        .spawn();
        let app = AppState::new(config, ledger, process_state, lifecycle);

        let shutdown = async {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM");
            let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT");
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
            }
        };
        flowforge_daemon::serve(app, port, shutdown)
            .await
            .context("serve control plane")
    })
}

/// Stops the background daemon.
pub fn stop() -> Result<()> {
    let Some(pid) = read_daemon_pid() else {
        println!("flowforge daemon is not running");
        return Ok(());
    };
    if !process_exists(pid) {
        let _ = std::fs::remove_file(pid_file());
        let _ = std::fs::remove_file(meta_file());
        println!("flowforge daemon is not running (stale pid file removed)");
        return Ok(());
    }

    kill(Pid::from_raw(pid), Signal::SIGTERM).context("signal daemon")?;
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while std::time::Instant::now() < deadline {
        if !process_exists(pid) {
            let _ = std::fs::remove_file(pid_file());
            let _ = std::fs::remove_file(meta_file());
            println!("flowforge daemon stopped");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    // Escalate like the supervisor would.
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    let _ = std::fs::remove_file(pid_file());
    let _ = std::fs::remove_file(meta_file());
    println!("flowforge daemon force-killed");
    Ok(())
}

/// Reports daemon status, optionally as JSON.
pub fn status(as_json: bool) -> Result<()> {
    let pid = read_daemon_pid();
    let alive = pid.is_some_and(process_exists);
    let meta = read_meta();
    let port = meta
        .as_ref()
        .and_then(|m| m.get("port").and_then(serde_json::Value::as_u64))
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(8080);
    let started_at = meta
        .as_ref()
        .and_then(|m| m.get("started_at").and_then(serde_json::Value::as_str))
        .map(String::from);
    let api_healthy = alive && probe_health(port);
    let state_present = Config::from_env().db_path.exists();

    if as_json {
        let mut payload = serde_json::json!({
            "status": if alive { "running" } else { "stopped" },
            "pid": pid.unwrap_or(0),
            "api_healthy": api_healthy,
            "port": port,
            "runtime_dir": runtime_dir(),
            "pid_file": pid_file(),
            "log_file": log_file(),
            "state_present": state_present,
        });
        if let Some(started_at) = started_at {
            payload["started_at"] = serde_json::Value::String(started_at);
        }
        println!("{payload}");
    } else if alive {
        println!(
            "flowforge daemon running (pid {}, port {port}, api {})",
            pid.unwrap_or(0),
            if api_healthy { "healthy" } else { "unhealthy" }
        );
    } else {
        println!("flowforge daemon stopped");
    }

    if !as_json && alive && !api_healthy {
        std::process::exit(1);
    }
    Ok(())
}

/// Tails the daemon log file.
pub fn logs(lines: usize, follow: bool) -> Result<()> {
    let path = log_file();
    let file = std::fs::File::open(&path)
        .with_context(|| format!("no daemon log at {}", path.display()))?;

    let reader = std::io::BufReader::new(&file);
    let all: Vec<String> = reader.lines().map_while(Result::ok).collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        println!("{line}");
    }

    if follow {
        let mut file = file;
        let mut position = file.seek(std::io::SeekFrom::End(0)).context("seek log")?;
        loop {
            std::thread::sleep(Duration::from_millis(500));
            let len = file.metadata().map(|m| m.len()).unwrap_or(position);
            if len > position {
                file.seek(std::io::SeekFrom::Start(position)).context("seek log")?;
                let reader = std::io::BufReader::new(&file);
                for line in reader.lines().map_while(Result::ok) {
                    println!("{line}");
                }
                position = len;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_dir_honors_override() {
        std::env::set_var("FLOWFORGE_RUNTIME_DIR", "/tmp/flowforge-test-runtime");
        assert_eq!(runtime_dir(), PathBuf::from("/tmp/flowforge-test-runtime"));
        std::env::remove_var("FLOWFORGE_RUNTIME_DIR");
    }

    #[test]
    fn health_url_defaults_to_loopback() {
        std::env::remove_var("FLOWFORGE_HEALTHCHECK_URL");
        assert_eq!(health_url(8080), "http://127.0.0.1:8080/healthz");
    }
}
