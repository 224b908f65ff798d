//! CLI process lifecycle management
//!
//! Spawns one coding-assistant CLI process per session, pointed back at this
//! server via `--sdk-url`. Process exit, pid and dial-back deadlines are
//! reported to the bridge as [`LifecycleEvent`]s; the launcher never touches
//! session state directly.

use crate::agent::types::{LifecycleEvent, SessionOptions, SYNTHETIC_EXIT_CODE};
use crate::config::CliConfig;
use crate::error::Error;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, RwLock};

/// How long a terminated process gets before it is force killed
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Live process bookkeeping. The `Child` itself is owned by its exit monitor.
struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Manages CLI process lifecycles
pub struct AgentLauncher {
    config: CliConfig,
    /// Host embedded in the dial-back URL
    host: String,
    /// Listen port embedded in the dial-back URL
    port: u16,
    processes: Arc<RwLock<HashMap<String, ProcessHandle>>>,
    events: mpsc::UnboundedSender<LifecycleEvent>,
}

impl AgentLauncher {
    /// Create a new launcher
    pub fn new(
        config: CliConfig,
        host: impl Into<String>,
        port: u16,
        events: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Self {
        Self {
            config,
            host: host.into(),
            port,
            processes: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// WebSocket URL the CLI dials back to
    pub fn callback_url(&self, session_id: &str) -> String {
        let host = match self.host.as_str() {
            "" | "0.0.0.0" | "::" | "[::]" => "127.0.0.1".to_string(),
            h if h.contains(':') && !h.starts_with('[') => format!("[{}]", h),
            h => h.to_string(),
        };
        format!("ws://{}:{}/ws/cli/{}", host, self.port, session_id)
    }

    /// Full argument list for a session's CLI process
    pub fn build_args(&self, session_id: &str, options: &SessionOptions) -> Vec<String> {
        let mut args = self.config.leading_args.clone();
        args.extend([
            "--sdk-url".to_string(),
            self.callback_url(session_id),
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ]);

        if let Some(ref m) = options.model {
            args.push("--model".to_string());
            args.push(m.clone());
        }
        if let Some(ref pm) = options.permission_mode {
            args.push("--permission-mode".to_string());
            args.push(pm.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());

        // Headless mode with empty prompt
        args.push("-p".to_string());
        args.push(String::new());
        args
    }

    /// Spawn the CLI process for a session.
    ///
    /// On success a `Spawned` event is emitted and the exit monitor and
    /// dial-back deadline are armed.
    pub async fn spawn(&self, session_id: &str, options: &SessionOptions) -> crate::Result<Option<u32>> {
        let binary = resolve_cli_binary(self.config.binary.as_deref())?;
        let working_dir = match options.cwd {
            Some(ref cwd) => PathBuf::from(cwd),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/tmp")),
        };
        let args = self.build_args(session_id, options);

        tracing::info!(
            session_id,
            binary = %binary.display(),
            cwd = %working_dir.display(),
            "Spawning CLI process"
        );

        let mut child = Command::new(&binary)
            .args(&args)
            .current_dir(&working_dir)
            .env("CLAUDECODE", "1")
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(self.config.kill_on_shutdown)
            .spawn()
            .map_err(|e| {
                Error::Launch(format!(
                    "Failed to spawn CLI at {}: {}",
                    binary.display(),
                    e
                ))
            })?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            drain_output(session_id.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            drain_output(session_id.to_string(), "stderr", stderr);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        self.processes.write().await.insert(
            session_id.to_string(),
            ProcessHandle {
                pid,
                kill_tx: Some(kill_tx),
            },
        );

        let _ = self.events.send(LifecycleEvent::Spawned {
            session_id: session_id.to_string(),
            pid,
        });
        self.spawn_exit_monitor(session_id.to_string(), child, kill_rx);
        self.arm_dial_back_timeout(session_id.to_string());

        Ok(pid)
    }

    /// Ask a process to terminate (SIGTERM, then force kill after a grace
    /// period). Returns false when no live process is known.
    pub async fn kill(&self, session_id: &str) -> bool {
        let mut processes = self.processes.write().await;
        let Some(kill_tx) = processes
            .get_mut(session_id)
            .and_then(|h| h.kill_tx.take())
        else {
            return false;
        };
        tracing::info!(session_id, "Killing CLI process");
        kill_tx.send(()).is_ok()
    }

    pub async fn pid(&self, session_id: &str) -> Option<u32> {
        self.processes
            .read()
            .await
            .get(session_id)
            .and_then(|h| h.pid)
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        self.processes.read().await.contains_key(session_id)
    }

    /// Release all processes. Children are only terminated when
    /// `kill_on_shutdown` is configured.
    pub async fn shutdown(&self) {
        let mut processes = self.processes.write().await;
        if self.config.kill_on_shutdown {
            for (session_id, handle) in processes.iter_mut() {
                if let Some(kill_tx) = handle.kill_tx.take() {
                    tracing::debug!(session_id = %session_id, "Terminating CLI process on shutdown");
                    let _ = kill_tx.send(());
                }
            }
        } else {
            tracing::info!(count = processes.len(), "Leaving CLI processes running");
            // Dropping the kill senders detaches the monitors
            processes.clear();
        }
    }

    /// Spawn a task that owns the child and reports its exit
    fn spawn_exit_monitor(
        &self,
        session_id: String,
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
    ) {
        let processes = self.processes.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => terminate(&session_id, &mut child).await,
            };

            let exit_code = match status {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    tracing::warn!(session_id = %session_id, "Failed to wait for CLI process: {}", e);
                    Some(SYNTHETIC_EXIT_CODE)
                }
            };

            tracing::info!(
                session_id = %session_id,
                exit_code = ?exit_code,
                uptime_ms = started.elapsed().as_millis() as u64,
                "CLI process exited"
            );

            processes.write().await.remove(&session_id);
            let _ = events.send(LifecycleEvent::Exited {
                session_id,
                exit_code,
            });
        });
    }

    fn arm_dial_back_timeout(&self, session_id: String) {
        let events = self.events.clone();
        let timeout = self.config.dial_back_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(LifecycleEvent::DialBackTimeout { session_id });
        });
    }
}

/// Graceful terminate with a forced fallback
async fn terminate(session_id: &str, child: &mut Child) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain signal delivery to a pid we spawned and still own
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(session_id, "Force killing CLI process");
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Exit code, or 128 + signal number for signal deaths
fn exit_code_of(status: ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + signal);
        }
    }
    None
}

/// Forward a child's output to the log, line by line
fn drain_output<R>(session_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(session_id = %session_id, stream, "{}", line);
        }
    });
}

/// Resolve the CLI binary: configured path, then `claude` on PATH, then
/// common install locations
pub fn resolve_cli_binary(configured: Option<&Path>) -> crate::Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        // Bare command names are looked up on PATH
        if path.components().count() == 1 {
            if let Some(found) = find_in_path(&path.to_string_lossy()) {
                return Ok(found);
            }
        }
        return Err(Error::Launch(format!(
            "Configured CLI binary not found: {}",
            path.display()
        )));
    }

    if let Some(found) = find_in_path("claude") {
        return Ok(found);
    }

    // Check common locations
    let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let candidates = [
        home.join(".claude").join("local").join("claude"),
        PathBuf::from("/usr/local/bin/claude"),
        PathBuf::from("/opt/homebrew/bin/claude"),
    ];

    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }

    Err(Error::Launch(
        "Claude Code CLI not found. Install it from https://claude.ai/code".to_string(),
    ))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_launcher(config: CliConfig) -> (AgentLauncher, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AgentLauncher::new(config, "127.0.0.1", 3456, tx), rx)
    }

    /// A shell standing in for the CLI; generated args become positional
    /// parameters and are ignored
    #[cfg(unix)]
    fn fake_cli(script: &str) -> CliConfig {
        CliConfig {
            binary: Some(PathBuf::from("/bin/sh")),
            leading_args: vec!["-c".to_string(), script.to_string(), "fake-claude".to_string()],
            ..Default::default()
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> LifecycleEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for lifecycle event")
            .expect("event channel closed")
    }

    #[test]
    fn test_callback_url() {
        let (launcher, _rx) = make_launcher(CliConfig::default());
        assert_eq!(
            launcher.callback_url("abc-123"),
            "ws://127.0.0.1:3456/ws/cli/abc-123"
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        let wildcard = AgentLauncher::new(CliConfig::default(), "0.0.0.0", 8080, tx);
        assert_eq!(wildcard.callback_url("s1"), "ws://127.0.0.1:8080/ws/cli/s1");
    }

    #[test]
    fn test_build_args_with_options() {
        let (launcher, _rx) = make_launcher(CliConfig {
            extra_args: vec!["--debug".to_string()],
            ..Default::default()
        });
        let options = SessionOptions {
            cwd: None,
            model: Some("claude-sonnet-4".to_string()),
            permission_mode: Some("plan".to_string()),
        };
        let args = launcher.build_args("s1", &options);
        assert_eq!(
            args,
            vec![
                "--sdk-url",
                "ws://127.0.0.1:3456/ws/cli/s1",
                "--print",
                "--output-format",
                "stream-json",
                "--input-format",
                "stream-json",
                "--verbose",
                "--model",
                "claude-sonnet-4",
                "--permission-mode",
                "plan",
                "--debug",
                "-p",
                "",
            ]
        );
    }

    #[test]
    fn test_build_args_minimal() {
        let (launcher, _rx) = make_launcher(CliConfig::default());
        let args = launcher.build_args("s1", &SessionOptions::default());
        assert!(!args.contains(&"--model".to_string()));
        assert!(!args.contains(&"--permission-mode".to_string()));
        assert_eq!(&args[args.len() - 2..], &["-p".to_string(), String::new()]);
    }

    #[test]
    fn test_resolve_configured_binary() {
        let dir = tempfile::TempDir::new().unwrap();
        let binary = dir.path().join("claude");
        std::fs::write(&binary, "#!/bin/sh\n").unwrap();
        assert_eq!(resolve_cli_binary(Some(binary.as_path())).unwrap(), binary);
    }

    #[test]
    fn test_resolve_missing_configured_binary() {
        let result = resolve_cli_binary(Some(Path::new("/nonexistent/dir/claude")));
        assert!(matches!(result, Err(Error::Launch(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_of_signal() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code_of(ExitStatus::from_raw(3 << 8)), Some(3));
        assert_eq!(exit_code_of(ExitStatus::from_raw(libc::SIGTERM)), Some(143));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let (launcher, mut rx) = make_launcher(CliConfig {
            binary: Some(PathBuf::from("/nonexistent/dir/claude")),
            ..Default::default()
        });
        let result = launcher.spawn("s1", &SessionOptions::default()).await;
        assert!(matches!(result, Err(Error::Launch(_))));
        assert!(rx.try_recv().is_err());
        assert!(!launcher.is_running("s1").await);
    }

    #[tokio::test]
    async fn test_kill_unknown_session() {
        let (launcher, _rx) = make_launcher(CliConfig::default());
        assert!(!launcher.kill("nope").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_reports_exit_code() {
        let (launcher, mut rx) = make_launcher(fake_cli("exit 3"));
        let pid = launcher.spawn("s1", &SessionOptions::default()).await.unwrap();
        assert!(pid.is_some());

        assert_eq!(
            next_event(&mut rx).await,
            LifecycleEvent::Spawned {
                session_id: "s1".to_string(),
                pid
            }
        );
        assert_eq!(
            next_event(&mut rx).await,
            LifecycleEvent::Exited {
                session_id: "s1".to_string(),
                exit_code: Some(3)
            }
        );
        assert!(!launcher.is_running("s1").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_terminates_process() {
        let (launcher, mut rx) = make_launcher(fake_cli("sleep 30"));
        launcher.spawn("s1", &SessionOptions::default()).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, LifecycleEvent::Spawned { .. }));
        assert!(launcher.is_running("s1").await);
        assert!(launcher.pid("s1").await.is_some());

        assert!(launcher.kill("s1").await);
        // A second kill request is a no-op while termination is in flight
        assert!(!launcher.kill("s1").await);

        match next_event(&mut rx).await {
            LifecycleEvent::Exited { exit_code, .. } => assert_ne!(exit_code, Some(0)),
            other => panic!("Expected Exited, got {:?}", other),
        }
        assert!(!launcher.is_running("s1").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dial_back_timeout_event() {
        let mut config = fake_cli("sleep 30");
        config.dial_back_timeout_secs = 1;
        let (launcher, mut rx) = make_launcher(config);
        launcher.spawn("s1", &SessionOptions::default()).await.unwrap();

        assert!(matches!(next_event(&mut rx).await, LifecycleEvent::Spawned { .. }));
        assert_eq!(
            next_event(&mut rx).await,
            LifecycleEvent::DialBackTimeout {
                session_id: "s1".to_string()
            }
        );
        launcher.kill("s1").await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_leaves_children_by_default() {
        let (launcher, mut rx) = make_launcher(fake_cli("sleep 30"));
        launcher.spawn("s1", &SessionOptions::default()).await.unwrap();
        let pid = match next_event(&mut rx).await {
            LifecycleEvent::Spawned { pid, .. } => pid.unwrap(),
            other => panic!("Expected Spawned, got {:?}", other),
        };

        launcher.shutdown().await;
        assert!(!launcher.is_running("s1").await);
        // Still alive: signal 0 probes without delivering anything
        assert_eq!(unsafe { libc::kill(pid as i32, 0) }, 0);
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}
