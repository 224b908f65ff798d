//! Agent service: wires the bridge and launcher together
//!
//! ```text
//! REST facade ─► AgentService ─┬─► AgentBridge (registry, routing)
//!                              └─► AgentLauncher (processes)
//!                                       │
//!            lifecycle events ◄─────────┘  (consumed by one event loop)
//! ```

use crate::agent::bridge::AgentBridge;
use crate::agent::launcher::AgentLauncher;
use crate::agent::types::*;
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Session lifecycle front door used by the HTTP layer
pub struct AgentService {
    bridge: Arc<AgentBridge>,
    launcher: Arc<AgentLauncher>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl AgentService {
    /// Build the bridge and launcher and start the lifecycle event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &RelayConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(AgentBridge::new(config.bridge.clone(), events_tx.clone()));
        let launcher = Arc::new(AgentLauncher::new(
            config.cli.clone(),
            config.server.host.clone(),
            config.server.port,
            events_tx,
        ));

        let event_loop = Self::spawn_event_loop(bridge.clone(), launcher.clone(), events_rx);

        Arc::new(Self {
            bridge,
            launcher,
            event_loop: Mutex::new(Some(event_loop)),
        })
    }

    fn spawn_event_loop(
        bridge: Arc<AgentBridge>,
        launcher: Arc<AgentLauncher>,
        mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let session_id = event.session_id().to_string();
                if bridge.handle_lifecycle_event(event).await {
                    launcher.kill(&session_id).await;
                }
            }
            tracing::debug!("Lifecycle event loop stopped");
        })
    }

    pub fn bridge(&self) -> &Arc<AgentBridge> {
        &self.bridge
    }

    /// Register a session and launch its CLI process.
    ///
    /// A spawn failure leaves the session registered in `exited` state and
    /// returns the launch error.
    pub async fn create_session(&self, options: SessionOptions) -> Result<SessionInfo> {
        let session_id = self.bridge.create_session(options.clone()).await;
        self.bridge.track_process(&session_id).await;

        let pid = match self.launcher.spawn(&session_id, &options).await {
            Ok(pid) => pid,
            Err(e) => {
                self.bridge
                    .handle_lifecycle_event(LifecycleEvent::SpawnFailed {
                        session_id: session_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };

        let mut info = self
            .bridge
            .get_session(&session_id)
            .await
            .ok_or_else(|| Error::SessionNotFound(session_id.clone()))?;
        // The Spawned event may not have been applied yet
        info.pid = info.pid.or(pid);
        Ok(info)
    }

    /// Remove a session and terminate its process. Unknown ids are a no-op.
    pub async fn delete_session(&self, session_id: &str) -> bool {
        let removed = self.bridge.remove_session(session_id).await;
        self.launcher.kill(session_id).await;
        removed
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.bridge.get_session(session_id).await
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.bridge.list_sessions().await
    }

    /// Close all sockets, release processes and stop the event loop
    pub async fn shutdown(&self) {
        self.bridge.shutdown().await;
        self.launcher.shutdown().await;
        if let Ok(mut event_loop) = self.event_loop.lock() {
            if let Some(handle) = event_loop.take() {
                handle.abort();
            }
        }
        tracing::info!("Agent service shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config_with_cli(cli: crate::config::CliConfig) -> RelayConfig {
        RelayConfig {
            cli,
            ..Default::default()
        }
    }

    #[cfg(unix)]
    fn fake_cli(script: &str) -> crate::config::CliConfig {
        crate::config::CliConfig {
            binary: Some(PathBuf::from("/bin/sh")),
            leading_args: vec!["-c".to_string(), script.to_string(), "fake-claude".to_string()],
            ..Default::default()
        }
    }

    /// Poll until the session reaches `exited`
    async fn wait_for_exit(service: &AgentService, session_id: &str) -> SessionInfo {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(info) = service.get_session(session_id).await {
                    if info.state == SessionState::Exited {
                        return info;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session did not exit in time")
    }

    #[tokio::test]
    async fn test_spawn_failure_registers_exited_session() {
        let service = AgentService::new(&config_with_cli(crate::config::CliConfig {
            binary: Some(PathBuf::from("/nonexistent/dir/claude")),
            ..Default::default()
        }));

        let err = service
            .create_session(SessionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Launch(_)));

        let sessions = service.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, SessionState::Exited);
        assert_eq!(sessions[0].exit_code, Some(SYNTHETIC_EXIT_CODE));
        service.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_before_dial_back() {
        let service = AgentService::new(&config_with_cli(fake_cli("exit 4")));
        let info = service
            .create_session(SessionOptions::default())
            .await
            .unwrap();
        assert!(info.pid.is_some());

        let exited = wait_for_exit(&service, &info.session_id).await;
        assert_eq!(exited.exit_code, Some(4));
        service.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dial_back_timeout_kills_process() {
        let mut cli = fake_cli("sleep 30");
        cli.dial_back_timeout_secs = 1;
        let service = AgentService::new(&config_with_cli(cli));
        let info = service
            .create_session(SessionOptions::default())
            .await
            .unwrap();

        let exited = wait_for_exit(&service, &info.session_id).await;
        assert_eq!(exited.exit_code, Some(SYNTHETIC_EXIT_CODE));

        tokio::time::timeout(Duration::from_secs(10), async {
            while service.launcher.is_running(&info.session_id).await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("process was not killed");
        service.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_delete_session_idempotent() {
        let service = AgentService::new(&config_with_cli(fake_cli("sleep 30")));
        let info = service
            .create_session(SessionOptions {
                cwd: Some(std::env::temp_dir().to_string_lossy().to_string()),
                model: Some("claude-sonnet-4".to_string()),
                permission_mode: None,
            })
            .await
            .unwrap();
        assert_eq!(info.model.as_deref(), Some("claude-sonnet-4"));

        assert!(service.delete_session(&info.session_id).await);
        assert!(service.get_session(&info.session_id).await.is_none());
        assert!(!service.delete_session(&info.session_id).await);
        assert!(!service.delete_session("never-existed").await);
        service.shutdown().await;
    }
}
