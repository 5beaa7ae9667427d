//! Terminal-multiplexer transport
//!
//! Workers live inside tmux-style sessions; the control plane only ever
//! starts sessions, types text at them, and reads their scrollback. The
//! trait keeps that surface minimal so tests can script it.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// Target session does not exist; commands fail fast rather than hang
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The multiplexer binary returned a non-zero status
    #[error("transport command failed: {0}")]
    CommandFailed(String),

    /// Read did not complete within the allowed time
    #[error("transport read timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session-oriented text transport to worker processes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a detached session rooted at `cwd`
    async fn create_session(&self, name: &str, cwd: &Path) -> Result<(), TransportError>;

    async fn session_exists(&self, name: &str) -> bool;

    /// Type `text` into the target pane; when `press_enter` is set, the
    /// Enter key is delivered as a separate key event. Combined text+Enter
    /// sends drop the keypress on large payloads.
    async fn send_keys(
        &self,
        target: &str,
        text: &str,
        press_enter: bool,
    ) -> Result<(), TransportError>;

    /// Most recent `lines` of the target pane's buffer as plain text
    async fn capture(&self, target: &str, lines: u32) -> Result<String, TransportError>;

    async fn kill_session(&self, name: &str) -> Result<(), TransportError>;

    async fn list_sessions(&self) -> Result<Vec<String>, TransportError>;

    /// Whether the target session is alive and its pane responding
    async fn is_active(&self, target: &str) -> bool;
}

/// Production transport backed by the `tmux` binary
pub struct TmuxTransport {
    binary: String,
}

impl TmuxTransport {
    pub fn new() -> Self {
        Self {
            binary: "tmux".to_string(),
        }
    }

    /// Use a non-default tmux binary (e.g. an absolute path)
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, TransportError> {
        debug!(args = ?args, "tmux");
        let output = Command::new(&self.binary).args(args).output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(TransportError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn ensure_session(&self, target: &str) -> Result<(), TransportError> {
        // Commands against a dead session must fail fast, not hang
        let name = target.split(':').next().unwrap_or(target);
        if self.session_exists(name).await {
            Ok(())
        } else {
            Err(TransportError::SessionNotFound(name.to_string()))
        }
    }
}

impl Default for TmuxTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TmuxTransport {
    async fn create_session(&self, name: &str, cwd: &Path) -> Result<(), TransportError> {
        let cwd = cwd.to_string_lossy();
        self.run(&["new-session", "-d", "-s", name, "-c", &cwd])
            .await?;
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> bool {
        Command::new(&self.binary)
            .args(["has-session", "-t", name])
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    async fn send_keys(
        &self,
        target: &str,
        text: &str,
        press_enter: bool,
    ) -> Result<(), TransportError> {
        self.ensure_session(target).await?;
        self.run(&["send-keys", "-t", target, "-l", text]).await?;
        if press_enter {
            // Give the pane time to ingest large pastes before Enter lands
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.run(&["send-keys", "-t", target, "Enter"]).await?;
        }
        Ok(())
    }

    async fn capture(&self, target: &str, lines: u32) -> Result<String, TransportError> {
        self.ensure_session(target).await?;
        let start = format!("-{lines}");
        self.run(&["capture-pane", "-t", target, "-p", "-S", &start])
            .await
    }

    async fn kill_session(&self, name: &str) -> Result<(), TransportError> {
        self.ensure_session(name).await?;
        self.run(&["kill-session", "-t", name]).await?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, TransportError> {
        let out = self
            .run(&["list-sessions", "-F", "#{session_name}"])
            .await
            .unwrap_or_default();
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn is_active(&self, target: &str) -> bool {
        self.ensure_session(target).await.is_ok()
    }
}

#[cfg(test)]
pub mod fake {
    //! Scriptable in-memory transport for unit tests

    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{Transport, TransportError};

    #[derive(Debug, Default, Clone)]
    pub struct FakeSession {
        pub cwd: PathBuf,
        pub sent: Vec<String>,
        pub output: String,
        pub active: bool,
    }

    #[derive(Default)]
    pub struct FakeTransport {
        sessions: Mutex<HashMap<String, FakeSession>>,
        default_output: Mutex<Option<String>>,
        pub fail_creates: Mutex<bool>,
        pub created_count: Mutex<u32>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Pane output that every newly created session starts with
        pub fn set_default_output(&self, output: &str) {
            *self.default_output.lock() = Some(output.to_string());
        }

        /// Script the pane output returned by subsequent captures
        pub fn set_output(&self, name: &str, output: &str) {
            if let Some(session) = self.sessions.lock().get_mut(name) {
                session.output = output.to_string();
            }
        }

        /// Mark a session dead without removing it (hung worker)
        pub fn set_active(&self, name: &str, active: bool) {
            if let Some(session) = self.sessions.lock().get_mut(name) {
                session.active = active;
            }
        }

        /// Remove a session entirely (crashed worker)
        pub fn drop_session(&self, name: &str) {
            self.sessions.lock().remove(name);
        }

        pub fn sent_lines(&self, name: &str) -> Vec<String> {
            self.sessions
                .lock()
                .get(name)
                .map(|s| s.sent.clone())
                .unwrap_or_default()
        }

        pub fn session_count(&self) -> usize {
            self.sessions.lock().len()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn create_session(&self, name: &str, cwd: &Path) -> Result<(), TransportError> {
            if *self.fail_creates.lock() {
                return Err(TransportError::CommandFailed("create refused".into()));
            }
            *self.created_count.lock() += 1;
            self.sessions.lock().insert(
                name.to_string(),
                FakeSession {
                    cwd: cwd.to_path_buf(),
                    active: true,
                    output: self.default_output.lock().clone().unwrap_or_default(),
                    ..FakeSession::default()
                },
            );
            Ok(())
        }

        async fn session_exists(&self, name: &str) -> bool {
            self.sessions.lock().contains_key(name)
        }

        async fn send_keys(
            &self,
            target: &str,
            text: &str,
            _press_enter: bool,
        ) -> Result<(), TransportError> {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(target)
                .ok_or_else(|| TransportError::SessionNotFound(target.to_string()))?;
            session.sent.push(text.to_string());
            Ok(())
        }

        async fn capture(&self, target: &str, _lines: u32) -> Result<String, TransportError> {
            self.sessions
                .lock()
                .get(target)
                .map(|s| s.output.clone())
                .ok_or_else(|| TransportError::SessionNotFound(target.to_string()))
        }

        async fn kill_session(&self, name: &str) -> Result<(), TransportError> {
            self.sessions
                .lock()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| TransportError::SessionNotFound(name.to_string()))
        }

        async fn list_sessions(&self) -> Result<Vec<String>, TransportError> {
            Ok(self.sessions.lock().keys().cloned().collect())
        }

        async fn is_active(&self, target: &str) -> bool {
            self.sessions
                .lock()
                .get(target)
                .map(|s| s.active)
                .unwrap_or(false)
        }
    }
}
