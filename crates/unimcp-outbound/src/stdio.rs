//! Child-process stdio transport.
//!
//! Spawns the configured command and speaks newline-delimited JSON over its
//! stdin/stdout. stderr is drained to the proxy log at debug level.
//!
//! Lock discipline: short-lived `parking_lot` locks for state, tokio
//! mutexes only where a lock must cross an await (the child handle and the
//! inbound receiver).

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as StdMutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tracing::{debug, info, warn};
use unimcp_config::TransportKind;

use crate::error::{OutboundError, OutboundResult};
use crate::transport::Transport;

/// Configuration for one child process.
#[derive(Debug, Clone)]
pub struct ChildProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
    /// Grace period between SIGTERM-equivalent (stdin close) and kill.
    pub shutdown_timeout: Duration,
}

impl Default for ChildProcessConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

enum ProcessState {
    Idle,
    Running,
    Closed,
}

/// Transport over a spawned subprocess.
pub struct ChildProcessTransport {
    config: ChildProcessConfig,
    state: StdMutex<ProcessState>,
    child: TokioMutex<Option<Child>>,
    stdin_tx: StdMutex<Option<mpsc::Sender<String>>>,
    inbound_rx: TokioMutex<Option<mpsc::Receiver<String>>>,
}

impl ChildProcessTransport {
    pub fn new(config: ChildProcessConfig) -> Self {
        Self {
            config,
            state: StdMutex::new(ProcessState::Idle),
            child: TokioMutex::new(None),
            stdin_tx: StdMutex::new(None),
            inbound_rx: TokioMutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for ChildProcessTransport {
    async fn connect(&self) -> OutboundResult<()> {
        if matches!(*self.state.lock(), ProcessState::Running) {
            return Ok(());
        }
        if self.config.command.is_empty() {
            return Err(OutboundError::connection("command cannot be empty"));
        }

        info!(command = %self.config.command, args = ?self.config.args, "spawning upstream process");

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| OutboundError::connection(format!("failed to spawn process: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OutboundError::connection("no stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OutboundError::connection("no stdout handle"))?;
        let stderr = child.stderr.take();

        // Writer task: frames in, newline-delimited bytes out.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = stdin_rx.recv().await {
                if stdin.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task: lines in, frames out. Channel close signals EOF.
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(256);
        let command = self.config.command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        if inbound_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(command = %command, "upstream stdout closed");
                        break;
                    }
                    Err(e) => {
                        warn!(command = %command, error = %e, "upstream stdout read error");
                        break;
                    }
                }
            }
        });

        if let Some(stderr) = stderr {
            let command = self.config.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(command = %command, "upstream stderr: {line}");
                }
            });
        }

        *self.child.lock().await = Some(child);
        *self.stdin_tx.lock() = Some(stdin_tx);
        *self.inbound_rx.lock().await = Some(inbound_rx);
        *self.state.lock() = ProcessState::Running;
        Ok(())
    }

    async fn send(&self, frame: String) -> OutboundResult<()> {
        let tx = self
            .stdin_tx
            .lock()
            .clone()
            .ok_or_else(|| OutboundError::transport("process not connected"))?;
        tx.send(frame)
            .await
            .map_err(|_| OutboundError::transport("process stdin closed"))
    }

    async fn receive(&self) -> OutboundResult<Option<String>> {
        let mut guard = self.inbound_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => Ok(rx.recv().await),
            None => Ok(None),
        }
    }

    async fn close(&self) -> OutboundResult<()> {
        {
            let mut state = self.state.lock();
            if matches!(*state, ProcessState::Closed) {
                return Ok(());
            }
            *state = ProcessState::Closed;
        }
        // Dropping the sender closes stdin, the polite shutdown signal for
        // an MCP server.
        self.stdin_tx.lock().take();

        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            let deadline = tokio::time::timeout(self.config.shutdown_timeout, child.wait()).await;
            match deadline {
                Ok(Ok(status)) => debug!(?status, "upstream process exited"),
                Ok(Err(e)) => warn!(error = %e, "error waiting for upstream process"),
                Err(_) => {
                    warn!(command = %self.config.command, "upstream ignored shutdown, killing");
                    let _ = child.kill().await;
                }
            }
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat_config() -> ChildProcessConfig {
        ChildProcessConfig {
            command: "cat".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn echo_round_trip_through_cat() {
        let transport = ChildProcessTransport::new(cat_config());
        transport.connect().await.unwrap();
        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
            .await
            .unwrap();
        let frame = transport.receive().await.unwrap().expect("one frame");
        assert!(frame.contains("\"ping\""));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn receive_returns_none_after_exit() {
        let transport = ChildProcessTransport::new(ChildProcessConfig {
            command: "true".to_string(),
            ..Default::default()
        });
        transport.connect().await.unwrap();
        // `true` exits immediately; stdout EOF drains to None.
        let frame = transport.receive().await.unwrap();
        assert!(frame.is_none());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let transport = ChildProcessTransport::new(ChildProcessConfig::default());
        assert!(transport.connect().await.is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_connection_error() {
        let transport = ChildProcessTransport::new(ChildProcessConfig {
            command: "definitely-not-a-real-binary-xyz".to_string(),
            ..Default::default()
        });
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, OutboundError::ClientConnection(_)));
    }
}
