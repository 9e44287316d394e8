//! Transports that deliver call batches to a drone utility.
//!
//! - [`LocalTransport`] runs a [`DroneUtility`] in-process on the blocking
//!   thread pool.
//! - [`SshTransport`] runs the `autotest-drone-utility` binary on a remote
//!   machine over ssh, with the batch as JSON on stdin.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::error::{DroneError, DroneResult};
use crate::protocol::{DroneCall, ExecutionReport};
use crate::utility::DroneUtility;

/// Name of the drone utility binary under `<installation_dir>/bin`.
pub const DRONE_UTILITY_BINARY: &str = "autotest-drone-utility";

#[async_trait]
pub trait DroneTransport: Send + Sync {
    async fn execute_calls(&self, calls: Vec<DroneCall>) -> DroneResult<ExecutionReport>;

    /// Whether calls execute on the scheduler's own machine.
    fn is_local(&self) -> bool {
        false
    }

    async fn shutdown(&self) {}
}

// ── Local ──────────────────────────────────────────────────────────

pub struct LocalTransport {
    utility: Arc<Mutex<DroneUtility>>,
}

impl LocalTransport {
    pub fn new(max_transfer_processes: usize) -> Self {
        Self {
            utility: Arc::new(Mutex::new(DroneUtility::new(max_transfer_processes))),
        }
    }
}

#[async_trait]
impl DroneTransport for LocalTransport {
    async fn execute_calls(&self, calls: Vec<DroneCall>) -> DroneResult<ExecutionReport> {
        let utility = Arc::clone(&self.utility);
        tokio::task::spawn_blocking(move || {
            let mut utility = utility.lock().map_err(|e| DroneError::Transport {
                hostname: "localhost".to_string(),
                message: e.to_string(),
            })?;
            Ok(utility.execute_calls(&calls))
        })
        .await
        .map_err(|e| DroneError::Transport {
            hostname: "localhost".to_string(),
            message: e.to_string(),
        })?
    }

    fn is_local(&self) -> bool {
        true
    }
}

// ── SSH ────────────────────────────────────────────────────────────

pub struct SshTransport {
    /// `host` or `user@host`.
    destination: String,
    utility_path: PathBuf,
    max_transfer_processes: usize,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(destination: impl Into<String>, installation_directory: &std::path::Path) -> Self {
        Self {
            destination: destination.into(),
            utility_path: installation_directory.join("bin").join(DRONE_UTILITY_BINARY),
            max_transfer_processes: 50,
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_transfer_processes(mut self, max: usize) -> Self {
        self.max_transfer_processes = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn ssh_command(&self) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg(&self.destination)
            .kill_on_drop(true);
        command
    }

    /// Whether the machine answers a trivial ssh command.
    pub async fn is_up(&self) -> bool {
        let mut command = self.ssh_command();
        command
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let probe = tokio::time::timeout(self.connect_timeout, command.status()).await;
        matches!(probe, Ok(Ok(status)) if status.success())
    }

    fn transport_error(&self, message: impl Into<String>) -> DroneError {
        DroneError::Transport {
            hostname: self.destination.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl DroneTransport for SshTransport {
    async fn execute_calls(&self, calls: Vec<DroneCall>) -> DroneResult<ExecutionReport> {
        info!(destination = %self.destination, calls = calls.len(), "running drone utility");
        let input = serde_json::to_vec(&calls)?;

        let mut command = self.ssh_command();
        command
            .arg(&self.utility_path)
            .arg("--max-transfer-processes")
            .arg(self.max_transfer_processes.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.transport_error("ssh stdin unavailable"))?;
        stdin.write_all(&input).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(self.transport_error(format!(
                "drone utility exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            error!(
                destination = %self.destination,
                response = %String::from_utf8_lossy(&output.stdout),
                "invalid drone utility response"
            );
            DroneError::Protocol(e.to_string())
        })
    }

    async fn shutdown(&self) {
        debug!(destination = %self.destination, "ssh transport closed");
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CallResult;

    #[tokio::test]
    async fn local_transport_runs_utility() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport::new(2);
        let report = transport
            .execute_calls(vec![DroneCall::WriteToFile {
                path: dir.path().join("out"),
                contents: "hello".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(report.results, vec![CallResult::Done]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out")).unwrap(),
            "hello"
        );
        assert!(transport.is_local());
    }

    #[test]
    fn ssh_transport_locates_utility() {
        let transport = SshTransport::new("autotest@drone1", std::path::Path::new("/opt/autotest"));
        assert_eq!(
            transport.utility_path,
            PathBuf::from("/opt/autotest/bin/autotest-drone-utility")
        );
        assert!(!transport.is_local());
    }
}
