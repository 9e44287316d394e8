//! Drone handle: the scheduler-side view of one execution machine.
//!
//! A `Drone` carries the load-balancing attributes the drone manager
//! mutates (enabled flag, capacity, active process count), a queue of
//! pending [`DroneCall`]s, and the [`DroneTransport`] that delivers them.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{DroneError, DroneResult};
use crate::protocol::*;
use crate::transport::DroneTransport;

/// Load of a drone as `(fraction_full, -max_processes)`.
///
/// Compared lexicographically, so among equally full drones the bigger
/// one counts as less loaded (0/10 before 0/2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsedCapacity(pub f64, pub i64);

impl Eq for UsedCapacity {}

impl PartialOrd for UsedCapacity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UsedCapacity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0).then(self.1.cmp(&other.1))
    }
}

impl fmt::Display for UsedCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

pub struct Drone {
    pub hostname: String,
    pub enabled: bool,
    pub max_processes: u32,
    pub active_processes: u32,
    /// `None` means any user may use this drone.
    pub allowed_users: Option<BTreeSet<String>>,
    /// Login used to reach this drone over ssh.
    pub username: Option<String>,
    handle: DroneHandle,
    calls: Vec<DroneCall>,
}

impl Drone {
    pub fn new(hostname: impl Into<String>, transport: Arc<dyn DroneTransport>) -> Self {
        let hostname = hostname.into();
        Self {
            handle: DroneHandle {
                hostname: hostname.clone(),
                transport,
            },
            hostname,
            enabled: true,
            max_processes: 0,
            active_processes: 0,
            allowed_users: None,
            username: None,
            calls: Vec::new(),
        }
    }

    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }

    pub fn used_capacity(&self) -> UsedCapacity {
        if self.max_processes == 0 {
            return UsedCapacity(1.0, 0);
        }
        UsedCapacity(
            f64::from(self.active_processes) / f64::from(self.max_processes),
            -i64::from(self.max_processes),
        )
    }

    /// Whether `user` may run processes here. A request with no user is
    /// only accepted by unrestricted drones.
    pub fn usable_by(&self, user: Option<&str>) -> bool {
        match (&self.allowed_users, user) {
            (None, _) => true,
            (Some(users), Some(user)) => users.contains(user),
            (Some(_), None) => false,
        }
    }

    pub fn is_local(&self) -> bool {
        self.handle.transport.is_local()
    }

    /// ssh destination for this drone, `user@host` when a login is set.
    pub fn ssh_destination(&self) -> String {
        match &self.username {
            Some(user) => format!("{user}@{}", self.hostname),
            None => self.hostname.clone(),
        }
    }

    /// Cloneable handle for issuing calls outside of `&mut self`.
    pub fn handle(&self) -> DroneHandle {
        self.handle.clone()
    }

    // ── Call queue ─────────────────────────────────────────────────

    pub fn queue_call(&mut self, call: DroneCall) {
        debug!(hostname = %self.hostname, %call, "drone call queued");
        self.calls.push(call);
    }

    pub fn queued_calls(&self) -> &[DroneCall] {
        &self.calls
    }

    pub fn clear_call_queue(&mut self) {
        self.calls.clear();
    }

    pub fn take_call_queue(&mut self) -> Vec<DroneCall> {
        std::mem::take(&mut self.calls)
    }

    /// Execute a single call immediately, bypassing the queue.
    pub async fn call(&self, call: DroneCall, timeout: Duration) -> DroneResult<CallResult> {
        let mut report = self.handle.execute_calls(vec![call], timeout).await?;
        report
            .results
            .pop()
            .ok_or_else(|| DroneError::Protocol("empty result list".to_string()))
    }

    /// Flush the call queue. The queue is cleared whether or not the
    /// delivery succeeds.
    pub async fn execute_queued_calls(&mut self, timeout: Duration) -> DroneResult<ExecutionReport> {
        if self.calls.is_empty() {
            return Ok(ExecutionReport::default());
        }
        let calls = self.take_call_queue();
        self.handle.execute_calls(calls, timeout).await
    }

    /// Route a copy of `source_path` on this drone to `destination_path`
    /// on `target`.
    ///
    /// Same host: a local copy here. Local target and remote source: the
    /// target pulls the file. Otherwise this drone pushes it.
    pub fn send_file_to(
        &self,
        target: &Drone,
        source_path: &str,
        destination_path: &str,
        can_fail: bool,
    ) -> QueuedTransfer {
        if target.hostname == self.hostname {
            return QueuedTransfer {
                queue_on: TransferSide::Source,
                call: DroneCall::CopyFileOrDirectory {
                    source: source_path.to_string(),
                    destination: destination_path.to_string(),
                },
            };
        }
        if !self.is_local() && target.is_local() {
            return QueuedTransfer {
                queue_on: TransferSide::Target,
                call: DroneCall::GetFileFrom {
                    hostname: self.ssh_destination(),
                    source: source_path.to_string(),
                    destination: destination_path.to_string(),
                },
            };
        }
        QueuedTransfer {
            queue_on: TransferSide::Source,
            call: DroneCall::SendFileTo {
                hostname: target.ssh_destination(),
                source: source_path.to_string(),
                destination: destination_path.to_string(),
                can_fail,
            },
        }
    }

    pub async fn shutdown(&self) {
        info!(hostname = %self.hostname, "shutting down drone");
        self.handle.transport.shutdown().await;
    }
}

impl fmt::Debug for Drone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drone")
            .field("hostname", &self.hostname)
            .field("enabled", &self.enabled)
            .field("max_processes", &self.max_processes)
            .field("active_processes", &self.active_processes)
            .field("queued_calls", &self.calls.len())
            .finish()
    }
}

/// Which end of a transfer queues the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSide {
    Source,
    Target,
}

/// A transfer call and the drone that must queue it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTransfer {
    pub queue_on: TransferSide,
    pub call: DroneCall,
}

/// Hostname plus transport, detached from the drone's mutable state so
/// calls can run on spawned tasks.
#[derive(Clone)]
pub struct DroneHandle {
    hostname: String,
    transport: Arc<dyn DroneTransport>,
}

impl DroneHandle {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Deliver a batch, bounded by `timeout`. Warnings in the report are
    /// logged here; callers decide whether to escalate them.
    pub async fn execute_calls(
        &self,
        calls: Vec<DroneCall>,
        timeout: Duration,
    ) -> DroneResult<ExecutionReport> {
        let expected = calls.len();
        let report = tokio::time::timeout(timeout, self.transport.execute_calls(calls))
            .await
            .map_err(|_| DroneError::Timeout {
                hostname: self.hostname.clone(),
                secs: timeout.as_secs(),
            })??;

        if report.results.len() != expected {
            return Err(DroneError::Protocol(format!(
                "drone {} answered {} results for {expected} calls",
                self.hostname,
                report.results.len()
            )));
        }
        for warning in &report.warnings {
            warn!(hostname = %self.hostname, "Warning from drone {}\n{warning}", self.hostname);
        }
        Ok(report)
    }

    /// Run a refresh call and unpack its report.
    pub async fn refresh(
        &self,
        pidfile_paths: Vec<std::path::PathBuf>,
        check_dark_mark: bool,
        timeout: Duration,
    ) -> DroneResult<(RefreshReport, Vec<String>)> {
        let call = DroneCall::Refresh {
            pidfile_paths,
            check_dark_mark,
        };
        let mut report = self.execute_calls(vec![call], timeout).await?;
        match report.results.pop() {
            Some(CallResult::Refresh(refresh)) => Ok((refresh, report.warnings)),
            Some(CallResult::Failed(message)) => Err(DroneError::Transport {
                hostname: self.hostname.clone(),
                message,
            }),
            _ => Err(DroneError::UnexpectedResult {
                expected: "refresh",
            }),
        }
    }
}
