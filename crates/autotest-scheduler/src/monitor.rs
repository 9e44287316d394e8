//! Tracks one dispatched process through its pidfile.
//!
//! The first pidfile read of a cycle says whether the process has started
//! and whether it has written an exit status. A pid without an exit status
//! whose process is gone from the process scan may have exited between the
//! read and the scan, so the second read (taken after the scan) decides:
//! still no exit status means the process died without reporting one.

use std::time::{Duration, Instant};

use autotest_drone::Process;
use tracing::{info, warn};

use crate::drone_manager::{CommandArg, DroneManager, ExecuteRequest};
use crate::error::DroneManagerResult;
use crate::pidfile::{PidfileId, PidfileState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    /// No pid in the pidfile yet.
    NotStarted,
    Running(Process),
    Finished {
        process: Process,
        exit_status: i32,
        /// `-1` when the pidfile did not say.
        num_tests_failed: i32,
    },
    /// Gave up on the process; counts as exit status 1 with no failed tests.
    Lost {
        process: Option<Process>,
        reason: String,
    },
}

impl RunState {
    pub fn process(&self) -> Option<&Process> {
        match self {
            Self::NotStarted => None,
            Self::Running(process) | Self::Finished { process, .. } => Some(process),
            Self::Lost { process, .. } => process.as_ref(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Lost { .. })
    }

    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Self::Finished { exit_status, .. } => Some(*exit_status),
            Self::Lost { .. } => Some(1),
            _ => None,
        }
    }

    pub fn num_tests_failed(&self) -> i32 {
        match self {
            Self::Finished {
                num_tests_failed, ..
            } => *num_tests_failed,
            Self::Lost { .. } => 0,
            _ => -1,
        }
    }
}

pub struct ProcessMonitor {
    pidfile_id: PidfileId,
    started_at: Instant,
    pidfile_timeout: Duration,
    last_process: Option<Process>,
    lost: Option<RunState>,
}

impl ProcessMonitor {
    fn new(manager: &DroneManager, pidfile_id: PidfileId) -> Self {
        Self {
            pidfile_id,
            started_at: Instant::now(),
            pidfile_timeout: Duration::from_secs(manager.config().scheduler.pidfile_timeout_secs),
            last_process: None,
            lost: None,
        }
    }

    /// Start a new process, optionally under `nice -n <level>`.
    pub fn run(
        manager: &mut DroneManager,
        mut request: ExecuteRequest,
        nice_level: Option<i32>,
    ) -> DroneManagerResult<Self> {
        if let Some(level) = nice_level {
            let mut command: Vec<CommandArg> =
                vec!["nice".into(), "-n".into(), level.to_string().into()];
            command.append(&mut request.command);
            request.command = command;
        }
        let pidfile_id = manager.execute_command(request)?;
        Ok(Self::new(manager, pidfile_id))
    }

    /// Follow a process started before this scheduler, found through its
    /// execution tag.
    pub fn attach(
        manager: &mut DroneManager,
        execution_tag: &str,
        pidfile_name: &str,
        num_processes: Option<u32>,
    ) -> Self {
        let pidfile_id = manager.get_pidfile_id_from(execution_tag, pidfile_name);
        if let Some(num_processes) = num_processes {
            manager.declare_process_count(&pidfile_id, num_processes);
        }
        info!(pidfile = %pidfile_id, "attached to existing process");
        Self::new(manager, pidfile_id)
    }

    pub fn with_pidfile_timeout(mut self, timeout: Duration) -> Self {
        self.pidfile_timeout = timeout;
        self
    }

    pub fn pidfile_id(&self) -> &PidfileId {
        &self.pidfile_id
    }

    /// Current state of the process as of the manager's last refresh.
    pub fn poll(&mut self, manager: &mut DroneManager) -> RunState {
        if let Some(lost) = &self.lost {
            return lost.clone();
        }

        let contents = match manager.get_pidfile_contents(&self.pidfile_id, false) {
            PidfileState::Contents(contents) => contents,
            PidfileState::Invalid(invalid) => {
                self.last_process = None;
                return self.pidfile_error(manager, "Pidfile error", &invalid.error);
            }
        };
        let Some(process) = contents.process else {
            return self.handle_no_process(manager);
        };
        self.last_process = Some(process.clone());

        if let Some(exit_status) = contents.exit_status {
            return RunState::Finished {
                process,
                exit_status,
                num_tests_failed: contents.num_tests_failed.unwrap_or(-1),
            };
        }
        if manager.is_process_running(&process) {
            return RunState::Running(process);
        }

        // pid but no running process; it may have only just exited
        match manager.get_pidfile_contents(&self.pidfile_id, true) {
            PidfileState::Contents(second) => match second.exit_status {
                Some(exit_status) => RunState::Finished {
                    process: second.process.unwrap_or(process),
                    exit_status,
                    num_tests_failed: second.num_tests_failed.unwrap_or(-1),
                },
                None => self.pidfile_error(manager, "autoserv died without writing exit code", ""),
            },
            PidfileState::Invalid(invalid) => {
                self.last_process = None;
                self.pidfile_error(manager, "Pidfile error", &invalid.error)
            }
        }
    }

    fn handle_no_process(&mut self, manager: &DroneManager) -> RunState {
        if self.started_at.elapsed() < self.pidfile_timeout {
            return RunState::NotStarted;
        }
        manager.alerts().enqueue(
            "Process has failed to write pidfile",
            format!("No pid found at {}", self.pidfile_id),
        );
        self.mark_lost("Process has failed to write pidfile")
    }

    fn pidfile_error(&mut self, manager: &DroneManager, error: &str, message: &str) -> RunState {
        let process = self
            .last_process
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "None".to_string());
        manager.alerts().enqueue(
            error,
            format!(
                "{error}\nProcess: {process}\nPidfile: {}\n{message}",
                self.pidfile_id
            ),
        );
        self.mark_lost(error)
    }

    fn mark_lost(&mut self, reason: &str) -> RunState {
        warn!(pidfile = %self.pidfile_id, %reason, "process lost");
        let lost = RunState::Lost {
            process: self.last_process.clone(),
            reason: reason.to_string(),
        };
        self.lost = Some(lost.clone());
        lost
    }

    pub fn process(&mut self, manager: &mut DroneManager) -> Option<Process> {
        self.poll(manager).process().cloned()
    }

    pub fn kill(&mut self, manager: &mut DroneManager) -> DroneManagerResult<()> {
        match self.process(manager) {
            Some(process) => manager.kill_process(&process),
            None => Ok(()),
        }
    }

    pub fn try_copy_results_on_drone(
        &mut self,
        manager: &mut DroneManager,
        source_path: &str,
        destination_path: &str,
    ) -> DroneManagerResult<()> {
        match self.process(manager) {
            Some(process) => manager.copy_results_on_drone(&process, source_path, destination_path),
            None => Ok(()),
        }
    }

    pub fn try_copy_to_results_repository(
        &mut self,
        manager: &mut DroneManager,
        source_path: &str,
        destination_path: Option<&str>,
    ) -> DroneManagerResult<()> {
        match self.process(manager) {
            Some(process) => {
                manager.copy_to_results_repository(&process, source_path, destination_path)
            }
            None => Ok(()),
        }
    }
}
