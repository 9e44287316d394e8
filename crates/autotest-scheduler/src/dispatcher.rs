//! The scheduler cycle.
//!
//! Each tick refreshes drone state, settles executions whose process has
//! finished, hands ready hosts to pending queue entries and flushes the
//! resulting drone calls. Executions are keyed by execution tag
//! (`<job id>-<owner>/<execution subdir>`), which is also the working
//! directory of the process on its drone.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use autotest_state::{Host, HostQueueEntry, Job, JobId, QueueEntryId, QueueEntryStatus, SchedulerDb};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::alerts::AdminAlerts;
use crate::drone_manager::{CommandArg, DroneManager, ExecuteRequest};
use crate::error::{SchedulerError, SchedulerResult};
use crate::host_scheduler::HostScheduler;
use crate::monitor::{ProcessMonitor, RunState};
use crate::pidfile::AUTOSERV_PID_FILE;

pub const AUTOSERV_BINARY: &str = "autotest-remote";
pub const CONTROL_FILE_NAME: &str = "control.srv";
/// Execution subdirectory shared by every host of a multi-host run.
pub const GROUP_SUBDIR: &str = "group0";

struct Execution {
    monitor: ProcessMonitor,
    entry_ids: Vec<QueueEntryId>,
    marked_running: bool,
}

/// What a tick did, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub started: Vec<String>,
    pub finished: Vec<String>,
    pub running: usize,
}

pub struct Dispatcher {
    db: Arc<dyn SchedulerDb>,
    drone_manager: DroneManager,
    host_scheduler: HostScheduler,
    alerts: AdminAlerts,
    tick_pause: Duration,
    executions: BTreeMap<String, Execution>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn SchedulerDb>,
        drone_manager: DroneManager,
        host_scheduler: HostScheduler,
    ) -> Self {
        let tick_pause = Duration::from_secs(drone_manager.config().scheduler.tick_pause_secs);
        let alerts = drone_manager.alerts().clone();
        Self {
            db,
            drone_manager,
            host_scheduler,
            alerts,
            tick_pause,
            executions: BTreeMap::new(),
        }
    }

    pub fn with_tick_pause(mut self, tick_pause: Duration) -> Self {
        self.tick_pause = tick_pause;
        self
    }

    pub fn drone_manager(&self) -> &DroneManager {
        &self.drone_manager
    }

    pub fn drone_manager_mut(&mut self) -> &mut DroneManager {
        &mut self.drone_manager
    }

    pub fn execution_tags(&self) -> Vec<&str> {
        self.executions.keys().map(String::as_str).collect()
    }

    // ── Startup ────────────────────────────────────────────────────

    /// Recover state left by a previous scheduler.
    ///
    /// Active entries get a monitor attached to their existing execution.
    /// Orphaned autoserv processes that belong to no active entry are
    /// killed.
    pub async fn initialize(&mut self) -> SchedulerResult<()> {
        self.host_scheduler.recovery_on_startup();
        self.drone_manager.refresh().await;

        let active = self.db.active_queue_entries()?;
        let jobs = self.jobs_for(&active)?;
        let mut groups: BTreeMap<String, Vec<QueueEntryId>> = BTreeMap::new();
        for entry in &active {
            let Some(job) = jobs.get(&entry.job_id) else {
                error!(entry = %entry, "active entry references a missing job");
                continue;
            };
            groups
                .entry(execution_tag(job, &entry.execution_subdir))
                .or_default()
                .push(entry.id);
        }

        for (tag, entry_ids) in groups {
            let num_processes = entry_ids.len().max(1) as u32;
            let monitor = ProcessMonitor::attach(
                &mut self.drone_manager,
                &tag,
                AUTOSERV_PID_FILE,
                Some(num_processes),
            );
            info!(execution_tag = %tag, entries = entry_ids.len(), "recovered execution");
            self.executions.insert(
                tag,
                Execution {
                    monitor,
                    entry_ids,
                    marked_running: false,
                },
            );
        }

        let recovered: HashSet<_> = self
            .executions
            .keys()
            .filter_map(|tag| self.drone_manager.process_for_execution_tag(tag))
            .cloned()
            .collect();
        for process in self.drone_manager.get_orphaned_autoserv_processes() {
            if recovered.contains(&process) {
                continue;
            }
            warn!(%process, "killing orphaned autoserv process");
            self.drone_manager.kill_process(&process)?;
        }

        self.drone_manager.execute_actions().await;
        self.flush_alerts();
        Ok(())
    }

    // ── Tick ───────────────────────────────────────────────────────

    pub async fn tick(&mut self) -> SchedulerResult<TickSummary> {
        let mut summary = TickSummary::default();

        self.drone_manager.refresh_drone_configs();
        self.drone_manager.refresh().await;
        self.poll_executions(&mut summary)?;

        self.host_scheduler.tick();
        let pending = self.db.pending_queue_entries()?;
        self.host_scheduler.refresh(&pending)?;
        self.schedule_pending(&pending, &mut summary)?;

        self.drone_manager.execute_actions().await;
        self.flush_alerts();

        summary.running = self.executions.len();
        debug!(
            started = summary.started.len(),
            finished = summary.finished.len(),
            running = summary.running,
            "tick complete"
        );
        Ok(summary)
    }

    fn poll_executions(&mut self, summary: &mut TickSummary) -> SchedulerResult<()> {
        let tags: Vec<String> = self.executions.keys().cloned().collect();
        for tag in tags {
            let Some(execution) = self.executions.get_mut(&tag) else {
                continue;
            };
            let state = execution.monitor.poll(&mut self.drone_manager);
            match &state {
                RunState::NotStarted => {}
                RunState::Running(process) => {
                    if !execution.marked_running {
                        debug!(execution_tag = %tag, %process, "execution running");
                        for &entry_id in &execution.entry_ids {
                            self.db
                                .set_queue_entry_status(entry_id, QueueEntryStatus::Running)?;
                        }
                        execution.marked_running = true;
                    }
                }
                RunState::Finished { .. } | RunState::Lost { .. } => {
                    let status = match state.exit_status() {
                        Some(0) => QueueEntryStatus::Completed,
                        _ => QueueEntryStatus::Failed,
                    };
                    info!(
                        execution_tag = %tag,
                        %status,
                        num_tests_failed = state.num_tests_failed(),
                        "execution finished"
                    );
                    for &entry_id in &execution.entry_ids {
                        self.db.set_queue_entry_status(entry_id, status)?;
                    }
                    if let Err(e) = execution.monitor.try_copy_to_results_repository(
                        &mut self.drone_manager,
                        &tag,
                        None,
                    ) {
                        error!(execution_tag = %tag, error = %e, "failed to queue results copy");
                    }
                    let pidfile_id = execution.monitor.pidfile_id().clone();
                    self.drone_manager.unregister_pidfile(&pidfile_id);
                    self.executions.remove(&tag);
                    summary.finished.push(tag);
                }
            }
        }
        Ok(())
    }

    fn schedule_pending(
        &mut self,
        pending: &[HostQueueEntry],
        summary: &mut TickSummary,
    ) -> SchedulerResult<()> {
        for entry in pending {
            let hosts = if is_hostless(entry) {
                Vec::new()
            } else if entry.host_id.is_none() && entry.atomic_group_id.is_some() {
                let hosts = self.host_scheduler.find_eligible_atomic_group(entry)?;
                if hosts.is_empty() {
                    continue;
                }
                hosts
            } else {
                match self.host_scheduler.schedule_entry(entry)? {
                    Some(host) => vec![host],
                    None => continue,
                }
            };

            match self.dispatch(entry, &hosts) {
                Ok(Some(tag)) => summary.started.push(tag),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!(entry = %entry, error = %e, "failed to dispatch queue entry"),
            }
        }
        Ok(())
    }

    /// Persist the assignment and queue the autoserv command.
    ///
    /// Returns the execution tag, or `None` when no drone can take the
    /// entry this cycle and it stays queued. A failed start undoes the
    /// assignment.
    fn dispatch(
        &mut self,
        entry: &HostQueueEntry,
        hosts: &[Host],
    ) -> SchedulerResult<Option<String>> {
        let job = self
            .db
            .jobs(&[entry.job_id])?
            .remove(&entry.job_id)
            .ok_or(SchedulerError::JobNotFound(entry.job_id))?;

        if !self.drone_manager.has_usable_drone(Some(&job.owner)) {
            debug!(entry = %entry, owner = %job.owner, "no usable drone for owner");
            return Ok(None);
        }

        let num_processes = hosts.len().max(1) as u32;
        let max_runnable = self
            .drone_manager
            .max_runnable_processes(Some(&job.owner), None);
        if num_processes > max_runnable && self.drone_manager.total_running_processes() > 0 {
            debug!(entry = %entry, num_processes, max_runnable, "not enough drone capacity");
            return Ok(None);
        }

        let execution_subdir = match hosts {
            [] => String::new(),
            [host] => host.hostname.clone(),
            _ => GROUP_SUBDIR.to_string(),
        };
        let tag = execution_tag(&job, &execution_subdir);
        let entry_ids: Vec<QueueEntryId> = if hosts.is_empty() {
            self.db
                .set_queue_entry_status(entry.id, QueueEntryStatus::Starting)?;
            vec![entry.id]
        } else {
            let host_ids: Vec<_> = hosts.iter().map(|host| host.id).collect();
            self.db
                .assign_queue_entry(entry.id, &host_ids, &execution_subdir)?
                .into_iter()
                .map(|assigned| assigned.id)
                .collect()
        };

        match self.start_execution(&job, &tag, hosts, num_processes) {
            Ok(monitor) => {
                info!(execution_tag = %tag, entries = ?entry_ids, "dispatched");
                self.executions.insert(
                    tag.clone(),
                    Execution {
                        monitor,
                        entry_ids,
                        marked_running: false,
                    },
                );
                Ok(Some(tag))
            }
            Err(e) => {
                self.drone_manager.discard_attached_files(&tag);
                self.db.revert_queue_entry_assignment(entry, &entry_ids)?;
                Err(e)
            }
        }
    }

    fn start_execution(
        &mut self,
        job: &Job,
        tag: &str,
        hosts: &[Host],
        num_processes: u32,
    ) -> SchedulerResult<ProcessMonitor> {
        let control_file = format!("{tag}/{CONTROL_FILE_NAME}");
        self.drone_manager.attach_file_to_execution(
            tag,
            job.control_file.clone(),
            Some(control_file.clone()),
        )?;
        let control_path = self.drone_manager.absolute_path(&control_file, false);

        let mut command: Vec<CommandArg> = vec![
            AUTOSERV_BINARY.into(),
            "-P".into(),
            tag.into(),
            "-r".into(),
            CommandArg::WorkingDirectory,
            "-u".into(),
            job.owner.clone().into(),
            "-l".into(),
            job.name.clone().into(),
        ];
        if !hosts.is_empty() {
            let machines: Vec<&str> = hosts.iter().map(|host| host.hostname.as_str()).collect();
            command.push("-m".into());
            command.push(machines.join(",").into());
        }
        command.push(control_path.to_string_lossy().into_owned().into());

        let request = ExecuteRequest::new(command, tag, AUTOSERV_PID_FILE)
            .with_num_processes(num_processes)
            .with_username(Some(job.owner.clone()));
        Ok(ProcessMonitor::run(&mut self.drone_manager, request, None)?)
    }

    fn jobs_for(&self, entries: &[HostQueueEntry]) -> SchedulerResult<BTreeMap<JobId, Job>> {
        let job_ids: Vec<JobId> = entries
            .iter()
            .map(|entry| entry.job_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Ok(self.db.jobs(&job_ids)?.into_iter().collect())
    }

    fn flush_alerts(&self) {
        for alert in self.alerts.drain() {
            error!(subject = %alert.subject, "{}", alert.body);
        }
    }

    // ── Loop ───────────────────────────────────────────────────────

    /// Tick every `tick_pause` until `shutdown` fires. Returns early only
    /// on an error that makes further ticks pointless.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<()> {
        info!(tick_pause_secs = self.tick_pause.as_secs(), "dispatcher started");
        loop {
            match self.tick().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal scheduler error");
                    return Err(e);
                }
                Err(e) => error!(error = %e, "scheduler tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.tick_pause) => {}
                _ = shutdown.changed() => {
                    info!("dispatcher shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Flush anything still queued and stop the drones.
    pub async fn shutdown(&mut self) {
        self.drone_manager.execute_actions().await;
        self.flush_alerts();
        self.drone_manager.shutdown().await;
    }
}

/// An entry with no host, label or atomic group runs without machines.
fn is_hostless(entry: &HostQueueEntry) -> bool {
    entry.host_id.is_none() && entry.meta_host.is_none() && entry.atomic_group_id.is_none()
}

pub fn execution_tag(job: &Job, execution_subdir: &str) -> String {
    if execution_subdir.is_empty() {
        job.tag()
    } else {
        format!("{}/{execution_subdir}", job.tag())
    }
}
