//! Drone manager: what is running where, and where to run the next thing.
//!
//! Once per scheduler cycle the manager is [`refresh`](DroneManager::refresh)ed
//! from every drone, callers queue work against it (commands, kills, copies,
//! file writes) and [`execute_actions`](DroneManager::execute_actions) flushes
//! the queued calls in one round trip per drone.
//!
//! Process and pidfile maps are rebuilt from scratch on every refresh. Only
//! the registered pidfiles and the drones themselves survive across cycles.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use autotest_core::SchedulerConfig;
use autotest_drone::utility::TEMPORARY_DIRECTORY;
use autotest_drone::{
    AUTOSERV_COMMAND, CallResult, Drone, DroneCall, DroneFactory, DroneSpec, Process, ProcessInfo,
    RefreshReport, TransferSide,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::alerts::AdminAlerts;
use crate::drone_queue::DroneQueue;
use crate::error::{DroneManagerError, DroneManagerResult};
use crate::pidfile::{PidfileId, PidfileState, parse_execution_tag, parse_pidfile};

// ── Requests ───────────────────────────────────────────────────────

/// One argv element of a command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArg {
    Literal(String),
    /// Replaced by the absolute working directory on the chosen drone.
    WorkingDirectory,
}

impl From<&str> for CommandArg {
    fn from(value: &str) -> Self {
        Self::Literal(value.to_string())
    }
}

impl From<String> for CommandArg {
    fn from(value: String) -> Self {
        Self::Literal(value)
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub command: Vec<CommandArg>,
    /// Relative to the drone results directory; the pidfile lands here.
    pub working_directory: String,
    pub pidfile_name: String,
    /// Processes to account for against the drone's capacity.
    pub num_processes: u32,
    /// Relative to the drone results directory. A temporary path if unset.
    pub log_file: Option<String>,
    /// Run on the same drone as the process behind this pidfile.
    pub paired_with_pidfile: Option<PidfileId>,
    pub username: Option<String>,
    pub drone_hostnames_allowed: Option<BTreeSet<String>>,
}

impl ExecuteRequest {
    pub fn new(
        command: Vec<CommandArg>,
        working_directory: impl Into<String>,
        pidfile_name: impl Into<String>,
    ) -> Self {
        Self {
            command,
            working_directory: working_directory.into(),
            pidfile_name: pidfile_name.into(),
            num_processes: 1,
            log_file: None,
            paired_with_pidfile: None,
            username: None,
            drone_hostnames_allowed: None,
        }
    }

    pub fn with_num_processes(mut self, num_processes: u32) -> Self {
        self.num_processes = num_processes;
        self
    }

    pub fn with_log_file(mut self, log_file: impl Into<String>) -> Self {
        self.log_file = Some(log_file.into());
        self
    }

    pub fn paired_with(mut self, pidfile_id: PidfileId) -> Self {
        self.paired_with_pidfile = Some(pidfile_id);
        self
    }

    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }

    pub fn with_drones_allowed(mut self, hostnames: BTreeSet<String>) -> Self {
        self.drone_hostnames_allowed = Some(hostnames);
        self
    }
}

#[derive(Debug, Clone, Default)]
struct PidfileInfo {
    /// Refreshes since anyone last asked about this pidfile.
    age: u32,
    num_processes: Option<u32>,
}

// ── DroneManager ───────────────────────────────────────────────────

pub struct DroneManager {
    config: SchedulerConfig,
    /// Reread by `refresh_drone_configs` when set.
    config_path: Option<PathBuf>,
    factory: Arc<dyn DroneFactory>,
    alerts: AdminAlerts,
    call_timeout: Duration,
    /// Base results directory on the results repository.
    results_dir: PathBuf,
    drones: BTreeMap<String, Drone>,
    results_drone: Option<Drone>,
    queue: DroneQueue,
    process_set: HashSet<Process>,
    tagged_processes: HashMap<String, Process>,
    pidfiles: HashMap<PidfileId, PidfileState>,
    pidfiles_second_read: HashMap<PidfileId, PidfileState>,
    registered_pidfiles: HashMap<PidfileId, PidfileInfo>,
    /// Last successful refresh per drone, replayed while it is unreachable.
    last_reports: HashMap<String, RefreshReport>,
    temporary_path_counter: u64,
    /// Execution working directory -> file path -> contents.
    attached_files: HashMap<String, BTreeMap<String, String>>,
}

impl DroneManager {
    pub fn new(config: SchedulerConfig, factory: Arc<dyn DroneFactory>, alerts: AdminAlerts) -> Self {
        Self {
            call_timeout: Duration::from_secs(config.scheduler.drone_call_timeout_secs),
            results_dir: config.scheduler.results_dir.clone(),
            config,
            config_path: None,
            factory,
            alerts,
            drones: BTreeMap::new(),
            results_drone: None,
            queue: DroneQueue::new(),
            process_set: HashSet::new(),
            tagged_processes: HashMap::new(),
            pidfiles: HashMap::new(),
            pidfiles_second_read: HashMap::new(),
            registered_pidfiles: HashMap::new(),
            last_reports: HashMap::new(),
            temporary_path_counter: 0,
            attached_files: HashMap::new(),
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn alerts(&self) -> &AdminAlerts {
        &self.alerts
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Create and initialize every drone, then the results repository.
    ///
    /// Drones that cannot be reached are skipped. Fails if none are left,
    /// or if the results repository cannot be created.
    pub async fn initialize(
        &mut self,
        base_results_dir: impl Into<PathBuf>,
        drone_hostnames: &[String],
        results_repository_hostname: &str,
    ) -> DroneManagerResult<()> {
        self.results_dir = base_results_dir.into();

        for hostname in drone_hostnames {
            self.add_drone(hostname).await;
        }
        if self.drones.is_empty() {
            return Err(DroneManagerError::NoValidDrones);
        }

        self.refresh_drone_configs();

        info!(hostname = %results_repository_hostname, "using results repository");
        let spec = DroneSpec {
            hostname: results_repository_hostname.to_string(),
            username: self.config.drone_settings(results_repository_hostname).username,
            installation_directory: self.config.results_host_installation_directory(),
        };
        // The results drone is never initialized: its directories must
        // survive and it runs no processes.
        self.results_drone = Some(self.factory.create_drone(&spec).await?);
        Ok(())
    }

    async fn add_drone(&mut self, hostname: &str) {
        info!(%hostname, "adding drone");
        let spec = DroneSpec {
            hostname: hostname.to_string(),
            username: self.config.drone_settings(hostname).username,
            installation_directory: self.config.scheduler.drone_installation_directory.clone(),
        };
        let drone = match self.factory.create_drone(&spec).await {
            Ok(drone) => drone,
            Err(e) => {
                error!(%hostname, error = %e, "could not create drone, skipping");
                return;
            }
        };

        let call = DroneCall::Initialize {
            results_dir: self.absolute_path("", false),
        };
        match drone.call(call, self.call_timeout).await {
            Ok(CallResult::Failed(message)) => {
                error!(%hostname, %message, "drone failed to initialize, skipping");
            }
            Err(e) => {
                error!(%hostname, error = %e, "drone failed to initialize, skipping");
            }
            Ok(_) => {
                self.drones.insert(drone.hostname.clone(), drone);
            }
        }
    }

    pub async fn reinitialize_drones(&self) {
        let results_dir = self.absolute_path("", false);
        for drone in self.drones.values() {
            let call = DroneCall::Initialize {
                results_dir: results_dir.clone(),
            };
            if let Err(e) = drone.call(call, self.call_timeout).await {
                error!(hostname = %drone.hostname, error = %e, "drone reinitialize failed");
            }
        }
    }

    pub async fn shutdown(&self) {
        for drone in self.drones.values() {
            drone.shutdown().await;
        }
        if let Some(results_drone) = &self.results_drone {
            results_drone.shutdown().await;
        }
    }

    /// Reapply per-drone settings, rereading the config file if there is one.
    pub fn refresh_drone_configs(&mut self) {
        if let Some(path) = &self.config_path {
            match SchedulerConfig::from_file(path) {
                Ok(config) => {
                    self.call_timeout =
                        Duration::from_secs(config.scheduler.drone_call_timeout_secs);
                    self.config = config;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "keeping previous config");
                }
            }
        }

        for (hostname, drone) in self.drones.iter_mut() {
            let settings = self.config.drone_settings(hostname);
            drone.enabled = settings.enabled;
            drone.max_processes = settings.max_processes;
            drone.allowed_users = settings.allowed_users;
        }
        self.queue.reorder(&self.drones);
    }

    pub fn drones(&self) -> impl Iterator<Item = &Drone> {
        self.drones.values()
    }

    pub fn drone(&self, hostname: &str) -> Option<&Drone> {
        self.drones.get(hostname)
    }

    /// Test hook and admin override for capacity and enablement.
    pub fn drone_mut(&mut self, hostname: &str) -> Option<&mut Drone> {
        self.drones.get_mut(hostname)
    }

    pub fn results_drone(&self) -> Option<&Drone> {
        self.results_drone.as_ref()
    }

    /// Drop a drone from the pool. Its queued calls are discarded.
    pub fn remove_drone(&mut self, hostname: &str) -> Option<Drone> {
        let removed = self.drones.remove(hostname);
        self.last_reports.remove(hostname);
        self.queue.reorder(&self.drones);
        removed
    }

    // ── Refresh ────────────────────────────────────────────────────

    fn reset(&mut self) {
        self.process_set.clear();
        self.tagged_processes.clear();
        self.pidfiles.clear();
        self.pidfiles_second_read.clear();
        self.queue.clear();
    }

    fn drop_old_pidfiles(&mut self) {
        let max_refreshes = self.config.scheduler.max_pidfile_refreshes;
        let mut expired = Vec::new();
        for (pidfile_id, info) in self.registered_pidfiles.iter_mut() {
            info.age += 1;
            if info.age >= max_refreshes {
                expired.push(pidfile_id.clone());
            }
        }
        for pidfile_id in expired {
            warn!(pidfile = %pidfile_id, "dropping leaked pidfile");
            self.unregister_pidfile(&pidfile_id);
        }
    }

    /// Rebuild process and pidfile state from every drone.
    ///
    /// A drone that fails to answer keeps its last known processes and
    /// pidfiles and its last active process count, but is left out of the
    /// load queue until it answers again.
    pub async fn refresh(&mut self) {
        self.reset();
        self.drop_old_pidfiles();

        let pidfile_paths: Vec<PathBuf> = self
            .registered_pidfiles
            .keys()
            .map(|pidfile_id| pidfile_id.path().to_path_buf())
            .collect();
        let check_dark_mark = self.config.scheduler.check_processes_for_dark_mark;
        let timeout = self.call_timeout;

        let mut tasks = JoinSet::new();
        for drone in self.drones.values() {
            let handle = drone.handle();
            let paths = pidfile_paths.clone();
            tasks.spawn(async move {
                let result = handle.refresh(paths, check_dark_mark, timeout).await;
                (handle.hostname().to_string(), result)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((hostname, result)) => {
                    results.insert(hostname, result);
                }
                Err(e) => error!(error = %e, "drone refresh task failed"),
            }
        }

        let hostnames: Vec<String> = self.drones.keys().cloned().collect();
        for hostname in hostnames {
            match results.remove(&hostname) {
                Some(Ok((report, warnings))) => {
                    forward_warnings(&self.alerts, &hostname, warnings);
                    self.apply_report(&hostname, &report);
                    self.last_reports.insert(hostname.clone(), report);
                    self.compute_active_processes(&hostname);
                    if let Some(drone) = self.drones.get(&hostname) {
                        if drone.enabled {
                            self.queue.push(drone);
                        }
                    }
                }
                failed => {
                    let message = match failed {
                        Some(Err(e)) => e.to_string(),
                        _ => "refresh did not complete".to_string(),
                    };
                    error!(%hostname, error = %message, "drone refresh failed, using last known state");
                    self.alerts
                        .enqueue(format!("Drone {hostname} refresh failed"), message);
                    if let Some(report) = self.last_reports.get(&hostname).cloned() {
                        self.apply_report(&hostname, &report);
                    }
                }
            }
        }
        debug!(
            processes = self.process_set.len(),
            pidfiles = self.pidfiles.len(),
            queued_drones = self.queue.len(),
            "drone manager refreshed"
        );
    }

    fn apply_report(&mut self, hostname: &str, report: &RefreshReport) {
        for info in &report.autoserv_processes {
            self.add_autoserv_process(hostname, info);
        }
        for info in &report.parse_processes {
            self.add_process(hostname, info);
        }
        for (path, raw) in &report.pidfiles {
            let pidfile_id = PidfileId::new(path.clone());
            if self.registered_pidfiles.contains_key(&pidfile_id) {
                self.pidfiles.insert(pidfile_id, parse_pidfile(hostname, raw));
            }
        }
        for (path, raw) in &report.pidfiles_second_read {
            let pidfile_id = PidfileId::new(path.clone());
            if self.registered_pidfiles.contains_key(&pidfile_id) {
                self.pidfiles_second_read
                    .insert(pidfile_id, parse_pidfile(hostname, raw));
            }
        }
    }

    fn add_process(&mut self, hostname: &str, info: &ProcessInfo) -> Process {
        let process = Process::new(hostname, info.pid).with_ppid(info.ppid);
        self.process_set.insert(process.clone());
        process
    }

    fn add_autoserv_process(&mut self, hostname: &str, info: &ProcessInfo) {
        debug_assert_eq!(info.comm, AUTOSERV_COMMAND);
        // only the root of an autoserv process group is tracked
        if info.pgid != info.pid {
            return;
        }
        let process = self.add_process(hostname, info);
        if let Some(tag) = parse_execution_tag(&info.args) {
            self.tagged_processes.insert(tag.to_string(), process);
        }
    }

    fn compute_active_processes(&mut self, hostname: &str) {
        let active: u32 = self
            .pidfiles
            .iter()
            .filter_map(|(pidfile_id, state)| {
                let contents = state.contents()?;
                let process = contents.process.as_ref()?;
                if contents.exit_status.is_some() || process.hostname != hostname {
                    return None;
                }
                self.registered_pidfiles.get(pidfile_id)?.num_processes
            })
            .sum();
        if let Some(drone) = self.drones.get_mut(hostname) {
            drone.active_processes = active;
        }
    }

    // ── Flush ──────────────────────────────────────────────────────

    /// Deliver every queued call. Failures are alerted and the affected
    /// queues are dropped; nothing here fails the cycle.
    pub async fn execute_actions(&mut self) {
        let timeout = self.call_timeout;
        let mut tasks = JoinSet::new();
        for drone in self.drones.values_mut() {
            let calls = drone.take_call_queue();
            if calls.is_empty() {
                continue;
            }
            let handle = drone.handle();
            tasks.spawn(async move {
                let result = handle.execute_calls(calls, timeout).await;
                (handle.hostname().to_string(), result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((hostname, Ok(report))) => {
                    forward_warnings(&self.alerts, &hostname, report.warnings);
                }
                Ok((hostname, Err(e))) => {
                    error!(%hostname, error = %e, "drone failed to execute calls");
                    self.alerts.enqueue(
                        format!("Drone {hostname} failed to execute calls"),
                        e.to_string(),
                    );
                }
                Err(e) => error!(error = %e, "drone call task failed"),
            }
        }

        if let Some(results_drone) = self.results_drone.as_mut() {
            match results_drone.execute_queued_calls(timeout).await {
                Ok(report) => {
                    forward_warnings(&self.alerts, &results_drone.hostname, report.warnings)
                }
                Err(e) => {
                    self.alerts.enqueue(
                        "Results repository error",
                        format!("Results repository failed to execute calls:\n{e}"),
                    );
                    results_drone.clear_call_queue();
                }
            }
        }
    }

    // ── Processes ──────────────────────────────────────────────────

    /// Root autoserv processes whose parent has exited.
    pub fn get_orphaned_autoserv_processes(&self) -> HashSet<Process> {
        self.process_set
            .iter()
            .filter(|process| process.ppid == Some(1))
            .cloned()
            .collect()
    }

    pub fn is_process_running(&self, process: &Process) -> bool {
        self.process_set.contains(process)
    }

    /// Running autoserv process started with `-P <execution_tag>`.
    pub fn process_for_execution_tag(&self, execution_tag: &str) -> Option<&Process> {
        self.tagged_processes.get(execution_tag)
    }

    pub fn kill_process(&mut self, process: &Process) -> DroneManagerResult<()> {
        info!(%process, "killing process");
        self.drone_for_process_mut(process)?
            .queue_call(DroneCall::KillProcess {
                process: process.clone(),
            });
        Ok(())
    }

    pub fn total_running_processes(&self) -> u32 {
        self.drones.values().map(|drone| drone.active_processes).sum()
    }

    /// Whether any enabled drone accepts work from `username`.
    pub fn has_usable_drone(&self, username: Option<&str>) -> bool {
        self.queue
            .hostnames()
            .iter()
            .filter_map(|hostname| self.drones.get(hostname))
            .any(|drone| drone.usable_by(username))
    }

    /// Most processes a single execution could start right now.
    pub fn max_runnable_processes(
        &self,
        username: Option<&str>,
        drone_hostnames_allowed: Option<&BTreeSet<String>>,
    ) -> u32 {
        self.queue
            .hostnames()
            .iter()
            .filter_map(|hostname| self.drones.get(hostname))
            .filter(|drone| {
                drone.usable_by(username)
                    && drone_hostnames_allowed.is_none_or(|allowed| allowed.contains(&drone.hostname))
            })
            .map(|drone| drone.max_processes.saturating_sub(drone.active_processes))
            .max()
            .unwrap_or(0)
    }

    /// Pop drones in increasing load order until one fits
    /// `num_processes`; fall back to the least loaded usable drone when
    /// none does. Every popped drone goes back on the queue.
    fn choose_drone_for_execution(
        &mut self,
        num_processes: u32,
        username: Option<&str>,
        drone_hostnames_allowed: Option<&BTreeSet<String>>,
    ) -> Option<String> {
        let mut checked = Vec::new();
        let mut usable = Vec::new();
        let mut chosen = None;

        while let Some(hostname) = self.queue.pop() {
            let Some(drone) = self.drones.get(&hostname) else {
                continue;
            };
            checked.push(hostname.clone());
            debug!(%hostname, "checking drone");
            if !drone.usable_by(username) {
                continue;
            }
            if drone_hostnames_allowed.is_some_and(|allowed| !allowed.contains(&hostname)) {
                debug!(%hostname, "drone not allowed");
                continue;
            }
            usable.push(hostname.clone());

            if drone.active_processes.saturating_add(num_processes) <= drone.max_processes {
                chosen = Some(hostname);
                break;
            }
            info!(
                %hostname,
                active = drone.active_processes,
                requested = num_processes,
                max = drone.max_processes,
                "drone lacks capacity"
            );
        }

        if chosen.is_none() && !usable.is_empty() {
            let summary = usable
                .iter()
                .filter_map(|hostname| self.drones.get(hostname))
                .map(|d| format!("{} {}/{}", d.hostname, d.active_processes, d.max_processes))
                .collect::<Vec<_>>()
                .join(",");
            error!(
                "No drone has capacity to handle {num_processes} processes ({summary}) for user {}",
                username.unwrap_or("None")
            );
            chosen = usable
                .iter()
                .filter_map(|hostname| self.drones.get(hostname))
                .min_by_key(|drone| drone.used_capacity())
                .map(|drone| drone.hostname.clone());
        }

        for hostname in checked {
            if let Some(drone) = self.drones.get(&hostname) {
                self.queue.push(drone);
            }
        }
        chosen
    }

    /// Queue a command on a drone and start tracking its pidfile.
    pub fn execute_command(&mut self, request: ExecuteRequest) -> DroneManagerResult<PidfileId> {
        let abs_working_directory = self.absolute_path(&request.working_directory, false);
        let log_file = match &request.log_file {
            Some(log_file) if !log_file.is_empty() => log_file.clone(),
            _ => self.get_temporary_path("execute"),
        };
        let log_file = self.absolute_path(&log_file, false);

        let command: Vec<String> = request
            .command
            .iter()
            .map(|arg| match arg {
                CommandArg::Literal(value) => value.clone(),
                CommandArg::WorkingDirectory => path_string(&abs_working_directory),
            })
            .collect();

        let hostname = match &request.paired_with_pidfile {
            Some(pidfile_id) => self.drone_for_pidfile(pidfile_id)?,
            None => self
                .choose_drone_for_execution(
                    request.num_processes,
                    request.username.as_deref(),
                    request.drone_hostnames_allowed.as_ref(),
                )
                .ok_or_else(|| DroneManagerError::NoDronesAvailable(command.join(" ")))?,
        };

        info!(%hostname, command = %command.join(" "), "executing command");
        info!("log file = {hostname}:{}", log_file.display());

        let write_calls: Vec<DroneCall> = self
            .attached_files
            .remove(&request.working_directory)
            .unwrap_or_default()
            .into_iter()
            .map(|(file_path, contents)| DroneCall::WriteToFile {
                path: self.absolute_path(&file_path, false),
                contents,
            })
            .collect();

        let drone = self
            .drones
            .get_mut(&hostname)
            .ok_or_else(|| DroneManagerError::UnknownDrone(hostname.clone()))?;
        for call in write_calls {
            drone.queue_call(call);
        }
        drone.queue_call(DroneCall::ExecuteCommand {
            command,
            working_directory: abs_working_directory.clone(),
            log_file: Some(log_file),
            pidfile_name: request.pidfile_name.clone(),
        });
        drone.active_processes += request.num_processes;
        self.queue.reorder(&self.drones);

        let pidfile_id = PidfileId::new(abs_working_directory.join(&request.pidfile_name));
        self.register_pidfile(&pidfile_id);
        self.declare_process_count(&pidfile_id, request.num_processes);
        Ok(pidfile_id)
    }

    fn drone_for_pidfile(&mut self, pidfile_id: &PidfileId) -> DroneManagerResult<String> {
        let hostname = self
            .get_pidfile_contents(pidfile_id, false)
            .contents()
            .and_then(|contents| contents.process.as_ref())
            .map(|process| process.hostname.clone())
            .ok_or_else(|| DroneManagerError::NoProcessForPidfile(pidfile_id.clone()))?;
        if !self.drones.contains_key(&hostname) {
            return Err(DroneManagerError::UnknownDrone(hostname));
        }
        Ok(hostname)
    }

    fn drone_for_process_mut(&mut self, process: &Process) -> DroneManagerResult<&mut Drone> {
        self.drones
            .get_mut(&process.hostname)
            .ok_or_else(|| DroneManagerError::UnknownDrone(process.hostname.clone()))
    }

    fn results_drone_mut(&mut self) -> DroneManagerResult<&mut Drone> {
        self.results_drone
            .as_mut()
            .ok_or(DroneManagerError::NotInitialized)
    }

    // ── Pidfiles ───────────────────────────────────────────────────

    pub fn get_pidfile_id_from(&self, execution_tag: &str, pidfile_name: &str) -> PidfileId {
        PidfileId::new(self.absolute_path(execution_tag, false).join(pidfile_name))
    }

    /// Look for this pidfile on every refresh. Resets its age.
    pub fn register_pidfile(&mut self, pidfile_id: &PidfileId) {
        let info = self
            .registered_pidfiles
            .entry(pidfile_id.clone())
            .or_insert_with(|| {
                info!(pidfile = %pidfile_id, "monitoring pidfile");
                PidfileInfo::default()
            });
        info.age = 0;
    }

    pub fn unregister_pidfile(&mut self, pidfile_id: &PidfileId) {
        if self.registered_pidfiles.remove(pidfile_id).is_some() {
            info!(pidfile = %pidfile_id, "forgetting pidfile");
        }
    }

    pub fn is_pidfile_registered(&self, pidfile_id: &PidfileId) -> bool {
        self.registered_pidfiles.contains_key(pidfile_id)
    }

    /// Registers the pidfile if it is not tracked yet.
    pub fn declare_process_count(&mut self, pidfile_id: &PidfileId, num_processes: u32) {
        self.registered_pidfiles
            .entry(pidfile_id.clone())
            .or_default()
            .num_processes = Some(num_processes);
    }

    /// Contents from this cycle's first read, or the second read taken
    /// after the process scan. Unknown pidfiles start being tracked and
    /// read as empty until the next refresh.
    pub fn get_pidfile_contents(
        &mut self,
        pidfile_id: &PidfileId,
        use_second_read: bool,
    ) -> PidfileState {
        self.register_pidfile(pidfile_id);
        let pidfiles = if use_second_read {
            &self.pidfiles_second_read
        } else {
            &self.pidfiles
        };
        pidfiles.get(pidfile_id).cloned().unwrap_or_default()
    }

    // ── Paths & files ──────────────────────────────────────────────

    /// Unique path under the drone temporary directory for this run.
    pub fn get_temporary_path(&mut self, base_name: &str) -> String {
        self.temporary_path_counter += 1;
        format!(
            "{TEMPORARY_DIRECTORY}/{base_name}.{}",
            self.temporary_path_counter
        )
    }

    pub fn absolute_path(&self, path: &str, on_results_repository: bool) -> PathBuf {
        let base = if on_results_repository {
            self.results_dir.clone()
        } else {
            self.config.drone_results_dir()
        };
        if path.is_empty() { base } else { base.join(path) }
    }

    fn copy_results_helper(
        &mut self,
        process: &Process,
        source_path: &str,
        destination_path: &str,
        to_results_repository: bool,
    ) -> DroneManagerResult<()> {
        let full_source = path_string(&self.absolute_path(source_path, false));
        let full_destination =
            path_string(&self.absolute_path(destination_path, to_results_repository));

        if !to_results_repository {
            self.drone_for_process_mut(process)?
                .queue_call(DroneCall::CopyFileOrDirectory {
                    source: full_source,
                    destination: full_destination,
                });
            return Ok(());
        }

        let source_drone = self
            .drones
            .get(&process.hostname)
            .ok_or_else(|| DroneManagerError::UnknownDrone(process.hostname.clone()))?;
        let results_drone = self
            .results_drone
            .as_ref()
            .ok_or(DroneManagerError::NotInitialized)?;
        let transfer = source_drone.send_file_to(results_drone, &full_source, &full_destination, true);
        match transfer.queue_on {
            TransferSide::Source => self.drone_for_process_mut(process)?.queue_call(transfer.call),
            TransferSide::Target => self.results_drone_mut()?.queue_call(transfer.call),
        }
        Ok(())
    }

    /// Copy `source_path` from the process's drone to the results
    /// repository, at the same relative path unless `destination_path`
    /// is given.
    pub fn copy_to_results_repository(
        &mut self,
        process: &Process,
        source_path: &str,
        destination_path: Option<&str>,
    ) -> DroneManagerResult<()> {
        self.copy_results_helper(
            process,
            source_path,
            destination_path.unwrap_or(source_path),
            true,
        )
    }

    pub fn copy_results_on_drone(
        &mut self,
        process: &Process,
        source_path: &str,
        destination_path: &str,
    ) -> DroneManagerResult<()> {
        self.copy_results_helper(process, source_path, destination_path, false)
    }

    /// Stage a file to be written on whichever drone executes the command
    /// whose working directory is `results_dir`. Returns the file path.
    pub fn attach_file_to_execution(
        &mut self,
        results_dir: &str,
        contents: impl Into<String>,
        file_path: Option<String>,
    ) -> DroneManagerResult<String> {
        let file_path = match file_path {
            Some(path) if !path.is_empty() => path,
            _ => self.get_temporary_path("attach"),
        };
        let files = self
            .attached_files
            .entry(results_dir.to_string())
            .or_default();
        if files.contains_key(&file_path) {
            return Err(DroneManagerError::DuplicateAttachment {
                results_dir: results_dir.to_string(),
                file_path,
            });
        }
        files.insert(file_path.clone(), contents.into());
        Ok(file_path)
    }

    /// Drop files staged for `results_dir` whose execution never started.
    pub fn discard_attached_files(&mut self, results_dir: &str) {
        if let Some(files) = self.attached_files.remove(results_dir) {
            debug!(results_dir, files = files.len(), "discarded attached files");
        }
    }

    /// Write `lines` to `file_path` on the paired process's drone, or on
    /// the results repository when there is no paired process.
    pub fn write_lines_to_file<S: AsRef<str>>(
        &mut self,
        file_path: &str,
        lines: &[S],
        paired_with_process: Option<&Process>,
    ) -> DroneManagerResult<()> {
        let mut contents = lines
            .iter()
            .map(|line| line.as_ref())
            .collect::<Vec<_>>()
            .join("\n");
        contents.push('\n');

        let path = self.absolute_path(file_path, paired_with_process.is_none());
        let call = DroneCall::WriteToFile { path, contents };
        match paired_with_process {
            Some(process) => self.drone_for_process_mut(process)?.queue_call(call),
            None => self.results_drone_mut()?.queue_call(call),
        }
        Ok(())
    }
}

fn forward_warnings(alerts: &AdminAlerts, hostname: &str, warnings: Vec<String>) {
    for warning in warnings {
        alerts.enqueue(format!("Warning from drone {hostname}"), warning);
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pidfile::AUTOSERV_PID_FILE;
    use crate::testing::{FakeFactory, config};

    async fn manager(drones: &[&str], max_processes: u32) -> (DroneManager, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::new());
        let mut manager = DroneManager::new(
            config(drones, max_processes),
            factory.clone(),
            AdminAlerts::new(),
        );
        let hostnames: Vec<String> = drones.iter().map(|d| d.to_string()).collect();
        manager
            .initialize("/results", &hostnames, "results")
            .await
            .unwrap();
        manager.refresh().await;
        (manager, factory)
    }

    fn autoserv(working_directory: &str) -> ExecuteRequest {
        ExecuteRequest::new(
            vec!["autotest-remote".into(), "-r".into(), CommandArg::WorkingDirectory],
            working_directory,
            AUTOSERV_PID_FILE,
        )
    }

    #[tokio::test]
    async fn initialize_without_drones_fails() {
        let factory = Arc::new(FakeFactory::new());
        factory.set_unreachable("drone1");
        let mut manager = DroneManager::new(config(&["drone1"], 10), factory, AdminAlerts::new());
        let err = manager
            .initialize("/results", &["drone1".to_string()], "results")
            .await
            .unwrap_err();
        assert!(matches!(err, DroneManagerError::NoValidDrones));
    }

    #[tokio::test]
    async fn unreachable_drones_are_skipped() {
        let factory = Arc::new(FakeFactory::new());
        factory.set_unreachable("drone2");
        let mut manager =
            DroneManager::new(config(&["drone1", "drone2"], 10), factory.clone(), AdminAlerts::new());
        manager
            .initialize(
                "/results",
                &["drone1".to_string(), "drone2".to_string()],
                "results",
            )
            .await
            .unwrap();
        assert_eq!(manager.drones().count(), 1);
        assert!(matches!(
            factory.drone("drone1").calls()[0],
            DroneCall::Initialize { ref results_dir } if results_dir == Path::new("/autotest/results")
        ));
        // results drone is not initialized
        assert!(factory.drone("results").calls().is_empty());
    }

    #[tokio::test]
    async fn chooses_first_drone_that_fits() {
        let (mut manager, _) = manager(&["drone1", "drone2"], 10).await;
        manager.drone_mut("drone1").unwrap().active_processes = 9;
        manager.drone_mut("drone2").unwrap().active_processes = 2;
        manager.queue.reorder(&manager.drones);

        manager
            .execute_command(autoserv("1-alice/host1").with_num_processes(3))
            .unwrap();
        assert_eq!(manager.drone("drone2").unwrap().active_processes, 5);
        assert_eq!(manager.drone("drone1").unwrap().active_processes, 9);
        assert_eq!(manager.queue.len(), 2);
    }

    #[tokio::test]
    async fn overcommits_least_loaded_when_nothing_fits() {
        let (mut manager, _) = manager(&["drone1", "drone2"], 4).await;
        manager.drone_mut("drone1").unwrap().active_processes = 4;
        manager.drone_mut("drone2").unwrap().active_processes = 3;
        manager.queue.reorder(&manager.drones);

        manager
            .execute_command(autoserv("1-alice/host1").with_num_processes(2))
            .unwrap();
        assert_eq!(manager.drone("drone2").unwrap().active_processes, 5);
    }

    #[tokio::test]
    async fn restricted_drones_need_matching_user() {
        let (mut manager, _) = manager(&["drone1", "drone2"], 10).await;
        manager.drone_mut("drone1").unwrap().allowed_users =
            Some(BTreeSet::from(["bob".to_string()]));
        manager.drone_mut("drone2").unwrap().active_processes = 9;
        manager.queue.reorder(&manager.drones);

        manager
            .execute_command(autoserv("1-alice/host1").with_username(Some("alice".to_string())))
            .unwrap();
        assert_eq!(manager.drone("drone2").unwrap().active_processes, 10);

        manager
            .execute_command(autoserv("2-bob/host2").with_username(Some("bob".to_string())))
            .unwrap();
        assert_eq!(manager.drone("drone1").unwrap().active_processes, 1);
    }

    #[tokio::test]
    async fn usable_drone_respects_users_and_enabled() {
        let (mut manager, _) = manager(&["drone1"], 10).await;
        assert!(manager.has_usable_drone(Some("alice")));

        manager.drone_mut("drone1").unwrap().allowed_users =
            Some(BTreeSet::from(["bob".to_string()]));
        assert!(!manager.has_usable_drone(Some("alice")));
        assert!(manager.has_usable_drone(Some("bob")));

        manager.queue.clear();
        assert!(!manager.has_usable_drone(Some("bob")));
    }

    #[tokio::test]
    async fn no_usable_drone_is_an_error() {
        let (mut manager, _) = manager(&["drone1"], 10).await;
        let request = autoserv("1-alice/host1").with_drones_allowed(BTreeSet::from(["other".to_string()]));
        let err = manager.execute_command(request).unwrap_err();
        assert!(matches!(err, DroneManagerError::NoDronesAvailable(_)));
        // the checked drone is back on the queue
        assert_eq!(manager.queue.len(), 1);
    }

    #[tokio::test]
    async fn execute_command_queues_attached_files_and_command() {
        let (mut manager, factory) = manager(&["drone1"], 10).await;
        let control = manager
            .attach_file_to_execution("1-alice/host1", "job.run()", Some("1-alice/host1/control.srv".to_string()))
            .unwrap();
        assert_eq!(control, "1-alice/host1/control.srv");

        let pidfile_id = manager.execute_command(autoserv("1-alice/host1")).unwrap();
        assert_eq!(
            pidfile_id.path(),
            Path::new("/autotest/results/1-alice/host1/.autoserv_execute")
        );
        assert!(manager.is_pidfile_registered(&pidfile_id));

        manager.execute_actions().await;
        let calls = factory.drone("drone1").calls();
        let n = calls.len();
        assert!(matches!(
            &calls[n - 2],
            DroneCall::WriteToFile { path, contents }
                if path == Path::new("/autotest/results/1-alice/host1/control.srv") && contents == "job.run()"
        ));
        match &calls[n - 1] {
            DroneCall::ExecuteCommand {
                command,
                log_file,
                ..
            } => {
                assert_eq!(command[2], "/autotest/results/1-alice/host1");
                assert_eq!(
                    log_file.as_deref(),
                    Some(Path::new("/autotest/results/drone_tmp/execute.1"))
                );
            }
            other => panic!("unexpected call {other}"),
        }
    }

    #[tokio::test]
    async fn duplicate_attachment_is_rejected() {
        let (mut manager, _) = manager(&["drone1"], 10).await;
        manager
            .attach_file_to_execution("dir", "a", Some("dir/f".to_string()))
            .unwrap();
        let err = manager
            .attach_file_to_execution("dir", "b", Some("dir/f".to_string()))
            .unwrap_err();
        assert!(matches!(err, DroneManagerError::DuplicateAttachment { .. }));

        let generated = manager.attach_file_to_execution("dir", "c", None).unwrap();
        assert!(generated.starts_with("drone_tmp/attach."));
    }

    #[tokio::test]
    async fn refresh_reads_pidfiles_and_counts_active_processes() {
        let (mut manager, factory) = manager(&["drone1"], 10).await;
        let pidfile_id = manager
            .execute_command(autoserv("1-alice/host1").with_num_processes(4))
            .unwrap();
        manager.execute_actions().await;

        let drone = factory.drone("drone1");
        drone.set_pidfile(pidfile_id.path(), "1234\n");
        drone.add_autoserv(1234, 1, "autotest-remote -P 1-alice/host1 -m host1");
        manager.refresh().await;

        let state = manager.get_pidfile_contents(&pidfile_id, false);
        let process = state.contents().unwrap().process.clone().unwrap();
        assert_eq!(process, Process::new("drone1", 1234));
        assert!(manager.is_process_running(&process));
        assert_eq!(manager.process_for_execution_tag("1-alice/host1"), Some(&process));
        assert_eq!(manager.get_orphaned_autoserv_processes().len(), 1);
        assert_eq!(manager.drone("drone1").unwrap().active_processes, 4);
        assert_eq!(manager.total_running_processes(), 4);
        assert_eq!(manager.max_runnable_processes(None, None), 6);

        drone.set_pidfile(pidfile_id.path(), "1234\n0\n0\n");
        manager.refresh().await;
        assert_eq!(manager.drone("drone1").unwrap().active_processes, 0);
    }

    #[tokio::test]
    async fn pidfiles_age_out_and_come_back() {
        let (mut manager, _) = manager(&["drone1"], 10).await;
        let pidfile_id = PidfileId::new("/autotest/results/9-bob/host9/.autoserv_execute");
        manager.register_pidfile(&pidfile_id);

        // max_pidfile_refreshes is 5
        for _ in 0..4 {
            manager.refresh().await;
        }
        assert!(manager.is_pidfile_registered(&pidfile_id));
        manager.refresh().await;
        assert!(!manager.is_pidfile_registered(&pidfile_id));

        assert_eq!(manager.get_pidfile_contents(&pidfile_id, false), PidfileState::default());
        assert!(manager.is_pidfile_registered(&pidfile_id));
        for _ in 0..4 {
            manager.refresh().await;
        }
        assert!(manager.is_pidfile_registered(&pidfile_id));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_state_and_leaves_queue() {
        let (mut manager, factory) = manager(&["drone1", "drone2"], 10).await;
        let pidfile_id = manager
            .execute_command(autoserv("1-alice/host1").with_drones_allowed(BTreeSet::from(["drone1".to_string()])))
            .unwrap();
        manager.execute_actions().await;
        factory.drone("drone1").set_pidfile(pidfile_id.path(), "77\n");
        factory.drone("drone1").add_autoserv(77, 1, "autotest-remote -P 1-alice/host1");
        manager.refresh().await;
        assert_eq!(manager.drone("drone1").unwrap().active_processes, 1);

        factory.drone("drone1").set_failing(true);
        manager.refresh().await;
        assert!(manager.is_process_running(&Process::new("drone1", 77)));
        assert_eq!(manager.drone("drone1").unwrap().active_processes, 1);
        assert_eq!(manager.queue.hostnames(), vec!["drone2".to_string()]);
        assert!(!manager.alerts().is_empty());
    }

    #[tokio::test]
    async fn results_repository_failure_is_alerted_and_cleared() {
        let (mut manager, factory) = manager(&["drone1"], 10).await;
        manager
            .write_lines_to_file("1-alice/status.log", &["START", "END GOOD"], None)
            .unwrap();
        factory.drone("results").set_failing(true);
        manager.execute_actions().await;

        let alerts = manager.alerts().drain();
        assert!(alerts.iter().any(|a| a.subject == "Results repository error"));
        assert!(manager.results_drone().unwrap().queued_calls().is_empty());
    }

    #[tokio::test]
    async fn write_lines_targets_results_repository_or_paired_drone() {
        let (mut manager, factory) = manager(&["drone1"], 10).await;
        manager
            .write_lines_to_file("1-alice/keyvals", &["a=1", "b=2"], None)
            .unwrap();
        manager
            .write_lines_to_file("1-alice/host1/x", &["y"], Some(&Process::new("drone1", 5)))
            .unwrap();
        manager.execute_actions().await;

        assert_eq!(
            factory.drone("results").calls(),
            vec![DroneCall::WriteToFile {
                path: PathBuf::from("/results/1-alice/keyvals"),
                contents: "a=1\nb=2\n".to_string(),
            }]
        );
        assert!(factory.drone("drone1").calls().contains(&DroneCall::WriteToFile {
            path: PathBuf::from("/autotest/results/1-alice/host1/x"),
            contents: "y\n".to_string(),
        }));
    }

    #[tokio::test]
    async fn copy_to_results_repository_pushes_from_drone() {
        let (mut manager, factory) = manager(&["drone1"], 10).await;
        manager
            .copy_to_results_repository(&Process::new("drone1", 5), "1-alice/host1", None)
            .unwrap();
        manager
            .copy_results_on_drone(&Process::new("drone1", 5), "1-alice/host1/", "1-alice/group0")
            .unwrap();
        manager.execute_actions().await;

        let calls = factory.drone("drone1").calls();
        assert!(calls.contains(&DroneCall::SendFileTo {
            hostname: "results".to_string(),
            source: "/autotest/results/1-alice/host1".to_string(),
            destination: "/results/1-alice/host1".to_string(),
            can_fail: true,
        }));
        assert!(calls.contains(&DroneCall::CopyFileOrDirectory {
            source: "/autotest/results/1-alice/host1/".to_string(),
            destination: "/autotest/results/1-alice/group0".to_string(),
        }));
    }

    #[tokio::test]
    async fn paired_command_runs_on_pidfile_drone() {
        let (mut manager, factory) = manager(&["drone1", "drone2"], 10).await;
        let pidfile_id = manager.get_pidfile_id_from("1-alice/host1", AUTOSERV_PID_FILE);
        factory.drone("drone2").set_pidfile(pidfile_id.path(), "55\n0\n0\n");
        manager.register_pidfile(&pidfile_id);
        manager.refresh().await;

        manager
            .execute_command(autoserv("1-alice/host1").paired_with(pidfile_id))
            .unwrap();
        manager.execute_actions().await;
        assert_eq!(factory.drone("drone2").executed_commands().len(), 1);
        assert!(factory.drone("drone1").executed_commands().is_empty());
    }

    #[tokio::test]
    async fn kill_process_queues_on_owning_drone() {
        let (mut manager, factory) = manager(&["drone1"], 10).await;
        manager.kill_process(&Process::new("drone1", 42)).unwrap();
        assert!(matches!(
            manager.kill_process(&Process::new("nowhere", 1)),
            Err(DroneManagerError::UnknownDrone(_))
        ));
        manager.execute_actions().await;
        assert_eq!(
            factory.drone("drone1").calls().last(),
            Some(&DroneCall::KillProcess {
                process: Process::new("drone1", 42)
            })
        );
    }

    #[test]
    fn temporary_paths_are_unique() {
        let mut manager = DroneManager::new(
            config(&["drone1"], 1),
            Arc::new(FakeFactory::new()),
            AdminAlerts::new(),
        );
        assert_eq!(manager.get_temporary_path("execute"), "drone_tmp/execute.1");
        assert_eq!(manager.get_temporary_path("attach"), "drone_tmp/attach.2");
        assert_eq!(
            manager.absolute_path("x", true),
            PathBuf::from("/results/x")
        );
    }
}
