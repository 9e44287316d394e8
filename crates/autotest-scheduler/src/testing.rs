//! In-memory drones for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use autotest_core::SchedulerConfig;
use autotest_drone::{
    AUTOSERV_COMMAND, CallResult, Drone, DroneCall, DroneError, DroneFactory, DroneResult,
    DroneSpec, DroneTransport, ExecutionReport, PARSE_COMMAND, ProcessInfo, RefreshReport,
};

#[derive(Default)]
struct FakeState {
    pidfiles: BTreeMap<PathBuf, String>,
    processes: Vec<ProcessInfo>,
    batches: Vec<Vec<DroneCall>>,
    failing: bool,
}

/// A drone whose filesystem is a map of pidfile contents and whose
/// process table is a plain list.
pub struct FakeDrone {
    hostname: String,
    state: Mutex<FakeState>,
}

impl FakeDrone {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn set_pidfile(&self, path: impl AsRef<Path>, contents: &str) {
        self.state
            .lock()
            .unwrap()
            .pidfiles
            .insert(path.as_ref().to_path_buf(), contents.to_string());
    }

    pub fn add_autoserv(&self, pid: i32, ppid: i32, args: &str) {
        self.state.lock().unwrap().processes.push(ProcessInfo {
            pid,
            pgid: pid,
            ppid,
            comm: AUTOSERV_COMMAND.to_string(),
            args: args.to_string(),
        });
    }

    pub fn clear_processes(&self) {
        self.state.lock().unwrap().processes.clear();
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Every non-refresh call delivered so far.
    pub fn calls(&self) -> Vec<DroneCall> {
        self.state
            .lock()
            .unwrap()
            .batches
            .iter()
            .flatten()
            .filter(|call| !matches!(call, DroneCall::Refresh { .. }))
            .cloned()
            .collect()
    }

    pub fn executed_commands(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DroneCall::ExecuteCommand { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    fn refresh_report(state: &FakeState, pidfile_paths: &[PathBuf]) -> RefreshReport {
        let pidfiles: BTreeMap<PathBuf, String> = pidfile_paths
            .iter()
            .filter_map(|path| {
                state
                    .pidfiles
                    .get(path)
                    .map(|contents| (path.clone(), contents.clone()))
            })
            .collect();
        let by_comm = |comm: &str| {
            state
                .processes
                .iter()
                .filter(|info| info.comm == comm)
                .cloned()
                .collect()
        };
        RefreshReport {
            autoserv_processes: by_comm(AUTOSERV_COMMAND),
            parse_processes: by_comm(PARSE_COMMAND),
            pidfiles_second_read: pidfiles.clone(),
            pidfiles,
        }
    }
}

#[async_trait]
impl DroneTransport for FakeDrone {
    async fn execute_calls(&self, calls: Vec<DroneCall>) -> DroneResult<ExecutionReport> {
        let mut state = self.state.lock().unwrap();
        state.batches.push(calls.clone());
        if state.failing {
            return Err(DroneError::Transport {
                hostname: self.hostname.clone(),
                message: "connection refused".to_string(),
            });
        }
        let results = calls
            .iter()
            .map(|call| match call {
                DroneCall::Refresh { pidfile_paths, .. } => {
                    CallResult::Refresh(Self::refresh_report(&state, pidfile_paths))
                }
                _ => CallResult::Done,
            })
            .collect();
        Ok(ExecutionReport {
            results,
            warnings: Vec::new(),
        })
    }
}

#[derive(Default)]
pub struct FakeFactory {
    drones: Mutex<HashMap<String, Arc<FakeDrone>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, hostname: &str) {
        self.unreachable
            .lock()
            .unwrap()
            .insert(hostname.to_string());
    }

    pub fn drone(&self, hostname: &str) -> Arc<FakeDrone> {
        self.drones
            .lock()
            .unwrap()
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(FakeDrone::new(hostname)))
            .clone()
    }
}

#[async_trait]
impl DroneFactory for FakeFactory {
    async fn create_drone(&self, spec: &DroneSpec) -> DroneResult<Drone> {
        if self.unreachable.lock().unwrap().contains(&spec.hostname) {
            return Err(DroneError::Unreachable(spec.hostname.clone()));
        }
        Ok(Drone::new(spec.hostname.clone(), self.drone(&spec.hostname))
            .with_username(spec.username.clone()))
    }
}

/// Config with the given drones, each allowed `max_processes`.
pub fn config(drones: &[&str], max_processes: u32) -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.scheduler.drones = drones.iter().map(|d| d.to_string()).collect();
    config.scheduler.results_host = "results".to_string();
    config.scheduler.drone_installation_directory = PathBuf::from("/autotest");
    config.scheduler.results_dir = PathBuf::from("/results");
    config.scheduler.max_processes_per_drone = max_processes;
    config.scheduler.max_pidfile_refreshes = 5;
    config
}
