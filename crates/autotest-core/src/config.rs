//! scheduler.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Directory name under the drone installation directory that holds results.
pub const DRONE_RESULTS_DIR_SUFFIX: &str = "results";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Per-drone overrides keyed by hostname.
    #[serde(default)]
    pub drones: BTreeMap<String, DroneOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub drones: Vec<String>,
    pub results_host: String,
    pub drone_installation_directory: PathBuf,
    pub results_host_installation_directory: Option<PathBuf>,
    pub test_output_dir: Option<PathBuf>,
    /// Base results directory on the results repository.
    pub results_dir: PathBuf,
    pub max_pidfile_refreshes: u32,
    pub max_processes_per_drone: u32,
    pub max_transfer_processes: u32,
    pub tick_pause_secs: u64,
    pub pidfile_timeout_secs: u64,
    pub drone_call_timeout_secs: u64,
    pub check_processes_for_dark_mark: bool,
    /// Comma-separated names of site metahost schedulers to enable.
    pub site_metahost_schedulers: String,
    /// Flat `<hostname>_<setting>` keys.
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            drones: vec!["localhost".to_string()],
            results_host: "localhost".to_string(),
            drone_installation_directory: PathBuf::from("/usr/local/autotest"),
            results_host_installation_directory: None,
            test_output_dir: None,
            results_dir: PathBuf::from("/usr/local/autotest/results"),
            max_pidfile_refreshes: 2000,
            max_processes_per_drone: 1000,
            max_transfer_processes: 50,
            tick_pause_secs: 5,
            pidfile_timeout_secs: 300,
            drone_call_timeout_secs: 300,
            check_processes_for_dark_mark: false,
            site_metahost_schedulers: String::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// `[drones."<hostname>"]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroneOverrides {
    pub disabled: Option<bool>,
    pub max_processes: Option<u32>,
    /// Whitespace-separated logins allowed to use the drone.
    pub users: Option<String>,
    /// Login used when connecting to the drone over ssh.
    pub username: Option<String>,
}

/// Effective settings for one drone after applying overrides and defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroneSettings {
    pub enabled: bool,
    pub max_processes: u32,
    /// `None` means any user may use the drone.
    pub allowed_users: Option<BTreeSet<String>>,
    pub username: Option<String>,
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: SchedulerConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolve the settings for `hostname`.
    ///
    /// A `[drones."<hostname>"]` table wins over the flat
    /// `<hostname>_disabled` / `<hostname>_max_processes` /
    /// `<hostname>_users` / `<hostname>_username` keys, which in turn win
    /// over the scheduler-wide defaults.
    pub fn drone_settings(&self, hostname: &str) -> DroneSettings {
        let table = self.drones.get(hostname).cloned().unwrap_or_default();
        let flat = |setting: &str| self.scheduler.extra.get(&format!("{hostname}_{setting}"));

        let disabled = table
            .disabled
            .unwrap_or_else(|| flat("disabled").is_some_and(truthy));

        let max_processes = table
            .max_processes
            .or_else(|| {
                flat("max_processes")
                    .and_then(toml::Value::as_integer)
                    .and_then(|n| u32::try_from(n).ok())
            })
            .unwrap_or(self.scheduler.max_processes_per_drone);

        let users = table
            .users
            .or_else(|| flat("users").and_then(toml::Value::as_str).map(str::to_string));
        let allowed_users =
            users.map(|u| u.split_whitespace().map(str::to_string).collect());

        let username = table
            .username
            .or_else(|| flat("username").and_then(toml::Value::as_str).map(str::to_string));

        DroneSettings {
            enabled: !disabled,
            max_processes,
            allowed_users,
            username,
        }
    }

    /// Names listed in `site_metahost_schedulers`.
    pub fn site_metahost_scheduler_names(&self) -> BTreeSet<String> {
        self.scheduler
            .site_metahost_schedulers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Base directory for results on a drone.
    pub fn drone_results_dir(&self) -> PathBuf {
        let base = match &self.scheduler.test_output_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => self.scheduler.drone_installation_directory.clone(),
        };
        base.join(DRONE_RESULTS_DIR_SUFFIX)
    }

    /// Installation directory used to locate the drone utility on the
    /// results repository.
    pub fn results_host_installation_directory(&self) -> PathBuf {
        self.scheduler
            .results_host_installation_directory
            .clone()
            .unwrap_or_else(|| self.scheduler.drone_installation_directory.clone())
    }
}

/// Anything other than `false`, `0` or an empty string disables.
fn truthy(value: &toml::Value) -> bool {
    match value {
        toml::Value::Boolean(b) => *b,
        toml::Value::String(s) => !s.is_empty(),
        toml::Value::Integer(i) => *i != 0,
        _ => true,
    }
}
