//! Wire protocol between the drone manager and a drone utility.
//!
//! A batch of [`DroneCall`]s is sent as a JSON array; the utility answers
//! with one [`ExecutionReport`] holding a [`CallResult`] per call plus any
//! warnings raised while executing them.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Command name of the job runner process on a drone.
pub const AUTOSERV_COMMAND: &str = "autotest-remote";

/// Command name of the results parser process on a drone.
pub const PARSE_COMMAND: &str = "parse";

/// An OS process on a specific drone.
///
/// Equality and hashing use `(hostname, pid)` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub hostname: String,
    pub pid: i32,
    pub ppid: Option<i32>,
}

impl Process {
    pub fn new(hostname: impl Into<String>, pid: i32) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
            ppid: None,
        }
    }

    pub fn with_ppid(mut self, ppid: i32) -> Self {
        self.ppid = Some(ppid);
        self
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.hostname == other.hostname && self.pid == other.pid
    }
}

impl Eq for Process {}

impl Hash for Process {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hostname.hash(state);
        self.pid.hash(state);
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hostname, self.pid)
    }
}

/// One row of `ps x -o pid,pgid,ppid,comm,args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub pgid: i32,
    pub ppid: i32,
    pub comm: String,
    pub args: String,
}

/// A single operation for a drone utility to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DroneCall {
    Initialize {
        results_dir: PathBuf,
    },
    Refresh {
        pidfile_paths: Vec<PathBuf>,
        check_dark_mark: bool,
    },
    KillProcess {
        process: Process,
    },
    ExecuteCommand {
        command: Vec<String>,
        working_directory: PathBuf,
        log_file: Option<PathBuf>,
        pidfile_name: String,
    },
    WriteToFile {
        path: PathBuf,
        contents: String,
    },
    CopyFileOrDirectory {
        source: String,
        destination: String,
    },
    /// Push a local path to `hostname` (an ssh destination, possibly
    /// `user@host`).
    SendFileTo {
        hostname: String,
        source: String,
        destination: String,
        can_fail: bool,
    },
    /// Pull a path from `hostname` to the local filesystem.
    GetFileFrom {
        hostname: String,
        source: String,
        destination: String,
    },
}

impl DroneCall {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::Refresh { .. } => "refresh",
            Self::KillProcess { .. } => "kill_process",
            Self::ExecuteCommand { .. } => "execute_command",
            Self::WriteToFile { .. } => "write_to_file",
            Self::CopyFileOrDirectory { .. } => "copy_file_or_directory",
            Self::SendFileTo { .. } => "send_file_to",
            Self::GetFileFrom { .. } => "get_file_from",
        }
    }
}

impl fmt::Display for DroneCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialize { results_dir } => {
                write!(f, "initialize({})", results_dir.display())
            }
            Self::Refresh { pidfile_paths, .. } => {
                write!(f, "refresh({} pidfiles)", pidfile_paths.len())
            }
            Self::KillProcess { process } => write!(f, "kill_process({process})"),
            Self::ExecuteCommand { command, .. } => {
                write!(f, "execute_command({})", command.join(" "))
            }
            Self::WriteToFile { path, .. } => write!(f, "write_to_file({})", path.display()),
            Self::CopyFileOrDirectory {
                source,
                destination,
            } => write!(f, "copy_file_or_directory({source}, {destination})"),
            Self::SendFileTo {
                hostname,
                source,
                destination,
                ..
            } => write!(f, "send_file_to({hostname}, {source}, {destination})"),
            Self::GetFileFrom {
                hostname,
                source,
                destination,
            } => write!(f, "get_file_from({hostname}, {source}, {destination})"),
        }
    }
}

/// Process and pidfile state reported by a drone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub autoserv_processes: Vec<ProcessInfo>,
    pub parse_processes: Vec<ProcessInfo>,
    /// Pidfile path -> raw contents, for pidfiles that exist.
    pub pidfiles: BTreeMap<PathBuf, String>,
    /// Same keys as `pidfiles`, read after the process scan.
    pub pidfiles_second_read: BTreeMap<PathBuf, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum CallResult {
    Done,
    Refresh(RefreshReport),
    Failed(String),
}

/// Answer to one batch of calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub results: Vec<CallResult>,
    pub warnings: Vec<String>,
}
