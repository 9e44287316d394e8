//! DroneUtility — the OS side of a drone.
//!
//! Executes batches of [`DroneCall`]s against the local machine: scans the
//! process table, reads pidfiles, spawns and kills processes, writes and
//! copies files, and moves files between machines with rsync over ssh.
//! All paths going into and out of the utility are absolute.
//!
//! Failures of individual calls never abort a batch. They are reported as
//! [`CallResult::Failed`] and collected as warnings for the caller.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{DroneError, DroneResult};
use crate::protocol::*;

/// Environment variable marking every process spawned by a drone utility.
pub const DARK_MARK_ENVIRONMENT_VAR: &str = "AUTOTEST_SCHEDULER_DARK_MARK";

/// Scratch directory under the results directory, wiped on initialize.
pub const TEMPORARY_DIRECTORY: &str = "drone_tmp";

/// Marker left next to a source path whose optional transfer failed.
pub const TRANSFER_FAILED_FILE: &str = ".transfer_failed";

/// Batches slower than this produce a warning.
const WARNING_DURATION: Duration = Duration::from_secs(60);

const PS_FORMAT: &str = "pid,pgid,ppid,comm,args";

struct Transfer {
    child: Child,
    description: String,
    failure_marker: Option<FailureMarker>,
}

/// Where to record a failed `can_fail` send.
struct FailureMarker {
    hostname: String,
    source: PathBuf,
    destination: String,
}

pub struct DroneUtility {
    max_transfer_processes: usize,
    proc_root: PathBuf,
    warnings: Vec<String>,
    transfers: Vec<Transfer>,
    /// Spawned commands, reaped at the start of each batch.
    children: Vec<Child>,
}

impl DroneUtility {
    pub fn new(max_transfer_processes: usize) -> Self {
        Self {
            max_transfer_processes: max_transfer_processes.max(1),
            proc_root: PathBuf::from("/proc"),
            warnings: Vec::new(),
            transfers: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Read process state from a different procfs mount.
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    /// Execute a batch of calls and collect the warnings they raised.
    pub fn execute_calls(&mut self, calls: &[DroneCall]) -> ExecutionReport {
        let start = Instant::now();
        self.reap_children();

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute_call(call));
            if self.transfers.len() >= self.max_transfer_processes {
                self.wait_for_some_transfers();
            }
        }
        self.wait_for_all_transfers();

        let duration = start.elapsed();
        if duration > WARNING_DURATION {
            self.report_long_execution(calls, duration);
        }

        ExecutionReport {
            results,
            warnings: std::mem::take(&mut self.warnings),
        }
    }

    fn execute_call(&mut self, call: &DroneCall) -> CallResult {
        debug!(%call, "executing drone call");
        let outcome = match call {
            DroneCall::Initialize { results_dir } => self.initialize(results_dir),
            DroneCall::Refresh {
                pidfile_paths,
                check_dark_mark,
            } => {
                return match self.refresh(pidfile_paths, *check_dark_mark) {
                    Ok(report) => CallResult::Refresh(report),
                    Err(e) => self.failed(call, e),
                };
            }
            DroneCall::KillProcess { process } => self.kill_process(process),
            DroneCall::ExecuteCommand {
                command,
                working_directory,
                log_file,
                pidfile_name,
            } => self.execute_command(
                command,
                working_directory,
                log_file.as_deref(),
                pidfile_name,
            ),
            DroneCall::WriteToFile { path, contents } => {
                self.write_to_file(path, contents);
                Ok(())
            }
            DroneCall::CopyFileOrDirectory {
                source,
                destination,
            } => copy_file_or_directory(source, destination),
            DroneCall::SendFileTo {
                hostname,
                source,
                destination,
                can_fail,
            } => self.send_file_to(hostname, source, destination, *can_fail),
            DroneCall::GetFileFrom {
                hostname,
                source,
                destination,
            } => self.get_file_from(hostname, source, destination),
        };

        match outcome {
            Ok(()) => CallResult::Done,
            Err(e) => self.failed(call, e),
        }
    }

    fn failed(&mut self, call: &DroneCall, error: DroneError) -> CallResult {
        self.warn(format!("{call} failed: {error}"));
        CallResult::Failed(error.to_string())
    }

    fn warn(&mut self, warning: String) {
        warn!("{warning}");
        self.warnings.push(warning);
    }

    // ── Calls ──────────────────────────────────────────────────────

    fn initialize(&mut self, results_dir: &Path) -> DroneResult<()> {
        let temporary_directory = results_dir.join(TEMPORARY_DIRECTORY);
        if temporary_directory.exists() {
            fs::remove_dir_all(&temporary_directory)?;
        }
        ensure_directory_exists(&temporary_directory)
    }

    fn refresh(
        &mut self,
        pidfile_paths: &[PathBuf],
        check_dark_mark: bool,
    ) -> DroneResult<RefreshReport> {
        let pidfiles = read_pidfiles(pidfile_paths);
        let processes = list_processes()?;
        let autoserv_processes =
            self.filter_processes(&processes, AUTOSERV_COMMAND, check_dark_mark);
        let parse_processes = self.filter_processes(&processes, PARSE_COMMAND, check_dark_mark);
        let pidfiles_second_read = read_pidfiles(pidfile_paths);

        Ok(RefreshReport {
            autoserv_processes,
            parse_processes,
            pidfiles,
            pidfiles_second_read,
        })
    }

    /// Processes named `command_name`, optionally only those carrying the
    /// dark mark.
    pub fn filter_processes(
        &mut self,
        processes: &[ProcessInfo],
        command_name: &str,
        check_dark_mark: bool,
    ) -> Vec<ProcessInfo> {
        let mut matching = Vec::new();
        for info in processes.iter().filter(|info| info.comm == command_name) {
            if check_dark_mark && !self.has_dark_mark(info.pid) {
                self.warn(format!(
                    "{} process pid {} has no dark mark; ignoring.",
                    info.comm, info.pid
                ));
                continue;
            }
            matching.push(info.clone());
        }
        matching
    }

    fn has_dark_mark(&self, pid: i32) -> bool {
        let environ = self.proc_root.join(pid.to_string()).join("environ");
        match fs::read(environ) {
            Ok(data) => data
                .windows(DARK_MARK_ENVIRONMENT_VAR.len())
                .any(|window| window == DARK_MARK_ENVIRONMENT_VAR.as_bytes()),
            Err(_) => false,
        }
    }

    fn is_process_running(&self, pid: i32) -> bool {
        self.proc_root.join(pid.to_string()).exists()
    }

    fn kill_process(&mut self, process: &Process) -> DroneResult<()> {
        if !self.is_process_running(process.pid) {
            return Ok(());
        }
        send_signal(process.pid, libc::SIGCONT)?;
        send_signal(process.pid, libc::SIGTERM)?;
        debug!(pid = process.pid, "process signalled");
        Ok(())
    }

    fn execute_command(
        &mut self,
        command: &[String],
        working_directory: &Path,
        log_file: Option<&Path>,
        pidfile_name: &str,
    ) -> DroneResult<()> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| DroneError::Protocol("empty command".to_string()))?;

        let output = match log_file {
            Some(path) => match open_log_file(path, command) {
                Ok(file) => Some(file),
                Err(e) => {
                    self.warn(format!("Error opening log file {}: {e}", path.display()));
                    None
                }
            },
            None => None,
        };

        ensure_directory_exists(working_directory)?;
        let pidfile_path = working_directory.join(pidfile_name);
        if pidfile_path.exists() {
            self.warn(format!("Pidfile {} already exists", pidfile_path.display()));
            fs::remove_file(&pidfile_path)?;
        }

        let (stdout, stderr) = match output {
            Some(file) => {
                let stderr = file.try_clone()?;
                (Stdio::from(file), Stdio::from(stderr))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .env(DARK_MARK_ENVIRONMENT_VAR, std::process::id().to_string())
            .spawn()?;
        debug!(pid = child.id(), program = %program, "command spawned");
        self.children.push(child);
        Ok(())
    }

    fn write_to_file(&mut self, path: &Path, contents: &str) {
        let result = path
            .parent()
            .map_or(Ok(()), ensure_directory_exists)
            .and_then(|()| {
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                file.write_all(contents.as_bytes())?;
                Ok(())
            });
        if let Err(e) = result {
            self.warn(format!("Error write to file {}: {e}", path.display()));
        }
    }

    fn send_file_to(
        &mut self,
        hostname: &str,
        source: &str,
        destination: &str,
        can_fail: bool,
    ) -> DroneResult<()> {
        let remote_parent = parent_of(destination);
        let mut command = rsync_command();
        command
            .arg(format!("--rsync-path=mkdir -p '{remote_parent}' && rsync"))
            .arg(source)
            .arg(format!("{hostname}:{destination}"));

        let failure_marker = can_fail.then(|| FailureMarker {
            hostname: hostname.to_string(),
            source: PathBuf::from(source),
            destination: destination.to_string(),
        });
        self.start_transfer(
            command,
            format!("send {source} to {hostname}:{destination}"),
            failure_marker,
        )
    }

    fn get_file_from(&mut self, hostname: &str, source: &str, destination: &str) -> DroneResult<()> {
        ensure_directory_exists(Path::new(parent_of(destination)))?;
        let mut command = rsync_command();
        command
            .arg(format!("{hostname}:{source}"))
            .arg(destination);
        self.start_transfer(
            command,
            format!("get {hostname}:{source} to {destination}"),
            None,
        )
    }

    // ── Transfers ──────────────────────────────────────────────────

    fn start_transfer(
        &mut self,
        mut command: Command,
        description: String,
        failure_marker: Option<FailureMarker>,
    ) -> DroneResult<()> {
        let child = command.spawn()?;
        debug!(%description, "transfer started");
        self.transfers.push(Transfer {
            child,
            description,
            failure_marker,
        });
        Ok(())
    }

    fn poll_transfers(&mut self) {
        let mut still_running = Vec::with_capacity(self.transfers.len());
        for mut transfer in std::mem::take(&mut self.transfers) {
            match transfer.child.try_wait() {
                Ok(None) => still_running.push(transfer),
                Ok(Some(status)) => self.finish_transfer(transfer, status),
                Err(e) => self.warn(format!("{}: {e}", transfer.description)),
            }
        }
        self.transfers = still_running;
    }

    fn wait_for_some_transfers(&mut self) {
        self.poll_transfers();
        while self.transfers.len() >= self.max_transfer_processes {
            std::thread::sleep(Duration::from_secs(1));
            self.poll_transfers();
        }
    }

    fn wait_for_all_transfers(&mut self) {
        for mut transfer in std::mem::take(&mut self.transfers) {
            match transfer.child.wait() {
                Ok(status) => self.finish_transfer(transfer, status),
                Err(e) => self.warn(format!("{}: {e}", transfer.description)),
            }
        }
    }

    fn finish_transfer(&mut self, transfer: Transfer, status: ExitStatus) {
        if status.success() {
            debug!(description = %transfer.description, "transfer finished");
            return;
        }
        let reason = format!("{} failed: {status}", transfer.description);
        match transfer.failure_marker {
            Some(marker) => {
                if let Err(e) = write_failure_marker(&marker, &reason) {
                    self.warn(format!(
                        "could not record failed transfer of {}: {e}",
                        marker.source.display()
                    ));
                }
            }
            None => self.warn(reason),
        }
    }

    fn reap_children(&mut self) {
        self.children
            .retain_mut(|child| matches!(child.try_wait(), Ok(None)));
    }

    fn report_long_execution(&mut self, calls: &[DroneCall], duration: Duration) {
        let mut call_count: BTreeMap<&str, usize> = BTreeMap::new();
        for call in calls {
            *call_count.entry(call.method()).or_default() += 1;
        }
        let summary: Vec<String> = call_count
            .iter()
            .map(|(method, count)| format!("{count} {method}"))
            .collect();
        self.warn(format!(
            "Execution took {:.3} sec\n{}",
            duration.as_secs_f64(),
            summary.join("\n")
        ));
    }
}

// ── Filesystem helpers ─────────────────────────────────────────────

fn ensure_directory_exists(path: &Path) -> DroneResult<()> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(DroneError::Io(std::io::Error::other(format!(
            "path {} exists as a file, not a directory",
            path.display()
        ))));
    }
    fs::create_dir_all(path)?;
    Ok(())
}

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => "/",
        Some(index) => &path[..index],
        None => ".",
    }
}

/// Pidfile path -> contents, for every path that exists and is readable.
pub fn read_pidfiles(pidfile_paths: &[PathBuf]) -> BTreeMap<PathBuf, String> {
    pidfile_paths
        .iter()
        .filter_map(|path| {
            fs::read_to_string(path)
                .ok()
                .map(|contents| (path.clone(), contents))
        })
        .collect()
}

fn open_log_file(path: &Path, command: &[String]) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let separator = "*".repeat(80);
    write!(
        file,
        "\n{separator}\n{}> {}\n{separator}\n",
        chrono::Local::now().format("%X %x"),
        command.join(" ")
    )?;
    Ok(file)
}

/// Copy a file or directory.
///
/// A source ending in `/` copies the directory's contents into the
/// (existing) destination directory; otherwise the path itself is copied.
/// Symlinks are recreated rather than followed.
pub fn copy_file_or_directory(source: &str, destination: &str) -> DroneResult<()> {
    if source.trim_end_matches('/') == destination.trim_end_matches('/') {
        return Ok(());
    }
    ensure_directory_exists(Path::new(parent_of(destination)))?;

    let source_path = Path::new(source);
    let destination_path = Path::new(destination);
    if source.ends_with('/') {
        if !source_path.is_dir() || !destination_path.is_dir() {
            return Err(DroneError::Protocol(format!(
                "copying contents of {source} requires both {source} and {destination} to be directories"
            )));
        }
        for entry in fs::read_dir(source_path)? {
            let entry = entry?;
            let name = entry.file_name();
            copy_file_or_directory(
                &source_path.join(&name).to_string_lossy(),
                &destination_path.join(&name).to_string_lossy(),
            )?;
        }
    } else if source_path.is_dir() {
        copy_tree(source_path, destination_path)?;
    } else if source_path.is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(source_path)?, destination_path)?;
    } else {
        fs::copy(source_path, destination_path)?;
    }
    Ok(())
}

fn copy_tree(source: &Path, destination: &Path) -> DroneResult<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| DroneError::Io(std::io::Error::other(e)))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| DroneError::Protocol(e.to_string()))?;
        let target = destination.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn write_failure_marker(marker: &FailureMarker, reason: &str) -> DroneResult<()> {
    if marker.source.is_dir() {
        let mut file = File::create(marker.source.join(TRANSFER_FAILED_FILE))?;
        write!(
            file,
            "{}:{}\n{}\n{reason}",
            marker.hostname,
            marker.destination,
            chrono::Local::now().to_rfc3339()
        )?;
        Ok(())
    } else {
        let copy_to = format!("{}{TRANSFER_FAILED_FILE}", marker.destination);
        copy_file_or_directory(&marker.source.to_string_lossy(), &copy_to)
    }
}

// ── Processes ──────────────────────────────────────────────────────

fn list_processes() -> DroneResult<Vec<ProcessInfo>> {
    let output = Command::new("/bin/ps")
        .args(["x", "-o", PS_FORMAT])
        .stdin(Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(DroneError::Protocol(format!("ps exited with {}", output.status)));
    }
    Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `ps -o pid,pgid,ppid,comm,args` output, skipping the header.
pub fn parse_ps_output(output: &str) -> Vec<ProcessInfo> {
    output.lines().filter_map(parse_ps_line).collect()
}

fn parse_ps_line(line: &str) -> Option<ProcessInfo> {
    let mut rest = line.trim_start();
    let mut fields = Vec::with_capacity(4);
    for _ in 0..4 {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some(ProcessInfo {
        pid: fields[0].parse().ok()?,
        pgid: fields[1].parse().ok()?,
        ppid: fields[2].parse().ok()?,
        comm: fields[3].to_string(),
        args: rest.trim_end().to_string(),
    })
}

fn send_signal(pid: i32, signal: libc::c_int) -> DroneResult<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn rsync_command() -> Command {
    let mut command = Command::new("rsync");
    command
        .args(["-a", "--delete", "-e", "ssh -o BatchMode=yes -o ConnectTimeout=30"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}
