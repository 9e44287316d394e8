//! Pidfile identities and contents.
//!
//! A pidfile is a text file of up to three lines written by a process the
//! scheduler started: its pid, then its exit status, then the number of
//! failed tests.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use autotest_drone::Process;
use regex::Regex;

pub const AUTOSERV_PID_FILE: &str = ".autoserv_execute";
pub const CRASHINFO_PID_FILE: &str = ".collect_crashinfo_execute";
pub const PARSER_PID_FILE: &str = ".parser_execute";
pub const ARCHIVER_PID_FILE: &str = ".archiver_execute";

pub const ALL_PIDFILE_NAMES: [&str; 4] = [
    AUTOSERV_PID_FILE,
    CRASHINFO_PID_FILE,
    PARSER_PID_FILE,
    ARCHIVER_PID_FILE,
];

static EXECUTION_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-P (\S+)").expect("execution tag regex is valid"));

/// A pidfile, identified by its absolute path on the drones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PidfileId(PathBuf);

impl PidfileId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for PidfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PidfileContents {
    pub process: Option<Process>,
    pub exit_status: Option<i32>,
    pub num_tests_failed: Option<i32>,
}

impl PidfileContents {
    pub fn is_running(&self) -> bool {
        self.process.is_some() && self.exit_status.is_none()
    }
}

/// A pidfile that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPidfile {
    pub error: String,
}

impl fmt::Display for InvalidPidfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error)
    }
}

/// Result of reading one pidfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidfileState {
    Contents(PidfileContents),
    Invalid(InvalidPidfile),
}

impl PidfileState {
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }

    pub fn is_running(&self) -> bool {
        match self {
            Self::Contents(contents) => contents.is_running(),
            Self::Invalid(_) => false,
        }
    }

    pub fn contents(&self) -> Option<&PidfileContents> {
        match self {
            Self::Contents(contents) => Some(contents),
            Self::Invalid(_) => None,
        }
    }
}

impl Default for PidfileState {
    fn default() -> Self {
        Self::Contents(PidfileContents::default())
    }
}

/// Parse raw pidfile contents read from `hostname`.
///
/// A two-line file means the writer was caught between the exit status
/// and the failed-test count, so its exit status is ignored until the
/// third line shows up.
pub fn parse_pidfile(hostname: &str, raw_contents: &str) -> PidfileState {
    if raw_contents.is_empty() {
        return PidfileState::default();
    }
    let lines: Vec<&str> = raw_contents.lines().collect();
    if lines.len() > 3 {
        return PidfileState::Invalid(InvalidPidfile {
            error: format!("Corrupt pid file ({} lines):\n{lines:?}", lines.len()),
        });
    }

    match parse_lines(hostname, &lines) {
        Ok(contents) => PidfileState::Contents(contents),
        Err(invalid) => PidfileState::Invalid(invalid),
    }
}

fn parse_lines(hostname: &str, lines: &[&str]) -> Result<PidfileContents, InvalidPidfile> {
    let parse = |line: &str| {
        line.trim().parse::<i32>().map_err(|e| InvalidPidfile {
            error: format!("Corrupt pid file: {e} ({line:?})"),
        })
    };

    let mut contents = PidfileContents {
        process: Some(Process::new(hostname, parse(lines[0])?)),
        ..Default::default()
    };
    if lines.len() == 3 {
        contents.exit_status = Some(parse(lines[1])?);
        contents.num_tests_failed = Some(parse(lines[2])?);
    }
    Ok(contents)
}

/// Execution tag passed to a process with `-P <tag>`.
pub fn parse_execution_tag(args: &str) -> Option<&str> {
    EXECUTION_TAG_RE
        .captures(args)
        .and_then(|caps| caps.get(1))
        .map(|tag| tag.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(state: PidfileState) -> PidfileContents {
        match state {
            PidfileState::Contents(contents) => contents,
            PidfileState::Invalid(invalid) => panic!("unexpected invalid pidfile: {invalid}"),
        }
    }

    #[test]
    fn complete_pidfile() {
        let parsed = contents(parse_pidfile("drone1", "1234\n0\n2\n"));
        assert_eq!(parsed.process, Some(Process::new("drone1", 1234)));
        assert_eq!(parsed.exit_status, Some(0));
        assert_eq!(parsed.num_tests_failed, Some(2));
        assert!(!parsed.is_running());
    }

    #[test]
    fn empty_pidfile_has_no_process() {
        assert_eq!(parse_pidfile("drone1", ""), PidfileState::default());
    }

    #[test]
    fn pid_only_is_running() {
        let parsed = contents(parse_pidfile("drone1", "42\n"));
        assert_eq!(parsed.process, Some(Process::new("drone1", 42)));
        assert_eq!(parsed.exit_status, None);
        assert!(parsed.is_running());
    }

    #[test]
    fn two_lines_ignore_exit_status() {
        let parsed = contents(parse_pidfile("drone1", "42\n1\n"));
        assert!(parsed.process.is_some());
        assert_eq!(parsed.exit_status, None);
        assert_eq!(parsed.num_tests_failed, None);
    }

    #[test]
    fn too_many_lines_is_invalid() {
        let state = parse_pidfile("drone1", "1\n2\n3\n4\n");
        match state {
            PidfileState::Invalid(invalid) => {
                assert!(invalid.error.starts_with("Corrupt pid file (4 lines)"))
            }
            other => panic!("expected invalid pidfile, got {other:?}"),
        }
    }

    #[test]
    fn non_integer_is_invalid() {
        assert!(parse_pidfile("drone1", "abc\n").is_invalid());
        assert!(parse_pidfile("drone1", "12\nx\n0\n").is_invalid());
        assert!(!parse_pidfile("drone1", "12\nx\n").is_invalid());
    }

    #[test]
    fn execution_tag_from_args() {
        assert_eq!(
            parse_execution_tag("autotest-remote -P 12-alice/host1 -m host1"),
            Some("12-alice/host1")
        );
        assert_eq!(parse_execution_tag("autotest-remote -m host1"), None);
    }
}
