//! Domain types for the autotest state store.
//!
//! These mirror the scheduler-relevant parts of the lab database: hosts,
//! labels, atomic groups, ACL groups, jobs and host queue entries. All
//! types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

pub type HostId = u64;
pub type LabelId = u64;
pub type AtomicGroupId = u64;
pub type AclGroupId = u64;
pub type JobId = u64;
pub type QueueEntryId = u64;

// ── Host ──────────────────────────────────────────────────────────

/// A machine that test jobs run against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    pub hostname: String,
    pub locked: bool,
    /// `None` is treated the same as `Ready` by the scheduler.
    pub status: Option<HostStatus>,
    /// One-time hosts whose label relationships have been cleared.
    pub invalid: bool,
    pub labels: BTreeSet<LabelId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Ready,
    Running,
    Verifying,
    Repairing,
    RepairFailed,
    Cleaning,
    Pending,
}

static ALPHANUM_HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z-]+)(\d+)$").expect("hostname regex is valid"));

impl Host {
    /// Canonical host ordering by hostname.
    ///
    /// Hostnames of the form `<letters><digits>` compare by name and then
    /// numerically by the trailing digits, ignoring leading zeros; anything
    /// else compares as lower case strings:
    ///
    /// ```text
    /// alice, host1, host2, host09, host010, host10, host11, yolkfolk
    /// ```
    pub fn cmp_for_sort(a: &Host, b: &Host) -> Ordering {
        compare_hostnames(&a.hostname, &b.hostname)
    }

    pub fn is_ready(&self) -> bool {
        !self.locked && matches!(self.status, None | Some(HostStatus::Ready))
    }
}

pub fn compare_hostnames(a: &str, b: &str) -> Ordering {
    let lower_a = a.to_lowercase();
    let lower_b = b.to_lowercase();
    let (Some(caps_a), Some(caps_b)) = (
        ALPHANUM_HOST_RE.captures(&lower_a),
        ALPHANUM_HOST_RE.captures(&lower_b),
    ) else {
        return lower_a.cmp(&lower_b);
    };

    let name_cmp = caps_a[1].cmp(&caps_b[1]);
    let number_cmp = compare_decimal(&caps_a[2], &caps_b[2]);
    match name_cmp.then(number_cmp) {
        // abc012 != abc12
        Ordering::Equal => lower_a.cmp(&lower_b),
        other => other,
    }
}

/// Compare two digit strings numerically without overflowing.
fn compare_decimal(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

// ── Labels & groups ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
    pub atomic_group_id: Option<AtomicGroupId>,
    /// Hosts with this label are only used by jobs that ask for it.
    pub only_if_needed: bool,
    pub platform: bool,
    pub invalid: bool,
}

/// A pool of interchangeable hosts reserved as a block by synchronous jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AtomicGroup {
    pub id: AtomicGroupId,
    pub name: String,
    pub max_number_of_machines: u32,
    pub invalid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AclGroup {
    pub id: AclGroupId,
    pub name: String,
    /// Logins of users in this group.
    pub users: BTreeSet<String>,
    pub hosts: BTreeSet<HostId>,
}

// ── Jobs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    /// Login of the job owner; ACL access derives from it.
    pub owner: String,
    /// Minimum number of hosts for synchronous execution.
    pub synch_count: u32,
    pub control_file: String,
    pub dependency_labels: BTreeSet<LabelId>,
    /// Hosts this job must never be scheduled onto.
    pub ineligible_hosts: BTreeSet<HostId>,
}

impl Job {
    /// Results directory tag shared by every queue entry of this job.
    pub fn tag(&self) -> String {
        format!("{}-{}", self.id, self.owner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryStatus {
    Queued,
    Starting,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl QueueEntryStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_complete(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for QueueEntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "Queued",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

/// One unit of schedulable work: a job against a host, a label
/// (metahost) or an atomic group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostQueueEntry {
    pub id: QueueEntryId,
    pub job_id: JobId,
    pub host_id: Option<HostId>,
    /// Label requested when any host carrying it will do.
    pub meta_host: Option<LabelId>,
    pub atomic_group_id: Option<AtomicGroupId>,
    pub status: QueueEntryStatus,
    pub active: bool,
    pub complete: bool,
    pub execution_subdir: String,
}

impl HostQueueEntry {
    pub fn is_pending(&self) -> bool {
        self.status == QueueEntryStatus::Queued && !self.active && !self.complete
    }
}

impl fmt::Display for HostQueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HQE {} (job {}", self.id, self.job_id)?;
        if let Some(host_id) = self.host_id {
            write!(f, ", host {host_id}")?;
        }
        if let Some(label_id) = self.meta_host {
            write!(f, ", meta_host {label_id}")?;
        }
        if let Some(group_id) = self.atomic_group_id {
            write!(f, ", atomic_group {group_id}")?;
        }
        write!(f, ")")
    }
}
