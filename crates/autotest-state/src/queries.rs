//! Bulk query interface used by the host scheduler.
//!
//! Every relationship query takes a batch of ids and answers with a
//! many-to-many map, so one scheduling cycle costs a fixed number of
//! queries regardless of how many queue entries are pending.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::*;

/// Left id -> set of right ids.
pub type ManyToMany = HashMap<u64, HashSet<u64>>;

/// Collect `(left, right)` pairs into a [`ManyToMany`] map.
pub fn many_to_many(pairs: impl IntoIterator<Item = (u64, u64)>) -> ManyToMany {
    let mut map = ManyToMany::new();
    for (left, right) in pairs {
        map.entry(left).or_default().insert(right);
    }
    map
}

/// Read and write access to scheduler entities.
pub trait SchedulerDb: Send + Sync {
    /// Hosts that are unlocked, have status `None` or `Ready`, and have no
    /// active queue entry against them.
    fn ready_hosts(&self) -> StateResult<Vec<Host>>;

    fn hosts(&self, host_ids: &[HostId]) -> StateResult<HashMap<HostId, Host>>;

    /// job -> ACL groups whose users include the job owner.
    fn job_acl_groups(&self, job_ids: &[JobId]) -> StateResult<ManyToMany>;

    fn job_ineligible_hosts(&self, job_ids: &[JobId]) -> StateResult<ManyToMany>;

    fn job_dependencies(&self, job_ids: &[JobId]) -> StateResult<ManyToMany>;

    fn host_acl_groups(&self, host_ids: &[HostId]) -> StateResult<ManyToMany>;

    /// `(label, host)` pairs for the given hosts.
    fn label_host_pairs(&self, host_ids: &[HostId]) -> StateResult<Vec<(LabelId, HostId)>>;

    fn labels(&self) -> StateResult<Vec<Label>>;

    fn jobs(&self, job_ids: &[JobId]) -> StateResult<HashMap<JobId, Job>>;

    fn atomic_groups(&self) -> StateResult<HashMap<AtomicGroupId, AtomicGroup>>;

    /// Queued, inactive, incomplete entries in id order.
    fn pending_queue_entries(&self) -> StateResult<Vec<HostQueueEntry>>;

    /// Entries currently marked active.
    fn active_queue_entries(&self) -> StateResult<Vec<HostQueueEntry>>;

    /// Update an entry's status; `active` and `complete` follow from it.
    fn set_queue_entry_status(
        &self,
        entry_id: QueueEntryId,
        status: QueueEntryStatus,
    ) -> StateResult<()>;

    /// Assign `host_ids` to an entry and mark it `Starting`.
    ///
    /// The first host goes onto the entry itself; each further host gets a
    /// new entry for the same job. Returns every entry now assigned.
    fn assign_queue_entry(
        &self,
        entry_id: QueueEntryId,
        host_ids: &[HostId],
        execution_subdir: &str,
    ) -> StateResult<Vec<HostQueueEntry>>;

    /// Undo an assignment that never started.
    ///
    /// `original` is written back as it was before assignment, but queued
    /// and inactive. Every other id in `assigned` (the siblings created by
    /// [`SchedulerDb::assign_queue_entry`]) is deleted.
    fn revert_queue_entry_assignment(
        &self,
        original: &HostQueueEntry,
        assigned: &[QueueEntryId],
    ) -> StateResult<()>;
}

impl SchedulerDb for StateStore {
    fn ready_hosts(&self) -> StateResult<Vec<Host>> {
        let busy: HashSet<HostId> = self
            .list_queue_entries()?
            .into_iter()
            .filter(|entry| entry.active)
            .filter_map(|entry| entry.host_id)
            .collect();
        Ok(self
            .list_hosts()?
            .into_iter()
            .filter(|host| host.is_ready() && !busy.contains(&host.id))
            .collect())
    }

    fn hosts(&self, host_ids: &[HostId]) -> StateResult<HashMap<HostId, Host>> {
        let wanted: HashSet<HostId> = host_ids.iter().copied().collect();
        Ok(self
            .list_hosts()?
            .into_iter()
            .filter(|host| wanted.contains(&host.id))
            .map(|host| (host.id, host))
            .collect())
    }

    fn job_acl_groups(&self, job_ids: &[JobId]) -> StateResult<ManyToMany> {
        let jobs = self.jobs(job_ids)?;
        let acl_groups = self.list_acl_groups()?;
        let pairs = jobs.values().flat_map(|job| {
            acl_groups
                .iter()
                .filter(|acl| acl.users.contains(&job.owner))
                .map(|acl| (job.id, acl.id))
        });
        Ok(many_to_many(pairs))
    }

    fn job_ineligible_hosts(&self, job_ids: &[JobId]) -> StateResult<ManyToMany> {
        let jobs = self.jobs(job_ids)?;
        Ok(many_to_many(jobs.values().flat_map(|job| {
            job.ineligible_hosts.iter().map(|&host_id| (job.id, host_id))
        })))
    }

    fn job_dependencies(&self, job_ids: &[JobId]) -> StateResult<ManyToMany> {
        let jobs = self.jobs(job_ids)?;
        Ok(many_to_many(jobs.values().flat_map(|job| {
            job.dependency_labels
                .iter()
                .map(|&label_id| (job.id, label_id))
        })))
    }

    fn host_acl_groups(&self, host_ids: &[HostId]) -> StateResult<ManyToMany> {
        let wanted: HashSet<HostId> = host_ids.iter().copied().collect();
        let pairs: Vec<(u64, u64)> = self
            .list_acl_groups()?
            .into_iter()
            .flat_map(|acl| {
                acl.hosts
                    .into_iter()
                    .filter(|host_id| wanted.contains(host_id))
                    .map(move |host_id| (host_id, acl.id))
            })
            .collect();
        Ok(many_to_many(pairs))
    }

    fn label_host_pairs(&self, host_ids: &[HostId]) -> StateResult<Vec<(LabelId, HostId)>> {
        let wanted: HashSet<HostId> = host_ids.iter().copied().collect();
        Ok(self
            .list_hosts()?
            .into_iter()
            .filter(|host| wanted.contains(&host.id))
            .flat_map(|host| {
                let host_id = host.id;
                host.labels.into_iter().map(move |label_id| (label_id, host_id))
            })
            .collect())
    }

    fn labels(&self) -> StateResult<Vec<Label>> {
        self.list_labels()
    }

    fn jobs(&self, job_ids: &[JobId]) -> StateResult<HashMap<JobId, Job>> {
        let mut jobs = HashMap::with_capacity(job_ids.len());
        for &job_id in job_ids {
            if let Some(job) = self.get_job(job_id)? {
                jobs.insert(job_id, job);
            }
        }
        Ok(jobs)
    }

    fn atomic_groups(&self) -> StateResult<HashMap<AtomicGroupId, AtomicGroup>> {
        Ok(self
            .list_atomic_groups()?
            .into_iter()
            .map(|group| (group.id, group))
            .collect())
    }

    fn pending_queue_entries(&self) -> StateResult<Vec<HostQueueEntry>> {
        Ok(self
            .list_queue_entries()?
            .into_iter()
            .filter(HostQueueEntry::is_pending)
            .collect())
    }

    fn active_queue_entries(&self) -> StateResult<Vec<HostQueueEntry>> {
        Ok(self
            .list_queue_entries()?
            .into_iter()
            .filter(|entry| entry.active)
            .collect())
    }

    fn set_queue_entry_status(
        &self,
        entry_id: QueueEntryId,
        status: QueueEntryStatus,
    ) -> StateResult<()> {
        let mut entry = self
            .get_queue_entry(entry_id)?
            .ok_or(StateError::QueueEntryNotFound(entry_id))?;
        entry.status = status;
        entry.active = status.is_active();
        entry.complete = status.is_complete();
        self.put_queue_entry(&entry)?;
        debug!(entry_id, %status, "queue entry status updated");
        Ok(())
    }

    fn assign_queue_entry(
        &self,
        entry_id: QueueEntryId,
        host_ids: &[HostId],
        execution_subdir: &str,
    ) -> StateResult<Vec<HostQueueEntry>> {
        let entry = self
            .get_queue_entry(entry_id)?
            .ok_or(StateError::QueueEntryNotFound(entry_id))?;

        let mut next_id = self.next_queue_entry_id()?;
        let mut assigned = Vec::with_capacity(host_ids.len());
        for (index, &host_id) in host_ids.iter().enumerate() {
            let id = if index == 0 {
                entry.id
            } else {
                next_id += 1;
                next_id - 1
            };
            assigned.push(HostQueueEntry {
                id,
                host_id: Some(host_id),
                status: QueueEntryStatus::Starting,
                active: true,
                complete: false,
                execution_subdir: execution_subdir.to_string(),
                ..entry.clone()
            });
        }

        self.put_queue_entries(&assigned)?;
        debug!(entry_id, hosts = ?host_ids, "queue entry assigned");
        Ok(assigned)
    }

    fn revert_queue_entry_assignment(
        &self,
        original: &HostQueueEntry,
        assigned: &[QueueEntryId],
    ) -> StateResult<()> {
        let restored = HostQueueEntry {
            status: QueueEntryStatus::Queued,
            active: false,
            complete: false,
            ..original.clone()
        };
        let siblings: Vec<QueueEntryId> = assigned
            .iter()
            .copied()
            .filter(|&id| id != original.id)
            .collect();
        self.replace_queue_entries(std::slice::from_ref(&restored), &siblings)?;
        debug!(entry_id = original.id, removed = ?siblings, "queue entry assignment reverted");
        Ok(())
    }
}
