//! Host scheduler: which ready host can run which pending queue entry.
//!
//! Each cycle [`HostScheduler::refresh`] issues a fixed set of bulk
//! queries and builds an in-memory [`SchedulingIndex`]. Every decision in
//! the cycle is then made against that index, and a host handed out is
//! popped from it so nothing later in the cycle sees it again.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use autotest_state::{
    AtomicGroup, AtomicGroupId, Host, HostId, HostQueueEntry, Job, JobId, Label, LabelId,
    ManyToMany, QueueEntryStatus, SchedulerDb,
};
use tracing::{debug, error, info};

use crate::error::{SchedulerError, SchedulerResult};
use crate::metahost::{HostSchedulingUtility, LabelMetahostScheduler, MetahostScheduler};

// ── Index ──────────────────────────────────────────────────────────

/// One cycle's snapshot of hosts, labels and access rules.
#[derive(Debug, Default)]
pub struct SchedulingIndex {
    hosts_available: HashMap<HostId, Host>,
    job_acls: ManyToMany,
    ineligible_hosts: ManyToMany,
    job_dependencies: ManyToMany,
    host_acls: ManyToMany,
    label_hosts: HashMap<LabelId, BTreeSet<HostId>>,
    host_labels: HashMap<HostId, HashSet<LabelId>>,
    labels: BTreeMap<LabelId, Label>,
    jobs: HashMap<JobId, Job>,
    atomic_groups: HashMap<AtomicGroupId, AtomicGroup>,
}

impl SchedulingIndex {
    fn build(db: &dyn SchedulerDb, pending: &[HostQueueEntry]) -> SchedulerResult<Self> {
        let hosts_available: HashMap<HostId, Host> = db
            .ready_hosts()?
            .into_iter()
            .map(|host| (host.id, host))
            .collect();

        let job_ids: Vec<JobId> = pending
            .iter()
            .map(|entry| entry.job_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let host_ids: Vec<HostId> = hosts_available.keys().copied().collect();

        let mut label_hosts: HashMap<LabelId, BTreeSet<HostId>> = HashMap::new();
        let mut host_labels: HashMap<HostId, HashSet<LabelId>> = HashMap::new();
        for (label_id, host_id) in db.label_host_pairs(&host_ids)? {
            label_hosts.entry(label_id).or_default().insert(host_id);
            host_labels.entry(host_id).or_default().insert(label_id);
        }

        Ok(Self {
            job_acls: db.job_acl_groups(&job_ids)?,
            ineligible_hosts: db.job_ineligible_hosts(&job_ids)?,
            job_dependencies: db.job_dependencies(&job_ids)?,
            host_acls: db.host_acl_groups(&host_ids)?,
            label_hosts,
            host_labels,
            labels: db
                .labels()?
                .into_iter()
                .map(|label| (label.id, label))
                .collect(),
            jobs: db.jobs(&job_ids)?,
            atomic_groups: db.atomic_groups()?,
            hosts_available,
        })
    }

    pub fn is_host_available(&self, host_id: HostId) -> bool {
        self.hosts_available.contains_key(&host_id)
    }

    pub fn available_host_count(&self) -> usize {
        self.hosts_available.len()
    }

    fn is_host_invalid(&self, host_id: HostId) -> bool {
        self.hosts_available
            .get(&host_id)
            .is_some_and(|host| host.invalid)
    }

    fn is_acl_accessible(&self, host_id: HostId, entry: &HostQueueEntry) -> bool {
        match (
            self.job_acls.get(&entry.job_id),
            self.host_acls.get(&host_id),
        ) {
            (Some(job_acls), Some(host_acls)) => !job_acls.is_disjoint(host_acls),
            _ => false,
        }
    }

    /// Hosts carrying an only-if-needed label are reserved for jobs that
    /// ask for it, either as the metahost or as a dependency. A specific
    /// host request skips the check.
    fn check_only_if_needed_labels(
        &self,
        job_dependencies: &HashSet<LabelId>,
        host_labels: &HashSet<LabelId>,
        entry: &HostQueueEntry,
    ) -> bool {
        let Some(meta_host) = entry.meta_host else {
            return true;
        };
        host_labels.iter().all(|label_id| {
            let Some(label) = self.labels.get(label_id) else {
                return true;
            };
            !label.only_if_needed || *label_id == meta_host || job_dependencies.contains(label_id)
        })
    }

    /// Atomic group carried by the host's labels. A host with several is
    /// a data error; the lowest group id wins.
    fn host_atomic_group_id(
        &self,
        host_labels: &HashSet<LabelId>,
        entry: &HostQueueEntry,
    ) -> Option<AtomicGroupId> {
        let atomic_ids: BTreeSet<AtomicGroupId> = host_labels
            .iter()
            .filter_map(|label_id| self.labels.get(label_id))
            .filter_map(|label| label.atomic_group_id)
            .collect();
        if atomic_ids.len() > 1 {
            let atomic_labels: Vec<&str> = host_labels
                .iter()
                .filter_map(|label_id| self.labels.get(label_id))
                .filter(|label| label.atomic_group_id.is_some())
                .map(|label| label.name.as_str())
                .collect();
            error!(
                "More than one Atomic Group on {entry} via: {atomic_labels:?}, using group {:?}",
                atomic_ids.first()
            );
        }
        atomic_ids.first().copied()
    }

    /// Non-invalid label ids of `atomic_group_id`, lowest first.
    fn atomic_group_labels(&self, atomic_group_id: AtomicGroupId) -> Vec<LabelId> {
        self.labels
            .values()
            .filter(|label| label.atomic_group_id == Some(atomic_group_id) && !label.invalid)
            .map(|label| label.id)
            .collect()
    }

    fn schedule_non_metahost(&mut self, host_id: HostId, entry: &HostQueueEntry) -> Option<Host> {
        if !self.is_host_eligible_for_job(host_id, entry) {
            return None;
        }
        self.hosts_available.remove(&host_id)
    }
}

impl HostSchedulingUtility for SchedulingIndex {
    fn hosts_in_label(&self, label_id: LabelId) -> BTreeSet<HostId> {
        self.label_hosts.get(&label_id).cloned().unwrap_or_default()
    }

    fn remove_host_from_label(&mut self, host_id: HostId, label_id: LabelId) {
        if let Some(hosts) = self.label_hosts.get_mut(&label_id) {
            hosts.remove(&host_id);
        }
    }

    fn pop_host(&mut self, host_id: HostId) -> Option<Host> {
        self.hosts_available.remove(&host_id)
    }

    fn ineligible_hosts_for_entry(&self, entry: &HostQueueEntry) -> HashSet<HostId> {
        self.ineligible_hosts
            .get(&entry.job_id)
            .cloned()
            .unwrap_or_default()
    }

    fn is_host_usable(&self, host_id: HostId) -> bool {
        // invalid hosts are only usable by entries that name them
        self.hosts_available
            .get(&host_id)
            .is_some_and(|host| !host.invalid)
    }

    fn is_host_eligible_for_job(&self, host_id: HostId, entry: &HostQueueEntry) -> bool {
        // One-time hosts have had their labels cleared; they skip every check.
        if self.is_host_invalid(host_id) {
            return true;
        }

        let empty = HashSet::new();
        let job_dependencies = self.job_dependencies.get(&entry.job_id).unwrap_or(&empty);
        let host_labels = self.host_labels.get(&host_id).unwrap_or(&empty);

        self.is_acl_accessible(host_id, entry)
            && job_dependencies.is_subset(host_labels)
            && self.check_only_if_needed_labels(job_dependencies, host_labels, entry)
            && self.host_atomic_group_id(host_labels, entry) == entry.atomic_group_id
    }
}

// ── HostScheduler ──────────────────────────────────────────────────

pub struct HostScheduler {
    db: Arc<dyn SchedulerDb>,
    metahost_schedulers: Vec<Box<dyn MetahostScheduler>>,
    index: SchedulingIndex,
}

impl HostScheduler {
    /// Build a scheduler with the label scheduler plus every site scheduler
    /// whose name is in `enabled_site_schedulers`. Site schedulers are
    /// consulted first.
    pub fn new(
        db: Arc<dyn SchedulerDb>,
        site_schedulers: Vec<Box<dyn MetahostScheduler>>,
        enabled_site_schedulers: &BTreeSet<String>,
    ) -> Self {
        let mut metahost_schedulers: Vec<Box<dyn MetahostScheduler>> =
            vec![Box::new(LabelMetahostScheduler)];
        for scheduler in site_schedulers {
            if enabled_site_schedulers.contains(scheduler.name()) {
                metahost_schedulers.insert(0, scheduler);
            } else {
                debug!(name = scheduler.name(), "site metahost scheduler not enabled");
            }
        }
        let names: Vec<&str> = metahost_schedulers.iter().map(|s| s.name()).collect();
        info!("Metahost schedulers: {}", names.join(", "));

        Self {
            db,
            metahost_schedulers,
            index: SchedulingIndex::default(),
        }
    }

    pub fn metahost_scheduler_names(&self) -> Vec<&str> {
        self.metahost_schedulers.iter().map(|s| s.name()).collect()
    }

    pub fn index(&self) -> &SchedulingIndex {
        &self.index
    }

    pub fn recovery_on_startup(&mut self) {
        for scheduler in &mut self.metahost_schedulers {
            scheduler.recovery_on_startup();
        }
    }

    pub fn tick(&mut self) {
        for scheduler in &mut self.metahost_schedulers {
            scheduler.tick();
        }
    }

    /// Rebuild the index for this cycle's pending entries.
    pub fn refresh(&mut self, pending: &[HostQueueEntry]) -> SchedulerResult<()> {
        self.index = SchedulingIndex::build(self.db.as_ref(), pending)?;
        debug!(
            hosts_available = self.index.available_host_count(),
            pending = pending.len(),
            "host scheduler refreshed"
        );
        Ok(())
    }

    pub fn is_host_eligible_for_job(&self, host_id: HostId, entry: &HostQueueEntry) -> bool {
        self.index.is_host_eligible_for_job(host_id, entry)
    }

    pub fn is_host_usable(&self, host_id: HostId) -> bool {
        self.index.is_host_usable(host_id)
    }

    /// Host for an entry that names one, or for a metahost entry via the
    /// first plugin that claims it.
    ///
    /// An entry naming an ineligible host is not scheduled and gets no
    /// substitute. An entry no plugin claims is a configuration error.
    pub fn schedule_entry(&mut self, entry: &HostQueueEntry) -> SchedulerResult<Option<Host>> {
        if let Some(host_id) = entry.host_id {
            return Ok(self.index.schedule_non_metahost(host_id, entry));
        }

        for scheduler in &mut self.metahost_schedulers {
            if scheduler.can_schedule_metahost(entry) {
                return Ok(scheduler.schedule_metahost(entry, &mut self.index));
            }
        }
        Err(SchedulerError::NoMetahostScheduler(entry.to_string()))
    }

    /// Reserve a block of hosts from one label of the entry's atomic group.
    ///
    /// The job's `synch_count` is the minimum block size and the group's
    /// `max_number_of_machines` the maximum. Labels are tried lowest id
    /// first; the first with enough eligible hosts wins. Returns an empty
    /// list when no label can satisfy the job this cycle. An entry whose
    /// job can never fit the group is aborted.
    pub fn find_eligible_atomic_group(
        &mut self,
        entry: &HostQueueEntry,
    ) -> SchedulerResult<Vec<Host>> {
        let Some(atomic_group_id) = entry.atomic_group_id else {
            return Ok(Vec::new());
        };
        let job = self
            .index
            .jobs
            .get(&entry.job_id)
            .ok_or(SchedulerError::JobNotFound(entry.job_id))?;
        let atomic_group = self
            .index
            .atomic_groups
            .get(&atomic_group_id)
            .ok_or(SchedulerError::AtomicGroupNotFound(atomic_group_id))?;

        let min_hosts = job.synch_count.max(1) as usize;
        let max_hosts = atomic_group.max_number_of_machines as usize;
        if min_hosts > max_hosts {
            error!(
                "Error: job {} synch_count={} > requested atomic_group {} \
                 max_number_of_machines={}.  Aborted host_queue_entry {}.",
                job.id, job.synch_count, atomic_group.id, max_hosts, entry.id
            );
            self.db
                .set_queue_entry_status(entry.id, QueueEntryStatus::Aborted)?;
            return Ok(Vec::new());
        }

        let metahost_hosts = entry
            .meta_host
            .map(|label_id| self.index.hosts_in_label(label_id));
        let ineligible = self.index.ineligible_hosts_for_entry(entry);

        for label_id in self.index.atomic_group_labels(atomic_group_id) {
            let eligible: Vec<HostId> = self
                .index
                .hosts_in_label(label_id)
                .into_iter()
                .filter(|host_id| metahost_hosts.as_ref().is_none_or(|hosts| hosts.contains(host_id)))
                .filter(|host_id| !ineligible.contains(host_id))
                .filter(|&host_id| {
                    self.index.is_host_usable(host_id)
                        && self.index.is_host_eligible_for_job(host_id, entry)
                })
                .collect();

            if eligible.len() < min_hosts {
                debug!(label_id, eligible = eligible.len(), min_hosts, "atomic group label too small");
                continue;
            }

            let mut hosts: Vec<Host> = eligible
                .iter()
                .filter_map(|host_id| self.index.hosts_available.get(host_id).cloned())
                .collect();
            hosts.sort_by(Host::cmp_for_sort);
            hosts.truncate(max_hosts);
            for host in &hosts {
                self.index.hosts_available.remove(&host.id);
            }
            info!(
                %entry,
                label_id,
                hosts = ?hosts.iter().map(|h| h.hostname.as_str()).collect::<Vec<_>>(),
                "atomic group scheduled"
            );
            return Ok(hosts);
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotest_state::{AclGroup, StateStore};

    const EVERYONE: u64 = 100;
    const LARGE_MEM: LabelId = 30;
    const RACK_A: LabelId = 40;
    const RACK_B: LabelId = 41;
    const NETBOOK: LabelId = 10;
    const GROUP: AtomicGroupId = 5;

    fn host(id: HostId, labels: &[LabelId]) -> Host {
        Host {
            id,
            hostname: format!("host{id}"),
            locked: false,
            status: None,
            invalid: false,
            labels: labels.iter().copied().collect(),
        }
    }

    fn label(id: LabelId, name: &str) -> Label {
        Label {
            id,
            name: name.to_string(),
            atomic_group_id: None,
            only_if_needed: false,
            platform: false,
            invalid: false,
        }
    }

    fn job(id: JobId, synch_count: u32) -> Job {
        Job {
            id,
            name: format!("job{id}"),
            owner: "alice".to_string(),
            synch_count,
            control_file: String::new(),
            dependency_labels: BTreeSet::new(),
            ineligible_hosts: BTreeSet::new(),
        }
    }

    fn entry(id: u64, job_id: JobId) -> HostQueueEntry {
        HostQueueEntry {
            id,
            job_id,
            host_id: None,
            meta_host: None,
            atomic_group_id: None,
            status: QueueEntryStatus::Queued,
            active: false,
            complete: false,
            execution_subdir: String::new(),
        }
    }

    fn store_with_hosts(hosts: &[Host]) -> Arc<StateStore> {
        let store = StateStore::open_in_memory().unwrap();
        for host in hosts {
            store.put_host(host).unwrap();
        }
        store
            .put_acl_group(&AclGroup {
                id: EVERYONE,
                name: "Everyone".to_string(),
                users: BTreeSet::from(["alice".to_string()]),
                hosts: hosts.iter().map(|h| h.id).collect(),
            })
            .unwrap();
        store.put_label(&label(NETBOOK, "netbook")).unwrap();
        let mut large_mem = label(LARGE_MEM, "large-mem");
        large_mem.only_if_needed = true;
        store.put_label(&large_mem).unwrap();
        for (id, name) in [(RACK_A, "rack-a"), (RACK_B, "rack-b")] {
            let mut rack = label(id, name);
            rack.atomic_group_id = Some(GROUP);
            store.put_label(&rack).unwrap();
        }
        store
            .put_atomic_group(&AtomicGroup {
                id: GROUP,
                name: "rack".to_string(),
                max_number_of_machines: 3,
                invalid: false,
            })
            .unwrap();
        Arc::new(store)
    }

    fn refreshed(store: &Arc<StateStore>, pending: &[HostQueueEntry]) -> HostScheduler {
        let mut scheduler = HostScheduler::new(store.clone(), Vec::new(), &BTreeSet::new());
        scheduler.refresh(pending).unwrap();
        scheduler
    }

    #[test]
    fn metahost_entry_gets_labelled_host() {
        let store = store_with_hosts(&[host(1, &[]), host(2, &[NETBOOK])]);
        store.put_job(&job(1, 1)).unwrap();
        let mut pending = entry(1, 1);
        pending.meta_host = Some(NETBOOK);

        let mut scheduler = refreshed(&store, &[pending.clone()]);
        let host = scheduler.schedule_entry(&pending).unwrap().unwrap();
        assert_eq!(host.id, 2);
        assert!(!scheduler.index().is_host_available(2));
        // the same host is never handed out twice in a cycle
        assert!(scheduler.schedule_entry(&pending).unwrap().is_none());
    }

    #[test]
    fn only_if_needed_label_blocks_generic_jobs() {
        let store = store_with_hosts(&[host(1, &[NETBOOK, LARGE_MEM])]);
        store.put_job(&job(1, 1)).unwrap();
        let mut pending = entry(1, 1);
        pending.meta_host = Some(NETBOOK);

        let scheduler = refreshed(&store, &[pending.clone()]);
        assert!(!scheduler.is_host_eligible_for_job(1, &pending));

        // requesting the label as metahost is fine
        pending.meta_host = Some(LARGE_MEM);
        assert!(scheduler.is_host_eligible_for_job(1, &pending));

        // so is depending on it
        let mut dependent = job(2, 1);
        dependent.dependency_labels.insert(LARGE_MEM);
        store.put_job(&dependent).unwrap();
        let mut other = entry(2, 2);
        other.meta_host = Some(NETBOOK);
        let scheduler = refreshed(&store, &[other.clone()]);
        assert!(scheduler.is_host_eligible_for_job(1, &other));
    }

    #[test]
    fn specific_host_bypasses_only_if_needed() {
        let store = store_with_hosts(&[host(1, &[LARGE_MEM])]);
        store.put_job(&job(1, 1)).unwrap();
        let mut pending = entry(1, 1);
        pending.host_id = Some(1);

        let mut scheduler = refreshed(&store, &[pending.clone()]);
        assert_eq!(scheduler.schedule_entry(&pending).unwrap().map(|h| h.id), Some(1));
    }

    #[test]
    fn acl_and_dependencies_gate_eligibility() {
        let store = store_with_hosts(&[host(1, &[NETBOOK]), host(2, &[])]);
        let mut needs_netbook = job(1, 1);
        needs_netbook.dependency_labels.insert(NETBOOK);
        store.put_job(&needs_netbook).unwrap();
        let mut stranger = job(2, 1);
        stranger.owner = "mallory".to_string();
        store.put_job(&stranger).unwrap();

        let pending = [entry(1, 1), entry(2, 2)];
        let scheduler = refreshed(&store, &pending);
        assert!(scheduler.is_host_eligible_for_job(1, &pending[0]));
        assert!(!scheduler.is_host_eligible_for_job(2, &pending[0]));
        assert!(!scheduler.is_host_eligible_for_job(1, &pending[1]));
    }

    #[test]
    fn invalid_host_skips_checks_but_is_not_usable() {
        let mut one_time = host(1, &[]);
        one_time.invalid = true;
        let store = store_with_hosts(&[one_time]);
        let mut stranger = job(1, 1);
        stranger.owner = "mallory".to_string();
        store.put_job(&stranger).unwrap();
        let mut pending = entry(1, 1);
        pending.host_id = Some(1);

        let mut scheduler = refreshed(&store, &[pending.clone()]);
        assert!(!scheduler.is_host_usable(1));
        assert!(scheduler.schedule_entry(&pending).unwrap().is_some());
    }

    #[test]
    fn atomic_group_hosts_need_matching_entry() {
        let store = store_with_hosts(&[host(1, &[RACK_A])]);
        store.put_job(&job(1, 1)).unwrap();
        let mut pending = entry(1, 1);
        pending.host_id = Some(1);

        let scheduler = refreshed(&store, &[pending.clone()]);
        assert!(!scheduler.is_host_eligible_for_job(1, &pending));
        pending.atomic_group_id = Some(GROUP);
        assert!(scheduler.is_host_eligible_for_job(1, &pending));
    }

    #[test]
    fn multiple_atomic_groups_use_lowest_id() {
        let store = store_with_hosts(&[host(1, &[RACK_A, 50])]);
        let mut other_group = label(50, "other-rack");
        other_group.atomic_group_id = Some(9);
        store.put_label(&other_group).unwrap();
        store.put_job(&job(1, 1)).unwrap();
        let mut pending = entry(1, 1);
        pending.host_id = Some(1);
        pending.atomic_group_id = Some(GROUP);

        let scheduler = refreshed(&store, &[pending.clone()]);
        assert!(scheduler.is_host_eligible_for_job(1, &pending));
    }

    #[test]
    fn no_metahost_scheduler_is_an_error() {
        let store = store_with_hosts(&[host(1, &[])]);
        store.put_job(&job(1, 1)).unwrap();
        let pending = entry(1, 1);

        let mut scheduler = refreshed(&store, &[pending.clone()]);
        let err = scheduler.schedule_entry(&pending).unwrap_err();
        assert!(matches!(err, SchedulerError::NoMetahostScheduler(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn atomic_group_packs_first_label_with_enough_hosts() {
        let store = store_with_hosts(&[
            host(1, &[RACK_A]),
            host(2, &[RACK_B]),
            host(3, &[RACK_B]),
            host(10, &[RACK_B]),
            host(4, &[RACK_B]),
        ]);
        store.put_job(&job(1, 2)).unwrap();
        let mut pending = entry(1, 1);
        pending.atomic_group_id = Some(GROUP);

        let mut scheduler = refreshed(&store, &[pending.clone()]);
        let hosts = scheduler.find_eligible_atomic_group(&pending).unwrap();
        let names: Vec<&str> = hosts.iter().map(|h| h.hostname.as_str()).collect();
        // rack-a is too small; rack-b is capped at the group maximum of 3
        assert_eq!(names, vec!["host2", "host3", "host4"]);
        for host in &hosts {
            assert!(!scheduler.index().is_host_available(host.id));
        }
        assert!(scheduler.index().is_host_available(10));
        assert!(scheduler.index().is_host_available(1));
    }

    #[test]
    fn atomic_group_respects_metahost_and_ineligible_hosts() {
        let store = store_with_hosts(&[
            host(1, &[RACK_A, NETBOOK]),
            host(2, &[RACK_A, NETBOOK]),
            host(3, &[RACK_A]),
        ]);
        let mut picky = job(1, 1);
        picky.ineligible_hosts.insert(2);
        store.put_job(&picky).unwrap();
        let mut pending = entry(1, 1);
        pending.atomic_group_id = Some(GROUP);
        pending.meta_host = Some(NETBOOK);

        let mut scheduler = refreshed(&store, &[pending.clone()]);
        let hosts = scheduler.find_eligible_atomic_group(&pending).unwrap();
        assert_eq!(hosts.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn atomic_group_not_enough_hosts_stays_pending() {
        let store = store_with_hosts(&[host(1, &[RACK_A]), host(2, &[RACK_B])]);
        store.put_job(&job(1, 2)).unwrap();
        let mut pending = entry(1, 1);
        pending.atomic_group_id = Some(GROUP);
        store.put_queue_entry(&pending).unwrap();

        let mut scheduler = refreshed(&store, &[pending.clone()]);
        assert!(scheduler.find_eligible_atomic_group(&pending).unwrap().is_empty());
        assert_eq!(
            store.get_queue_entry(1).unwrap().unwrap().status,
            QueueEntryStatus::Queued
        );
    }

    #[test]
    fn oversized_synch_count_aborts_entry() {
        let store = store_with_hosts(&[host(1, &[RACK_A])]);
        store.put_job(&job(1, 5)).unwrap();
        let mut pending = entry(1, 1);
        pending.atomic_group_id = Some(GROUP);
        store.put_queue_entry(&pending).unwrap();

        let mut scheduler = refreshed(&store, &[pending.clone()]);
        assert!(scheduler.find_eligible_atomic_group(&pending).unwrap().is_empty());
        let stored = store.get_queue_entry(1).unwrap().unwrap();
        assert_eq!(stored.status, QueueEntryStatus::Aborted);
        assert!(stored.complete);
        assert!(scheduler.index().is_host_available(1));
    }

    struct FirstHostScheduler;

    impl MetahostScheduler for FirstHostScheduler {
        fn name(&self) -> &str {
            "FirstHostScheduler"
        }

        fn can_schedule_metahost(&self, entry: &HostQueueEntry) -> bool {
            entry.meta_host.is_some()
        }

        fn schedule_metahost(
            &mut self,
            _entry: &HostQueueEntry,
            utility: &mut dyn HostSchedulingUtility,
        ) -> Option<Host> {
            utility.pop_host(1)
        }
    }

    #[test]
    fn enabled_site_schedulers_take_precedence() {
        let store = store_with_hosts(&[host(1, &[]), host(2, &[NETBOOK])]);
        store.put_job(&job(1, 1)).unwrap();
        let mut pending = entry(1, 1);
        pending.meta_host = Some(NETBOOK);

        let disabled = HostScheduler::new(store.clone(), vec![Box::new(FirstHostScheduler)], &BTreeSet::new());
        assert_eq!(disabled.metahost_scheduler_names(), vec!["LabelMetahostScheduler"]);

        let enabled = BTreeSet::from(["FirstHostScheduler".to_string()]);
        let mut scheduler = HostScheduler::new(store.clone(), vec![Box::new(FirstHostScheduler)], &enabled);
        assert_eq!(
            scheduler.metahost_scheduler_names(),
            vec!["FirstHostScheduler", "LabelMetahostScheduler"]
        );
        scheduler.refresh(&[pending.clone()]).unwrap();
        assert_eq!(scheduler.schedule_entry(&pending).unwrap().map(|h| h.id), Some(1));
    }
}
