//! Metahost scheduling plugins.
//!
//! A metahost entry asks for "any host carrying label X". The host
//! scheduler hands such entries to the first [`MetahostScheduler`] that
//! claims them, along with a [`HostSchedulingUtility`] view of this
//! cycle's availability and eligibility data.

use std::collections::{BTreeSet, HashSet};

use autotest_state::{Host, HostId, HostQueueEntry, LabelId};
use tracing::debug;

/// Per-cycle host availability and eligibility, as seen by plugins.
pub trait HostSchedulingUtility {
    fn hosts_in_label(&self, label_id: LabelId) -> BTreeSet<HostId>;

    fn remove_host_from_label(&mut self, host_id: HostId, label_id: LabelId);

    /// Take a host out of this cycle's available set.
    fn pop_host(&mut self, host_id: HostId) -> Option<Host>;

    fn ineligible_hosts_for_entry(&self, entry: &HostQueueEntry) -> HashSet<HostId>;

    /// Still available this cycle and not invalid.
    fn is_host_usable(&self, host_id: HostId) -> bool;

    fn is_host_eligible_for_job(&self, host_id: HostId, entry: &HostQueueEntry) -> bool;
}

pub trait MetahostScheduler: Send {
    /// Name matched against `site_metahost_schedulers`.
    fn name(&self) -> &str;

    fn can_schedule_metahost(&self, entry: &HostQueueEntry) -> bool;

    /// Pick and pop a host for `entry`, or `None` if nothing fits this
    /// cycle.
    fn schedule_metahost(
        &mut self,
        entry: &HostQueueEntry,
        utility: &mut dyn HostSchedulingUtility,
    ) -> Option<Host>;

    fn recovery_on_startup(&mut self) {}

    fn tick(&mut self) {}
}

/// Schedules a metahost entry onto the lowest-id eligible host carrying
/// its label.
#[derive(Debug, Default)]
pub struct LabelMetahostScheduler;

impl MetahostScheduler for LabelMetahostScheduler {
    fn name(&self) -> &str {
        "LabelMetahostScheduler"
    }

    fn can_schedule_metahost(&self, entry: &HostQueueEntry) -> bool {
        entry.meta_host.is_some()
    }

    fn schedule_metahost(
        &mut self,
        entry: &HostQueueEntry,
        utility: &mut dyn HostSchedulingUtility,
    ) -> Option<Host> {
        let label_id = entry.meta_host?;
        let ineligible = utility.ineligible_hosts_for_entry(entry);

        for host_id in utility.hosts_in_label(label_id) {
            if !utility.is_host_usable(host_id) {
                utility.remove_host_from_label(host_id, label_id);
                continue;
            }
            if ineligible.contains(&host_id) {
                continue;
            }
            if !utility.is_host_eligible_for_job(host_id, entry) {
                continue;
            }
            utility.remove_host_from_label(host_id, label_id);
            debug!(%entry, host_id, "metahost scheduled");
            return utility.pop_host(host_id);
        }
        None
    }
}
