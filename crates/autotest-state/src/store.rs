//! StateStore — redb-backed persistence for scheduler entities.
//!
//! Provides typed CRUD operations over hosts, labels, atomic groups, ACL
//! groups, jobs and host queue entries. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, u64, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [HOSTS, LABELS, ATOMIC_GROUPS, ACL_GROUPS, JOBS, QUEUE_ENTRIES] {
            txn.open_table(table).map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic row access ────────────────────────────────────────

    fn put_row<T: Serialize>(&self, table: Table, id: u64, row: &T) -> StateResult<()> {
        let value = serde_json::to_vec(row).map_err(map_err!(Encode))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Storage))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_row<T: DeserializeOwned>(&self, table: Table, id: u64) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Storage))?;
        match table.get(id).map_err(map_err!(Storage))? {
            Some(guard) => {
                let row: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Corrupt))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// All rows of a table in ascending id order.
    fn list_rows<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Storage))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (_, value) = entry.map_err(map_err!(Storage))?;
            let row: T = serde_json::from_slice(value.value()).map_err(map_err!(Corrupt))?;
            results.push(row);
        }
        Ok(results)
    }

    fn delete_row(&self, table: Table, id: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Storage))?;
            existed = table.remove(id).map_err(map_err!(Storage))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Insert or update a host.
    pub fn put_host(&self, host: &Host) -> StateResult<()> {
        self.put_row(HOSTS, host.id, host)?;
        debug!(host_id = host.id, hostname = %host.hostname, "host stored");
        Ok(())
    }

    pub fn get_host(&self, id: HostId) -> StateResult<Option<Host>> {
        self.get_row(HOSTS, id)
    }

    pub fn list_hosts(&self) -> StateResult<Vec<Host>> {
        self.list_rows(HOSTS)
    }

    /// Delete a host by id. Returns true if it existed.
    pub fn delete_host(&self, id: HostId) -> StateResult<bool> {
        self.delete_row(HOSTS, id)
    }

    // ── Labels ─────────────────────────────────────────────────────

    pub fn put_label(&self, label: &Label) -> StateResult<()> {
        self.put_row(LABELS, label.id, label)
    }

    pub fn get_label(&self, id: LabelId) -> StateResult<Option<Label>> {
        self.get_row(LABELS, id)
    }

    pub fn list_labels(&self) -> StateResult<Vec<Label>> {
        self.list_rows(LABELS)
    }

    // ── Atomic groups ──────────────────────────────────────────────

    pub fn put_atomic_group(&self, group: &AtomicGroup) -> StateResult<()> {
        self.put_row(ATOMIC_GROUPS, group.id, group)
    }

    pub fn get_atomic_group(&self, id: AtomicGroupId) -> StateResult<Option<AtomicGroup>> {
        self.get_row(ATOMIC_GROUPS, id)
    }

    pub fn list_atomic_groups(&self) -> StateResult<Vec<AtomicGroup>> {
        self.list_rows(ATOMIC_GROUPS)
    }

    // ── ACL groups ─────────────────────────────────────────────────

    pub fn put_acl_group(&self, group: &AclGroup) -> StateResult<()> {
        self.put_row(ACL_GROUPS, group.id, group)
    }

    pub fn list_acl_groups(&self) -> StateResult<Vec<AclGroup>> {
        self.list_rows(ACL_GROUPS)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn put_job(&self, job: &Job) -> StateResult<()> {
        self.put_row(JOBS, job.id, job)?;
        debug!(job_id = job.id, name = %job.name, "job stored");
        Ok(())
    }

    pub fn get_job(&self, id: JobId) -> StateResult<Option<Job>> {
        self.get_row(JOBS, id)
    }

    /// Mark `host_id` as never schedulable for `job_id`.
    pub fn add_ineligible_host(&self, job_id: JobId, host_id: HostId) -> StateResult<()> {
        let mut job = self
            .get_job(job_id)?
            .ok_or(StateError::JobNotFound(job_id))?;
        job.ineligible_hosts.insert(host_id);
        self.put_job(&job)
    }

    // ── Host queue entries ─────────────────────────────────────────

    pub fn put_queue_entry(&self, entry: &HostQueueEntry) -> StateResult<()> {
        self.put_row(QUEUE_ENTRIES, entry.id, entry)
    }

    /// Store several entries in one transaction.
    pub fn put_queue_entries(&self, entries: &[HostQueueEntry]) -> StateResult<()> {
        self.replace_queue_entries(entries, &[])
    }

    /// Store `entries` and remove the `removed` ids in one transaction.
    pub fn replace_queue_entries(
        &self,
        entries: &[HostQueueEntry],
        removed: &[QueueEntryId],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(QUEUE_ENTRIES).map_err(map_err!(Storage))?;
            for entry in entries {
                let value = serde_json::to_vec(entry).map_err(map_err!(Encode))?;
                table
                    .insert(entry.id, value.as_slice())
                    .map_err(map_err!(Storage))?;
            }
            for &id in removed {
                table.remove(id).map_err(map_err!(Storage))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_queue_entry(&self, id: QueueEntryId) -> StateResult<Option<HostQueueEntry>> {
        self.get_row(QUEUE_ENTRIES, id)
    }

    pub fn list_queue_entries(&self) -> StateResult<Vec<HostQueueEntry>> {
        self.list_rows(QUEUE_ENTRIES)
    }

    /// Next unused queue entry id.
    pub(crate) fn next_queue_entry_id(&self) -> StateResult<QueueEntryId> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(QUEUE_ENTRIES).map_err(map_err!(Storage))?;
        let last = table.last().map_err(map_err!(Storage))?;
        Ok(last.map(|(key, _)| key.value() + 1).unwrap_or(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn test_host(id: HostId, hostname: &str) -> Host {
        Host {
            id,
            hostname: hostname.to_string(),
            locked: false,
            status: None,
            invalid: false,
            labels: BTreeSet::from([10]),
        }
    }

    fn test_job(id: JobId) -> Job {
        Job {
            id,
            name: "sleeptest".to_string(),
            owner: "alice".to_string(),
            synch_count: 1,
            control_file: "job.run_test('sleeptest')".to_string(),
            dependency_labels: BTreeSet::new(),
            ineligible_hosts: BTreeSet::new(),
        }
    }

    #[test]
    fn host_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let host = test_host(1, "host1");

        store.put_host(&host).unwrap();
        assert_eq!(store.get_host(1).unwrap(), Some(host));
    }

    #[test]
    fn host_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.get_host(42).unwrap(), None);
    }

    #[test]
    fn host_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&test_host(1, "host1")).unwrap();

        assert!(store.delete_host(1).unwrap());
        assert!(!store.delete_host(1).unwrap());
        assert!(store.list_hosts().unwrap().is_empty());
    }

    #[test]
    fn list_hosts_in_id_order() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&test_host(3, "host3")).unwrap();
        store.put_host(&test_host(1, "host1")).unwrap();
        store.put_host(&test_host(2, "host2")).unwrap();

        let ids: Vec<HostId> = store.list_hosts().unwrap().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn add_ineligible_host_updates_job() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_job(&test_job(7)).unwrap();

        store.add_ineligible_host(7, 3).unwrap();
        let job = store.get_job(7).unwrap().unwrap();
        assert!(job.ineligible_hosts.contains(&3));
    }

    #[test]
    fn add_ineligible_host_unknown_job_fails() {
        let store = StateStore::open_in_memory().unwrap();
        let result = store.add_ineligible_host(99, 1);
        assert!(matches!(result, Err(StateError::JobNotFound(99))));
    }

    #[test]
    fn next_queue_entry_id_follows_last_row() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.next_queue_entry_id().unwrap(), 1);

        store
            .put_queue_entry(&HostQueueEntry {
                id: 5,
                job_id: 1,
                host_id: None,
                meta_host: Some(10),
                atomic_group_id: None,
                status: QueueEntryStatus::Queued,
                active: false,
                complete: false,
                execution_subdir: String::new(),
            })
            .unwrap();
        assert_eq!(store.next_queue_entry_id().unwrap(), 6);
    }

    #[test]
    fn persistent_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autotest.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.put_host(&test_host(1, "host1")).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.get_host(1).unwrap().unwrap().hostname, "host1");
    }
}
