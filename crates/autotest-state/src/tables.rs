//! redb table definitions for the autotest state store.
//!
//! Each table uses numeric row ids as keys and `&[u8]` values
//! (JSON-serialized domain types).

use redb::TableDefinition;

pub const HOSTS: TableDefinition<u64, &[u8]> = TableDefinition::new("hosts");

pub const LABELS: TableDefinition<u64, &[u8]> = TableDefinition::new("labels");

pub const ATOMIC_GROUPS: TableDefinition<u64, &[u8]> = TableDefinition::new("atomic_groups");

pub const ACL_GROUPS: TableDefinition<u64, &[u8]> = TableDefinition::new("acl_groups");

pub const JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("jobs");

pub const QUEUE_ENTRIES: TableDefinition<u64, &[u8]> = TableDefinition::new("host_queue_entries");
