//! autotest-state — persisted scheduler entities.
//!
//! Hosts, labels, atomic groups, ACL groups, jobs and host queue entries,
//! stored in [redb](https://docs.rs/redb) as JSON-serialized values keyed
//! by numeric id.
//!
//! The scheduler reads them through the [`SchedulerDb`] trait, whose
//! relationship queries are batched by id. `StateStore` is `Clone` +
//! `Send` + `Sync` (backed by `Arc<Database>`) and implements it.

pub mod error;
pub mod queries;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use queries::{ManyToMany, SchedulerDb, many_to_many};
pub use store::StateStore;
pub use types::*;
