//! autotest-scheduler — drone management and host scheduling.
//!
//! Decides which ready host runs which pending queue entry, and on which
//! drone the resulting autoserv process runs. Drones are driven through
//! batched calls (see `autotest-drone`); everything the scheduler knows
//! about running processes comes from the last refresh.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher (one tick per tick_pause)
//!   ├── DroneManager
//!   │     ├── Drone handles + DroneQueue (least loaded first)
//!   │     ├── registered pidfiles (aged, first and second read)
//!   │     └── AdminAlerts
//!   ├── HostScheduler
//!   │     ├── SchedulingIndex (bulk SchedulerDb queries per cycle)
//!   │     └── MetahostScheduler plugins
//!   └── ProcessMonitor per execution tag
//! ```

pub mod alerts;
pub mod dispatcher;
pub mod drone_manager;
pub mod drone_queue;
pub mod error;
pub mod host_scheduler;
pub mod metahost;
pub mod monitor;
pub mod pidfile;

#[cfg(test)]
mod testing;

pub use alerts::{AdminAlerts, Alert};
pub use dispatcher::{Dispatcher, TickSummary};
pub use drone_manager::{CommandArg, DroneManager, ExecuteRequest};
pub use drone_queue::DroneQueue;
pub use error::{DroneManagerError, DroneManagerResult, SchedulerError, SchedulerResult};
pub use host_scheduler::{HostScheduler, SchedulingIndex};
pub use metahost::{HostSchedulingUtility, LabelMetahostScheduler, MetahostScheduler};
pub use monitor::{ProcessMonitor, RunState};
pub use pidfile::{PidfileContents, PidfileId, PidfileState};
