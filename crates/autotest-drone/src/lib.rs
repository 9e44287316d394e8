//! autotest-drone — remote execution agents for the autotest scheduler.
//!
//! # Architecture
//!
//! ```text
//! DroneManager (scheduler)
//!   └── Drone (per machine)
//!       ├── call queue of DroneCall
//!       └── DroneTransport
//!           ├── LocalTransport → DroneUtility (in-process)
//!           └── SshTransport → ssh host autotest-drone-utility
//!                               (JSON calls on stdin,
//!                                JSON ExecutionReport on stdout)
//! ```
//!
//! The drone utility performs the actual OS work: process scans, pidfile
//! reads, spawning and killing processes, and file copies and transfers.

pub mod drone;
pub mod error;
pub mod factory;
pub mod protocol;
pub mod transport;
pub mod utility;

pub use drone::{Drone, DroneHandle, QueuedTransfer, TransferSide, UsedCapacity};
pub use error::{DroneError, DroneResult};
pub use factory::{DefaultDroneFactory, DroneFactory, DroneSpec};
pub use protocol::{
    AUTOSERV_COMMAND, CallResult, DroneCall, ExecutionReport, PARSE_COMMAND, Process, ProcessInfo,
    RefreshReport,
};
pub use transport::{DroneTransport, LocalTransport, SshTransport};
pub use utility::DroneUtility;
