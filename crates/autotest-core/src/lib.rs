pub mod config;

pub use config::{DroneOverrides, DroneSettings, SchedulerConfig, SchedulerSection};
