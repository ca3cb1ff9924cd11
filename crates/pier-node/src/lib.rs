//! Lifecycle of a Pier edge node.
//!
//! - [`settings`]: the local settings file and its validation
//! - [`state`]: the process-wide run flag and the request gate
//! - [`supervisor`]: registration, the reconciliation loop and the drain

pub mod settings;
pub mod state;
pub mod supervisor;

pub use settings::{ClientSettings, SettingsError, SettingsFile, SettingsSource};
pub use state::{RequestGuard, RunState};
pub use supervisor::{
    CycleReport, DrainOutcome, InvalidLevel, LevelControl, NodePhase, NodeSupervisor,
    SupervisorError, SupervisorOptions,
};
