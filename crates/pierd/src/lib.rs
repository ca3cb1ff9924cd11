//! Building blocks of the `pierd` daemon.
//!
//! - [`server`]: the client-facing HTTP layer
//! - [`telemetry`]: tracing setup with a runtime-adjustable filter

pub mod server;
pub mod telemetry;

/// Build number declared to the control plane.
pub const BUILD_VERSION: u32 = 1;
