//! Control-plane coordination for Pier nodes.
//!
//! A node registers and heartbeats with the control plane through
//! [`ControlPlane::ping`], which hands back the node's current
//! [`Assignment`], and deregisters through [`ControlPlane::shutdown`] when
//! it drains. [`HttpControlPlane`] is the JSON-over-HTTP implementation used
//! by the daemon; tests substitute their own implementations.

mod client;
mod error;
mod types;

pub use client::{ControlPlane, HttpControlPlane};
pub use error::ControlError;
pub use types::{Assignment, PingRequest, TlsMaterial};
