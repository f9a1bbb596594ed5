//! OpenHVX host agent
//!
//! Long-running process mediating between the OpenHVX control plane and a
//! local Hyper-V host:
//! - consumes task messages from a durable AMQP bus and dispatches them to
//!   external PowerShell action scripts
//! - publishes heartbeats, inventories and task results back to the plane
//! - guards the managed datastore tree (no overwrite, no deletion)

pub mod actions;
pub mod broker;
pub mod config;
pub mod datadirs;
pub mod runtime;
pub mod tasks;
pub mod telemetry;
