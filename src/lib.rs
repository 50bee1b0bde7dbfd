//! endpoint-guard: OS policy reconciliation for an endpoint protection agent
//!
//! The agent receives a declarative policy from a management server and keeps
//! the local Windows machine converged on it: web blocking through the hosts
//! file, firewall rules or a local DNS filter; USB device control; and upload
//! lockdown with approved, time-limited exceptions.
//!
//! # Architecture
//!
//! - **Policy**: Immutable snapshots published through a watch channel
//! - **OS**: One adapter trait over every OS side effect, with an in-memory double
//! - **Network / USB / Upload**: Controllers that reconcile the OS against the policy
//! - **Sync**: Heartbeat and approval polling against the management server
//! - **Config**: Hierarchical TOML configuration
//! - **Telemetry**: Structured syslog audit trail
//!
//! Enforcement is reversible: stopping a controller removes every side
//! effect it introduced.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod agent;
pub mod cli;
pub mod config;
pub mod network;
pub mod os;
pub mod policy;
pub mod sync;
pub mod telemetry;
pub mod upload;
pub mod usb;
pub mod workers;
