//! Safe shutdown and startup of a Kubernetes cluster hosted on hypervisor VMs.
//!
//! A shutdown pauses GitOps and operator controllers, scales every workload
//! holding a distributed-storage volume to zero, verifies the volumes were
//! released, then powers off worker VMs before master VMs. A start reverses
//! it: masters, workers, cluster API readiness, workload restore, controller
//! resume.
//!
//! Both control planes sit behind capability traits
//! ([`hypervisor::Hypervisor`], [`cluster::ClusterApi`],
//! [`controllers::ReconcilingController`]) so the orchestrator can be driven
//! against in-memory fakes.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cluster;
pub mod commands;
pub mod config;
pub mod controllers;
pub mod drain;
pub mod error;
pub mod hypervisor;
pub mod inventory;
pub mod model;
pub mod orchestrator;
pub mod power;
pub mod report;
pub mod state;
pub mod ui;
pub mod wait;

pub use config::LifecycleConfig;
pub use error::LifecycleError;
pub use orchestrator::{Backends, Orchestrator, RunOptions};
pub use report::StatusReport;
pub use state::{Direction, RunCheckpoint, RunState};
