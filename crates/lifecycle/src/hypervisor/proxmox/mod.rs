//! Proxmox VE hypervisor.
//!
//! Implements the [`Hypervisor`](super::Hypervisor) trait for the Proxmox VE API.

mod client;
mod models;

pub use client::Proxmox;
pub use models::*;
