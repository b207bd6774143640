//! libvirt backend for virtforge
//!
//! - [`virsh`]: the production [`crate::hypervisor::Hypervisor`], driving `virsh`
//! - [`domain`]: builder for the base domain of a freshly materialized template

pub mod domain;
#[cfg(test)]
pub(crate) mod fake;
pub mod virsh;

pub use virsh::VirshConnection;
