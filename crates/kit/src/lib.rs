//! Provision, clone and tear down libvirt virtual machines from templates.
//!
//! The entry point is [`engine::Provisioner`]. It drives a
//! [`hypervisor::Hypervisor`] connection, in production
//! [`libvirt::VirshConnection`], through the create, clone and delete
//! workflows. The managers in [`volume`], [`devices`], [`network`] and [`pool`]
//! are usable on their own.

pub mod capacity;
pub mod cloud_init;
pub mod config;
pub mod descriptor;
pub mod devices;
pub mod engine;
pub mod error;
pub mod host;
pub mod hypervisor;
pub mod libvirt;
pub mod locks;
pub mod network;
pub mod pool;
pub mod template;
pub mod units;
pub mod volume;
pub mod xml_utils;

pub use engine::Provisioner;
pub use error::{ProvisionError, Result};
