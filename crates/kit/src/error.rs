//! Error taxonomy for provisioning operations.
//!
//! Library code returns [`ProvisionError`]; the command line front end wraps
//! it in `color_eyre::Report` for display.

use std::time::Duration;

use serde::Serialize;
use strum::{Display, EnumString};
use thiserror::Error;

/// Steps of the teardown workflow, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum TeardownStep {
    /// Hard stop of a running instance.
    ForceStop,
    /// Removal of every snapshot.
    DeleteSnapshots,
    /// Deletion of the volumes behind the instance's disks.
    DeleteDisks,
    /// Removal of the persistent definition.
    Undefine,
}

/// Coarse classification of a [`ProvisionError`].
///
/// The kebab-case rendering (`volume-not-found`, ...) is stable and shown to
/// users next to the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
#[allow(missing_docs)]
pub enum ErrorKind {
    Connection,
    TemplateNotFound,
    DomainNotFound,
    InvalidParameter,
    CapacityExceeded,
    VolumeNotFound,
    DeviceNotFound,
    Definition,
    BootTimeout,
    Cancelled,
    PartialTeardown,
    Materialization,
    Seed,
    Hypervisor,
    Xml,
    Io,
}

/// Errors that can occur while provisioning, cloning or tearing down instances.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The hypervisor endpoint could not be reached.
    #[error("Failed to connect to hypervisor at {uri}: {message}")]
    Connection {
        /// Connection URI that was attempted.
        uri: String,
        /// Underlying failure.
        message: String,
    },

    /// The template is neither defined nor known to the catalog.
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// No instance with this name exists.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// A parameter was rejected before any side effect took place.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The memory admission check refused the request.
    #[error(
        "Insufficient memory: requested {requested} bytes with {free} bytes free and {reserve} bytes reserved"
    )]
    CapacityExceeded {
        /// Bytes requested.
        requested: u64,
        /// Free bytes reported by the host.
        free: u64,
        /// Bytes the threshold keeps in reserve.
        reserve: u64,
    },

    /// A storage volume could not be located.
    #[error("Storage volume not found: {0}")]
    VolumeNotFound(String),

    /// The disk or interface to detach does not exist on the instance.
    #[error("Device {device} not found on domain {domain}")]
    DeviceNotFound {
        /// Instance name.
        domain: String,
        /// Device selector (volume name, path, `ethN` or MAC).
        device: String,
    },

    /// The hypervisor rejected a definition.
    #[error("Failed to define {name}: {message}")]
    Definition {
        /// Name of the object being defined.
        name: String,
        /// Hypervisor diagnostics.
        message: String,
    },

    /// The instance did not report an address in time.
    #[error("Domain {domain} did not obtain an IP address within {}s", waited.as_secs())]
    BootTimeout {
        /// Instance name.
        domain: String,
        /// Time spent polling.
        waited: Duration,
    },

    /// The caller cancelled a wait.
    #[error("Cancelled while waiting for {0}")]
    Cancelled(String),

    /// Deletion stopped partway.
    #[error(
        "Teardown of {domain} failed at step {failed} after completing [{}]: {message}",
        completed.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ")
    )]
    PartialTeardown {
        /// Instance name.
        domain: String,
        /// Steps that finished before the failure.
        completed: Vec<TeardownStep>,
        /// Step that failed.
        failed: TeardownStep,
        /// Underlying failure.
        message: String,
    },

    /// Fetching or registering a template image failed.
    #[error("Failed to materialize template {template}: {message}")]
    Materialization {
        /// Template name.
        template: String,
        /// Underlying failure.
        message: String,
    },

    /// The cloud-init seed image could not be built.
    #[error("Failed to build cloud-init seed: {0}")]
    Seed(String),

    /// A hypervisor call failed.
    #[error("{operation} failed: {message}")]
    Hypervisor {
        /// Short description of the call.
        operation: String,
        /// Hypervisor diagnostics.
        message: String,
    },

    /// A descriptor could not be parsed or serialized.
    #[error("XML error: {0}")]
    Xml(String),

    /// Local filesystem or process failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::TemplateNotFound(_) => ErrorKind::TemplateNotFound,
            Self::DomainNotFound(_) => ErrorKind::DomainNotFound,
            Self::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::VolumeNotFound(_) => ErrorKind::VolumeNotFound,
            Self::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            Self::Definition { .. } => ErrorKind::Definition,
            Self::BootTimeout { .. } => ErrorKind::BootTimeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::PartialTeardown { .. } => ErrorKind::PartialTeardown,
            Self::Materialization { .. } => ErrorKind::Materialization,
            Self::Seed(_) => ErrorKind::Seed,
            Self::Hypervisor { .. } => ErrorKind::Hypervisor,
            Self::Xml(_) => ErrorKind::Xml,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Shorthand for a failed hypervisor call.
    pub fn hypervisor(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hypervisor {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether this error reports a missing volume or device.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::VolumeNotFound | ErrorKind::DeviceNotFound | ErrorKind::DomainNotFound
        )
    }
}

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, ProvisionError>;
