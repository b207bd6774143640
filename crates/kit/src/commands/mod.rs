//! Command line front end
//!
//! - instance verbs: `create`, `clone`, `rm`, `start`, `stop`, `list`, `info`, ...
//! - `disk` and `nic`: device hotplug
//! - `net` and `pool`: networks and storage pools
//! - `host` and `template`: inventory and the template catalog

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::Context as _, Report, Result};
use serde::Serialize;

use virtforge::config::Config;
use virtforge::error::ErrorKind;
use virtforge::{ProvisionError, Provisioner};

mod devices;
mod host;
mod instance;
mod network;

/// Options shared by every command
#[derive(Debug, Clone, Parser)]
pub struct GlobalOpts {
    /// Hypervisor connection URI (e.g., qemu:///system, qemu+ssh://host/system)
    #[clap(long, short = 'c', global = true)]
    pub connect: Option<String>,

    /// Configuration file (default: $XDG_CONFIG_HOME/virtforge/config.toml)
    #[clap(long, global = true)]
    pub config: Option<Utf8PathBuf>,
}

impl GlobalOpts {
    /// Effective configuration, with `--connect` taking precedence.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(uri) = &self.connect {
            config.connect = uri.clone();
        }
        Ok(config)
    }

    /// Engine connected per the effective configuration.
    pub fn provisioner(&self) -> Result<Provisioner> {
        let config = self.load_config()?;
        let uri = config.connect.clone();
        Provisioner::open(config).with_context(|| format!("Opening {uri}"))
    }
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON document
    Json,
}

/// Print `value` as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output as JSON")?
    );
    Ok(())
}

/// Kind of the first provisioning error in the chain of `report`.
pub fn error_kind(report: &Report) -> Option<ErrorKind> {
    report
        .chain()
        .find_map(|e| e.downcast_ref::<ProvisionError>())
        .map(ProvisionError::kind)
}

/// Prefix a failed command's report with its error kind, e.g. `[domain-not-found]`.
pub fn tag_error_kind(report: Report) -> Report {
    match error_kind(&report) {
        Some(kind) => report.wrap_err(format!("[{kind}]")),
        None => report,
    }
}

/// Format a byte count with binary units.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Top-level commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create an instance from a template
    Create(instance::CreateOpts),

    /// Clone a template or stopped instance
    Clone(instance::CloneOpts),

    /// Stop an instance and remove it with its snapshots and disks
    #[clap(name = "rm")]
    Remove(instance::RemoveOpts),

    /// Start an instance
    Start(instance::StartOpts),

    /// Shut an instance down
    Stop(instance::StopOpts),

    /// Reset a running instance
    Reboot(instance::NameOpts),

    /// Pause a running instance
    Suspend(instance::NameOpts),

    /// Resume a paused instance
    Resume(instance::NameOpts),

    /// Enable or disable start on host boot
    Autostart(instance::AutostartOpts),

    /// List instances
    List(instance::ListOpts),

    /// Show details of an instance
    Info(instance::InfoOpts),

    /// Print the address leased to an instance
    Ip(instance::NameOpts),

    /// Add or remove disks
    #[clap(subcommand)]
    Disk(devices::DiskCommands),

    /// Add or remove network interfaces
    #[clap(subcommand)]
    Nic(devices::NicCommands),

    /// Manage virtual networks
    #[clap(subcommand)]
    Net(network::NetCommands),

    /// Manage storage pools
    #[clap(subcommand)]
    Pool(network::PoolCommands),

    /// Inspect the hypervisor host
    #[clap(subcommand)]
    Host(host::HostCommands),

    /// Manage the template catalog
    #[clap(subcommand)]
    Template(host::TemplateCommands),
}

impl Commands {
    /// Execute the command
    pub fn run(self, global: &GlobalOpts) -> Result<()> {
        match self {
            Commands::Create(opts) => instance::create(global, opts),
            Commands::Clone(opts) => instance::clone(global, opts),
            Commands::Remove(opts) => instance::remove(global, opts),
            Commands::Start(opts) => instance::start(global, opts),
            Commands::Stop(opts) => instance::stop(global, opts),
            Commands::Reboot(opts) => instance::reboot(global, opts),
            Commands::Suspend(opts) => instance::suspend(global, opts),
            Commands::Resume(opts) => instance::resume(global, opts),
            Commands::Autostart(opts) => instance::autostart(global, opts),
            Commands::List(opts) => instance::list(global, opts),
            Commands::Info(opts) => instance::info(global, opts),
            Commands::Ip(opts) => instance::ip(global, opts),
            Commands::Disk(cmd) => cmd.run(global),
            Commands::Nic(cmd) => cmd.run(global),
            Commands::Net(cmd) => cmd.run(global),
            Commands::Pool(cmd) => cmd.run(global),
            Commands::Host(cmd) => cmd.run(global),
            Commands::Template(cmd) => cmd.run(global),
        }
    }
}
