//! Disk and interface hotplug commands

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};

use virtforge::devices::DiskRequest;

use super::{print_json, GlobalOpts, OutputFormat};

/// Options for `disk add`
#[derive(Debug, Parser)]
pub struct DiskAddOpts {
    /// Instance receiving the disk
    pub domain: String,

    /// Size of the new volume in GB
    #[clap(long, default_value_t = 10)]
    pub size: u64,

    /// Pool for the new volume (default: the configured pool)
    #[clap(long)]
    pub pool: Option<String>,

    /// Allocate the whole volume up front (raw) instead of a thin qcow2
    #[clap(long)]
    pub thick: bool,

    /// Backing volume, by name or path
    #[clap(long)]
    pub backing: Option<String>,

    /// Allow several instances to attach the disk
    #[clap(long)]
    pub shareable: bool,

    /// Attach this existing volume instead of creating one
    #[clap(long, conflicts_with_all = ["size", "backing", "thick"])]
    pub existing: Option<Utf8PathBuf>,
}

/// Options for `disk rm`
#[derive(Debug, Parser)]
pub struct DiskRemoveOpts {
    /// Instance owning the disk
    pub domain: String,

    /// Volume name or path of the disk
    pub volume: String,
}

/// Options for `disk list`
#[derive(Debug, Parser)]
pub struct DiskListOpts {
    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

/// Disk subcommands
#[derive(Debug, Subcommand)]
pub enum DiskCommands {
    /// Create (or reuse) a volume and attach it
    Add(DiskAddOpts),

    /// Detach a disk and delete its volume
    #[clap(name = "rm")]
    Remove(DiskRemoveOpts),

    /// List every volume in every pool
    List(DiskListOpts),
}

impl DiskCommands {
    /// Execute the subcommand
    pub fn run(self, global: &GlobalOpts) -> Result<()> {
        let provisioner = global.provisioner()?;
        match self {
            DiskCommands::Add(opts) => {
                let pool = opts
                    .pool
                    .unwrap_or_else(|| provisioner.config().default_pool.clone());
                let request = DiskRequest {
                    thin: !opts.thick,
                    backing: opts.backing,
                    shareable: opts.shareable,
                    existing: opts.existing,
                    ..DiskRequest::new(pool, opts.size)
                };
                let disk = provisioner.devices().add_disk(&opts.domain, &request)?;
                println!("Attached {} to {} as {}", disk.path, opts.domain, disk.device);
            }
            DiskCommands::Remove(opts) => {
                provisioner.devices().detach_disk(&opts.domain, &opts.volume)?;
                println!("Removed {} from {}", opts.volume, opts.domain);
            }
            DiskCommands::List(opts) => {
                let volumes = provisioner.volumes().list_volumes()?;
                match opts.format {
                    OutputFormat::Json => print_json(&volumes)?,
                    OutputFormat::Table => {
                        let mut table = Table::new();
                        table.load_preset(UTF8_FULL);
                        table.set_header(vec!["NAME", "POOL", "PATH"]);
                        for (name, location) in &volumes {
                            table.add_row(vec![
                                name.clone(),
                                location.pool.clone(),
                                location.path.to_string(),
                            ]);
                        }
                        println!("{}", table);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Options for `nic add`
#[derive(Debug, Parser)]
pub struct NicAddOpts {
    /// Instance receiving the interface
    pub domain: String,

    /// Virtual network or host bridge to plug into
    pub source: String,
}

/// Options for `nic rm`
#[derive(Debug, Parser)]
pub struct NicRemoveOpts {
    /// Instance owning the interface
    pub domain: String,

    /// Interface slot, `eth0` being the first interface
    #[clap(long, required_unless_present = "mac", conflicts_with = "mac")]
    pub slot: Option<String>,

    /// MAC address of the interface
    #[clap(long)]
    pub mac: Option<String>,
}

/// Interface subcommands
#[derive(Debug, Subcommand)]
pub enum NicCommands {
    /// Attach an interface with a fresh MAC address
    Add(NicAddOpts),

    /// Detach an interface
    #[clap(name = "rm")]
    Remove(NicRemoveOpts),
}

impl NicCommands {
    /// Execute the subcommand
    pub fn run(self, global: &GlobalOpts) -> Result<()> {
        let provisioner = global.provisioner()?;
        let devices = provisioner.devices();
        match self {
            NicCommands::Add(opts) => {
                let source = devices.resolve_interface_source(&opts.source)?;
                let nic = devices.attach_nic(&opts.domain, source)?;
                println!("Attached {} to {}", nic.mac, opts.domain);
            }
            NicCommands::Remove(opts) => {
                let nic = match (&opts.slot, &opts.mac) {
                    (_, Some(mac)) => devices.detach_nic_by_mac(&opts.domain, mac)?,
                    (Some(slot), None) => devices.detach_nic(&opts.domain, slot)?,
                    (None, None) => color_eyre::eyre::bail!("Either --slot or --mac is required"),
                };
                println!("Detached {} from {}", nic.mac, opts.domain);
            }
        }
        Ok(())
    }
}
