//! Virtual network and storage pool commands

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};
use itertools::Itertools;

use virtforge::network::{NetworkOutcome, NetworkSpec};

use super::{human_bytes, print_json, GlobalOpts, OutputFormat};

/// Options for `net create`
#[derive(Debug, Parser)]
pub struct NetCreateOpts {
    /// Network name
    pub name: String,

    /// IPv4 range, e.g. 10.10.0.0/24
    pub cidr: String,

    /// Do not serve DHCP
    #[clap(long)]
    pub no_dhcp: bool,

    /// Isolated network without NAT to the outside
    #[clap(long)]
    pub isolated: bool,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

/// Options for `net list`
#[derive(Debug, Parser)]
pub struct NetListOpts {
    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

/// Network subcommands
#[derive(Debug, Subcommand)]
pub enum NetCommands {
    /// Define, start and autostart a network
    Create(NetCreateOpts),

    /// Stop and remove a network
    #[clap(name = "rm")]
    Remove {
        /// Network name
        name: String,
    },

    /// List networks
    List(NetListOpts),

    /// List instances attached to a network
    Members {
        /// Network name
        name: String,
    },
}

impl NetCommands {
    /// Execute the subcommand
    pub fn run(self, global: &GlobalOpts) -> Result<()> {
        let provisioner = global.provisioner()?;
        let networks = provisioner.networks();
        match self {
            NetCommands::Create(opts) => {
                let spec = NetworkSpec {
                    name: opts.name,
                    cidr: opts.cidr,
                    dhcp: !opts.no_dhcp,
                    nat: !opts.isolated,
                };
                let outcome = networks.create_network(&spec);
                if opts.format == OutputFormat::Json {
                    print_json(&outcome)?;
                }
                match outcome {
                    NetworkOutcome::Success => {
                        if opts.format == OutputFormat::Table {
                            println!("Created network {} on {}", spec.name, spec.cidr);
                        }
                    }
                    NetworkOutcome::Failure { reason } => color_eyre::eyre::bail!(reason),
                }
            }
            NetCommands::Remove { name } => {
                networks.delete_network(&name)?;
                println!("Removed network {}", name);
            }
            NetCommands::List(opts) => {
                let list = networks.list_networks()?;
                match opts.format {
                    OutputFormat::Json => print_json(&list)?,
                    OutputFormat::Table => {
                        let mut table = Table::new();
                        table.load_preset(UTF8_FULL);
                        table.set_header(vec!["NAME", "RANGES", "FORWARD", "DHCP", "ACTIVE"]);
                        for n in &list {
                            table.add_row(vec![
                                n.name.clone(),
                                n.cidrs.iter().join(", "),
                                n.forward.clone().unwrap_or_else(|| "isolated".into()),
                                if n.dhcp { "yes" } else { "no" }.to_string(),
                                if n.active { "yes" } else { "no" }.to_string(),
                            ]);
                        }
                        println!("{}", table);
                    }
                }
            }
            NetCommands::Members { name } => {
                for domain in networks.members(&name)? {
                    println!("{}", domain);
                }
            }
        }
        Ok(())
    }
}

/// Storage pool subcommands
#[derive(Debug, Subcommand)]
pub enum PoolCommands {
    /// Create a directory pool
    Create {
        /// Pool name
        name: String,
        /// Absolute directory path
        path: Utf8PathBuf,
    },

    /// Stop and undefine a pool, leaving its files in place
    #[clap(name = "rm")]
    Remove {
        /// Pool name
        name: String,
    },

    /// List pools with usage
    List {
        /// Output format
        #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

impl PoolCommands {
    /// Execute the subcommand
    pub fn run(self, global: &GlobalOpts) -> Result<()> {
        let provisioner = global.provisioner()?;
        let pools = provisioner.pools();
        match self {
            PoolCommands::Create { name, path } => {
                let pool = pools.create_dir_pool(&name, &path)?;
                println!("Created pool {} at {}", pool.name, pool.path);
            }
            PoolCommands::Remove { name } => {
                pools.delete_pool(&name)?;
                println!("Removed pool {}", name);
            }
            PoolCommands::List { format } => {
                let list = pools.list()?;
                match format {
                    OutputFormat::Json => print_json(&list)?,
                    OutputFormat::Table => {
                        let mut table = Table::new();
                        table.load_preset(UTF8_FULL);
                        table.set_header(vec!["NAME", "TYPE", "PATH", "CAPACITY", "AVAILABLE"]);
                        for p in &list {
                            table.add_row(vec![
                                p.name.clone(),
                                p.kind.clone(),
                                p.path.to_string(),
                                human_bytes(p.capacity),
                                human_bytes(p.available),
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
