//! Host inventory and template catalog commands

use clap::{Parser, Subcommand};
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};
use itertools::Itertools;

use virtforge::descriptor::MemorySize;
use virtforge::host::host_report;
use virtforge::template::{FileCatalog, TemplateSpec};
use virtforge::volume::VolumeFormat;

use super::{human_bytes, print_json, GlobalOpts, OutputFormat};

/// Host subcommands
#[derive(Debug, Subcommand)]
pub enum HostCommands {
    /// CPUs, memory, pools, bridges and networks
    Report {
        /// Output format
        #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Whether the host admits more memory
    Capacity {
        /// Check a specific request, in GB
        #[clap(long)]
        ram: Option<f64>,
    },
}

impl HostCommands {
    /// Execute the subcommand
    pub fn run(self, global: &GlobalOpts) -> Result<()> {
        let provisioner = global.provisioner()?;
        match self {
            HostCommands::Report { format } => {
                let report = host_report(
                    provisioner.hypervisor(),
                    provisioner.config().memory_threshold,
                )?;
                match format {
                    OutputFormat::Json => print_json(&report)?,
                    OutputFormat::Table => {
                        println!("Host:     {} ({})", report.info.hostname, report.uri);
                        println!("CPUs:     {} x {}", report.info.cpus, report.info.cpu_model);
                        println!(
                            "Memory:   {} free of {}",
                            human_bytes(report.memory.free_memory),
                            human_bytes(report.memory.total_memory)
                        );
                        println!("Domains:  {}", report.domains);
                        println!("Bridges:  {}", report.bridges.iter().join(", "));
                        println!(
                            "Networks: {}",
                            report.networks.iter().map(|n| n.name.as_str()).join(", ")
                        );
                        let mut table = Table::new();
                        table.load_preset(UTF8_FULL);
                        table.set_header(vec!["POOL", "TYPE", "PATH", "ALLOCATION", "AVAILABLE"]);
                        for p in &report.pools {
                            table.add_row(vec![
                                p.name.clone(),
                                p.kind.clone(),
                                p.path.to_string(),
                                human_bytes(p.allocation),
                                human_bytes(p.available),
                            ]);
                        }
                        println!("{}", table);
                    }
                }
            }
            HostCommands::Capacity { ram } => {
                let capacity = provisioner.capacity();
                match ram {
                    Some(ram) => {
                        let bytes = MemorySize::from_gb(ram)?.bytes();
                        if capacity.can_allocate(bytes)? {
                            println!("{} GB can be allocated", ram);
                        } else {
                            color_eyre::eyre::bail!("{} GB cannot be allocated", ram);
                        }
                    }
                    None => {
                        let a = capacity.availability()?;
                        println!(
                            "{}: {} free of {} (threshold {}%)",
                            if a.available { "available" } else { "exhausted" },
                            human_bytes(a.free_memory),
                            human_bytes(a.total_memory),
                            a.threshold
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// Options for `template add`
#[derive(Debug, Parser)]
pub struct TemplateAddOpts {
    /// Template name
    pub name: String,

    /// Operating system
    #[clap(long)]
    pub os: String,

    /// Operating system version
    #[clap(long)]
    pub version: String,

    /// Image URL or local path
    #[clap(long)]
    pub image: String,

    /// Expected SHA-256 of the image
    #[clap(long)]
    pub sha256: Option<String>,

    /// Image format
    #[clap(long, default_value = "qcow2")]
    pub image_format: VolumeFormat,
}

/// Template subcommands
#[derive(Debug, Subcommand)]
pub enum TemplateCommands {
    /// List catalog entries and whether they are defined
    List {
        /// Output format
        #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Download and define a template if it is not defined yet
    Ensure {
        /// Template name
        name: String,
    },

    /// Add or replace a catalog entry
    Add(TemplateAddOpts),

    /// Remove a catalog entry
    #[clap(name = "rm")]
    Remove {
        /// Template name
        name: String,
    },
}

impl TemplateCommands {
    /// Execute the subcommand
    pub fn run(self, global: &GlobalOpts) -> Result<()> {
        match self {
            TemplateCommands::List { format } => {
                let provisioner = global.provisioner()?;
                let templates = provisioner.catalog().list();
                match format {
                    OutputFormat::Json => print_json(&templates)?,
                    OutputFormat::Table => {
                        let mut table = Table::new();
                        table.load_preset(UTF8_FULL);
                        table.set_header(vec!["NAME", "OS", "VERSION", "DEFINED", "IMAGE"]);
                        for t in &templates {
                            let defined = provisioner.hypervisor().domain_exists(&t.name)?;
                            table.add_row(vec![
                                t.name.clone(),
                                t.os.clone(),
                                t.version.clone(),
                                if defined { "yes" } else { "no" }.to_string(),
                                t.image.clone(),
                            ]);
                        }
                        println!("{}", table);
                    }
                }
            }
            TemplateCommands::Ensure { name } => {
                global.provisioner()?.ensure_template(&name)?;
                println!("Template {} is defined", name);
            }
            TemplateCommands::Add(opts) => {
                let mut catalog = FileCatalog::load(&global.load_config()?.templates_file())?;
                catalog.add(TemplateSpec {
                    name: opts.name.clone(),
                    os: opts.os,
                    version: opts.version,
                    image: opts.image,
                    sha256: opts.sha256,
                    format: opts.image_format,
                })?;
                println!("Added template {}", opts.name);
            }
            TemplateCommands::Remove { name } => {
                let mut catalog = FileCatalog::load(&global.load_config()?.templates_file())?;
                if !catalog.remove(&name)? {
                    color_eyre::eyre::bail!("Template {} is not in the catalog", name);
                }
                println!("Removed template {}", name);
            }
        }
        Ok(())
    }
}
