//! Instance lifecycle commands

use std::fs;

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::{eyre::Context as _, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use dialoguer::{theme::ColorfulTheme, Confirm};
use itertools::Itertools;

use virtforge::descriptor::InstanceParams;
use virtforge::engine::{CreateOptions, ProvisionedDomain};

use super::{human_bytes, print_json, GlobalOpts, OutputFormat};

/// Options for `create`
#[derive(Debug, Parser)]
pub struct CreateOpts {
    /// Template to instantiate
    pub template: String,

    /// Name of the new instance
    pub name: String,

    /// Memory in GB; fractions are allowed (e.g. 1.5)
    #[clap(long)]
    pub ram: Option<f64>,

    /// Number of vCPUs
    #[clap(long)]
    pub vcpus: Option<u32>,

    /// Primary disk size in GB
    #[clap(long)]
    pub disk_size: Option<u64>,

    /// Custom cloud-config user-data file merged into the seed
    #[clap(long)]
    pub user_data: Option<Utf8PathBuf>,

    /// Start the instance and wait for it to obtain an address
    #[clap(long)]
    pub start: bool,

    /// Fail instead of materializing a template that is not defined yet
    #[clap(long)]
    pub no_materialize: bool,

    /// Skip the host memory admission check
    #[clap(long)]
    pub skip_capacity_check: bool,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

/// Options for `clone`
#[derive(Debug, Parser)]
pub struct CloneOpts {
    /// Template or stopped instance to copy
    pub source: String,

    /// Name of the new instance
    pub name: String,

    /// Start the clone and wait for it to obtain an address
    #[clap(long)]
    pub start: bool,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

/// Options for `rm`
#[derive(Debug, Parser)]
pub struct RemoveOpts {
    /// Instance to remove
    pub name: String,

    /// Remove without confirmation
    #[clap(long, short = 'f')]
    pub force: bool,
}

/// Options for `start`
#[derive(Debug, Parser)]
pub struct StartOpts {
    /// Instance to start
    pub name: String,

    /// Wait until the instance obtains an address
    #[clap(long)]
    pub wait: bool,
}

/// Options for `stop`
#[derive(Debug, Parser)]
pub struct StopOpts {
    /// Instance to stop
    pub name: String,

    /// Pull the plug instead of requesting an ACPI shutdown
    #[clap(long, short = 'f')]
    pub force: bool,
}

/// A single instance name
#[derive(Debug, Parser)]
pub struct NameOpts {
    /// Instance name
    pub name: String,
}

/// Options for `autostart`
#[derive(Debug, Parser)]
pub struct AutostartOpts {
    /// Instance name
    pub name: String,

    /// Disable instead of enable
    #[clap(long)]
    pub disable: bool,
}

/// Options for `list`
#[derive(Debug, Parser)]
pub struct ListOpts {
    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

/// Options for `info`
#[derive(Debug, Parser)]
pub struct InfoOpts {
    /// Instance name
    pub name: String,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

fn report(out: &ProvisionedDomain, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            println!("Created {}", out.name);
            if let Some(uuid) = &out.uuid {
                println!("  UUID: {}", uuid);
            }
            println!("  Volumes: {}", out.volumes.iter().join(", "));
            if let Some(ip) = &out.ip {
                println!("  Address: {}", ip);
            }
            Ok(())
        }
    }
}

/// Execute `create`
pub fn create(global: &GlobalOpts, opts: CreateOpts) -> Result<()> {
    let user_data = opts
        .user_data
        .as_ref()
        .map(|p| fs::read_to_string(p).with_context(|| format!("Reading {p}")))
        .transpose()?;
    let params = InstanceParams {
        name: opts.name,
        ram: opts.ram,
        vcpus: opts.vcpus,
        disk_size: opts.disk_size,
    };
    let create_opts = CreateOptions {
        start: opts.start,
        materialize_template: !opts.no_materialize,
        check_capacity: !opts.skip_capacity_check,
        user_data,
        cancel: None,
    };
    let provisioner = global.provisioner()?;
    let out = provisioner.create(&opts.template, &params, &create_opts)?;
    report(&out, opts.format)
}

/// Execute `clone`
pub fn clone(global: &GlobalOpts, opts: CloneOpts) -> Result<()> {
    let create_opts = CreateOptions {
        start: opts.start,
        ..Default::default()
    };
    let provisioner = global.provisioner()?;
    let out = provisioner.clone_domain(&opts.source, &opts.name, &create_opts)?;
    report(&out, opts.format)
}

/// Execute `rm`
pub fn remove(global: &GlobalOpts, opts: RemoveOpts) -> Result<()> {
    let provisioner = global.provisioner()?;
    if !opts.force {
        let info = provisioner.info(&opts.name)?;
        println!("This will permanently delete {} and its data:", opts.name);
        for disk in info.disks.iter().filter(|d| !d.is_cdrom()) {
            if let Some(source) = &disk.source {
                println!("  Disk: {}", source);
            }
        }
        println!("  Status: {}", info.state);
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Are you sure? This cannot be undone")
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted");
            return Ok(());
        }
    }
    let steps = provisioner.delete(&opts.name)?;
    println!(
        "Removed {} ({})",
        opts.name,
        steps.iter().map(|s| s.to_string()).join(", ")
    );
    Ok(())
}

/// Execute `start`
pub fn start(global: &GlobalOpts, opts: StartOpts) -> Result<()> {
    let provisioner = global.provisioner()?;
    match provisioner.start(&opts.name, opts.wait, None)? {
        Some(ip) => println!("{} is up at {}", opts.name, ip),
        None => println!("Started {}", opts.name),
    }
    Ok(())
}

/// Execute `stop`
pub fn stop(global: &GlobalOpts, opts: StopOpts) -> Result<()> {
    global.provisioner()?.stop(&opts.name, opts.force)?;
    println!("Stopped {}", opts.name);
    Ok(())
}

/// Execute `reboot`
pub fn reboot(global: &GlobalOpts, opts: NameOpts) -> Result<()> {
    global.provisioner()?.reboot(&opts.name)?;
    Ok(())
}

/// Execute `suspend`
pub fn suspend(global: &GlobalOpts, opts: NameOpts) -> Result<()> {
    global.provisioner()?.suspend(&opts.name)?;
    Ok(())
}

/// Execute `resume`
pub fn resume(global: &GlobalOpts, opts: NameOpts) -> Result<()> {
    global.provisioner()?.resume(&opts.name)?;
    Ok(())
}

/// Execute `autostart`
pub fn autostart(global: &GlobalOpts, opts: AutostartOpts) -> Result<()> {
    global
        .provisioner()?
        .set_autostart(&opts.name, !opts.disable)?;
    Ok(())
}

/// Execute `list`
pub fn list(global: &GlobalOpts, opts: ListOpts) -> Result<()> {
    let provisioner = global.provisioner()?;
    let domains = provisioner.list()?;
    match opts.format {
        OutputFormat::Json => print_json(&domains),
        OutputFormat::Table => {
            if domains.is_empty() {
                println!("No domains found");
                return Ok(());
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["NAME", "STATE", "ADDRESS"]);
            for domain in &domains {
                let ip = provisioner
                    .domain_ip(&domain.name)?
                    .unwrap_or_else(|| "-".to_string());
                table.add_row(vec![domain.name.clone(), domain.state.to_string(), ip]);
            }
            println!("{}", table);
            Ok(())
        }
    }
}

/// Execute `info`
pub fn info(global: &GlobalOpts, opts: InfoOpts) -> Result<()> {
    let info = global.provisioner()?.info(&opts.name)?;
    match opts.format {
        OutputFormat::Json => print_json(&info),
        OutputFormat::Table => {
            println!("Name:    {}", info.name);
            println!("UUID:    {}", info.uuid.as_deref().unwrap_or("-"));
            println!("State:   {}", info.state);
            if let Some(mem) = info.max_memory {
                println!("Memory:  {}", human_bytes(mem));
            }
            if let Some(vcpus) = info.vcpus {
                println!("vCPUs:   {}", vcpus);
            }
            println!("Address: {}", info.ip.as_deref().unwrap_or("-"));

            let mut disks = Table::new();
            disks.load_preset(UTF8_FULL);
            disks.set_header(vec!["TARGET", "DEVICE", "SOURCE", "FORMAT"]);
            for d in &info.disks {
                disks.add_row(vec![
                    d.target.clone().unwrap_or_default(),
                    d.device.clone(),
                    d.source.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                    d.format.clone().unwrap_or_default(),
                ]);
            }
            println!("{}", disks);

            let mut nics = Table::new();
            nics.load_preset(UTF8_FULL);
            nics.set_header(vec!["TYPE", "SOURCE", "MAC", "MODEL"]);
            for i in &info.interfaces {
                nics.add_row(vec![
                    i.kind.clone(),
                    i.source.clone().unwrap_or_default(),
                    i.mac.clone().unwrap_or_default(),
                    i.model.clone().unwrap_or_default(),
                ]);
            }
            println!("{}", nics);
            Ok(())
        }
    }
}

/// Execute `ip`
pub fn ip(global: &GlobalOpts, opts: NameOpts) -> Result<()> {
    match global.provisioner()?.domain_ip(&opts.name)? {
        Some(ip) => println!("{}", ip),
        None => color_eyre::eyre::bail!("{} has no address (is it running?)", opts.name),
    }
    Ok(())
}
