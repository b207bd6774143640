//! `virtforge` command line entry point

use clap::Parser;
use color_eyre::{Report, Result};

mod commands;

/// Provision, clone and tear down libvirt virtual machines from templates.
///
/// Instances are created as copy-on-write clones of template domains, get a
/// cloud-init seed with their hostname and SSH keys, and can be removed
/// again together with their snapshots and disks.
#[derive(Parser)]
#[clap(name = "virtforge", version)]
struct Cli {
    #[command(flatten)]
    global: commands::GlobalOpts,

    #[command(subcommand)]
    command: commands::Commands,
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by the RUST_LOG environment variable, defaulting to
/// 'info', and written to stderr so command output stays parseable.
fn install_tracing() -> Result<()> {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
    Ok(())
}

fn main() -> Result<(), Report> {
    install_tracing()?;
    color_eyre::install()?;

    let cli = Cli::parse();
    cli.command
        .run(&cli.global)
        .map_err(commands::tag_error_kind)?;
    tracing::debug!("exiting");
    Ok(())
}
