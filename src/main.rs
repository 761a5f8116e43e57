//! Ignite init system binary.
//!
//! This is the entry point for the ignite init system. It is intended
//! to be invoked directly by the kernel as PID 1; the flags exist for
//! bring-up and debugging on a running system.

use clap::Parser;
use ignite::{Init, InitConfig};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "ignite",
    about = "Ignite init system - PID 1 boot step engine and daemon supervisor",
    version
)]
struct Cli {
    /// Filesystem table path
    #[arg(long, default_value = "/etc/fstab")]
    fstab: PathBuf,

    /// Mounted-filesystem table path
    #[arg(long, default_value = "/etc/mtab")]
    mtab: PathBuf,

    /// Kernel modules list
    #[arg(long, default_value = "/etc/modules")]
    modules: PathBuf,

    /// TOML daemon set replacing the compiled-in one
    #[arg(long)]
    daemons: Option<PathBuf>,

    /// Resolve and mount the root filesystem from the kernel command line
    #[arg(long)]
    mount_root: bool,

    /// Where to mount the resolved root filesystem
    #[arg(long, default_value = "/sysroot")]
    root_target: PathBuf,

    /// Skip the module-loading step
    #[arg(long)]
    no_modules: bool,

    /// Don't require running as PID 1
    #[arg(long)]
    no_pid1: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = InitConfig {
        fstab_path: cli.fstab,
        mtab_path: cli.mtab,
        modules_path: cli.modules,
        daemons_path: cli.daemons,
        root_target: cli.root_target,
        load_modules: !cli.no_modules,
        mount_root: cli.mount_root,
        require_pid1: !cli.no_pid1,
        ..InitConfig::default()
    };

    let mut init = Init::new(config)?;
    if let Err(e) = init.run().await {
        // the emergency shell already has the terminal; just record why
        error!(error = %e, "Boot halted");
        return Err(e.into());
    }
    Ok(())
}
