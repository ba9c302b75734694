mod command;
mod config;
mod fs;

use clap::Parser;
use fuser::MountOption;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use config::{Config, MountConfig};
use fs::{CommandFs, MountError};

/// Mount the output of shell commands as a read-only filesystem.
#[derive(Parser)]
#[command(name = "fusee")]
struct Cli {
    /// Print debug data
    #[arg(long)]
    debug: bool,
    /// Path to the configuration file
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    if config.mounts.is_empty() {
        error!("no mounts defined in the configuration");
        return ExitCode::FAILURE;
    }

    let mut drivers = Vec::new();
    for (name, mount_config) in config.mounts {
        drivers.push(thread::spawn(move || drive_mount(name, mount_config)));
    }

    let mut failed = false;
    for driver in drivers {
        match driver.join() {
            Ok(ok) => failed |= !ok,
            Err(_) => {
                error!("a mount driver thread panicked");
                failed = true;
            }
        }
    }
    if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

/// Runs one mount to completion; a failure is logged and reported to the
/// caller without affecting sibling mounts.
fn drive_mount(name: String, mount_config: MountConfig) -> bool {
    match mount_one(&name, mount_config) {
        Ok(()) => true,
        Err(err) => {
            error!("mount '{}' failed: {}", name, err);
            false
        }
    }
}

/// Constructs the filesystem for one mount and blocks until it is unmounted.
fn mount_one(name: &str, mount_config: MountConfig) -> Result<(), MountError> {
    let filesystem = CommandFs::new(name, mount_config)?;
    let mount_point = filesystem.mount_point().to_string();
    info!("mounting '{}' at {}", name, mount_point);
    let options = [
        MountOption::RO,
        MountOption::FSName("fusee".to_string()),
        MountOption::AutoUnmount,
    ];
    fuser::mount2(filesystem, &mount_point, &options)?;
    info!("mount '{}' at {} released", name, mount_point);
    Ok(())
}
