//! Versioning stacking filesystem daemon.
//!
//! Mounts `bkpfs` over a lower directory, transparently snapshotting writes
//! past a configured threshold and exposing them through the control channel
//! (see `bkpctl`).

use std::path::PathBuf;

use bkpfs::{BkpConfig, BkpFs, MountOption};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "bkpfsd", about = "Mount a versioning stacking filesystem")]
struct Args {
    /// Directory to serve as the lower (backing) filesystem
    lower: PathBuf,

    /// Mountpoint to expose the versioned view at
    mountpoint: PathBuf,

    /// Comma-separated mount option string (e.g. "maxvers=5,bkp_threshold=64")
    #[arg(short = 'o', long = "options")]
    options: Option<String>,

    /// Run in the foreground instead of daemonizing
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Enable debug-level FUSE logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = match &args.options {
        Some(opts) => BkpConfig::parse(opts),
        None => BkpConfig::default(),
    };

    log::info!(
        "bkpfsd: mounting {} at {} (maxvers={}, bkp_threshold={})",
        args.lower.display(),
        args.mountpoint.display(),
        config.maxvers,
        config.bkp_threshold
    );

    if !args.foreground {
        log::warn!("bkpfsd: background daemonization is not implemented, staying in the foreground");
    }

    let fs = BkpFs::new(args.lower, config);

    let mount_options = vec![
        MountOption::FSName("bkpfs".to_string()),
        MountOption::Subtype("bkpfs".to_string()),
        MountOption::DefaultPermissions,
    ];

    if let Err(err) = bkpfs::mount2(fs, &args.mountpoint, &mount_options) {
        log::error!("bkpfsd: mount failed: {err}");
        std::process::exit(1);
    }
}
