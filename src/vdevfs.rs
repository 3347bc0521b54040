use std::path::PathBuf;

use clap::Parser;

use vdev::config::Config;
use vdev::filter::{fuse, Filter};
use vdev::logging::{self, LogTarget};
use vdev::rules;

const DEFAULT_CONFIG: &str = "/etc/vdev/vdevfs.conf";

#[derive(Parser)]
#[command(
    name = "vdevfs",
    version,
    about = "Filtered view of a vdev-managed device directory"
)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long = "config-file", value_name = "PATH")]
    config_file: Option<PathBuf>,

    /// Verbosity (0 = warnings, 1 = info, 2 = debug, 3 = trace)
    #[arg(short = 'v', long = "verbose-level", value_name = "N")]
    verbose_level: Option<u8>,

    /// Mount options, FUSE-style (dev and allow_other are always on)
    #[arg(short = 'o', value_name = "OPT")]
    options: Vec<String>,

    /// FUSE-style trailing arguments; the last one is the mountpoint
    #[arg(value_name = "ARGS")]
    positional: Vec<PathBuf>,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vdevfs: {e}");
            return 1;
        }
    };

    let level = match args.verbose_level {
        Some(n) => logging::level_from_verbosity(n),
        None => config.loglevel,
    };
    if let Err(e) = logging::init("vdevfs", LogTarget::Stderr, level) {
        eprintln!("vdevfs: log setup: {e}");
        return 1;
    }

    let Some(mountpoint) = args.positional.last().cloned().or_else(|| {
        // fall back to the configured mountpoint
        Some(config.mountpoint.clone()).filter(|p| !p.as_os_str().is_empty())
    }) else {
        log::error!("no mountpoint given");
        return 1;
    };

    // the canonical path is the managed root
    let root = match mountpoint.canonicalize() {
        Ok(root) => root,
        Err(e) => {
            log::error!("mountpoint '{}': {e}", mountpoint.display());
            return 1;
        }
    };
    config.mountpoint = root.clone();

    let acls = match rules::load_acls(&config.acls_dir) {
        Ok(acls) => acls,
        Err(e) => {
            log::error!("load ACLs from '{}': {e}", config.acls_dir.display());
            return 1;
        }
    };
    log::info!("{} ACL rules loaded", acls.len());

    // -o a,b is the same as -o a -o b
    let options: Vec<String> = args
        .options
        .iter()
        .flat_map(|value| value.split(','))
        .map(str::to_string)
        .collect();

    let filter = Filter::new(config, acls, root.clone());
    log::info!("vdevfs serving '{}'", root.display());

    if let Err(e) = fuse::mount(filter, &root, &options) {
        log::error!("mount '{}': {e}", root.display());
        return 1;
    }
    0
}

fn load_config(args: &Args) -> Result<Config, vdev::Error> {
    match &args.config_file {
        Some(path) => Config::load(path),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.is_file() {
                Config::load(&default)
            } else {
                Ok(Config::default())
            }
        }
    }
}
