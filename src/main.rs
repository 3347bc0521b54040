use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use clap::Parser;
use nix::sys::signal::{sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{fork, pipe, setsid, ForkResult};

use vdev::config::Config;
use vdev::logging::{self, LogTarget};
use vdev::state::State;

const DEFAULT_CONFIG: &str = "/etc/vdev/vdevd.conf";

// exit codes, one per failing subsystem
const EXIT_INIT: i32 = 1;
const EXIT_LOG: i32 = 2;
const EXIT_DAEMONIZE: i32 = 3;
const EXIT_PIDFILE: i32 = 4;
const EXIT_START: i32 = 5;
const EXIT_QUIESCE: i32 = 6;

#[derive(Parser)]
#[command(name = "vdevd", version, about = "Userspace virtual device manager")]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long = "config-file", value_name = "PATH")]
    config_file: Option<PathBuf>,

    /// Verbosity (0 = warnings, 1 = info, 2 = debug, 3 = trace)
    #[arg(short = 'v', long = "verbose-level", value_name = "N")]
    verbose_level: Option<u8>,

    /// Log destination; the special value "syslog" diverts to syslog
    #[arg(short = 'l', long, value_name = "PATH")]
    logfile: Option<String>,

    #[arg(short = 'p', long, value_name = "PATH")]
    pidfile: Option<PathBuf>,

    /// Process the coldplug walk, then exit
    #[arg(short = '1', long)]
    once: bool,

    /// Stay in the foreground
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Managed directory
    mountpoint: Option<PathBuf>,
}

extern "C" fn on_terminate(_: libc::c_int) {
    vdev::state::request_stop();
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    // daemonlet pipes must fail with EPIPE, not kill us
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    };

    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vdevd: {e}");
            return EXIT_INIT;
        }
    };

    // command line wins over the config file
    if let Some(logfile) = &args.logfile {
        config.logfile = Some(logfile.clone());
    }
    if let Some(pidfile) = &args.pidfile {
        config.pidfile = Some(pidfile.clone());
    }
    if args.once {
        config.once = true;
    }
    if args.foreground {
        config.foreground = true;
    }
    if let Some(mountpoint) = &args.mountpoint {
        config.mountpoint = mountpoint.clone();
    }
    let level = match args.verbose_level {
        Some(n) => logging::level_from_verbosity(n),
        None => config.loglevel,
    };

    let target = if config.foreground {
        LogTarget::Stderr
    } else {
        match &config.logfile {
            Some(logfile) => LogTarget::from_logfile(logfile),
            None => {
                eprintln!("vdevd: no logfile specified");
                return EXIT_LOG;
            }
        }
    };
    if let Err(e) = logging::init("vdevd", target, level) {
        eprintln!("vdevd: log setup: {e}");
        return EXIT_LOG;
    }

    let terminate = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        if sigaction(Signal::SIGTERM, &terminate).is_err()
            || sigaction(Signal::SIGINT, &terminate).is_err()
        {
            log::error!("failed to install signal handlers");
            return EXIT_INIT;
        }
    }

    let mut state = match State::init(config) {
        Ok(state) => state,
        Err(e) => {
            log::error!("init: {e}");
            return EXIT_INIT;
        }
    };

    if let Err(e) = state.run_preseed() {
        log::error!("preseed: {e}");
        return EXIT_INIT;
    }

    // when daemonizing, the parent lingers until the child reports that
    // the coldplug queue has quiesced
    let mut flush_pipe: Option<OwnedFd> = None;
    if !state.config.foreground && !state.config.once {
        let (read_end, write_end) = match pipe() {
            Ok(ends) => ends,
            Err(e) => {
                log::error!("pipe: {e}");
                return EXIT_DAEMONIZE;
            }
        };

        match unsafe { fork() } {
            Ok(ForkResult::Parent { .. }) => {
                drop(write_end);
                return wait_for_quiesce(read_end);
            }
            Ok(ForkResult::Child) => {
                drop(read_end);
                if let Err(e) = become_daemon() {
                    log::error!("daemonize: {e}");
                    return EXIT_DAEMONIZE;
                }
                if let Some(pidfile) = state.config.pidfile.clone() {
                    if let Err(e) = write_pidfile(&pidfile) {
                        log::error!("pidfile '{}': {e}", pidfile.display());
                        return EXIT_PIDFILE;
                    }
                }
                flush_pipe = Some(write_end);
            }
            Err(e) => {
                log::error!("fork: {e}");
                return EXIT_DAEMONIZE;
            }
        }
    }

    let flush_hook = flush_pipe.as_ref().and_then(|fd| {
        let hook_fd = fd.try_clone().ok()?;
        Some(Box::new(move || {
            let mut file = File::from(hook_fd);
            let _ = file.write_all(&0i32.to_ne_bytes());
        }) as vdev::queue::FlushHook)
    });

    if let Err(e) = state.start(flush_hook) {
        log::error!("start: {e}");
        if let Some(fd) = flush_pipe {
            let mut file = File::from(fd);
            let _ = file.write_all(&EXIT_START.to_ne_bytes());
        }
        return EXIT_START;
    }

    log::info!("vdevd started (instance {})", state.config.instance_nonce);

    let rc = match state.main_loop() {
        Ok(()) => 0,
        Err(e) => {
            log::error!("main loop: {e}");
            1
        }
    };

    // find and remove devices that did not re-appear this run
    if state.config.once {
        if let Err(e) = state.gc_unplugged() {
            log::error!("unplugged-device gc: {e}");
        }
    }

    if let Err(e) = state.stop() {
        log::error!("stop: {e}");
    }
    state.shutdown();

    log::info!("vdevd stopped");
    rc
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

/// Parent side of the daemonize handshake: wait for the child to flush
/// its coldplug queue (or fail trying).
fn wait_for_quiesce(read_end: OwnedFd) -> i32 {
    let mut file = File::from(read_end);
    let mut buf = [0u8; 4];
    if file.read_exact(&mut buf).is_err() {
        eprintln!("vdevd: child exited before flushing initial devices");
        return EXIT_QUIESCE;
    }
    let rc = i32::from_ne_bytes(buf);
    if rc != 0 {
        eprintln!("vdevd: device quiesce failure, child rc = {rc}");
        return EXIT_QUIESCE;
    }
    println!("vdevd: all initial devices processed");
    0
}

/// Detach from the controlling terminal and the launch environment.
fn become_daemon() -> Result<(), vdev::Error> {
    setsid()?;
    std::env::set_current_dir("/")?;

    let null_in = File::open("/dev/null")?;
    let null_out = std::fs::OpenOptions::new().write(true).open("/dev/null")?;
    unsafe {
        libc::dup2(null_in.as_raw_fd(), libc::STDIN_FILENO);
        libc::dup2(null_out.as_raw_fd(), libc::STDOUT_FILENO);
        libc::dup2(null_out.as_raw_fd(), libc::STDERR_FILENO);
    }
    Ok(())
}

fn write_pidfile(path: &std::path::Path) -> Result<(), vdev::Error> {
    let mut file = File::create(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}
