//! Log sink selection. Everything in the crate logs through the `log`
//! facade; this module decides where those records end up.

use std::path::Path;

use syslog::{BasicLogger, Facility, Formatter3164};

use crate::error::Error;

/// Where diagnostics should go.
#[derive(Debug, Clone)]
pub enum LogTarget {
    Stderr,
    /// Append to a logfile
    File(std::path::PathBuf),
    /// The configured logfile was the special value "syslog"
    Syslog,
}

impl LogTarget {
    /// Interpret a `logfile=` value.
    pub fn from_logfile(value: &str) -> LogTarget {
        if value == "syslog" {
            LogTarget::Syslog
        } else {
            LogTarget::File(Path::new(value).to_path_buf())
        }
    }
}

/// Map a `-v N` occurrence count to a level filter.
pub fn level_from_verbosity(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// Install the global logger. Must be called exactly once, before any
/// thread starts logging.
pub fn init(process: &str, target: LogTarget, level: log::LevelFilter) -> Result<(), Error> {
    match target {
        LogTarget::Stderr => {
            env_logger::Builder::new().filter_level(level).init();
        }
        LogTarget::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            env_logger::Builder::new()
                .filter_level(level)
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
        LogTarget::Syslog => {
            let formatter = Formatter3164 {
                facility: Facility::LOG_DAEMON,
                hostname: None,
                process: process.to_string(),
                pid: std::process::id(),
            };
            let logger = syslog::unix(formatter)
                .map_err(|e| Error::InvalidState(format!("syslog: {e}")))?;
            log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
                .map_err(|e| Error::InvalidState(format!("logger: {e}")))?;
            log::set_max_level(level);
        }
    }
    Ok(())
}
