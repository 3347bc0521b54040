//! Daemonlets: long-lived helper subprocesses. The worker writes one
//! environment block per device event to the child's stdin and reads a
//! one-line exit status back from its stdout.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::Config;
use crate::error::Error;

struct Daemonlet {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Daemonlet {
    fn spawn(command: &str, config: &Config) -> Result<Daemonlet, Error> {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .env_clear()
            .env("VDEV_MOUNTPOINT", &config.mountpoint)
            .env("VDEV_HELPERS", &config.helpers_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::InvalidState("daemonlet has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| Error::InvalidState("daemonlet has no stdout".into()))?;

        log::debug!("daemonlet '{command}' started, pid {}", child.id());
        Ok(Daemonlet {
            child,
            stdin,
            stdout,
        })
    }

    /// Send one environment block and collect the status line.
    fn run(&mut self, env: &[(String, String)]) -> Result<i32, Error> {
        for (key, value) in env {
            self.stdin.write_all(key.as_bytes())?;
            self.stdin.write_all(b"=")?;
            self.stdin.write_all(value.as_bytes())?;
            self.stdin.write_all(b"\0")?;
        }
        // an empty record ends the block
        self.stdin.write_all(b"\0")?;
        self.stdin.flush()?;

        let mut line = String::new();
        let n = self.stdout.read_line(&mut line)?;
        if n == 0 {
            return Err(Error::InvalidState("daemonlet closed its stdout".into()));
        }
        line.trim()
            .parse::<i32>()
            .map_err(|_| Error::Parse(format!("bad daemonlet status '{}'", line.trim())))
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// The worker's table of live daemonlets, keyed by command line.
#[derive(Default)]
pub struct DaemonletTable {
    children: HashMap<String, Daemonlet>,
}

impl DaemonletTable {
    pub fn new() -> DaemonletTable {
        DaemonletTable::default()
    }

    /// Dispatch one event to the daemonlet for `command`, starting or
    /// restarting the child as needed, and return its reported status.
    pub fn dispatch(
        &mut self,
        command: &str,
        env: &[(String, String)],
        config: &Config,
    ) -> Result<i32, Error> {
        // one respawn attempt: the child may have died since last use
        for attempt in 0..2 {
            let needs_spawn = match self.children.get_mut(command) {
                Some(daemonlet) => !daemonlet.is_alive(),
                None => true,
            };
            if needs_spawn {
                if attempt > 0 || self.children.contains_key(command) {
                    log::warn!("daemonlet '{command}' died; restarting");
                }
                self.children.remove(command);
                let daemonlet = Daemonlet::spawn(command, config)?;
                self.children.insert(command.to_string(), daemonlet);
            }

            let daemonlet = self
                .children
                .get_mut(command)
                .expect("daemonlet just inserted");
            match daemonlet.run(env) {
                Ok(status) => return Ok(status),
                Err(e) if attempt == 0 => {
                    log::warn!("daemonlet '{command}': {e}");
                    self.children.remove(command);
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("daemonlet dispatch retries exhausted");
    }

    /// Signal every daemonlet and reap it.
    pub fn shutdown(&mut self) {
        for (command, mut daemonlet) in self.children.drain() {
            // EOF on stdin first, so a child draining its input can finish
            drop(daemonlet.stdin);
            let pid = Pid::from_raw(daemonlet.child.id() as i32);
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                log::warn!("SIGTERM daemonlet '{command}' ({pid}): {e}");
            }
            match daemonlet.child.wait() {
                Ok(status) => log::debug!("daemonlet '{command}' exited: {status}"),
                Err(e) => log::warn!("reap daemonlet '{command}': {e}"),
            }
        }
    }

    #[cfg(test)]
    pub fn pid_of(&self, command: &str) -> Option<u32> {
        self.children.get(command).map(|d| d.child.id())
    }
}

impl Drop for DaemonletTable {
    fn drop(&mut self) {
        self.shutdown();
    }
}
