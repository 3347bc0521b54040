//! The action executor: matches device requests against action rules,
//! derives renamed paths, and dispatches synchronous, asynchronous, and
//! daemonlet commands.

pub mod daemonlet;

use std::process::{Child, Command, Stdio};
use std::time::Instant;

use crate::config::Config;
use crate::device::{DeviceRequest, EventKind, NodeKind, PATH_UNKNOWN};
use crate::error::Error;
use crate::rules::{ActionRule, IfExists};

use daemonlet::DaemonletTable;

/// Upper bound on rename-command output: a path plus the NUL that will
/// never fit.
pub const RENAME_OUTPUT_MAX: usize = libc::PATH_MAX as usize + 1;

/// Returns whether the rule matches the request when the request is
/// considered to be at `path`. Matching is conjunctive over the trigger,
/// the path regex, the device type filter, and the OS parameter map.
pub fn matches_at(req: &DeviceRequest, rule: &ActionRule, path: &str) -> bool {
    if rule.trigger != req.kind() && rule.trigger != EventKind::Any {
        return false;
    }

    if let Some(regex) = &rule.path_regex {
        if !regex.is_match(path) {
            return false;
        }
    }

    if let Some(filter) = rule.node_filter {
        if req.node_kind() == NodeKind::None || req.node_kind() != filter {
            return false;
        }
    }

    for (key, expected) in &rule.os_params {
        match req.params().get(key) {
            // an empty expected value matches any present value
            Some(_) if expected.is_empty() => (),
            Some(value) if value == expected => (),
            _ => return false,
        }
    }

    true
}

/// Returns whether the rule matches the request at its original path.
pub fn matches(req: &DeviceRequest, rule: &ActionRule) -> bool {
    matches_at(req, rule, req.path())
}

/// Derive the device path for this request by running every matching
/// rename command in rule order. Each renamer sees the path produced by
/// the previous one and its stdout (trailing newline stripped) becomes the
/// new path. Returns the final path, which is the original when nothing
/// matched.
pub fn create_path(
    req: &DeviceRequest,
    rules: &[ActionRule],
    config: &Config,
) -> Result<String, Error> {
    let mut current = req.path().to_string();

    for rule in rules {
        let Some(rename_command) = &rule.rename_command else {
            continue;
        };
        if !matches_at(req, rule, &current) {
            continue;
        }

        let mut env = req.to_env(config);
        if let Some(path_var) = env.iter_mut().find(|(key, _)| key == "VDEV_PATH") {
            path_var.1 = current.clone();
        }

        match run_sync(rename_command, rule.shell, &env, Some(RENAME_OUTPUT_MAX)) {
            Ok((0, output)) => {
                let output = String::from_utf8_lossy(&output);
                current = output.strip_suffix('\n').unwrap_or(&output).to_string();
                log::debug!("rename '{}' -> '{current}'", req.path());
            }
            Ok((status, _)) => {
                log::error!("rename command '{rename_command}' exit status {status}");
            }
            Err(e) => {
                log::error!("rename command '{rename_command}': {e}");
            }
        }
    }

    if current.is_empty() {
        if req.path() == PATH_UNKNOWN {
            return Ok(PATH_UNKNOWN.to_string());
        }
        return Err(Error::InvalidState(format!(
            "zero-length path generated for '{}'",
            req.path()
        )));
    }

    Ok(current)
}

/// Dispatches action commands for the worker. Owns the daemonlet table and
/// the async children awaiting reaping.
#[derive(Default)]
pub struct Executor {
    daemonlets: DaemonletTable,
    async_children: Vec<Child>,
}

impl Executor {
    pub fn new() -> Executor {
        Executor::default()
    }

    /// Run the command of every rule matching this request, in rule order.
    /// Command failures are logged and do not stop the scan. `node_existed`
    /// reports whether the device node predated this event, which the
    /// per-rule `if_exists` policy inspects.
    pub fn run_commands(
        &mut self,
        req: &DeviceRequest,
        rules: &[ActionRule],
        config: &Config,
        node_existed: bool,
    ) -> Result<(), Error> {
        self.reap_async();

        for rule in rules {
            let Some(command) = rule.effective_command(config) else {
                continue;
            };
            if !matches(req, rule) {
                continue;
            }

            if node_existed {
                match rule.if_exists {
                    IfExists::Error => {
                        log::error!(
                            "action '{}': device '{}' already exists",
                            rule.name,
                            req.effective_path()
                        );
                        continue;
                    }
                    IfExists::Mask => {
                        log::debug!("action '{}': masked, device exists", rule.name);
                        continue;
                    }
                    IfExists::Run => (),
                }
            }

            let mut env = req.to_env(config);
            for (key, value) in &rule.helper_vars {
                env.push((key.clone(), value.clone()));
            }

            let started = Instant::now();
            if rule.daemonlet {
                match self.daemonlets.dispatch(&command, &env, config) {
                    Ok(0) => rule.stats.record(started.elapsed()),
                    Ok(status) => {
                        log::error!("daemonlet '{command}' exit status {status}");
                    }
                    Err(e) => log::error!("daemonlet '{command}': {e}"),
                }
            } else if rule.is_async {
                match spawn_async(&command, rule.shell, &env) {
                    Ok(child) => {
                        self.async_children.push(child);
                        rule.stats.record(started.elapsed());
                    }
                    Err(e) => log::error!("spawn '{command}': {e}"),
                }
            } else {
                match run_sync(&command, rule.shell, &env, None) {
                    Ok((0, _)) => rule.stats.record(started.elapsed()),
                    Ok((status, _)) => {
                        log::error!("command '{command}' exit status {status}");
                    }
                    Err(e) => log::error!("command '{command}': {e}"),
                }
            }
        }

        Ok(())
    }

    /// Collect any asynchronous children that have finished.
    fn reap_async(&mut self) {
        self.async_children.retain_mut(|child| {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("async command (pid {}) exited: {status}", child.id());
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    log::warn!("reap async command (pid {}): {e}", child.id());
                    false
                }
            }
        });
    }

    /// Stop every daemonlet and reap outstanding async children.
    pub fn shutdown(&mut self) {
        self.daemonlets.shutdown();
        for mut child in self.async_children.drain(..) {
            match child.wait() {
                Ok(status) => log::debug!("async command (pid {}) exited: {status}", child.id()),
                Err(e) => log::warn!("reap async command (pid {}): {e}", child.id()),
            }
        }
    }

    #[cfg(test)]
    pub fn daemonlet_pid(&self, command: &str) -> Option<u32> {
        self.daemonlets.pid_of(command)
    }
}

/// Log per-rule runtime counters at debug level.
pub fn log_stats(rules: &[ActionRule]) {
    use std::sync::atomic::Ordering;
    for rule in rules {
        let calls = rule.stats.calls.load(Ordering::Relaxed);
        if calls > 0 {
            log::debug!(
                "action '{}': {calls} successful calls, {}us total",
                rule.name,
                rule.stats.total_micros.load(Ordering::Relaxed)
            );
        }
    }
}

/// Build a command invocation: through `/bin/sh -c` or by splitting the
/// command line into argv words.
fn build_command(cmdline: &str, shell: bool) -> Result<Command, Error> {
    if shell {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(cmdline);
        return Ok(command);
    }
    let mut words = cmdline.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| Error::InvalidState("empty command".into()))?;
    let mut command = Command::new(program);
    command.args(words);
    Ok(command)
}

/// Run a command to completion with exactly the given environment.
/// Returns the exit status and (when `capture_max` is set) its stdout,
/// silently capped at the limit.
fn run_sync(
    cmdline: &str,
    shell: bool,
    env: &[(String, String)],
    capture_max: Option<usize>,
) -> Result<(i32, Vec<u8>), Error> {
    let mut command = build_command(cmdline, shell)?;
    command
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null());

    if let Some(max) = capture_max {
        let output = command.output()?;
        let mut stdout = output.stdout;
        stdout.truncate(max);
        Ok((output.status.code().unwrap_or(-1), stdout))
    } else {
        let status = command.status()?;
        Ok((status.code().unwrap_or(-1), Vec::new()))
    }
}

/// Start a command without waiting for it; the executor reaps it later.
fn spawn_async(
    cmdline: &str,
    shell: bool,
    env: &[(String, String)],
) -> Result<Child, Error> {
    let mut command = build_command(cmdline, shell)?;
    let child = command
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(child)
}
