//! Global daemon state and lifecycle: init, start, the producer loop,
//! stop, and shutdown, in that order, torn down in reverse.

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::actions::{self, Executor};
use crate::config::Config;
use crate::device::{node, DeviceRequest, EventKind};
use crate::error::Error;
use crate::os::{EventSource, Poll};
use crate::queue::{FlushHook, WorkQueue};
use crate::rules::{self, ActionRule};

/// Cleared by the signal handlers; every blocking loop checks it.
static RUNNING: AtomicBool = AtomicBool::new(true);

pub fn running() -> bool {
    RUNNING.load(Ordering::SeqCst)
}

pub fn request_stop() {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Process one dequeued device request: derive the renamed path, let the
/// materializer act, then run every matching action command.
pub fn handle_request(
    mut req: DeviceRequest,
    rules: &[ActionRule],
    config: &Config,
    executor: &mut Executor,
) -> Result<(), Error> {
    let renamed = actions::create_path(&req, rules, config)?;
    req.set_renamed(&renamed);

    let (major, minor) = req.dev();
    log::debug!(
        "{} device: type '{}' at '{}' ('{}' {major}:{minor})",
        req.kind().as_env_str(),
        req.node_kind().as_env_str(),
        req.effective_path(),
        req.path(),
    );

    match req.kind() {
        EventKind::Add => {
            let outcome = node::add(&req, config)?;
            executor.run_commands(&req, rules, config, outcome.existed)
        }
        EventKind::Remove => {
            node::remove(&req, config)?;
            executor.run_commands(&req, rules, config, false)
        }
        EventKind::Change => executor.run_commands(&req, rules, config, false),
        _ => Err(Error::InvalidState("request has no event kind".into())),
    }
}

pub struct State {
    pub config: Config,
    pub actions: Arc<Vec<ActionRule>>,
    queue: WorkQueue,
    source: Option<EventSource>,
    flush_noted: bool,
}

impl State {
    /// Load the action rules and set up the work queue. The event source
    /// comes later, in start().
    pub fn init(config: Config) -> Result<State, Error> {
        log::debug!("actions dir:  {}", config.actions_dir.display());
        log::debug!("firmware dir: {}", config.firmware_dir.display());
        log::debug!("helpers dir:  {}", config.helpers_dir.display());
        log::debug!("mountpoint:   {}", config.mountpoint.display());

        let actions = rules::load_actions(&config.actions_dir)?;
        log::info!("{} action rules loaded", actions.len());

        Ok(State {
            config,
            actions: Arc::new(actions),
            queue: WorkQueue::new(),
            source: None,
            flush_noted: false,
        })
    }

    /// Run the preseed script, if one is configured. A non-zero exit is a
    /// startup failure.
    pub fn run_preseed(&self) -> Result<(), Error> {
        let Some(preseed) = &self.config.preseed else {
            return Ok(());
        };
        log::info!("preseed: {}", preseed.display());

        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(preseed.display().to_string())
            .env_clear()
            .env("VDEV_MOUNTPOINT", &self.config.mountpoint)
            .env("VDEV_HELPERS", &self.config.helpers_dir)
            .stdin(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(Error::Subprocess {
                command: preseed.display().to_string(),
                status: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    /// Bring up the event source (which also detects platform quirks) and
    /// the worker thread.
    pub fn start(&mut self, flush_hook: Option<FlushHook>) -> Result<(), Error> {
        if self.source.is_some() {
            return Err(Error::InvalidState("already started".into()));
        }

        // quirk detection mutates the config; do it before the worker
        // takes its copy
        self.source = Some(EventSource::new(&mut self.config)?);

        if let Some(hook) = flush_hook {
            self.queue.set_flush_hook(hook);
        }

        let rules = self.actions.clone();
        let config = self.config.clone();
        let mut executor = Executor::new();
        self.queue.start(Box::new(move |req| {
            handle_request(req, &rules, &config, &mut executor)
        }))?;

        Ok(())
    }

    /// The producer loop: pull requests from the event source and feed the
    /// work queue until shutdown or end-of-events.
    pub fn main_loop(&mut self) -> Result<(), Error> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| Error::InvalidState("not started".into()))?;

        while running() {
            match source.next() {
                Ok(Poll::Event(req)) => {
                    let path = req.path().to_string();
                    if let Err(e) = self.queue.enqueue(req) {
                        log::error!("enqueue '{path}': {e}");
                    }
                    if source.is_flushed() && !self.flush_noted {
                        self.flush_noted = true;
                        self.queue.note_source_flushed();
                    }
                }
                Ok(Poll::Retry) => continue,
                Ok(Poll::Eof) => {
                    if !self.flush_noted {
                        self.flush_noted = true;
                        self.queue.note_source_flushed();
                    }
                    break;
                }
                Err(e) => {
                    log::error!("event source: {e}");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// In once-mode, drop every device whose metadata was written by some
    /// earlier instance and that did not re-appear during coldplug.
    pub fn gc_unplugged(&self) -> Result<(), Error> {
        for req in node::find_unplugged(&self.config)? {
            let path = req.path().to_string();
            if let Err(e) = self.queue.enqueue(req) {
                log::error!("enqueue removal of '{path}': {e}");
            }
        }
        Ok(())
    }

    /// Stop the worker; in once-mode, wait for the queue to drain first.
    pub fn stop(&mut self) -> Result<(), Error> {
        request_stop();
        self.queue.stop(self.config.once)
    }

    /// Tear down in reverse order of construction.
    pub fn shutdown(mut self) {
        self.source.take();
        actions::log_stats(&self.actions);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::handle_request;
    use crate::actions::Executor;
    use crate::config::{Config, QUIRK_DEVICE_EXISTS};
    use crate::device::{DeviceRequest, EventKind, NodeKind};
    use crate::rules::ActionRule;

    fn quirked_config(dir: &TempDir) -> Config {
        let mut config = Config {
            mountpoint: dir.path().to_path_buf(),
            helpers_dir: PathBuf::from("/lib/vdev"),
            ..Config::default()
        };
        config.set_quirk(QUIRK_DEVICE_EXISTS);
        config
    }

    fn shell_action(trigger: EventKind, command: &str) -> ActionRule {
        ActionRule {
            name: "test".to_string(),
            trigger,
            shell: true,
            command: Some(command.to_string()),
            ..ActionRule::default()
        }
    }

    #[test]
    fn coldplug_add_fires_actions_and_publishes_metadata() {
        let dir = TempDir::new().unwrap();
        let config = quirked_config(&dir);
        let outfile = dir.path().join("fired.txt");

        let mut req = DeviceRequest::new(EventKind::Add, "null");
        req.set_dev(1, 3);
        req.set_node_kind(NodeKind::Char);
        req.add_param("SUBSYSTEM", "mem").unwrap();
        req.add_param("OUTFILE", &outfile.display().to_string())
            .unwrap();

        let mut action = shell_action(EventKind::Add, "echo fired >> $VDEV_OS_OUTFILE");
        action.path_regex = Some(regex::Regex::new("^null$").unwrap());

        let mut executor = Executor::new();
        handle_request(req, &[action], &config, &mut executor).unwrap();

        assert_eq!(fs::read_to_string(&outfile).unwrap(), "fired\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("metadata/null/SUBSYSTEM")).unwrap(),
            "mem\n"
        );
    }

    #[test]
    fn rename_chain_commands_see_the_final_path() {
        let dir = TempDir::new().unwrap();
        let config = quirked_config(&dir);
        let outfile = dir.path().join("path.txt");

        let mut req = DeviceRequest::new(EventKind::Add, "raw");
        req.add_param("OUTFILE", &outfile.display().to_string())
            .unwrap();

        let mut first = ActionRule {
            name: "a".to_string(),
            trigger: EventKind::Add,
            shell: true,
            rename_command: Some("/bin/echo first".to_string()),
            ..ActionRule::default()
        };
        first.path_regex = Some(regex::Regex::new("^raw$").unwrap());

        let mut second = shell_action(EventKind::Add, "echo $VDEV_PATH >> $VDEV_OS_OUTFILE");
        second.rename_command = Some("/bin/echo second".to_string());

        let mut executor = Executor::new();
        handle_request(req, &[first, second], &config, &mut executor).unwrap();

        // the created name is the last renamer's output, and commands see it
        assert_eq!(fs::read_to_string(&outfile).unwrap(), "second\n");
    }

    #[test]
    fn remove_requests_clean_up_and_run_remove_actions() {
        let dir = TempDir::new().unwrap();
        let config = quirked_config(&dir);
        let outfile = dir.path().join("removed.txt");

        let node = dir.path().join("null");
        fs::write(&node, "").unwrap();
        let metadata = dir.path().join("metadata/null");
        fs::create_dir_all(&metadata).unwrap();
        fs::write(metadata.join("SUBSYSTEM"), "mem\n").unwrap();

        let mut req = DeviceRequest::new(EventKind::Remove, "null");
        req.add_param("OUTFILE", &outfile.display().to_string())
            .unwrap();

        let action = shell_action(EventKind::Remove, "echo gone >> $VDEV_OS_OUTFILE");

        let mut executor = Executor::new();
        handle_request(req, &[action], &config, &mut executor).unwrap();

        assert!(!node.exists());
        assert!(!metadata.exists());
        assert_eq!(fs::read_to_string(&outfile).unwrap(), "gone\n");
    }

    #[test]
    fn failed_rename_aborts_before_any_node_is_made() {
        let dir = TempDir::new().unwrap();
        let config = quirked_config(&dir);

        let mut req = DeviceRequest::new(EventKind::Add, "raw");
        req.set_dev(8, 0);
        req.set_node_kind(NodeKind::Block);

        // produces an empty path, which is an error for a known device
        let empty = ActionRule {
            name: "empty".to_string(),
            trigger: EventKind::Add,
            shell: true,
            rename_command: Some("printf ''".to_string()),
            ..ActionRule::default()
        };

        let mut executor = Executor::new();
        assert!(handle_request(req, &[empty], &config, &mut executor).is_err());
        assert!(!dir.path().join("metadata").exists());
    }
}
