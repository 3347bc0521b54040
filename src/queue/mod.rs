//! The device work queue: a single-consumer FIFO serializing every device
//! request behind one worker thread.

#[cfg(test)]
mod queue_test;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::device::DeviceRequest;
use crate::error::Error;

/// Handler run by the worker for each dequeued request. Failures are
/// logged; they never stop the queue.
pub type Handler = Box<dyn FnMut(DeviceRequest) -> Result<(), Error> + Send>;

/// One-shot hook fired when the queue first empties after the event source
/// reports the coldplug seed flushed.
pub type FlushHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<DeviceRequest>,
    running: bool,
    worker_busy: bool,
    source_flushed: bool,
    flush_hook: Option<FlushHook>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<QueueState>,
    work: Condvar,
    drained: Condvar,
    /// Number of threads blocked in wait_drained
    num_waiters: Mutex<usize>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// With the state lock held and the queue observed empty: release
    /// drain waiters and, if armed, take the initial-flush hook.
    fn on_empty(&self, state: &mut QueueState) -> Option<FlushHook> {
        self.drained.notify_all();
        if state.source_flushed {
            state.flush_hook.take()
        } else {
            None
        }
    }
}

pub struct WorkQueue {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> WorkQueue {
        WorkQueue {
            inner: Arc::new(Inner::default()),
            worker: None,
        }
    }

    /// Arm the one-shot initial-flush hook. Must be called before the
    /// coldplug seed drains to be of any use.
    pub fn set_flush_hook(&self, hook: FlushHook) {
        self.inner.lock().flush_hook = Some(hook);
    }

    /// Spawn the worker thread.
    pub fn start(&mut self, mut handler: Handler) -> Result<(), Error> {
        {
            let mut state = self.inner.lock();
            if state.running {
                return Err(Error::InvalidState("work queue already running".into()));
            }
            state.running = true;
        }

        let inner = self.inner.clone();
        let worker = std::thread::Builder::new()
            .name("vdev-worker".to_string())
            .spawn(move || loop {
                let request = {
                    let mut state = inner.lock();
                    loop {
                        if !state.running {
                            break None;
                        }
                        if let Some(request) = state.pending.pop_front() {
                            state.worker_busy = true;
                            break Some(request);
                        }
                        if let Some(hook) = inner.on_empty(&mut state) {
                            drop(state);
                            hook();
                            state = inner.lock();
                            continue;
                        }
                        state = inner
                            .work
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                };

                let Some(request) = request else {
                    return;
                };

                let path = request.path().to_string();
                if let Err(e) = handler(request) {
                    log::error!("request '{path}': {e}");
                }

                let mut state = inner.lock();
                state.worker_busy = false;
                if state.pending.is_empty() {
                    if let Some(hook) = inner.on_empty(&mut state) {
                        drop(state);
                        hook();
                    }
                }
            })?;

        self.worker = Some(worker);
        Ok(())
    }

    /// Enqueue a device request for the worker. The request must pass its
    /// sanity check and the queue must be running.
    pub fn enqueue(&self, request: DeviceRequest) -> Result<(), Error> {
        request.sanity_check()?;
        let mut state = self.inner.lock();
        if !state.running {
            return Err(Error::InvalidState("work queue is not running".into()));
        }
        state.pending.push_back(request);
        drop(state);
        self.inner.work.notify_one();
        Ok(())
    }

    /// Record that the event source has handed out its last coldplug
    /// request. If the queue is already empty the flush hook fires now.
    pub fn note_source_flushed(&self) {
        let mut state = self.inner.lock();
        state.source_flushed = true;
        if state.pending.is_empty() && !state.worker_busy {
            if let Some(hook) = self.inner.on_empty(&mut state) {
                drop(state);
                hook();
            }
        }
    }

    /// Block until the queue is empty and the worker has observed it.
    pub fn wait_drained(&self) {
        {
            let mut waiters = self
                .inner
                .num_waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *waiters += 1;
        }

        let mut state = self.inner.lock();
        while !(state.pending.is_empty() && !state.worker_busy) {
            state = self
                .inner
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(state);

        let mut waiters = self
            .inner
            .num_waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *waiters -= 1;
    }

    /// Stop the worker. With `wait` set, block until every pending request
    /// has been processed first.
    pub fn stop(&mut self, wait: bool) -> Result<(), Error> {
        if wait {
            self.wait_drained();
        }
        {
            let mut state = self.inner.lock();
            if !state.running {
                return Err(Error::InvalidState("work queue is not running".into()));
            }
            state.running = false;
        }
        self.inner.work.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
        Ok(())
    }

    /// Number of requests not yet picked up by the worker.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
