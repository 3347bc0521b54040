use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::device::{DeviceRequest, EventKind};
use crate::queue::WorkQueue;

fn request(path: &str) -> DeviceRequest {
    DeviceRequest::new(EventKind::Add, path)
}

#[test]
fn requests_are_processed_in_enqueue_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();

    let mut queue = WorkQueue::new();
    queue
        .start(Box::new(move |req| {
            seen_in_handler.lock().unwrap().push(req.path().to_string());
            Ok(())
        }))
        .unwrap();

    for name in ["a", "b", "c", "d"] {
        queue.enqueue(request(name)).unwrap();
    }
    queue.stop(true).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c", "d"]);
}

#[test]
fn handler_errors_do_not_stop_the_worker() {
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();

    let mut queue = WorkQueue::new();
    queue
        .start(Box::new(move |req| {
            counter.fetch_add(1, Ordering::SeqCst);
            if req.path() == "bad" {
                return Err(crate::Error::NotFound("bad".into()));
            }
            Ok(())
        }))
        .unwrap();

    queue.enqueue(request("bad")).unwrap();
    queue.enqueue(request("good")).unwrap();
    queue.stop(true).unwrap();

    assert_eq!(processed.load(Ordering::SeqCst), 2);
}

#[test]
fn stop_with_wait_drains_the_queue() {
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();

    let mut queue = WorkQueue::new();
    queue
        .start(Box::new(move |_| {
            std::thread::sleep(Duration::from_millis(10));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

    for _ in 0..5 {
        queue.enqueue(request("dev")).unwrap();
    }
    queue.stop(true).unwrap();

    assert_eq!(processed.load(Ordering::SeqCst), 5);
    assert!(queue.is_empty());
}

#[test]
fn enqueue_rejects_invalid_requests() {
    let mut queue = WorkQueue::new();
    queue.start(Box::new(|_| Ok(()))).unwrap();

    assert!(queue.enqueue(DeviceRequest::new(EventKind::Invalid, "x")).is_err());
    assert!(queue.enqueue(DeviceRequest::new(EventKind::Any, "x")).is_err());
    assert!(queue.enqueue(DeviceRequest::new(EventKind::Add, "")).is_err());

    queue.stop(false).unwrap();
}

#[test]
fn enqueue_fails_when_not_running() {
    let queue = WorkQueue::new();
    assert!(queue.enqueue(request("x")).is_err());
}

#[test]
fn flush_hook_fires_once_after_source_flush_and_drain() {
    let fired = Arc::new(AtomicUsize::new(0));
    let hook_counter = fired.clone();

    let mut queue = WorkQueue::new();
    queue.set_flush_hook(Box::new(move || {
        hook_counter.fetch_add(1, Ordering::SeqCst);
    }));
    queue.start(Box::new(|_| Ok(()))).unwrap();

    queue.enqueue(request("a")).unwrap();
    queue.enqueue(request("b")).unwrap();
    queue.note_source_flushed();
    queue.wait_drained();

    // give the worker a beat in case the hook fires on its side
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // further traffic must not re-fire the one-shot hook
    queue.enqueue(request("c")).unwrap();
    queue.stop(true).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn flush_hook_fires_immediately_when_queue_is_already_empty() {
    let fired = Arc::new(AtomicUsize::new(0));
    let hook_counter = fired.clone();

    let mut queue = WorkQueue::new();
    queue.set_flush_hook(Box::new(move || {
        hook_counter.fetch_add(1, Ordering::SeqCst);
    }));
    queue.start(Box::new(|_| Ok(()))).unwrap();

    queue.note_source_flushed();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    queue.stop(false).unwrap();
}
