//! vdev: a userspace virtual device manager for Linux.
//!
//! The back end (`vdevd`) listens for kernel hotplug events, seeds itself
//! from a sysfs walk, and materializes device nodes under a managed
//! directory while running per-event policy commands. The front end
//! (`vdevfs`) presents a per-caller filtered view of that directory by
//! evaluating ACL rules against the calling process.

pub mod acl;
pub mod actions;
pub mod config;
pub mod device;
pub mod error;
pub mod filter;
pub mod logging;
pub mod os;
pub mod queue;
pub mod rules;
pub mod state;

pub use error::Error;
