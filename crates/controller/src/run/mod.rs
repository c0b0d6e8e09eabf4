//! Polling controller: admission throttles, worker launching, the loop.

pub mod admission;
pub mod controller;
pub mod launcher;

pub use admission::{admit, failed_counts, parents_satisfied, running_counts, Held, TagCounts};
pub use controller::{Controller, ControllerOptions};
pub use launcher::{
    build_invocation, clear_kill_marker, kill_marker_present, process_alive, spawn_detached,
    Invocation, LaunchTracker, RunMode, KILL_MARKER,
};
