//! A server runtime built on stackful coroutines.
//!
//! `weft` provides three layers, each usable on its own and stacked in
//! practice:
//!
//! - [Fibers](fiber): cooperative tasks with private stacks and explicit
//!   context switching — blocking-style code that suspends instead of
//!   blocking its thread.
//! - [Scheduler](scheduler): an M:N dispatcher running fibers and callbacks
//!   across a pool of worker threads, with optional per-task thread pinning.
//! - [I/O manager](io): an epoll reactor plus [timer set](timer) that wakes
//!   suspended fibers on descriptor readiness and deadlines.
//!
//! ```no_run
//! use std::time::Duration;
//! use weft::io::IoManager;
//! use weft::scheduler::Task;
//!
//! let io = IoManager::new(2, false, "web").unwrap();
//! let worker = io.clone();
//! io.schedule(Task::callback(move || {
//!     // Runs on a worker fiber; sleeping suspends the fiber, not the
//!     // thread. Arming an fd event without a callback works the same way.
//!     worker.sleep(Duration::from_millis(10));
//! }));
//! io.stop();
//! ```
//!
//! Diagnostics go through the [`log`](https://docs.rs/log) facade; install
//! any backend. Tunables are declared via [`config`], e.g.
//! `fiber.stack_size`.

pub mod clock;
pub mod config;
pub mod error;
pub mod fiber;
pub mod io;
pub mod scheduler;
pub mod timer;
pub mod util;

pub use error::{Error, Result};
