//! prefork - worker supervision core for preforking servers.
//!
//! A master process forks workers and keeps two cheap lines to each of them:
//! a heartbeat counter in shared memory and a pipe over which it relays
//! control signals that the worker replays at a safe point.
//!
//! ```no_run
//! use nix::sys::signal::Signal;
//! use nix::unistd::{ForkResult, fork};
//! use prefork::worker::{HeartbeatStore, ProcessSignals, WorkerHandle};
//!
//! # fn main() -> prefork::Result<()> {
//! let mut store = HeartbeatStore::new();
//! let mut handle = WorkerHandle::create(0, &mut store, None)?;
//!
//! match unsafe { fork() }? {
//!     ForkResult::Child => {
//!         handle.on_fork_child();
//!         handle.set_tick(1);
//!         // ... at a safe point in the worker loop:
//!         handle.drain(&mut ProcessSignals, Signal::SIGQUIT)?;
//!     }
//!     ForkResult::Parent { .. } => {
//!         handle.on_fork_parent();
//!         handle.send(Signal::SIGUSR1);
//!         let _tick = handle.tick();
//!         handle.request_shutdown();
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod worker;

pub use error::{PreforkError, Result};
