//! Worker supervision primitives for a preforking server.
//!
//! The master forks one process per worker and talks to each through two
//! independent mechanisms:
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │            Master            │
//!            │  WorkerHandle (write end)    │
//!            └──────┬───────────────▲───────┘
//!      soft signals │ 4-byte pipe   │ tick (read)
//!                   │               │
//!            ┌──────▼───────────────┴───────┐
//!            │  HeartbeatStore (MAP_SHARED) │
//!            └──────┬───────────────▲───────┘
//!                   │               │ tick (write)
//!            ┌──────▼───────────────┴───────┐
//!            │            Worker            │
//!            │  WorkerHandle (read end)     │
//!            │  drain() at safe points      │
//!            └──────────────────────────────┘
//! ```
//!
//! - **Heartbeat**: the worker bumps a counter in shared memory, the master
//!   watches it for staleness. No IPC round trips.
//! - **Soft signals**: the master writes signal numbers into a pipe; the
//!   worker replays them through its own handlers when it is not in the
//!   middle of a request. Closing the pipe means "shut down".

mod channel;
mod handle;
mod heartbeat;
mod replay;
mod signum;
mod status;

pub use channel::{
    Delivery, MESSAGE_LEN, Received, SignalReader, SignalWriter, channel, decode, encode,
};
pub use handle::WorkerHandle;
pub use heartbeat::{
    HeartbeatSlot, HeartbeatStore, MAX_SLOTS_PER_PAGE, SLOT_SIZE, SlotLocation, TickWatch,
    check_slots_per_page, default_slots_per_page,
};
pub use replay::{DispositionGuard, DrainOutcome, ProcessSignals, SignalDispatch, drain};
pub use signum::{is_uncatchable, parse_signal, signal_from_raw};
pub use status::ExitReason;
