//! Worker handle shared by the master and the worker.
//!
//! The master creates the handle before forking. Right after `fork()` each
//! process drops the channel end it must not hold: the worker keeps the read
//! end, the master keeps the write end. Holding both in one process would
//! hide the peer's death, since end-of-stream only arrives once every write
//! end is closed.

use super::channel::{self, Delivery, SignalReader, SignalWriter};
use super::heartbeat::{HeartbeatSlot, HeartbeatStore};
use super::replay::{self, DrainOutcome, SignalDispatch};
use super::signum::signal_from_raw;
use crate::error::Result;
use nix::sys::signal::Signal;
use std::os::unix::io::{AsFd, BorrowedFd};
use tracing::debug;

/// One worker, as seen from either side of the fork.
#[derive(Debug)]
pub struct WorkerHandle {
    index: usize,
    switched: bool,
    reader: Option<SignalReader>,
    writer: Option<SignalWriter>,
    heartbeat: HeartbeatSlot,
}

impl WorkerHandle {
    /// Create a handle for worker `index`, before forking it.
    ///
    /// A fresh channel is created unless `existing` is given. The heartbeat
    /// slot is reset to zero.
    pub fn create(
        index: usize,
        store: &mut HeartbeatStore,
        existing: Option<(SignalReader, SignalWriter)>,
    ) -> Result<Self> {
        let heartbeat = store.slot_for(index)?;
        let (reader, writer) = match existing {
            Some(pair) => pair,
            None => channel::channel()?,
        };
        heartbeat.set(0);

        debug!(
            index,
            page = heartbeat.location().page,
            offset = heartbeat.location().offset,
            "Created worker handle"
        );

        Ok(Self {
            index,
            switched: false,
            reader: Some(reader),
            writer: Some(writer),
            heartbeat,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Compare identity by index only.
    pub fn equals_index(&self, index: usize) -> bool {
        self.index == index
    }

    /// Whether the worker has dropped privileges / switched roles.
    pub fn switched(&self) -> bool {
        self.switched
    }

    pub fn set_switched(&mut self, switched: bool) {
        self.switched = switched;
    }

    /// Call in the child right after fork: the worker never writes.
    pub fn on_fork_child(&mut self) {
        if self.writer.take().is_some() {
            debug!(index = self.index, "Closed write end in worker");
        }
    }

    /// Call in the parent right after fork: the master never reads.
    pub fn on_fork_parent(&mut self) {
        if self.reader.take().is_some() {
            debug!(index = self.index, "Closed read end in master");
        }
    }

    /// Ask the worker to quit by closing the write end.
    ///
    /// The worker sees end-of-stream on its next drain, even if it was not
    /// polling when this happened.
    pub fn request_shutdown(&mut self) {
        if self.writer.take().is_some() {
            debug!(index = self.index, "Requested worker shutdown");
        }
    }

    /// Relay `signal` to the worker. Best effort, never fails.
    pub fn send(&self, signal: Signal) -> Delivery {
        match &self.writer {
            Some(writer) => {
                let delivery = writer.send(signal);
                if !delivery.is_delivered() {
                    debug!(index = self.index, ?signal, ?delivery, "Soft signal not delivered");
                }
                delivery
            }
            None => Delivery::PeerGone,
        }
    }

    /// Relay a raw signal number, rejecting unknown numbers before writing.
    pub fn send_raw(&self, signum: i32) -> Result<Delivery> {
        let signal = signal_from_raw(signum)?;
        Ok(self.send(signal))
    }

    /// Dispatch every queued signal. Call only at a safe point.
    ///
    /// Once the read end is gone (closed locally or end-of-stream already
    /// handled) this returns a closed outcome without dispatching.
    pub fn drain(
        &mut self,
        dispatch: &mut dyn SignalDispatch,
        shutdown: Signal,
    ) -> Result<DrainOutcome> {
        match self.reader.as_mut() {
            Some(reader) => replay::drain(reader, dispatch, shutdown),
            None => Ok(DrainOutcome {
                delivered: 0,
                closed: true,
            }),
        }
    }

    /// Readiness view of the read end, for polling next to listeners.
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.reader.as_ref().map(|reader| reader.as_fd())
    }

    /// Called in the worker.
    pub fn set_tick(&self, value: u64) {
        self.heartbeat.set(value);
    }

    /// Called in the master.
    pub fn tick(&self) -> u64 {
        self.heartbeat.get()
    }

    pub fn heartbeat(&self) -> &HeartbeatSlot {
        &self.heartbeat
    }

    /// Close whatever channel ends this process still holds.
    pub fn close(&mut self) {
        let had_reader = self.reader.take().is_some();
        let had_writer = self.writer.take().is_some();
        if had_reader || had_writer {
            debug!(index = self.index, had_reader, had_writer, "Closed worker handle");
        }
    }

    pub fn has_reader(&self) -> bool {
        self.reader.is_some()
    }

    pub fn has_writer(&self) -> bool {
        self.writer.is_some()
    }
}
