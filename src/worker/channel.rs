//! Signal relay channel between the master and one worker.
//!
//! A non-blocking pipe carrying 4-byte messages, each a native-endian `i32`
//! signal number. Messages are smaller than `PIPE_BUF`, so every write lands
//! whole or not at all and a reader never sees a partial message.
//!
//! Writing to a pipe whose reader is gone raises `SIGPIPE`. The writer blocks
//! it for the calling thread around each write and discards the one the write
//! generated, so a dead worker can never take the master down, whatever the
//! host's `SIGPIPE` disposition.

use super::signum::signal_from_raw;
use crate::error::{PreforkError, Result};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::libc;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use tracing::{debug, trace, warn};

/// Size of one relayed signal on the wire.
pub const MESSAGE_LEN: usize = 4;

/// Encode a signal for the wire.
pub fn encode(signal: Signal) -> [u8; MESSAGE_LEN] {
    (signal as i32).to_ne_bytes()
}

/// Decode a wire message. An unknown signal number is a protocol violation.
pub fn decode(message: [u8; MESSAGE_LEN]) -> Result<Signal> {
    let signum = i32::from_ne_bytes(message);
    signal_from_raw(signum)
        .map_err(|_| PreforkError::Protocol(format!("unknown signal number {}", signum)))
}

/// Create a connected channel. Both ends are non-blocking and close-on-exec.
pub fn channel() -> Result<(SignalReader, SignalWriter)> {
    let (read_fd, write_fd) = nix::unistd::pipe()?;
    configure(&read_fd)?;
    configure(&write_fd)?;
    Ok((SignalReader::new(read_fd), SignalWriter::new(write_fd)))
}

fn configure(fd: &OwnedFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Outcome of a best-effort send. None of these are errors to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The message is queued in the channel.
    Delivered,
    /// The channel buffer was full; the message was discarded.
    Dropped,
    /// The worker has closed its end (or was never given one).
    PeerGone,
    /// Any other write failure, swallowed.
    Failed(Errno),
}

impl Delivery {
    /// Whether the message reached the channel.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Result of one non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Signal(Signal),
    /// Nothing queued right now.
    Empty,
    /// The write end is closed.
    Closed,
}

/// Master-side end of the channel.
#[derive(Debug)]
pub struct SignalWriter {
    fd: OwnedFd,
}

impl SignalWriter {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Attempt one non-blocking write of `signal`. Never retries.
    pub fn send(&self, signal: Signal) -> Delivery {
        let message = encode(signal);
        let mask = SigpipeMask::block();
        loop {
            match nix::unistd::write(&self.fd, &message) {
                Ok(MESSAGE_LEN) => {
                    trace!(fd = self.fd.as_raw_fd(), ?signal, "Relayed signal");
                    return Delivery::Delivered;
                }
                Ok(n) => {
                    // Writes below PIPE_BUF are all-or-nothing; treat anything else as lost.
                    warn!(fd = self.fd.as_raw_fd(), written = n, "Partial signal write");
                    return Delivery::Dropped;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    debug!(fd = self.fd.as_raw_fd(), ?signal, "Signal channel full, dropping");
                    return Delivery::Dropped;
                }
                Err(Errno::EPIPE) => {
                    if let Some(mask) = &mask {
                        mask.discard_pending();
                    }
                    debug!(fd = self.fd.as_raw_fd(), ?signal, "Worker end closed");
                    return Delivery::PeerGone;
                }
                Err(e) => {
                    debug!(fd = self.fd.as_raw_fd(), ?signal, error = %e, "Signal write failed");
                    return Delivery::Failed(e);
                }
            }
        }
    }
}

/// Keeps `SIGPIPE` blocked for the calling thread until dropped.
struct SigpipeMask {
    previous: SigSet,
}

impl SigpipeMask {
    /// Returns `None` if the mask cannot be changed or `SIGPIPE` was already
    /// blocked by the caller; a pending `SIGPIPE` is then left alone.
    fn block() -> Option<Self> {
        let mut previous = SigSet::empty();
        let sigpipe = SigSet::from(Signal::SIGPIPE);
        let blocked = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&sigpipe), Some(&mut previous));
        if let Err(e) = blocked {
            warn!(error = %e, "Cannot block SIGPIPE around signal write");
            return None;
        }
        if previous.contains(Signal::SIGPIPE) {
            return None;
        }
        Some(Self { previous })
    }

    /// Consume the `SIGPIPE` a failed write left pending on this thread.
    fn discard_pending(&self) {
        let pending = unsafe {
            let mut set = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigemptyset(set.as_mut_ptr());
            libc::sigpending(set.as_mut_ptr()) == 0
                && libc::sigismember(set.as_ptr(), libc::SIGPIPE) == 1
        };
        // Only wait when something is pending, or this would block.
        if pending && let Err(e) = SigSet::from(Signal::SIGPIPE).wait() {
            debug!(error = %e, "Failed to discard pending SIGPIPE");
        }
    }
}

impl Drop for SigpipeMask {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            warn!(error = %e, "Failed to restore signal mask");
        }
    }
}

impl AsFd for SignalWriter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SignalWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Worker-side end of the channel.
#[derive(Debug)]
pub struct SignalReader {
    fd: OwnedFd,
    closed: bool,
    shutdown_dispatched: bool,
}

impl SignalReader {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            closed: false,
            shutdown_dispatched: false,
        }
    }

    /// Whether end-of-stream has been observed on this reader.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the shutdown signal for end-of-stream was dispatched successfully.
    pub fn shutdown_dispatched(&self) -> bool {
        self.shutdown_dispatched
    }

    pub(crate) fn mark_shutdown_dispatched(&mut self) {
        self.shutdown_dispatched = true;
    }

    /// Read at most one message without blocking.
    pub fn recv(&mut self) -> Result<Received> {
        let mut message = [0u8; MESSAGE_LEN];
        loop {
            match nix::unistd::read(&self.fd, &mut message) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(Received::Closed);
                }
                Ok(MESSAGE_LEN) => return decode(message).map(Received::Signal),
                Ok(n) => {
                    return Err(PreforkError::Protocol(format!(
                        "expected {}-byte message, read {} bytes",
                        MESSAGE_LEN, n
                    )));
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(Received::Empty),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl AsFd for SignalReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SignalReader {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
