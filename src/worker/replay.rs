//! Synchronous replay of relayed signals.
//!
//! Real asynchronous delivery can land in the middle of a request and
//! interrupt it. Relayed signals are instead replayed at a safe point chosen
//! by the worker loop: the currently installed handler is looked up and called
//! as a plain function while the signal itself is ignored, then the original
//! disposition is put back.

use super::channel::{Received, SignalReader};
use super::signum::is_uncatchable;
use crate::error::{PreforkError, Result};
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, trace, warn};

/// Something that can deliver a relayed signal to the current process.
pub trait SignalDispatch {
    fn dispatch(&mut self, signal: Signal) -> Result<()>;
}

/// Installs a disposition for a signal and restores the previous one on drop.
pub struct DispositionGuard {
    signal: Signal,
    previous: SigAction,
}

impl DispositionGuard {
    /// Install `handler` for `signal`, remembering what was there before.
    pub fn install(signal: Signal, handler: SigHandler) -> Result<Self> {
        let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
        // Replacing a disposition is process-wide; the previous one is restored in Drop.
        let previous = unsafe { signal::sigaction(signal, &action) }?;
        Ok(Self { signal, previous })
    }

    /// The disposition that was active before this guard.
    pub fn previous(&self) -> SigHandler {
        self.previous.handler()
    }
}

impl Drop for DispositionGuard {
    fn drop(&mut self) {
        if let Err(e) = unsafe { signal::sigaction(self.signal, &self.previous) } {
            warn!(signal = ?self.signal, error = %e, "Failed to restore signal disposition");
        }
    }
}

/// Dispatches relayed signals to the process's own signal handlers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSignals;

impl SignalDispatch for ProcessSignals {
    fn dispatch(&mut self, signal: Signal) -> Result<()> {
        if is_uncatchable(signal) {
            return Err(PreforkError::InvalidSignal(format!(
                "{} cannot be replayed",
                signal
            )));
        }

        let guard = DispositionGuard::install(signal, SigHandler::SigIgn)?;
        let signum = signal as libc::c_int;

        match guard.previous() {
            SigHandler::Handler(handler) => {
                trace!(?signal, "Replaying signal handler");
                handler(signum);
            }
            SigHandler::SigAction(handler) => {
                trace!(?signal, "Replaying signal action");
                let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
                info.si_signo = signum;
                #[cfg(any(target_os = "linux", target_os = "android"))]
                {
                    info.si_code = libc::SI_USER;
                }
                handler(signum, &mut info, std::ptr::null_mut());
            }
            SigHandler::SigIgn => {
                trace!(?signal, "Relayed signal is ignored");
            }
            SigHandler::SigDfl => {
                // No handler to call: put the default back and let it act here.
                drop(guard);
                debug!(?signal, "Raising relayed signal with default disposition");
                signal::raise(signal)?;
            }
        }

        Ok(())
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Signals dispatched during this pass, shutdown included.
    pub delivered: usize,
    /// The master side of the channel is closed.
    pub closed: bool,
}

/// Dispatch every queued signal on `reader` without blocking.
///
/// End-of-stream dispatches `shutdown` once; after that succeeds, later passes
/// on the same reader return immediately. A malformed message aborts the pass with an error.
pub fn drain(
    reader: &mut SignalReader,
    dispatch: &mut dyn SignalDispatch,
    shutdown: Signal,
) -> Result<DrainOutcome> {
    let mut outcome = DrainOutcome::default();
    if reader.shutdown_dispatched() {
        outcome.closed = true;
        return Ok(outcome);
    }

    loop {
        match reader.recv()? {
            Received::Empty => return Ok(outcome),
            Received::Closed => {
                debug!(?shutdown, "Signal channel closed by master");
                // Latched only once dispatched, so a failed attempt is retried.
                dispatch.dispatch(shutdown)?;
                reader.mark_shutdown_dispatched();
                outcome.delivered += 1;
                outcome.closed = true;
                return Ok(outcome);
            }
            Received::Signal(signal) => {
                dispatch.dispatch(signal)?;
                outcome.delivered += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::channel::channel;
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

    /// Records dispatched signals.
    #[derive(Default)]
    struct Recorder(Vec<Signal>);

    impl SignalDispatch for Recorder {
        fn dispatch(&mut self, signal: Signal) -> Result<()> {
            self.0.push(signal);
            Ok(())
        }
    }

    #[test]
    fn test_drain_dispatches_in_order() {
        let (mut reader, writer) = channel().unwrap();
        writer.send(Signal::SIGUSR1);
        writer.send(Signal::SIGHUP);

        let mut recorder = Recorder::default();
        let outcome = drain(&mut reader, &mut recorder, Signal::SIGQUIT).unwrap();
        assert_eq!(recorder.0, vec![Signal::SIGUSR1, Signal::SIGHUP]);
        assert_eq!(
            outcome,
            DrainOutcome {
                delivered: 2,
                closed: false
            }
        );
    }

    #[test]
    fn test_drain_empty_is_noop() {
        let (mut reader, _writer) = channel().unwrap();
        let mut recorder = Recorder::default();
        let outcome = drain(&mut reader, &mut recorder, Signal::SIGQUIT).unwrap();
        assert_eq!(outcome, DrainOutcome::default());
        assert!(recorder.0.is_empty());
    }

    #[test]
    fn test_close_dispatches_shutdown_once() {
        let (mut reader, writer) = channel().unwrap();
        drop(writer);

        let mut recorder = Recorder::default();
        for _ in 0..3 {
            let outcome = drain(&mut reader, &mut recorder, Signal::SIGQUIT).unwrap();
            assert!(outcome.closed);
        }
        assert_eq!(recorder.0, vec![Signal::SIGQUIT]);
    }

    #[test]
    fn test_queued_signals_precede_shutdown() {
        let (mut reader, writer) = channel().unwrap();
        writer.send(Signal::SIGUSR2);
        drop(writer);

        let mut recorder = Recorder::default();
        let outcome = drain(&mut reader, &mut recorder, Signal::SIGTERM).unwrap();
        assert_eq!(recorder.0, vec![Signal::SIGUSR2, Signal::SIGTERM]);
        assert_eq!(outcome.delivered, 2);
    }

    #[test]
    fn test_garbage_aborts_drain() {
        let (mut reader, writer) = channel().unwrap();
        writer.send(Signal::SIGUSR1);
        nix::unistd::write(&writer, &[0xff, 0xff]).unwrap();

        let mut recorder = Recorder::default();
        let err = drain(&mut reader, &mut recorder, Signal::SIGQUIT).unwrap_err();
        assert!(matches!(err, PreforkError::Protocol(_)));
        assert_eq!(recorder.0, vec![Signal::SIGUSR1]);
    }

    /// Fails the first `failures` dispatches, then records.
    struct Flaky {
        failures: usize,
        seen: Vec<Signal>,
    }

    impl SignalDispatch for Flaky {
        fn dispatch(&mut self, signal: Signal) -> Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(PreforkError::InvalidSignal(signal.to_string()));
            }
            self.seen.push(signal);
            Ok(())
        }
    }

    #[test]
    fn test_failed_shutdown_dispatch_is_retried() {
        let (mut reader, writer) = channel().unwrap();
        drop(writer);

        let mut flaky = Flaky {
            failures: 1,
            seen: Vec::new(),
        };
        assert!(drain(&mut reader, &mut flaky, Signal::SIGQUIT).is_err());
        assert!(reader.is_closed());
        assert!(!reader.shutdown_dispatched());

        let outcome = drain(&mut reader, &mut flaky, Signal::SIGQUIT).unwrap();
        assert_eq!(
            outcome,
            DrainOutcome {
                delivered: 1,
                closed: true
            }
        );
        assert!(reader.shutdown_dispatched());

        drain(&mut reader, &mut flaky, Signal::SIGQUIT).unwrap();
        assert_eq!(flaky.seen, vec![Signal::SIGQUIT]);
    }

    static WINCH_CALLS: AtomicUsize = AtomicUsize::new(0);
    static WINCH_SEEN_IGNORED: AtomicI32 = AtomicI32::new(-1);

    extern "C" fn on_winch(_: libc::c_int) {
        WINCH_CALLS.fetch_add(1, Ordering::SeqCst);
        // Peek at the disposition active while the handler runs.
        if let Ok(guard) = DispositionGuard::install(Signal::SIGWINCH, SigHandler::SigIgn) {
            let ignored = matches!(guard.previous(), SigHandler::SigIgn);
            WINCH_SEEN_IGNORED.store(ignored as i32, Ordering::SeqCst);
        }
    }

    #[test]
    #[serial(dispositions)]
    fn test_process_signals_replays_handler() {
        let installed = DispositionGuard::install(Signal::SIGWINCH, SigHandler::Handler(on_winch))
            .unwrap();

        ProcessSignals.dispatch(Signal::SIGWINCH).unwrap();
        assert_eq!(WINCH_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(WINCH_SEEN_IGNORED.load(Ordering::SeqCst), 1);

        // The handler is back in place afterwards
        {
            let probe = DispositionGuard::install(Signal::SIGWINCH, SigHandler::SigIgn).unwrap();
            assert!(matches!(probe.previous(), SigHandler::Handler(_)));
        }

        drop(installed);
    }

    static INFO_SIGNO: AtomicI32 = AtomicI32::new(0);

    extern "C" fn on_cont_info(
        signum: libc::c_int,
        info: *mut libc::siginfo_t,
        _: *mut libc::c_void,
    ) {
        let signo = if info.is_null() {
            -1
        } else {
            unsafe { (*info).si_signo }
        };
        INFO_SIGNO.store(if signo == signum { signo } else { -signo }, Ordering::SeqCst);
    }

    #[test]
    #[serial(dispositions)]
    fn test_process_signals_fills_siginfo() {
        let action = SigAction::new(
            SigHandler::SigAction(on_cont_info),
            SaFlags::SA_SIGINFO,
            SigSet::empty(),
        );
        let previous = unsafe { signal::sigaction(Signal::SIGCONT, &action) }.unwrap();

        ProcessSignals.dispatch(Signal::SIGCONT).unwrap();
        assert_eq!(INFO_SIGNO.load(Ordering::SeqCst), Signal::SIGCONT as i32);

        unsafe { signal::sigaction(Signal::SIGCONT, &previous) }.unwrap();
    }

    #[test]
    #[serial(dispositions)]
    fn test_process_signals_ignored_is_noop() {
        let _ignored = DispositionGuard::install(Signal::SIGURG, SigHandler::SigIgn).unwrap();
        ProcessSignals.dispatch(Signal::SIGURG).unwrap();
    }

    #[test]
    fn test_process_signals_rejects_uncatchable() {
        assert!(matches!(
            ProcessSignals.dispatch(Signal::SIGKILL),
            Err(PreforkError::InvalidSignal(_))
        ));
    }

    #[test]
    #[serial(dispositions)]
    fn test_guard_restores_on_unwind() {
        let result = std::panic::catch_unwind(|| {
            let _guard = DispositionGuard::install(Signal::SIGUSR2, SigHandler::SigIgn).unwrap();
            panic!("handler failed");
        });
        assert!(result.is_err());

        // Default disposition for SIGUSR2 in a fresh test process
        let probe = DispositionGuard::install(Signal::SIGUSR2, SigHandler::SigIgn).unwrap();
        assert!(matches!(probe.previous(), SigHandler::SigDfl));
    }
}
