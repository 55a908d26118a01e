//! End-to-end demo: a tiny master with forked workers.
//!
//! Workers do no real work. They tick their heartbeat, poll their signal
//! channel, and replay relayed signals through real signal handlers. Each
//! worker exits with the number of `SIGUSR1`s it handled, so the master's
//! report shows whether every relayed signal arrived.

use crate::cli::DemoArgs;
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use prefork::config::SupervisorConfig;
use prefork::worker::{ExitReason, ProcessSignals, TickWatch, WorkerHandle};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Poll interval of the worker loop; also its tick rate.
const WORKER_POLL: u16 = 50;

/// Exit code for a worker whose loop failed.
const WORKER_FAILURE: i32 = 70;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static USR1_HANDLED: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_shutdown(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn on_usr1(_: libc::c_int) {
    USR1_HANDLED.fetch_add(1, Ordering::SeqCst);
}

/// A forked worker as tracked by the master.
struct Spawned {
    handle: WorkerHandle,
    pid: Pid,
    watch: TickWatch,
}

/// Run the demo master.
pub fn run(args: &DemoArgs, config: &SupervisorConfig) -> Result<()> {
    config.validate()?;
    let mut store = config.heartbeat_store()?;
    let mut workers: Vec<Spawned> = Vec::with_capacity(args.workers);

    for index in 0..args.workers {
        let mut handle = WorkerHandle::create(index, &mut store, None)
            .with_context(|| format!("cannot create handle for worker {}", index))?;

        // Safety: the master is single-threaded at this point.
        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Child => {
                handle.on_fork_child();
                // Write ends of earlier workers must not linger in this process.
                for other in &mut workers {
                    other.handle.close();
                }
                std::process::exit(worker_main(handle, config.shutdown_signal));
            }
            ForkResult::Parent { child } => {
                handle.on_fork_parent();
                info!(index, pid = %child, "Spawned worker");
                workers.push(Spawned {
                    handle,
                    pid: child,
                    watch: TickWatch::new(0, Instant::now()),
                });
            }
        }
    }

    for &signal in &args.signals {
        for worker in &workers {
            let delivery = worker.handle.send(signal);
            info!(index = worker.handle.index(), ?signal, ?delivery, "Relayed soft signal");
        }
    }

    watch_heartbeats(&mut workers, Duration::from_millis(args.settle_ms), config);

    for worker in &mut workers {
        worker.handle.request_shutdown();
    }

    for mut worker in workers {
        let reason = reap(worker.pid, config.heartbeat_timeout)?;
        info!(index = worker.handle.index(), pid = %worker.pid, %reason, "Reaped worker");
        println!(
            "worker {} {} (last tick {})",
            worker.handle.index(),
            reason,
            worker.handle.tick()
        );
        worker.handle.close();
    }

    Ok(())
}

/// Observe ticks for `window`, warning about workers whose tick stops moving.
fn watch_heartbeats(workers: &mut [Spawned], window: Duration, config: &SupervisorConfig) {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        let now = Instant::now();
        for worker in workers.iter_mut() {
            let tick = worker.handle.tick();
            if worker.watch.observe(tick, now) {
                debug!(index = worker.handle.index(), tick, "Heartbeat");
            } else if worker.watch.is_stale(config.heartbeat_timeout, now) {
                warn!(
                    index = worker.handle.index(),
                    tick,
                    timeout_ms = config.heartbeat_timeout.as_millis(),
                    "Worker heartbeat is stale"
                );
            }
        }
        thread::sleep(Duration::from_millis(u64::from(WORKER_POLL)));
    }
}

/// Wait for a worker to exit, escalating to SIGKILL after `timeout`.
fn reap(pid: Pid, timeout: Duration) -> Result<ExitReason> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => thread::sleep(Duration::from_millis(10)),
            Ok(status) => return Ok(ExitReason::from_wait_status(status)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context(format!("waitpid({}) failed", pid)),
        }
    }

    warn!(pid = %pid, "Worker ignored shutdown, killing");
    // Already gone is fine; waitpid below reports how it ended.
    let _ = signal::kill(pid, Signal::SIGKILL);
    loop {
        match waitpid(pid, None) {
            Ok(status) => return Ok(ExitReason::from_wait_status(status)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context(format!("waitpid({}) failed", pid)),
        }
    }
}

fn install_handler(signal: Signal, handler: extern "C" fn(libc::c_int)) -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { signal::sigaction(signal, &action) }
        .with_context(|| format!("cannot install {} handler", signal))?;
    Ok(())
}

/// Worker process body. Returns the process exit code.
fn worker_main(mut handle: WorkerHandle, shutdown: Signal) -> i32 {
    let index = handle.index();
    match worker_loop(&mut handle, shutdown) {
        Ok(()) => {
            handle.close();
            let handled = USR1_HANDLED.load(Ordering::SeqCst);
            debug!(index, handled, "Worker exiting");
            handled
        }
        Err(e) => {
            error!(index, error = %e, "Worker loop failed");
            WORKER_FAILURE
        }
    }
}

fn worker_loop(handle: &mut WorkerHandle, shutdown: Signal) -> Result<()> {
    install_handler(Signal::SIGUSR1, on_usr1)?;
    install_handler(shutdown, on_shutdown)?;

    let mut tick: u64 = 0;
    while !SHUTDOWN.load(Ordering::SeqCst) {
        tick += 1;
        handle.set_tick(tick);

        let readable = match handle.as_fd() {
            Some(fd) => {
                let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(WORKER_POLL)) {
                    Ok(0) | Err(Errno::EINTR) => false,
                    Ok(_) => fds[0]
                        .revents()
                        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)),
                    Err(e) => return Err(e).context("poll failed"),
                }
            }
            None => break,
        };

        // Not inside a request here, so this is a safe point.
        if readable {
            let outcome = handle.drain(&mut ProcessSignals, shutdown)?;
            debug!(index = handle.index(), ?outcome, "Drained signal channel");
        }
    }
    Ok(())
}
