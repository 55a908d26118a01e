//! Exit analysis for reaped workers.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process is no longer running (or that it still is).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled { signal: Signal, core_dumped: bool },
    /// Process is still running.
    StillAlive,
    /// Stopped, continued, or anything else `waitpid` can report.
    Unknown,
}

impl ExitReason {
    /// Classify a `WaitStatus` from `waitpid`.
    pub fn from_wait_status(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, signal, core_dumped) => Self::Signaled {
                signal,
                core_dumped,
            },
            WaitStatus::StillAlive => Self::StillAlive,
            _ => Self::Unknown,
        }
    }

    /// Exit code zero.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// The process is gone and can be forgotten.
    pub fn is_reaped(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Signaled { .. })
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled {
                signal,
                core_dumped: true,
            } => write!(f, "killed by {} (core dumped)", signal),
            Self::Signaled { signal, .. } => write!(f, "killed by {}", signal),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_from_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            ExitReason::from_wait_status(WaitStatus::Exited(pid, 3)),
            ExitReason::Exited(3)
        );
        assert_eq!(
            ExitReason::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGQUIT, true)),
            ExitReason::Signaled {
                signal: Signal::SIGQUIT,
                core_dumped: true
            }
        );
        assert_eq!(
            ExitReason::from_wait_status(WaitStatus::StillAlive),
            ExitReason::StillAlive
        );
        assert_eq!(
            ExitReason::from_wait_status(WaitStatus::Continued(pid)),
            ExitReason::Unknown
        );
    }

    #[test]
    fn test_clean_and_reaped() {
        assert!(ExitReason::Exited(0).is_clean());
        assert!(!ExitReason::Exited(2).is_clean());
        assert!(ExitReason::Exited(2).is_reaped());
        assert!(!ExitReason::StillAlive.is_reaped());
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitReason::Exited(2).to_string(), "exited with code 2");
        let killed = ExitReason::Signaled {
            signal: Signal::SIGKILL,
            core_dumped: false,
        };
        assert_eq!(killed.to_string(), "killed by SIGKILL");
    }
}
