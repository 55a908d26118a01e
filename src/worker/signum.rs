//! Signal identifier normalization.
//!
//! Everything that enters the relay core is a [`Signal`]. Names and raw
//! numbers are converted here and rejected if the platform does not know them.

use crate::error::{PreforkError, Result};
use nix::sys::signal::Signal;
use std::str::FromStr;

/// Parse a signal from a name (`QUIT`, `SIGQUIT`, `quit`) or a number (`3`).
pub fn parse_signal(text: &str) -> Result<Signal> {
    let trimmed = text.trim();
    if let Ok(signum) = trimmed.parse::<i32>() {
        return signal_from_raw(signum);
    }

    let upper = trimmed.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };

    Signal::from_str(&name).map_err(|_| PreforkError::InvalidSignal(text.to_string()))
}

/// Validate a raw signal number.
pub fn signal_from_raw(signum: i32) -> Result<Signal> {
    Signal::try_from(signum).map_err(|_| PreforkError::InvalidSignal(signum.to_string()))
}

/// Signals whose disposition cannot be changed and therefore cannot be replayed.
pub fn is_uncatchable(signal: Signal) -> bool {
    matches!(signal, Signal::SIGKILL | Signal::SIGSTOP)
}
