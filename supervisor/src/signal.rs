//! Stop-signal resolution and platform delivery.
//!
//! The supervisor only talks to [`deliver`]; each target platform provides
//! its own variant. Platforms without signals report
//! [`Delivery::Unsupported`] and the caller falls back to killing the run.

use std::fmt;

/// Signals accepted as a configured `stop_signal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopSignal {
    #[default]
    Interrupt,
    Terminate,
    Quit,
    Hangup,
    Kill,
}

impl StopSignal {
    pub fn name(&self) -> &'static str {
        match self {
            StopSignal::Interrupt => "SIGINT",
            StopSignal::Terminate => "SIGTERM",
            StopSignal::Quit => "SIGQUIT",
            StopSignal::Hangup => "SIGHUP",
            StopSignal::Kill => "SIGKILL",
        }
    }

    /// Parse a signal name, with or without the `SIG` prefix.
    pub fn parse(name: &str) -> Option<Self> {
        let normalised = name.trim().to_uppercase();
        let normalised = normalised.strip_prefix("SIG").unwrap_or(&normalised);
        match normalised {
            "INT" => Some(StopSignal::Interrupt),
            "TERM" => Some(StopSignal::Terminate),
            "QUIT" => Some(StopSignal::Quit),
            "HUP" => Some(StopSignal::Hangup),
            "KILL" => Some(StopSignal::Kill),
            _ => None,
        }
    }

    /// Resolve a configured name. Missing or empty names give the default.
    pub fn resolve(configured: Option<&str>) -> Result<Self, UnknownSignal> {
        match configured.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(StopSignal::default()),
            Some(name) => StopSignal::parse(name).ok_or_else(|| UnknownSignal(name.to_string())),
        }
    }
}

/// A configured stop signal outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stop signal: {0}")]
pub struct UnknownSignal(pub String);

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a delivery attempt that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The process was already gone.
    NoSuchProcess,
    /// This platform cannot deliver the signal.
    Unsupported,
}

#[cfg(unix)]
mod platform {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    use super::{Delivery, StopSignal};

    fn to_nix(signal: StopSignal) -> Signal {
        match signal {
            StopSignal::Interrupt => Signal::SIGINT,
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Quit => Signal::SIGQUIT,
            StopSignal::Hangup => Signal::SIGHUP,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }

    pub fn deliver(pid: u32, signal: StopSignal) -> std::io::Result<Delivery> {
        let pid = i32::try_from(pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
        match kill(Pid::from_raw(pid), to_nix(signal)) {
            Ok(()) => Ok(Delivery::Sent),
            Err(Errno::ESRCH) => Ok(Delivery::NoSuchProcess),
            Err(e) => Err(std::io::Error::from(e)),
        }
    }
}

#[cfg(not(unix))]
mod platform {
    use super::{Delivery, StopSignal};

    pub fn deliver(_pid: u32, _signal: StopSignal) -> std::io::Result<Delivery> {
        Ok(Delivery::Unsupported)
    }
}

/// Send `signal` to the process `pid`.
pub fn deliver(pid: u32, signal: StopSignal) -> std::io::Result<Delivery> {
    platform::deliver(pid, signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_missing_defaults_to_sigint() {
        assert_eq!(StopSignal::resolve(None), Ok(StopSignal::Interrupt));
        assert_eq!(StopSignal::resolve(Some("  ")), Ok(StopSignal::Interrupt));
    }

    #[test]
    fn test_resolve_unknown_name() {
        assert_eq!(
            StopSignal::resolve(Some("INVALID")),
            Err(UnknownSignal("INVALID".to_string()))
        );
    }

    #[test]
    fn test_resolve_known_names() {
        let cases = [
            ("SIGINT", StopSignal::Interrupt),
            ("SIGTERM", StopSignal::Terminate),
            ("SIGQUIT", StopSignal::Quit),
            ("SIGKILL", StopSignal::Kill),
            ("SIGHUP", StopSignal::Hangup),
            ("term", StopSignal::Terminate),
        ];
        for (name, expected) in cases {
            assert_eq!(StopSignal::resolve(Some(name)), Ok(expected), "{name}");
        }
    }
}
