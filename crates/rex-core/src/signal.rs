//! Signal identifiers that can be delivered to a remote process.
//!
//! The set matches the signal names defined for SSH channel requests
//! (RFC 4254 §6.10). Each identifier also maps onto the local OS signal of
//! the same name so a local handler can be driven by either source.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RexError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Abrt,
    Alrm,
    Fpe,
    Hup,
    Ill,
    Int,
    Kill,
    Pipe,
    Quit,
    Segv,
    Term,
    Usr1,
    Usr2,
}

impl Signal {
    pub const ALL: [Signal; 13] = [
        Signal::Abrt,
        Signal::Alrm,
        Signal::Fpe,
        Signal::Hup,
        Signal::Ill,
        Signal::Int,
        Signal::Kill,
        Signal::Pipe,
        Signal::Quit,
        Signal::Segv,
        Signal::Term,
        Signal::Usr1,
        Signal::Usr2,
    ];

    /// The name used on the wire, without the `SIG` prefix.
    pub fn name(self) -> &'static str {
        match self {
            Signal::Abrt => "ABRT",
            Signal::Alrm => "ALRM",
            Signal::Fpe => "FPE",
            Signal::Hup => "HUP",
            Signal::Ill => "ILL",
            Signal::Int => "INT",
            Signal::Kill => "KILL",
            Signal::Pipe => "PIPE",
            Signal::Quit => "QUIT",
            Signal::Segv => "SEGV",
            Signal::Term => "TERM",
            Signal::Usr1 => "USR1",
            Signal::Usr2 => "USR2",
        }
    }

    /// The raw OS signal number.
    #[cfg(unix)]
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Abrt => libc::SIGABRT,
            Signal::Alrm => libc::SIGALRM,
            Signal::Fpe => libc::SIGFPE,
            Signal::Hup => libc::SIGHUP,
            Signal::Ill => libc::SIGILL,
            Signal::Int => libc::SIGINT,
            Signal::Kill => libc::SIGKILL,
            Signal::Pipe => libc::SIGPIPE,
            Signal::Quit => libc::SIGQUIT,
            Signal::Segv => libc::SIGSEGV,
            Signal::Term => libc::SIGTERM,
            Signal::Usr1 => libc::SIGUSR1,
            Signal::Usr2 => libc::SIGUSR2,
        }
    }

    /// Whether a process may install a handler for this signal.
    ///
    /// `KILL` can never be caught; `FPE`, `ILL` and `SEGV` are synchronous
    /// faults that must not be intercepted by an async runtime.
    pub fn is_catchable(self) -> bool {
        !matches!(
            self,
            Signal::Kill | Signal::Fpe | Signal::Ill | Signal::Segv
        )
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

impl FromStr for Signal {
    type Err = RexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        Signal::ALL
            .into_iter()
            .find(|sig| sig.name() == bare)
            .ok_or_else(|| RexError::Config(format!("unknown signal: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        assert_eq!(Signal::Usr1.to_string(), "SIGUSR1");
        assert_eq!("SIGHUP".parse::<Signal>().unwrap(), Signal::Hup);
        assert_eq!("term".parse::<Signal>().unwrap(), Signal::Term);
        assert!("SIGWINCH".parse::<Signal>().is_err());
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<&str> = Signal::ALL.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Signal::ALL.len());
    }

    #[test]
    fn kill_is_not_catchable() {
        assert!(!Signal::Kill.is_catchable());
        assert!(Signal::Hup.is_catchable());
    }

    #[cfg(unix)]
    #[test]
    fn raw_numbers() {
        assert_eq!(Signal::Int.as_raw(), libc::SIGINT);
        assert_eq!(Signal::Term.as_raw(), libc::SIGTERM);
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&Signal::Quit).unwrap();
        assert_eq!(json, "\"QUIT\"");
    }
}
