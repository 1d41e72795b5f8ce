//! The closed error taxonomy shared by every component.
//!
//! Components never abort the process directly. They report an
//! [`AutopinError`] through the owning [`crate::watchdog::Watchdog`], which
//! decides — via [`AutopinErrorKind::is_fatal_by_default`] and the
//! [`classify`] override table — whether to tear the watchdog down or just
//! log a warning and carry on.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutopinErrorKind {
    FileNotFound,
    BadConfig,
    Process,
    System,
    ProcTrace,
    Comm,
    Monitor,
    Strategy,
    History,
    Unsupported,
    Unknown,
}

impl AutopinErrorKind {
    /// Baseline fatality when `(kind, opt)` has no entry in the override table.
    fn is_fatal_by_default(self) -> bool {
        matches!(self, AutopinErrorKind::Unknown)
    }
}

impl fmt::Display for AutopinErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AutopinErrorKind::FileNotFound => "FileNotFound",
            AutopinErrorKind::BadConfig => "BadConfig",
            AutopinErrorKind::Process => "Process",
            AutopinErrorKind::System => "System",
            AutopinErrorKind::ProcTrace => "ProcTrace",
            AutopinErrorKind::Comm => "Comm",
            AutopinErrorKind::Monitor => "Monitor",
            AutopinErrorKind::Strategy => "Strategy",
            AutopinErrorKind::History => "History",
            AutopinErrorKind::Unsupported => "Unsupported",
            AutopinErrorKind::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Exceptions to each kind's baseline fatality (§7).
///
/// `(kind, opt) -> fatal`. `opt` is the specific subcase token, e.g.
/// `"not_found"` paired with `Process` yields `Process/not_found`.
const OVERRIDES: &[(AutopinErrorKind, &str, bool)] = &[
    (AutopinErrorKind::Process, "not_found", true),
    (AutopinErrorKind::Comm, "connect", true),
    (AutopinErrorKind::ProcTrace, "observed_process", true),
    (AutopinErrorKind::ProcTrace, "cannot_trace", false),
    (AutopinErrorKind::System, "get_threads", false),
    (AutopinErrorKind::Monitor, "reset", false),
];

fn classify(kind: AutopinErrorKind, opt: &str) -> bool {
    OVERRIDES
        .iter()
        .find(|(k, o, _)| *k == kind && *o == opt)
        .map(|(_, _, fatal)| *fatal)
        .unwrap_or_else(|| kind.is_fatal_by_default())
}

#[derive(Debug, Clone)]
pub struct AutopinError {
    pub kind: AutopinErrorKind,
    pub opt: &'static str,
    pub message: String,
    pub fatal: bool,
}

impl AutopinError {
    pub fn new(kind: AutopinErrorKind, opt: &'static str, message: impl Into<String>) -> Self {
        let fatal = classify(kind, opt);
        Self {
            kind,
            opt,
            message: message.into(),
            fatal,
        }
    }

    pub fn tag(&self) -> String {
        format!("{}/{}", self.kind, self.opt)
    }
}

impl fmt::Display for AutopinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tag(), self.message)
    }
}

impl std::error::Error for AutopinError {}

/// Convenience constructors, one per taxonomy member, kept next to the
/// enum that names them.
macro_rules! ctor {
    ($name:ident, $kind:expr) => {
        pub fn $name(opt: &'static str, message: impl Into<String>) -> AutopinError {
            AutopinError::new($kind, opt, message)
        }
    };
}

pub mod errors {
    use super::{AutopinError, AutopinErrorKind};

    ctor!(file_not_found, AutopinErrorKind::FileNotFound);
    ctor!(bad_config, AutopinErrorKind::BadConfig);
    ctor!(process, AutopinErrorKind::Process);
    ctor!(system, AutopinErrorKind::System);
    ctor!(proc_trace, AutopinErrorKind::ProcTrace);
    ctor!(comm, AutopinErrorKind::Comm);
    ctor!(monitor, AutopinErrorKind::Monitor);
    ctor!(strategy, AutopinErrorKind::Strategy);
    ctor!(history, AutopinErrorKind::History);
    ctor!(unsupported, AutopinErrorKind::Unsupported);
    ctor!(unknown, AutopinErrorKind::Unknown);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_overrides_match_spec_examples() {
        assert!(errors::process("not_found", "no such pid").fatal);
        assert!(errors::comm("connect", "bind failed").fatal);
        assert!(errors::proc_trace("observed_process", "cannot attach to root").fatal);
        assert!(!errors::proc_trace("cannot_trace", "skipping task 42").fatal);
        assert!(!errors::system("get_threads", "proc vanished").fatal);
        assert!(!errors::monitor("reset", "counter busy").fatal);
    }

    #[test]
    fn unknown_is_always_fatal() {
        assert!(errors::unknown("anything", "x").fatal);
    }

    #[test]
    fn unlisted_pair_falls_back_to_kind_baseline() {
        // Strategy has no override entry, so baseline (non-fatal) applies.
        assert!(!errors::strategy("compute_pinning", "bug").fatal);
    }
}
