//! Per-phase log files.
//!
//! Each phase of a run logs into its own file while a guard returned by
//! [`LogSinks::enter`] is alive. Dropping the guard restores whatever
//! subscriber was active before.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use tracing::Level;
use tracing::subscriber::DefaultGuard;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Registration,
    Reconstruction,
    Evaluation,
}

impl Phase {
    pub fn file_name(&self) -> &'static str {
        match self {
            Phase::Registration => "log-registration.txt",
            Phase::Reconstruction => "log-reconstruction.txt",
            Phase::Evaluation => "log-evaluation.txt",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Registration => "registration",
            Phase::Reconstruction => "reconstruction",
            Phase::Evaluation => "evaluation",
        };
        f.write_str(name)
    }
}

/// Open log files, or nothing when logging to files is disabled.
pub struct LogSinks {
    files: Option<[File; 3]>,
}

impl LogSinks {
    /// Creates `{prefix}log-*.txt` in `dir`, truncating previous runs.
    pub fn open(dir: &Path, prefix: &str) -> Result<Self> {
        let open = |phase: Phase| File::create(dir.join(format!("{prefix}{}", phase.file_name())));
        Ok(Self {
            files: Some([
                open(Phase::Registration)?,
                open(Phase::Reconstruction)?,
                open(Phase::Evaluation)?,
            ]),
        })
    }

    pub fn disabled() -> Self {
        Self { files: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.files.is_some()
    }

    /// Routes events of the current thread into the phase file until the
    /// guard is dropped. `None` when disabled or the file cannot be shared.
    pub fn enter(&self, phase: Phase) -> Option<DefaultGuard> {
        let file = self.files.as_ref()?[phase.index()].try_clone().ok()?;
        let subscriber = tracing_subscriber::fmt()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(false)
            .with_max_level(Level::DEBUG)
            .finish();
        Some(tracing::subscriber::set_default(subscriber))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::info;

    #[test]
    fn events_land_in_the_phase_file() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = LogSinks::open(dir.path(), "run-").unwrap();
        {
            let _guard = sinks.enter(Phase::Evaluation);
            info!("evaluation record");
        }
        {
            let _guard = sinks.enter(Phase::Registration);
            info!("registration record");
        }
        let evaluation = std::fs::read_to_string(dir.path().join("run-log-evaluation.txt")).unwrap();
        let registration = std::fs::read_to_string(dir.path().join("run-log-registration.txt")).unwrap();
        assert!(evaluation.contains("evaluation record"));
        assert!(!evaluation.contains("registration record"));
        assert!(registration.contains("registration record"));
    }

    #[test]
    fn disabled_sinks_hand_out_no_guard() {
        let sinks = LogSinks::disabled();
        assert!(!sinks.is_enabled());
        assert!(sinks.enter(Phase::Reconstruction).is_none());
    }
}
