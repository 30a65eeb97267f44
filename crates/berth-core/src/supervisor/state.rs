// ABOUTME: Lifecycle phases of the supervised spawn-server helper.
// ABOUTME: NoHelper -> Starting -> Running -> Stopping -> NoHelper.

use std::fmt;

/// Where the supervisor's helper is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HelperPhase {
    #[default]
    NoHelper,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for HelperPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HelperPhase::NoHelper => "no-helper",
            HelperPhase::Starting => "starting",
            HelperPhase::Running => "running",
            HelperPhase::Stopping => "stopping",
        };
        f.write_str(s)
    }
}
