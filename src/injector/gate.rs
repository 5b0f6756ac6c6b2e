/*!
Per-session injection gate.

Cooldown and anti-repetition form a small state machine per session:
`Cooling` from the moment of any injection until `last_injection + cooldown`,
`Eligible` otherwise. The gate is resolved from the stored
[`InjectionMarker`] at the top of every probabilistic evaluation rather than
inferred ad hoc mid-loop, which keeps it testable on its own.

The marker does double duty: while cooling it blocks the whole round, and
once cooled its `mode` is what anti-repetition excludes from the next round.
*/

use chrono::{DateTime, Duration, Utc};

use crate::stores::InjectionMarker;

/// Resolved gate state for one probabilistic decision round.
#[derive(Debug, Clone, PartialEq)]
pub enum InjectionGate {
    /// Injection may proceed; `last_mode` is the mode to exclude for
    /// anti-repetition, when a marker is still live.
    Eligible { last_mode: Option<String> },
    /// Inside the cooldown window; no probabilistic injection until `until`.
    Cooling {
        until: DateTime<Utc>,
        last_mode: String,
    },
}

impl InjectionGate {
    /// Resolves the gate from the session's stored marker.
    ///
    /// No marker means the session has never been injected (or the marker
    /// lapsed), which is fully eligible with nothing to exclude.
    #[must_use]
    pub fn resolve(
        marker: Option<&InjectionMarker>,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        match marker {
            None => Self::Eligible { last_mode: None },
            Some(marker) => {
                let until = marker.at + cooldown;
                if now < until {
                    Self::Cooling {
                        until,
                        last_mode: marker.mode.clone(),
                    }
                } else {
                    Self::Eligible {
                        last_mode: Some(marker.mode.clone()),
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn permits_injection(&self) -> bool {
        matches!(self, Self::Eligible { .. })
    }
}
