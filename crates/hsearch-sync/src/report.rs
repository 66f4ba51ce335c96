//! Telemetry port for failures that must not stop a cycle.

use std::fmt;

use tracing::error;

/// The periodic cycle an event was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cycle {
    Grabber,
    Matcher,
    Garbage,
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Cycle::Grabber => "grabber",
            Cycle::Matcher => "matcher",
            Cycle::Garbage => "garbage",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub cycle: Cycle,
    /// Site name, chat id or listing key the failure concerns.
    pub scope: String,
    pub message: String,
}

/// Sink for failures that must not stop a cycle.
pub trait Reporter: Send + Sync {
    fn capture(&self, event: ErrorEvent);
}

/// Emits every event as an `error` record on the current span.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn capture(&self, event: ErrorEvent) {
        error!(cycle = %event.cycle, scope = %event.scope, "{}", event.message);
    }
}

pub(crate) fn report(
    reporter: &dyn Reporter,
    cycle: Cycle,
    scope: impl Into<String>,
    err: &dyn fmt::Display,
) {
    reporter.capture(ErrorEvent {
        cycle,
        scope: scope.into(),
        message: err.to_string(),
    });
}
