//! Race bookkeeping for one AND-group

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::ringback::RingbackStats;
use crate::types::CauseCode;

/// How a race ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceOutcome {
    /// Index of the winning leg in launch order.
    Winner(usize),
    Timeout,
    Cancelled,
    /// Every leg hung up, or the group was aborted by a reject policy or a
    /// required leg.
    AllRejected,
}

impl RaceOutcome {
    pub fn winner(self) -> Option<usize> {
        match self {
            RaceOutcome::Winner(idx) => Some(idx),
            _ => None,
        }
    }
}

impl fmt::Display for RaceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceOutcome::Winner(idx) => write!(f, "winner({})", idx),
            RaceOutcome::Timeout => write!(f, "timeout"),
            RaceOutcome::Cancelled => write!(f, "cancelled"),
            RaceOutcome::AllRejected => write!(f, "all-rejected"),
        }
    }
}

/// Mutable race state, owned by the coordinator.
#[derive(Debug)]
pub struct RaceState {
    pub started: Instant,
    pub hangups: usize,
    /// First ring seen on any live leg. Sticky.
    pub ring_seen: bool,
    /// First early media seen on any live leg. Sticky.
    pub progress_seen: bool,
    outcome: Option<RaceOutcome>,
    force_reason: Option<CauseCode>,
}

impl RaceState {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            hangups: 0,
            ring_seen: false,
            progress_seen: false,
            outcome: None,
            force_reason: None,
        }
    }

    /// Record the outcome. The first settled outcome sticks.
    pub fn settle(&mut self, outcome: RaceOutcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    /// Force the cause every loser and the caller will see.
    pub fn force(&mut self, cause: CauseCode) {
        if self.force_reason.is_none() {
            self.force_reason = Some(cause);
        }
    }

    pub fn outcome(&self) -> Option<RaceOutcome> {
        self.outcome
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn force_reason(&self) -> Option<CauseCode> {
        self.force_reason
    }

    /// Any sign of life from the far ends.
    pub fn has_progress(&self) -> bool {
        self.ring_seen || self.progress_seen
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Result handed from the coordinator to the outcome resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceReport {
    pub outcome: RaceOutcome,
    pub force_reason: Option<CauseCode>,
    pub ring_seen: bool,
    pub progress_seen: bool,
    pub elapsed: Duration,
    /// Legs handed to a confirmation collector.
    pub confirmations: usize,
    pub ringback: RingbackStats,
}
