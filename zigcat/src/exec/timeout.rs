use crate::shared::TimeoutKind;
use std::time::{Duration, Instant};

/// Limits a session may be created with. All three are independent; `None`
/// disables a deadline.
#[derive(Debug, Copy, Clone, Default)]
pub struct TimeoutLimits {
    /// Wall-clock bound from session start.
    pub execution: Option<Duration>,
    /// Bound on the gap between I/O activity.
    pub idle: Option<Duration>,
    /// Bound on the wait for the first byte to flow.
    pub connection: Option<Duration>,
}

/// Tracks the three session deadlines. At most one timeout ever fires; the
/// connection deadline is cancelled by the first byte of traffic, the idle
/// deadline rearms on every byte.
#[derive(Debug)]
pub struct TimeoutTracker {
    limits: TimeoutLimits,
    started: Instant,
    last_activity: Instant,
    data_flowed: bool,
    fired: bool,
}

impl TimeoutTracker {
    pub fn new(limits: TimeoutLimits, now: Instant) -> TimeoutTracker {
        TimeoutTracker {
            limits,
            started: now,
            last_activity: now,
            data_flowed: false,
            fired: false,
        }
    }

    /// Records I/O progress.
    pub fn mark_activity(&mut self, now: Instant) {
        self.last_activity = now;
        self.data_flowed = true;
    }

    pub fn data_flowed(&self) -> bool {
        self.data_flowed
    }

    /// Returns the first deadline that has passed, if any. Execution wins
    /// over idle, idle over connection, when several are due at once. Fires
    /// at most once per tracker.
    pub fn check(&mut self, now: Instant) -> Option<TimeoutKind> {
        if self.fired {
            return None;
        }

        let fired = if self
            .limits
            .execution
            .map_or(false, |limit| now.duration_since(self.started) >= limit)
        {
            Some(TimeoutKind::Execution)
        } else if self
            .limits
            .idle
            .map_or(false, |limit| now.duration_since(self.last_activity) >= limit)
        {
            Some(TimeoutKind::Idle)
        } else if !self.data_flowed
            && self
                .limits
                .connection
                .map_or(false, |limit| now.duration_since(self.started) >= limit)
        {
            Some(TimeoutKind::Connection)
        } else {
            None
        };

        if fired.is_some() {
            self.fired = true;
        }
        fired
    }

    /// Time until the nearest armed deadline, bounding the backend wait so a
    /// silent peer cannot stall timeout delivery.
    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        let mut nearest: Option<Duration> = None;

        let mut consider = |deadline: Instant| {
            let remaining = deadline.checked_duration_since(now).unwrap_or_default();
            nearest = Some(match nearest {
                Some(current) => current.min(remaining),
                None => remaining,
            });
        };

        if let Some(limit) = self.limits.execution {
            consider(self.started + limit);
        }
        if let Some(limit) = self.limits.idle {
            consider(self.last_activity + limit);
        }
        if let Some(limit) = self.limits.connection {
            if !self.data_flowed {
                consider(self.started + limit);
            }
        }

        nearest
    }
}
