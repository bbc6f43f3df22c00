//! Pulse train state machine shared by the software-timed pulsers
//!
//! The machine never touches hardware. `plan` works out what the next
//! level change would be, the driver writes that level, and only a
//! successful write is `apply`'d. A failed write therefore leaves the
//! train exactly where it was.

use serde::{Deserialize, Serialize};

use crate::clock::{seconds, Timestamp};
use crate::types::{Level, PulseCount};

/// One level change the driver should perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Scheduled time of this transition
    pub at: Timestamp,
    pub level: Level,
    pub busy_after: bool,
    pub pulses_left: u64,
    /// Next scheduled flip, `None` once the train has finished
    pub next_transition: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseTrain {
    busy: bool,
    output: Level,
    next_transition: Timestamp,
    pulses_left: u64,
    count_forever: bool,
    allow_time_skew: bool,
}

impl PulseTrain {
    pub fn new(now: Timestamp, allow_time_skew: bool) -> Self {
        Self {
            busy: false,
            output: Level::Low,
            next_transition: now,
            pulses_left: 0,
            count_forever: false,
            allow_time_skew,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn output(&self) -> Level {
        self.output
    }

    pub fn next_transition(&self) -> Timestamp {
        self.next_transition
    }

    pub fn pulses_left(&self) -> u64 {
        self.pulses_left
    }

    pub fn count_forever(&self) -> bool {
        self.count_forever
    }

    pub fn allow_time_skew(&self) -> bool {
        self.allow_time_skew
    }

    /// Start a new train with the output low and a high edge due now
    pub fn arm(&mut self, now: Timestamp, count: PulseCount) {
        self.busy = true;
        self.output = Level::Low;
        self.next_transition = now;
        match count {
            PulseCount::Finite(n) => {
                self.pulses_left = n;
                self.count_forever = false;
            }
            PulseCount::Forever => {
                self.pulses_left = 0;
                self.count_forever = true;
            }
        }
    }

    /// Return to idle with the output low. Calling it again changes nothing.
    pub fn reset(&mut self, now: Timestamp) {
        self.busy = false;
        self.output = Level::Low;
        self.next_transition = now;
        self.pulses_left = 0;
        self.count_forever = false;
    }

    /// Work out the transition due at `now`, if any
    ///
    /// # Arguments
    /// * `now` - Current clock reading
    /// * `pulse_width` - High time in seconds
    /// * `pulse_period` - Full cycle time in seconds
    pub fn plan(
        &self,
        now: Timestamp,
        pulse_width: f64,
        pulse_period: f64,
    ) -> Option<Transition> {
        if !self.busy || now < self.next_transition {
            return None;
        }

        let (level, busy_after, pulses_left, delay) = match self.output {
            Level::High => {
                let finished = self.pulses_left == 0 && !self.count_forever;
                (
                    Level::Low,
                    !finished,
                    self.pulses_left,
                    seconds(pulse_period - pulse_width),
                )
            }
            Level::Low => (
                Level::High,
                true,
                self.pulses_left.saturating_sub(1),
                seconds(pulse_width),
            ),
        };

        let next_transition = busy_after.then(|| {
            let base = if self.allow_time_skew {
                now
            } else {
                self.next_transition
            };
            base.saturating_add(delay)
        });

        Some(Transition {
            at: self.next_transition,
            level,
            busy_after,
            pulses_left,
            next_transition,
        })
    }

    /// Commit a planned transition after its level has been written
    pub fn apply(&mut self, transition: &Transition) {
        self.output = transition.level;
        self.pulses_left = transition.pulses_left;
        self.busy = transition.busy_after;
        match transition.next_transition {
            Some(next) => self.next_transition = next,
            None => self.count_forever = false,
        }
    }
}
