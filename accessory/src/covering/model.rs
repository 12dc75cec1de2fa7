//! Covering motion model
//!
//! The motor is never queried. Position while moving is derived from the run
//! start and the calibrated per-percent durations; only settled positions are
//! stored. The clock is passed in so the model stays deterministic.

use crate::Calibration;
use std::time::Duration;
use tokio::time::Instant;

/// Position state as reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    MovingDown,
    MovingUp,
    Stopped,
}

impl PositionState {
    /// Convert to the host characteristic value
    pub fn to_u8(&self) -> u8 {
        match self {
            PositionState::MovingDown => 0,
            PositionState::MovingUp => 1,
            PositionState::Stopped => 2,
        }
    }

    pub fn is_moving(&self) -> bool {
        !matches!(self, PositionState::Stopped)
    }

    fn reversed(self) -> Self {
        match self {
            PositionState::MovingDown => PositionState::MovingUp,
            PositionState::MovingUp => PositionState::MovingDown,
            PositionState::Stopped => PositionState::Stopped,
        }
    }

    /// Relay pair (up, down) that produces this state
    pub fn relays(&self) -> (bool, bool) {
        match self {
            PositionState::MovingDown => (false, true),
            PositionState::MovingUp => (true, false),
            PositionState::Stopped => (false, false),
        }
    }
}

/// Motion read off the relay pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    Stopped,
    MovingDown,
    MovingUp,
    /// Both relays on
    Error,
}

/// Decode a relay pair: `2 * up + down`
pub fn blind_state(up: bool, down: bool) -> ObservedState {
    match 2 * u8::from(up) + u8::from(down) {
        0 => ObservedState::Stopped,
        1 => ObservedState::MovingDown,
        2 => ObservedState::MovingUp,
        _ => ObservedState::Error,
    }
}

/// Outcome of a new target position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do
    Unchanged,
    /// Current run extended or shortened; relays stay as they are
    Retargeted,
    /// New run from a standstill
    Started(PositionState),
    /// Direction flipped mid-run
    Reversed(PositionState),
}

/// Outcome of an observed relay change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    None,
    /// Both relays on; stopped at the estimate, relays must be switched off
    Fault,
    /// Relays switched off outside our control; stopped at the estimate
    ExternalStop,
    /// Motor started outside our control; drive to this extreme
    Drive(u8),
}

/// Point-in-time view of a covering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoveringSnapshot {
    pub current_position: u8,
    pub last_position: u8,
    pub target_position: u8,
    pub state: PositionState,
}

/// Motion state of one covering
#[derive(Debug, Clone)]
pub struct Covering {
    calibration: Calibration,
    last_position: u8,
    target_position: u8,
    state: PositionState,
    start: Instant,
    target_at: Instant,
    generation: u64,
}

fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

fn from_millis(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_nanos((ms * 1_000_000.0).round() as u64)
    } else {
        Duration::ZERO
    }
}

impl Covering {
    /// Create a stopped covering at a settled position
    pub fn new(calibration: Calibration, position: u8, now: Instant) -> Self {
        let position = position.min(100);
        Self {
            calibration,
            last_position: position,
            target_position: position,
            state: PositionState::Stopped,
            start: now,
            target_at: now,
            generation: 0,
        }
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn last_position(&self) -> u8 {
        self.last_position
    }

    pub fn target_position(&self) -> u8 {
        self.target_position
    }

    pub fn state(&self) -> PositionState {
        self.state
    }

    /// When the current run reaches its target
    pub fn target_at(&self) -> Instant {
        self.target_at
    }

    /// Bumped on every new run and every stop
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self, now: Instant) -> CoveringSnapshot {
        CoveringSnapshot {
            current_position: self.actual_position(now),
            last_position: self.last_position,
            target_position: self.target_position,
            state: self.state,
        }
    }

    fn percent_duration(&self, direction: PositionState) -> f64 {
        match direction {
            PositionState::MovingUp => self.calibration.percent_duration_up(),
            _ => self.calibration.percent_duration_down(),
        }
    }

    /// Signed run time in ms from `from` to `to` while moving in `direction`
    ///
    /// Includes the bottom margin (leaving 0 upwards, arriving at 0
    /// downwards) and the overdrive at either extreme.
    fn run_millis(&self, direction: PositionState, from: u8, to: u8) -> f64 {
        let distance = match direction {
            PositionState::MovingUp => f64::from(to) - f64::from(from),
            _ => f64::from(from) - f64::from(to),
        };
        let margin = match direction {
            PositionState::MovingUp if from == 0 => self.calibration.duration_bmu_ms,
            PositionState::MovingDown if to == 0 => self.calibration.duration_bmd_ms,
            _ => 0,
        };
        let overdrive = if to == 0 || to == 100 {
            self.calibration.full_overdrive_ms
        } else {
            0
        };
        distance * self.percent_duration(direction) + margin as f64 + overdrive as f64
    }

    /// Run time between two positions, direction taken from their order
    pub fn travel_time(&self, from: u8, to: u8) -> Duration {
        if from == to {
            return Duration::ZERO;
        }
        let direction = if to > from {
            PositionState::MovingUp
        } else {
            PositionState::MovingDown
        };
        from_millis(self.run_millis(direction, from, to))
    }

    /// Estimated position at `now`, rounded and kept within the current run
    pub fn actual_position(&self, now: Instant) -> u8 {
        let elapsed = millis(now.saturating_duration_since(self.start));
        let last = f64::from(self.last_position);
        let target = f64::from(self.target_position);

        let position = match self.state {
            PositionState::Stopped => return self.last_position,
            PositionState::MovingUp => {
                (last + elapsed / self.calibration.percent_duration_up()).min(target.max(last))
            }
            PositionState::MovingDown => {
                (last - elapsed / self.calibration.percent_duration_down()).max(target.min(last))
            }
        };

        if position.is_nan() {
            return self.last_position;
        }
        position.round().clamp(0.0, 100.0) as u8
    }

    fn begin_run(&mut self, direction: PositionState, target: u8, now: Instant) {
        let run = from_millis(self.run_millis(direction, self.last_position, target));
        self.state = direction;
        self.target_position = target;
        self.start = now;
        self.target_at = now + run;
        self.generation += 1;
    }

    /// Drive towards a new target
    pub fn set_target_position(&mut self, position: u8, now: Instant) -> Transition {
        let position = position.min(100);

        let direction = match self.state {
            PositionState::Stopped => {
                if position == self.last_position {
                    return Transition::Unchanged;
                }
                let direction = if position > self.last_position {
                    PositionState::MovingUp
                } else {
                    PositionState::MovingDown
                };
                self.begin_run(direction, position, now);
                return Transition::Started(direction);
            }
            direction => direction,
        };

        if position == self.target_position {
            return Transition::Unchanged;
        }

        let diff_time = self.run_millis(direction, self.last_position, position)
            - self.run_millis(direction, self.last_position, self.target_position);
        let remaining = millis(self.target_at.saturating_duration_since(now));

        if remaining + diff_time >= 0.0 {
            self.target_at = if diff_time >= 0.0 {
                self.target_at + from_millis(diff_time)
            } else {
                self.target_at
                    .checked_sub(from_millis(-diff_time))
                    .unwrap_or(now)
                    .max(now)
            };
            self.target_position = position;
            return Transition::Retargeted;
        }

        // Already past the new target in this direction. The new run is timed
        // from the estimate at the reversed direction's rate and margins.
        self.last_position = self.actual_position(now);
        let reversed = direction.reversed();
        self.begin_run(reversed, position, now);
        Transition::Reversed(reversed)
    }

    /// Whether the current run has reached its target time
    pub fn is_due(&self, now: Instant) -> bool {
        self.state.is_moving() && now >= self.target_at
    }

    /// Settle at the current target
    pub fn settle(&mut self) {
        self.state = PositionState::Stopped;
        self.last_position = self.target_position;
        self.generation += 1;
    }

    /// Stop where the covering is estimated to be; returns that position
    pub fn stop_at(&mut self, now: Instant) -> u8 {
        let position = self.actual_position(now);
        self.hold_at(position);
        position
    }

    /// Stop at a known position, ending any run
    pub fn hold_at(&mut self, position: u8) {
        let position = position.min(100);
        self.state = PositionState::Stopped;
        self.last_position = position;
        self.target_position = position;
        self.generation += 1;
    }

    /// Fold an observed relay state into the tracked motion
    pub fn reconcile(&mut self, observed: ObservedState, now: Instant) -> Reaction {
        match (observed, self.state) {
            (ObservedState::Error, _) => {
                self.stop_at(now);
                Reaction::Fault
            }
            (ObservedState::Stopped, PositionState::Stopped) => Reaction::None,
            (ObservedState::Stopped, _) => {
                self.stop_at(now);
                Reaction::ExternalStop
            }
            (ObservedState::MovingUp, PositionState::MovingUp) => Reaction::None,
            (ObservedState::MovingDown, PositionState::MovingDown) => Reaction::None,
            (ObservedState::MovingUp, _) => Reaction::Drive(100),
            (ObservedState::MovingDown, _) => Reaction::Drive(0),
        }
    }
}
