//! Simulation clocks driving the scheduler
//!
//! A clock reports time in simulation units. One unit elapses every
//! `step_size` seconds of real time, so a step size of `0.5` runs the clock at
//! double speed. Pausing freezes the reading without losing it.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Clock interface the scheduler and replay controller depend on
pub trait Clock: Send + Sync {
    fn current_time(&self) -> f64;

    fn set_paused(&self, paused: bool);

    /// Changes how many real seconds make up one simulation unit
    fn reset_step_size(&self, step_size: f64);

    /// Rewinds to zero, keeping the step size and the paused state
    fn restart(&self);
}

#[derive(Debug)]
struct Timeline {
    origin: Instant,
    base: f64,
    step_size: f64,
    paused: bool,
}

impl Timeline {
    fn reading(&self) -> f64 {
        if self.paused {
            self.base
        } else {
            self.base + self.origin.elapsed().as_secs_f64() / self.step_size
        }
    }

    /// Folds the elapsed time into `base` so the next change starts from here
    fn rebase(&mut self) {
        self.base = self.reading();
        self.origin = Instant::now();
    }
}

/// Wall-clock backed simulation time
#[derive(Debug)]
pub struct GameTime {
    timeline: Mutex<Timeline>,
}

impl GameTime {
    pub fn new(step_size: f64) -> Self {
        Self {
            timeline: Mutex::new(Timeline {
                origin: Instant::now(),
                base: 0.0,
                step_size,
                paused: false,
            }),
        }
    }

    /// A clock that stays at zero until unpaused
    pub fn paused(step_size: f64) -> Self {
        let clock = Self::new(step_size);
        clock.set_paused(true);
        clock
    }

    fn timeline(&self) -> MutexGuard<'_, Timeline> {
        self.timeline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_paused(&self) -> bool {
        self.timeline().paused
    }

    pub fn step_size(&self) -> f64 {
        self.timeline().step_size
    }
}

impl Clock for GameTime {
    fn current_time(&self) -> f64 {
        self.timeline().reading()
    }

    fn set_paused(&self, paused: bool) {
        let mut timeline = self.timeline();
        if timeline.paused == paused {
            return;
        }
        timeline.rebase();
        timeline.paused = paused;
    }

    fn reset_step_size(&self, step_size: f64) {
        let mut timeline = self.timeline();
        timeline.rebase();
        timeline.step_size = step_size;
    }

    fn restart(&self) {
        let mut timeline = self.timeline();
        timeline.origin = Instant::now();
        timeline.base = 0.0;
    }
}

#[derive(Debug)]
struct ManualState {
    time: f64,
    step_size: f64,
    paused: bool,
}

/// Clock advanced explicitly by the caller.
///
/// Used for headless simulation and deterministic tests, where real time
/// passing between two scheduler passes would make results flaky.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            state: Mutex::new(ManualState {
                time: start,
                step_size: 1.0,
                paused: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManualState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lets `real_seconds` pass; a paused clock ignores it
    pub fn advance(&self, real_seconds: f64) {
        let mut state = self.state();
        if !state.paused {
            state.time += real_seconds / state.step_size;
        }
    }

    /// Jumps straight to `time` regardless of pause and step size
    pub fn set_time(&self, time: f64) {
        self.state().time = time;
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }
}

impl Clock for ManualClock {
    fn current_time(&self) -> f64 {
        self.state().time
    }

    fn set_paused(&self, paused: bool) {
        self.state().paused = paused;
    }

    fn reset_step_size(&self, step_size: f64) {
        self.state().step_size = step_size;
    }

    fn restart(&self) {
        let mut state = self.state();
        state.time = 0.0;
    }
}
