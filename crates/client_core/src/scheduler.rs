use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::debug;

const TICK: Duration = Duration::from_secs(1);

/// Value shown for the next predicted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Countdown {
    /// Whole seconds left, rounded up.
    Remaining(u64),
    AwaitingTransition,
}

impl fmt::Display for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Countdown::Remaining(secs) => write!(f, "next transition in {secs}s"),
            Countdown::AwaitingTransition => f.write_str("awaiting transition"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownTick {
    pub generation: u64,
    pub countdown: Countdown,
}

struct TimerGuard(JoinHandle<()>);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Single repeating countdown timer. Ticks are delivered on the channel
/// given to `new`, tagged with the generation of the `schedule` call that
/// produced them; only ticks matching `generation()` are current.
pub struct TransitionScheduler {
    ticks: mpsc::UnboundedSender<CountdownTick>,
    generation: u64,
    timer: Option<TimerGuard>,
}

impl TransitionScheduler {
    pub fn new(ticks: mpsc::UnboundedSender<CountdownTick>) -> Self {
        Self {
            ticks,
            generation: 0,
            timer: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.timer
            .as_ref()
            .is_some_and(|timer| !timer.0.is_finished())
    }

    pub fn accepts(&self, tick: &CountdownTick) -> bool {
        tick.generation == self.generation
    }

    /// Replaces any running timer and returns the value to publish right
    /// away. A transition time already in the past yields
    /// `AwaitingTransition` without starting a timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&mut self, next_transition_at: DateTime<Utc>) -> Countdown {
        self.cancel();

        let remaining = (next_transition_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let secs = ceil_secs(remaining);
        if secs == 0 {
            debug!(generation = self.generation, "scheduler: transition time already passed");
            return Countdown::AwaitingTransition;
        }

        let generation = self.generation;
        let deadline = Instant::now() + remaining;
        let ticks = self.ticks.clone();
        debug!(generation, remaining_secs = secs, "scheduler: countdown started");
        self.timer = Some(TimerGuard(tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + TICK, TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let secs = ceil_secs(deadline.saturating_duration_since(Instant::now()));
                let countdown = if secs == 0 {
                    Countdown::AwaitingTransition
                } else {
                    Countdown::Remaining(secs)
                };
                if ticks.send(CountdownTick { generation, countdown }).is_err() {
                    break;
                }
                if countdown == Countdown::AwaitingTransition {
                    debug!(generation, "scheduler: countdown finished");
                    break;
                }
            }
        })));

        Countdown::Remaining(secs)
    }

    /// Stops the running timer, if any. Ticks already queued from it stop
    /// being accepted.
    pub fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if self.timer.take().is_some() {
            debug!(generation = self.generation, "scheduler: countdown cancelled");
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[cfg(test)]
#[path = "tests/scheduler_tests.rs"]
mod tests;
