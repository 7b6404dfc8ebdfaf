//! The Deadline Scheduler: drives the player's tick loop against a
//! monotonic clock with a configurable time scale.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Sleep granularity used once within one tick of the deadline, to avoid
/// tokio timer coalescing from slipping past the target.
const COARSE_SLEEP: Duration = Duration::from_millis(1);

/// Outcome of waiting for a scenario-time deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The deadline was reached on schedule.
    Reached,
    /// The deadline had already passed by the time we got to wait on it.
    Missed,
    /// A restart was signaled (`SIGUSR1`) while waiting.
    Restart,
}

/// Tracks wall-clock origin against scenario time, applying a runtime
/// `scale` factor: `scale` is scenario-seconds elapsed per wall-clock
/// second, so a wall wait of `scenario_seconds / scale` reaches a given
/// scenario deadline (`scale = 1.0` is real time, `scale = 50.0` replays
/// 50x faster than real time). `scale` is a constructor parameter rather
/// than a compile-time constant, turning what was a single dormant
/// scaling branch into an always-available runtime knob (see
/// `DESIGN.md`).
pub struct Scheduler {
    origin: Instant,
    scale: f32,
    restart: Arc<AtomicBool>,
}

impl Scheduler {
    /// Build a scheduler whose origin is "now", `scale` scenario-seconds-
    /// per-wall-second (1.0 for real time).
    pub fn new(scale: f32, restart: Arc<AtomicBool>) -> Self {
        Self {
            origin: Instant::now(),
            scale,
            restart,
        }
    }

    /// Scenario-time seconds elapsed since the scheduler's origin.
    pub fn now_scenario_seconds(&self) -> f32 {
        self.origin.elapsed().as_secs_f32() * self.scale
    }

    /// Reset the origin to now, used on loop/restart.
    pub fn reset(&mut self) {
        self.origin = Instant::now();
    }

    /// Wait until scenario time `target_seconds` is reached, polling the
    /// restart flag at `COARSE_SLEEP` granularity, and reporting whether the
    /// deadline was already missed when the wait began.
    ///
    /// Waits for wall-clock `target_seconds / scale` to elapse since the
    /// origin (not `target_seconds * scale`): `scale` is a replay-speed
    /// multiplier here, not a slowdown divisor.
    pub async fn wait_until(&self, target_seconds: f32) -> WaitOutcome {
        let now = self.now_scenario_seconds();
        if now >= target_seconds {
            return WaitOutcome::Missed;
        }

        loop {
            if self.restart.load(Ordering::Relaxed) {
                return WaitOutcome::Restart;
            }

            let remaining_scenario = target_seconds - self.now_scenario_seconds();
            if remaining_scenario <= 0.0 {
                return WaitOutcome::Reached;
            }

            let remaining_wall = Duration::from_secs_f32((remaining_scenario / self.scale).max(0.0));
            let sleep_for = remaining_wall.min(COARSE_SLEEP).max(Duration::from_micros(1));
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn past_deadline_is_missed_immediately() {
        let scheduler = Scheduler::new(1.0, flag());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(scheduler.wait_until(0.0).await, WaitOutcome::Missed);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn future_deadline_is_reached() {
        let scheduler = Scheduler::new(1.0, flag());
        let outcome = scheduler.wait_until(0.01).await;
        assert_eq!(outcome, WaitOutcome::Reached);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn restart_flag_interrupts_wait() {
        let restart = flag();
        let scheduler = Scheduler::new(1.0, restart.clone());
        restart.store(true, Ordering::Relaxed);
        assert_eq!(scheduler.wait_until(10.0).await, WaitOutcome::Restart);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scale_speeds_up_scenario_time() {
        let scheduler = Scheduler::new(50.0, flag());
        // At 50x scale, ~20ms of real sleep covers 1 scenario-second.
        let outcome = scheduler.wait_until(1.0).await;
        assert_eq!(outcome, WaitOutcome::Reached);
    }
}
