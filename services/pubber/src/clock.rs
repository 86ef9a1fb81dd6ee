use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use tokio::time::Instant;

/// Offset applied to every device timestamp under the `skew_clock` option.
pub fn clock_skew() -> TimeDelta {
    TimeDelta::minutes(30)
}

/// Device wall clock.
///
/// Wall time is derived from a fixed origin plus tokio's monotonic clock, so
/// paused-time tests see generations and timers advance together.
#[derive(Debug, Clone)]
pub struct DeviceClock {
    origin_wall: DateTime<Utc>,
    origin: Instant,
    skew: TimeDelta,
    start_time: DateTime<Utc>,
}

impl DeviceClock {
    pub fn new(skewed: bool) -> Self {
        Self::starting_at(Utc::now(), skewed)
    }

    pub fn starting_at(wall: DateTime<Utc>, skewed: bool) -> Self {
        let skew = if skewed { clock_skew() } else { TimeDelta::zero() };
        Self {
            origin_wall: wall,
            origin: Instant::now(),
            skew,
            start_time: (wall + skew).trunc_subsecs(0),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.origin.elapsed()).unwrap_or(TimeDelta::zero());
        self.origin_wall + elapsed + self.skew
    }

    /// Device start time, truncated to whole seconds.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Time remaining until `at`; zero once it has passed.
    pub fn until(&self, at: DateTime<Utc>) -> std::time::Duration {
        (at - self.now()).to_std().unwrap_or_default()
    }
}
