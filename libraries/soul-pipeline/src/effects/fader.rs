//! Time-driven fader
//!
//! A fader maps elapsed time onto a curve and feeds the result into the
//! volume modifier. It does not run on its own: the control context calls
//! [`Fader::value_at`] whenever it pumps the controller, with time read from
//! a [`Clock`].
//!
//! - Forward fades run progress 0 → 1, backward fades 1 → 0
//! - Starting a fade while another runs keeps the volume continuous

use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Time source for faders
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }
}

/// Fade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FaderDirection {
    #[default]
    Forward,
    Backward,
}

/// Fade curve shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FaderCurve {
    #[default]
    Linear,
    /// Slow start
    EaseIn,
    /// Slow end
    EaseOut,
    /// Slow start and end
    EaseInOut,
    /// 0 → 1 → 0 over one period
    Sine,
    /// 0.5 → 1 → 0.5 → 0 → 0.5 over one period
    Cosine,
}

impl FaderCurve {
    /// Curve value for `progress` in 0..=1
    #[inline]
    pub fn value(self, progress: f64) -> f64 {
        let t = progress.clamp(0.0, 1.0);
        match self {
            FaderCurve::Linear => t,
            FaderCurve::EaseIn => 1.0 - (t * FRAC_PI_2).cos(),
            FaderCurve::EaseOut => (t * FRAC_PI_2).sin(),
            FaderCurve::EaseInOut => (1.0 - (PI * t).cos()) * 0.5,
            FaderCurve::Sine => ((t * PI * 2.0 - FRAC_PI_2).sin() + 1.0) * 0.5,
            FaderCurve::Cosine => ((t * PI * 2.0 - FRAC_PI_2).cos() + 1.0) * 0.5,
        }
    }
}

/// An active fade
#[derive(Debug, Clone)]
pub struct Fader {
    duration: Duration,
    direction: FaderDirection,
    curve: FaderCurve,
    started_at: Instant,
    /// Timeline position at `started_at`
    start_time: Duration,
}

impl Fader {
    /// Start a fade at `now`
    ///
    /// When `previous` is still running its timeline position is carried
    /// over: unchanged for an equal duration, scaled otherwise.
    pub fn start(
        duration: Duration,
        direction: FaderDirection,
        curve: FaderCurve,
        previous: Option<&Fader>,
        now: Instant,
    ) -> Self {
        let mut start_time = match direction {
            FaderDirection::Forward => Duration::ZERO,
            FaderDirection::Backward => duration,
        };

        if let Some(previous) = previous.filter(|p| !p.is_finished(now)) {
            let current = previous.current_time(now);
            start_time = if previous.duration == duration {
                current
            } else if previous.duration.is_zero() {
                start_time
            } else {
                duration.mul_f64(current.as_secs_f64() / previous.duration.as_secs_f64())
            };
        }

        Self {
            duration,
            direction,
            curve,
            started_at: now,
            start_time: start_time.min(duration),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn direction(&self) -> FaderDirection {
        self.direction
    }

    pub fn curve(&self) -> FaderCurve {
        self.curve
    }

    /// Timeline position at `now`
    pub fn current_time(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.started_at);
        match self.direction {
            FaderDirection::Forward => (self.start_time + elapsed).min(self.duration),
            FaderDirection::Backward => self.start_time.saturating_sub(elapsed),
        }
    }

    /// Normalized progress at `now`
    pub fn progress(&self, now: Instant) -> f64 {
        if self.duration.is_zero() {
            return match self.direction {
                FaderDirection::Forward => 1.0,
                FaderDirection::Backward => 0.0,
            };
        }
        self.current_time(now).as_secs_f64() / self.duration.as_secs_f64()
    }

    /// Volume modifier at `now`
    pub fn value_at(&self, now: Instant) -> f64 {
        self.curve.value(self.progress(now))
    }

    pub fn is_finished(&self, now: Instant) -> bool {
        let current = self.current_time(now);
        match self.direction {
            FaderDirection::Forward => current >= self.duration,
            FaderDirection::Backward => current.is_zero(),
        }
    }
}
