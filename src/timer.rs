/*
 * Copyright (C) 2024 The rlat authors
 *
 * This file is part of rlat.
 *
 * rlat is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * rlat is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with rlat.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::average::Averager;
use crate::config::{
    DEFAULT_COMP_TIMER_MAX_ERROR_FACTOR, DEFAULT_COMP_TIMER_MIN_ERROR_FACTOR,
    DEFAULT_HYBRID_TIMER_SLEEP_FACTOR,
};
use crate::error::{Error, Result};
use crate::time::{mono_now, nanos_to_dur};
use crate::utils::cancel::{CancelToken, Cancelled};

/// Timer waits for the next send.
pub trait Timer: Send {
    /// Sleeps for at least d nanoseconds past the monotonic time t and
    /// returns the monotonic time afterwards. Returns Err(Cancelled) when
    /// interrupted by the cancellation token.
    fn sleep(&mut self, cancel: &CancelToken, t: i64, d: i64) -> Result<i64, Cancelled>;

    /// The configuration string this timer was built from.
    fn spec(&self) -> String;
}

/// Sleeps on the cancellation token's condvar, at OS sleep accuracy.
#[derive(Default)]
pub struct SimpleTimer;

impl Timer for SimpleTimer {
    fn sleep(&mut self, cancel: &CancelToken, _t: i64, d: i64) -> Result<i64, Cancelled> {
        cancel.wait_timeout(nanos_to_dur(d))?;
        Ok(mono_now())
    }

    fn spec(&self) -> String {
        "simple".to_string()
    }
}

/// Measures the timer error of each sleep and applies a running
/// multiplicative correction to the requested duration. Error factors
/// outside [min_error_factor, max_error_factor] are rejected as outliers.
pub struct CompTimer {
    pub min_error_factor: f64,
    pub max_error_factor: f64,
    avg: Box<dyn Averager>,
    stimer: SimpleTimer,
}

impl CompTimer {
    pub fn new(avg: Box<dyn Averager>) -> CompTimer {
        CompTimer {
            min_error_factor: DEFAULT_COMP_TIMER_MIN_ERROR_FACTOR,
            max_error_factor: DEFAULT_COMP_TIMER_MAX_ERROR_FACTOR,
            avg,
            stimer: SimpleTimer,
        }
    }
}

impl Timer for CompTimer {
    fn sleep(&mut self, cancel: &CancelToken, t: i64, d: i64) -> Result<i64, Cancelled> {
        let comp = self.avg.average();
        let mut dc = d;
        if comp != 0.0 {
            dc = (d as f64 / comp) as i64;
        }

        let t2 = self.stimer.sleep(cancel, t, dc)?;
        if dc > 0 {
            let erf = (t2 - t) as f64 / dc as f64;
            if erf >= self.min_error_factor && erf <= self.max_error_factor {
                self.avg.push(erf);
            }
        }
        Ok(t2)
    }

    fn spec(&self) -> String {
        "comp".to_string()
    }
}

/// Spins until the deadline. High precision, high CPU.
#[derive(Default)]
pub struct BusyTimer;

impl Timer for BusyTimer {
    fn sleep(&mut self, cancel: &CancelToken, t: i64, d: i64) -> Result<i64, Cancelled> {
        let end = t + d;
        let mut now = mono_now();
        while now < end {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            std::hint::spin_loop();
            now = mono_now();
        }
        Ok(now)
    }

    fn spec(&self) -> String {
        "busy".to_string()
    }
}

/// Compensated sleep to sleep_factor of the duration, then a spin for the
/// remainder. The sleep factor trades CPU for precision: it can be raised
/// for long intervals and must be lowered for short ones.
pub struct HybridTimer {
    ctimer: CompTimer,
    sleep_factor: f64,
}

impl HybridTimer {
    pub fn new(avg: Box<dyn Averager>, sleep_factor: f64) -> HybridTimer {
        HybridTimer { ctimer: CompTimer::new(avg), sleep_factor }
    }
}

impl Timer for HybridTimer {
    fn sleep(&mut self, cancel: &CancelToken, t: i64, d: i64) -> Result<i64, Cancelled> {
        let end = t + d;
        let ds = (d as f64 * self.sleep_factor) as i64;
        let mut t2 = self.ctimer.sleep(cancel, t, ds)?;
        while t2 < end {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            std::hint::spin_loop();
            t2 = mono_now();
        }
        Ok(t2)
    }

    fn spec(&self) -> String {
        format!("hybrid:{}", self.sleep_factor)
    }
}

/// Returns a Timer for a configuration string: "simple", "comp", "busy" or
/// "hybrid[:sleep_factor]". The averager is consumed by the compensating
/// variants.
pub fn parse_timer(s: &str, avg: Box<dyn Averager>) -> Result<Box<dyn Timer>> {
    match s {
        "simple" => Ok(Box::new(SimpleTimer)),
        "comp" => Ok(Box::new(CompTimer::new(avg))),
        "busy" => Ok(Box::new(BusyTimer)),
        _ => {
            if let Some(rest) = s.strip_prefix("hybrid") {
                let factor = match rest.strip_prefix(':') {
                    None if rest.is_empty() => DEFAULT_HYBRID_TIMER_SLEEP_FACTOR,
                    Some(arg) => match arg.parse::<f64>() {
                        Ok(f) if f > 0.0 && f < 1.0 => f,
                        _ => return Err(Error::InvalidSleepFactor(arg.to_string())),
                    },
                    None => return Err(Error::NoSuchTimer(s.to_string())),
                };
                return Ok(Box::new(HybridTimer::new(avg, factor)));
            }
            Err(Error::NoSuchTimer(s.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::average::ExponentialAverager;
    use std::time::Duration;

    fn avg() -> Box<dyn Averager> {
        Box::<ExponentialAverager>::default()
    }

    #[test]
    fn simple_timer_sleeps_at_least_d() {
        let cancel = CancelToken::new();
        let t = mono_now();
        let d = Duration::from_millis(10).as_nanos() as i64;
        let t2 = SimpleTimer.sleep(&cancel, t, d).unwrap();
        assert!(t2 - t >= d);
    }

    #[test]
    fn comp_timer_learns_an_error_factor() {
        let cancel = CancelToken::new();
        let mut timer = CompTimer::new(avg());
        let d = Duration::from_millis(5).as_nanos() as i64;
        for _ in 0..3 {
            let t = mono_now();
            timer.sleep(&cancel, t, d).unwrap();
        }
        // OS sleeps overshoot, so the learned factor is at least 1
        assert!(timer.avg.average() >= 1.0);
    }

    #[test]
    fn busy_timer_hits_the_deadline() {
        let cancel = CancelToken::new();
        let t = mono_now();
        let d = Duration::from_millis(2).as_nanos() as i64;
        let t2 = BusyTimer.sleep(&cancel, t, d).unwrap();
        assert!(t2 >= t + d);
    }

    #[test]
    fn cancelled_token_interrupts_sleep() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let t = mono_now();
        let d = Duration::from_secs(60).as_nanos() as i64;
        assert!(SimpleTimer.sleep(&cancel, t, d).is_err());
        assert!(BusyTimer.sleep(&cancel, t, d).is_err());
        assert!(CompTimer::new(avg()).sleep(&cancel, t, d).is_err());
        assert!(HybridTimer::new(avg(), 0.9).sleep(&cancel, t, d).is_err());
    }

    #[test]
    fn parse_timer_specs() {
        assert_eq!(parse_timer("simple", avg()).unwrap().spec(), "simple");
        assert_eq!(parse_timer("comp", avg()).unwrap().spec(), "comp");
        assert_eq!(parse_timer("busy", avg()).unwrap().spec(), "busy");
        assert_eq!(parse_timer("hybrid:0.8", avg()).unwrap().spec(), "hybrid:0.8");
        assert_eq!(
            parse_timer("hybrid", avg()).unwrap().spec(),
            format!("hybrid:{}", DEFAULT_HYBRID_TIMER_SLEEP_FACTOR)
        );
        assert!(matches!(parse_timer("hybrid:2", avg()), Err(Error::InvalidSleepFactor(_))));
        assert!(matches!(parse_timer("hourglass", avg()), Err(Error::NoSuchTimer(_))));
    }
}
