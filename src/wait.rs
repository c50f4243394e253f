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

use std::time::Duration;

use crate::error::{Error, Result};
use crate::recorder::Recorder;
use crate::time::nanos_to_dur;

/// Waiter returns how long the client waits for the final replies after the
/// last send.
pub trait Waiter: Send {
    fn wait(&self, rec: &Recorder) -> Duration;

    /// The configuration string this waiter was built from.
    fn spec(&self) -> String;
}

/// Waits for a fixed duration.
pub struct WaitDuration(pub Duration);

impl Waiter for WaitDuration {
    fn wait(&self, _rec: &Recorder) -> Duration {
        self.0
    }

    fn spec(&self) -> String {
        format_duration(self.0)
    }
}

/// Waits for a factor of the maximum RTT, falling back to a fixed duration
/// when no replies arrived.
pub struct WaitMaxRTT {
    pub fallback: Duration,
    pub factor: u32,
}

impl Waiter for WaitMaxRTT {
    fn wait(&self, rec: &Recorder) -> Duration {
        let d = rec.read();
        if d.rtt_stats.n == 0 {
            return self.fallback;
        }
        nanos_to_dur(self.factor as i64 * d.rtt_stats.max)
    }

    fn spec(&self) -> String {
        format!("{}x{}", self.factor, format_duration(self.fallback))
    }
}

/// Waits for a factor of the mean RTT, falling back to a fixed duration
/// when no replies arrived.
pub struct WaitMeanRTT {
    pub fallback: Duration,
    pub factor: u32,
}

impl Waiter for WaitMeanRTT {
    fn wait(&self, rec: &Recorder) -> Duration {
        let d = rec.read();
        if d.rtt_stats.n == 0 {
            return self.fallback;
        }
        nanos_to_dur(self.factor as i64 * d.rtt_stats.mean())
    }

    fn spec(&self) -> String {
        format!("{}r{}", self.factor, format_duration(self.fallback))
    }
}

/// Returns a Waiter for a configuration string: "#xduration" (factor of max
/// RTT), "#rduration" (factor of mean RTT), or a plain duration.
pub fn parse_waiter(s: &str) -> Result<Box<dyn Waiter>> {
    if let Some(i) = s.find('x') {
        let (factor, fallback) = parse_wait(&s[..i], &s[i + 1..])
            .ok_or_else(|| Error::InvalidWaitString(s.to_string()))?;
        return Ok(Box::new(WaitMaxRTT { fallback, factor }));
    }
    if let Some(i) = s.find('r') {
        let (factor, fallback) = parse_wait(&s[..i], &s[i + 1..])
            .ok_or_else(|| Error::InvalidWaitString(s.to_string()))?;
        return Ok(Box::new(WaitMeanRTT { fallback, factor }));
    }
    if let Some(d) = parse_duration(s) {
        return Ok(Box::new(WaitDuration(d)));
    }
    Err(Error::NoSuchWaiter(s.to_string()))
}

fn parse_wait(fstr: &str, dstr: &str) -> Option<(u32, Duration)> {
    let factor = fstr.parse::<u32>().ok()?;
    let dur = parse_duration(dstr)?;
    Some((factor, dur))
}

/// Parses durations of the form "4s", "300ms", "1.5m", "100us", "50ns",
/// "1h".
fn parse_duration(s: &str) -> Option<Duration> {
    let split = s.find(|c: char| c.is_alphabetic() || c == 'µ')?;
    let (num, unit) = s.split_at(split);
    let num = num.parse::<f64>().ok()?;
    if !num.is_finite() || num < 0.0 {
        return None;
    }
    let secs = match unit {
        "ns" => num / 1e9,
        "us" | "µs" => num / 1e6,
        "ms" => num / 1e3,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs))
}

fn format_duration(d: Duration) -> String {
    let ns = d.as_nanos();
    if ns % 1_000_000_000 == 0 {
        format!("{}s", ns / 1_000_000_000)
    } else if ns % 1_000_000 == 0 {
        format!("{}ms", ns / 1_000_000)
    } else if ns % 1_000 == 0 {
        format!("{}us", ns / 1_000)
    } else {
        format!("{}ns", ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::Recorder;

    #[test]
    fn fixed_wait_ignores_the_recorder() {
        let rec = Recorder::new(4);
        let w = parse_waiter("750ms").unwrap();
        assert_eq!(w.wait(&rec), Duration::from_millis(750));
    }

    #[test]
    fn max_rtt_wait_falls_back_without_replies() {
        let rec = Recorder::new(4);
        let w = parse_waiter("3x4s").unwrap();
        assert_eq!(w.wait(&rec), Duration::from_secs(4));
    }

    #[test]
    fn max_rtt_wait_uses_recorded_max() {
        let rec = Recorder::new(4);
        rec.push_rtt_for_test(2_000_000);
        rec.push_rtt_for_test(5_000_000);
        let w = parse_waiter("3x4s").unwrap();
        assert_eq!(w.wait(&rec), Duration::from_millis(15));
    }

    #[test]
    fn mean_rtt_wait_uses_recorded_mean() {
        let rec = Recorder::new(4);
        rec.push_rtt_for_test(2_000_000);
        rec.push_rtt_for_test(4_000_000);
        let w = parse_waiter("2r1s").unwrap();
        assert_eq!(w.wait(&rec), Duration::from_millis(6));
    }

    #[test]
    fn parse_waiter_specs() {
        assert_eq!(parse_waiter("3x4s").unwrap().spec(), "3x4s");
        assert_eq!(parse_waiter("2r500ms").unwrap().spec(), "2r500ms");
        assert_eq!(parse_waiter("1s").unwrap().spec(), "1s");
        assert!(matches!(parse_waiter("x4s"), Err(Error::InvalidWaitString(_))));
        assert!(matches!(parse_waiter("forever"), Err(_)));
    }

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10us"), Some(Duration::from_micros(10)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("5"), None);
        assert_eq!(parse_duration("s"), None);
    }
}
