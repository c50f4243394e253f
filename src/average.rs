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

use crate::config::{DEFAULT_AVERAGE_WINDOW, DEFAULT_EXPONENTIAL_AVERAGE_ALPHA};
use crate::error::{Error, Result};

/// Averager returns an average of a series of pushed values. The
/// compensating timer feeds it timer error factors.
pub trait Averager: Send {
    fn push(&mut self, val: f64);

    fn average(&self) -> f64;

    /// The configuration string this averager was built from.
    fn spec(&self) -> String;
}

/// The cumulative moving average; all values count equally.
#[derive(Default)]
pub struct CumulativeAverager {
    sum: f64,
    n: f64,
}

impl Averager for CumulativeAverager {
    fn push(&mut self, val: f64) {
        self.sum += val;
        self.n += 1.0;
    }

    fn average(&self) -> f64 {
        if self.n == 0.0 {
            return 0.0;
        }
        self.sum / self.n
    }

    fn spec(&self) -> String {
        "avg".to_string()
    }
}

/// The exponential moving average. A higher alpha discounts older values
/// faster; the first push seeds the average.
pub struct ExponentialAverager {
    alpha: f64,
    avg: f64,
}

impl ExponentialAverager {
    pub fn new(alpha: f64) -> ExponentialAverager {
        ExponentialAverager { alpha, avg: 0.0 }
    }
}

impl Default for ExponentialAverager {
    fn default() -> ExponentialAverager {
        ExponentialAverager::new(DEFAULT_EXPONENTIAL_AVERAGE_ALPHA)
    }
}

impl Averager for ExponentialAverager {
    fn push(&mut self, val: f64) {
        if self.avg == 0.0 {
            self.avg = val;
            return;
        }
        self.avg = self.alpha * val + (1.0 - self.alpha) * self.avg;
    }

    fn average(&self) -> f64 {
        self.avg
    }

    fn spec(&self) -> String {
        format!("exp:{:.2}", self.alpha)
    }
}

/// The moving average over a fixed window of values.
pub struct WindowAverager {
    window: usize,
    values: Vec<f64>,
    pos: usize,
    filled: bool,
}

impl WindowAverager {
    pub fn new(window: usize) -> WindowAverager {
        assert!(window >= 1, "window must be >= 1");
        WindowAverager { window, values: vec![0.0; window], pos: 0, filled: false }
    }
}

impl Default for WindowAverager {
    fn default() -> WindowAverager {
        WindowAverager::new(DEFAULT_AVERAGE_WINDOW)
    }
}

impl Averager for WindowAverager {
    fn push(&mut self, val: f64) {
        self.values[self.pos] = val;
        self.pos += 1;
        if self.pos == self.window {
            self.pos = 0;
            self.filled = true;
        }
    }

    fn average(&self) -> f64 {
        let n = if self.filled { self.window } else { self.pos };
        if n == 0 {
            return 0.0;
        }
        self.values[..n].iter().sum::<f64>() / n as f64
    }

    fn spec(&self) -> String {
        format!("win:{}", self.window)
    }
}

/// Returns an Averager for a configuration string: "avg", "win[:N]" or
/// "exp[:alpha]".
pub fn parse_averager(s: &str) -> Result<Box<dyn Averager>> {
    if s == "avg" {
        return Ok(Box::<CumulativeAverager>::default());
    }
    if let Some(rest) = s.strip_prefix("win") {
        return match rest.strip_prefix(':') {
            None if rest.is_empty() => Ok(Box::<WindowAverager>::default()),
            Some(arg) => match arg.parse::<usize>() {
                Ok(w) if w >= 1 => Ok(Box::new(WindowAverager::new(w))),
                _ => Err(Error::InvalidWinAvgWindow(arg.to_string())),
            },
            None => Err(Error::NoSuchAverager(s.to_string())),
        };
    }
    if let Some(rest) = s.strip_prefix("exp") {
        return match rest.strip_prefix(':') {
            None if rest.is_empty() => Ok(Box::<ExponentialAverager>::default()),
            Some(arg) => match arg.parse::<f64>() {
                Ok(a) if (0.0..=1.0).contains(&a) => Ok(Box::new(ExponentialAverager::new(a))),
                _ => Err(Error::InvalidExpAvgAlpha(arg.to_string())),
            },
            None => Err(Error::NoSuchAverager(s.to_string())),
        };
    }
    Err(Error::NoSuchAverager(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_average() {
        let mut a = CumulativeAverager::default();
        assert_eq!(a.average(), 0.0);
        a.push(1.0);
        a.push(2.0);
        a.push(3.0);
        assert!((a.average() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn exponential_average_seeds_on_first_push() {
        let mut a = ExponentialAverager::new(0.5);
        a.push(2.0);
        assert_eq!(a.average(), 2.0);
        a.push(4.0);
        assert!((a.average() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn window_average_drops_old_values() {
        let mut a = WindowAverager::new(2);
        a.push(1.0);
        assert!((a.average() - 1.0).abs() < f64::EPSILON);
        a.push(3.0);
        assert!((a.average() - 2.0).abs() < f64::EPSILON);
        a.push(5.0);
        assert!((a.average() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_averager_specs() {
        assert_eq!(parse_averager("avg").unwrap().spec(), "avg");
        assert_eq!(parse_averager("win").unwrap().spec(), format!("win:{}", DEFAULT_AVERAGE_WINDOW));
        assert_eq!(parse_averager("win:9").unwrap().spec(), "win:9");
        assert_eq!(parse_averager("exp:0.25").unwrap().spec(), "exp:0.25");
        assert!(matches!(parse_averager("win:0"), Err(Error::InvalidWinAvgWindow(_))));
        assert!(matches!(parse_averager("exp:1.5"), Err(Error::InvalidExpAvgAlpha(_))));
        assert!(matches!(parse_averager("median"), Err(Error::NoSuchAverager(_))));
    }
}
