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

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::error::{Error, Result};
use crate::time::{Clock, Time};

/// The default fill pattern.
pub const DEFAULT_FILL_PATTERN: &[u8] = b"rlat";

// initial length of the pattern filler buffer
const PATTERN_MAX_INIT_LEN: usize = 4 * 1024;

/// Filler fills packet payloads.
pub trait Filler: Send {
    /// Fills buf completely.
    fn fill(&mut self, buf: &mut [u8]);

    /// The configuration string this filler was built from.
    fn spec(&self) -> String;
}

/// Fills with a repeating byte pattern, staged into a larger buffer so each
/// fill is a few copies.
pub struct PatternFiller {
    pattern: Vec<u8>,
    buf: Vec<u8>,
    pos: usize,
}

impl PatternFiller {
    pub fn new(pattern: Vec<u8>) -> PatternFiller {
        assert!(!pattern.is_empty(), "empty fill pattern");
        let reps = (PATTERN_MAX_INIT_LEN / pattern.len()).max(1);
        let mut buf = Vec::with_capacity(reps * pattern.len());
        for _ in 0..reps {
            buf.extend_from_slice(&pattern);
        }
        PatternFiller { pattern, buf, pos: 0 }
    }
}

impl Default for PatternFiller {
    fn default() -> PatternFiller {
        PatternFiller::new(DEFAULT_FILL_PATTERN.to_vec())
    }
}

impl Filler for PatternFiller {
    fn fill(&mut self, buf: &mut [u8]) {
        let mut l = 0;
        while l < buf.len() {
            let c = (buf.len() - l).min(self.buf.len() - self.pos);
            buf[l..l + c].copy_from_slice(&self.buf[self.pos..self.pos + c]);
            l += c;
            // the staged buffer length is a multiple of the pattern length,
            // so reducing modulo the pattern keeps the phase
            self.pos = (self.pos + c) % self.pattern.len();
        }
    }

    fn spec(&self) -> String {
        format!("pattern:{}", hex_encode(&self.pattern))
    }
}

/// Fills with pseudo-random bytes seeded from the wall clock.
pub struct RandFiller {
    rng: SmallRng,
}

impl RandFiller {
    pub fn new() -> RandFiller {
        let seed = Time::now(Clock::Wall).wall as u64;
        RandFiller { rng: SmallRng::seed_from_u64(seed) }
    }
}

impl Default for RandFiller {
    fn default() -> RandFiller {
        RandFiller::new()
    }
}

impl Filler for RandFiller {
    fn fill(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }

    fn spec(&self) -> String {
        "rand".to_string()
    }
}

/// Returns a Filler for a configuration string: "none" (zero payload),
/// "rand", "pattern" or "pattern:HEX".
pub fn parse_filler(s: &str) -> Result<Option<Box<dyn Filler>>> {
    if s == "none" {
        return Ok(None);
    }
    if s == "rand" {
        return Ok(Some(Box::new(RandFiller::new())));
    }
    if let Some(rest) = s.strip_prefix("pattern") {
        let pattern = match rest.strip_prefix(':') {
            None if rest.is_empty() => DEFAULT_FILL_PATTERN.to_vec(),
            Some(hex) if !hex.is_empty() => hex_decode(hex).ok_or_else(|| Error::InvalidFillPattern(s.to_string()))?,
            _ => return Err(Error::InvalidFillPattern(s.to_string())),
        };
        return Ok(Some(Box::new(PatternFiller::new(pattern))));
    }
    Err(Error::NoSuchFiller(s.to_string()))
}

fn hex_encode(b: &[u8]) -> String {
    b.iter().map(|x| format!("{:02x}", x)).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_fill_is_cyclic_across_calls() {
        let mut f = PatternFiller::new(vec![0x01, 0x02, 0x03]);
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        f.fill(&mut a);
        f.fill(&mut b);
        assert_eq!(a, [0x01, 0x02, 0x03, 0x01]);
        assert_eq!(b, [0x02, 0x03, 0x01, 0x02]);
    }

    #[test]
    fn pattern_fill_longer_than_staged_buffer() {
        let mut f = PatternFiller::new(vec![0xab, 0xcd]);
        let mut buf = vec![0u8; PATTERN_MAX_INIT_LEN + 7];
        f.fill(&mut buf);
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, if i % 2 == 0 { 0xab } else { 0xcd });
        }
    }

    #[test]
    fn rand_fill_fills_everything() {
        let mut f = RandFiller::new();
        let mut buf = [0u8; 512];
        f.fill(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn parse_filler_specs() {
        assert!(parse_filler("none").unwrap().is_none());
        assert_eq!(parse_filler("rand").unwrap().unwrap().spec(), "rand");
        let f = parse_filler("pattern:abcd12").unwrap().unwrap();
        assert_eq!(f.spec(), "pattern:abcd12");
        let f = parse_filler("pattern").unwrap().unwrap();
        assert_eq!(f.spec(), format!("pattern:{}", hex_encode(DEFAULT_FILL_PATTERN)));
        assert!(matches!(parse_filler("pattern:xyz"), Err(Error::InvalidFillPattern(_))));
        assert!(matches!(parse_filler("zeroes"), Err(Error::NoSuchFiller(_))));
    }
}
