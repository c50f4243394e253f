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

//! Test parameters, exchanged in open request and reply payloads as a TLV
//! stream: an unsigned varint tag followed by either a zigzag varint value
//! or a length-prefixed string. Unknown tags are skipped for forward
//! compatibility.

use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::time::{dur_to_nanos, Clock, ReceivedStats, StampAt};

/// Maximum encoded length of the params payload.
pub(crate) const PARAMS_MAX_LEN: usize = 128;

/// Maximum length of the server fill string.
pub const MAX_SERVER_FILL_LEN: usize = 32;

mod tag {
    pub const PROTOCOL_VERSION: u64 = 1;
    pub const DURATION: u64 = 2;
    pub const INTERVAL: u64 = 3;
    pub const LENGTH: u64 = 4;
    pub const RECEIVED_STATS: u64 = 5;
    pub const STAMP_AT: u64 = 6;
    pub const CLOCK: u64 = 7;
    pub const DSCP: u64 = 8;
    pub const SERVER_FILL: u64 = 9;
}

/// Params are the test parameters sent to and received from the server.
/// Zero values are not encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Params {
    #[serde(rename = "proto_version")]
    pub proto_version: i32,
    #[serde(serialize_with = "ser_nanos")]
    pub duration: Duration,
    #[serde(serialize_with = "ser_nanos")]
    pub interval: Duration,
    pub length: usize,
    pub received_stats: ReceivedStats,
    pub stamp_at: StampAt,
    pub clock: Option<Clock>,
    pub dscp: u8,
    pub server_fill: String,
}

fn ser_nanos<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_i64(dur_to_nanos(*d))
}

impl Params {
    /// Serializes the set fields as a TLV stream.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut b = vec![0u8; PARAMS_MAX_LEN];
        let mut pos = 0;
        if self.proto_version != 0 {
            pos += put_uvarint(&mut b[pos..], tag::PROTOCOL_VERSION);
            pos += put_varint(&mut b[pos..], self.proto_version as i64);
        }
        if !self.duration.is_zero() {
            pos += put_uvarint(&mut b[pos..], tag::DURATION);
            pos += put_varint(&mut b[pos..], dur_to_nanos(self.duration));
        }
        if !self.interval.is_zero() {
            pos += put_uvarint(&mut b[pos..], tag::INTERVAL);
            pos += put_varint(&mut b[pos..], dur_to_nanos(self.interval));
        }
        if self.length != 0 {
            pos += put_uvarint(&mut b[pos..], tag::LENGTH);
            pos += put_varint(&mut b[pos..], self.length as i64);
        }
        if self.received_stats != ReceivedStats::None {
            pos += put_uvarint(&mut b[pos..], tag::RECEIVED_STATS);
            pos += put_varint(&mut b[pos..], self.received_stats as i64);
        }
        if self.stamp_at != StampAt::None {
            pos += put_uvarint(&mut b[pos..], tag::STAMP_AT);
            pos += put_varint(&mut b[pos..], self.stamp_at as i64);
        }
        if let Some(clock) = self.clock {
            pos += put_uvarint(&mut b[pos..], tag::CLOCK);
            pos += put_varint(&mut b[pos..], clock as i64);
        }
        if self.dscp != 0 {
            pos += put_uvarint(&mut b[pos..], tag::DSCP);
            pos += put_varint(&mut b[pos..], self.dscp as i64);
        }
        if !self.server_fill.is_empty() {
            pos += put_uvarint(&mut b[pos..], tag::SERVER_FILL);
            pos += put_string(&mut b[pos..], &self.server_fill, MAX_SERVER_FILL_LEN);
        }
        b.truncate(pos);
        b
    }

    /// Parses a TLV stream. Enum values are validated; unknown tags are
    /// silently ignored.
    pub(crate) fn parse(b: &[u8]) -> Result<Params> {
        let mut p = Params::default();
        let mut pos = 0;
        while pos < b.len() {
            pos += p.read_param(&b[pos..])?;
        }
        Ok(p)
    }

    fn read_param(&mut self, b: &[u8]) -> Result<usize> {
        let (t, mut n) = read_uvarint(b)?;
        if t == tag::SERVER_FILL {
            let (s, m) = read_string(&b[n..], MAX_SERVER_FILL_LEN)?;
            self.server_fill = s;
            n += m;
        } else {
            let (v, m) = read_varint(&b[n..])?;
            n += m;
            match t {
                tag::PROTOCOL_VERSION => self.proto_version = v as i32,
                tag::DURATION => {
                    if v <= 0 {
                        return Err(Error::InvalidParamValue(format!("duration {} is <= 0", v)));
                    }
                    self.duration = Duration::from_nanos(v as u64);
                }
                tag::INTERVAL => {
                    if v <= 0 {
                        return Err(Error::InvalidParamValue(format!("interval {} is <= 0", v)));
                    }
                    self.interval = Duration::from_nanos(v as u64);
                }
                tag::LENGTH => {
                    self.length = usize::try_from(v)
                        .map_err(|_| Error::InvalidParamValue(format!("length {} is < 0", v)))?;
                }
                tag::RECEIVED_STATS => self.received_stats = ReceivedStats::from_int(v)?,
                tag::STAMP_AT => self.stamp_at = StampAt::from_int(v)?,
                tag::CLOCK => self.clock = Some(Clock::from_int(v)?),
                tag::DSCP => {
                    self.dscp = u8::try_from(v)
                        .map_err(|_| Error::InvalidParamValue(format!("dscp {} out of range", v)))?;
                }
                _ => {
                    // unknown params are silently ignored
                }
            }
        }
        Ok(n)
    }
}

fn put_uvarint(b: &mut [u8], mut v: u64) -> usize {
    let mut i = 0;
    while v >= 0x80 {
        b[i] = v as u8 | 0x80;
        v >>= 7;
        i += 1;
    }
    b[i] = v as u8;
    i + 1
}

// zigzag encoding for signed values
fn put_varint(b: &mut [u8], v: i64) -> usize {
    put_uvarint(b, ((v << 1) ^ (v >> 63)) as u64)
}

fn read_uvarint(b: &[u8]) -> Result<(u64, usize)> {
    let mut x = 0u64;
    let mut s = 0u32;
    for (i, &c) in b.iter().enumerate() {
        if i == 10 || (i == 9 && c > 1) {
            return Err(Error::ParamOverflow);
        }
        if c < 0x80 {
            return Ok((x | (c as u64) << s, i + 1));
        }
        x |= ((c & 0x7f) as u64) << s;
        s += 7;
    }
    Err(Error::ShortParamBuffer(b.len()))
}

fn read_varint(b: &[u8]) -> Result<(i64, usize)> {
    let (ux, n) = read_uvarint(b)?;
    Ok(((ux >> 1) as i64 ^ -((ux & 1) as i64), n))
}

fn put_string(b: &mut [u8], s: &str, max_len: usize) -> usize {
    let l = s.len().min(max_len);
    let mut n = put_uvarint(b, l as u64);
    b[n..n + l].copy_from_slice(&s.as_bytes()[..l]);
    n += l;
    n
}

fn read_string(b: &[u8], max_len: usize) -> Result<(String, usize)> {
    let (l, n) = read_uvarint(b)?;
    if l > max_len as u64 {
        return Err(Error::ParamOverflow);
    }
    let l = l as usize;
    if b[n..].len() < l {
        return Err(Error::ShortParamBuffer(b[n..].len()));
    }
    let s = std::str::from_utf8(&b[n..n + l])
        .map_err(|_| Error::InvalidParamValue("string param is not UTF-8".to_string()))?;
    Ok((s.to_string(), n + l))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Params {
        Params {
            proto_version: 1,
            duration: Duration::from_secs(60),
            interval: Duration::from_millis(200),
            length: 172,
            received_stats: ReceivedStats::Both,
            stamp_at: StampAt::Midpoint,
            clock: Some(Clock::Both),
            dscp: 46,
            server_fill: "rand".to_string(),
        }
    }

    #[test]
    fn encode_parse_round_trip() {
        let p = sample();
        let b = p.encode();
        assert!(b.len() <= PARAMS_MAX_LEN);
        assert_eq!(Params::parse(&b).unwrap(), p);
    }

    #[test]
    fn zero_params_encode_empty() {
        let p = Params::default();
        assert!(p.encode().is_empty());
        assert_eq!(Params::parse(&[]).unwrap(), p);
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let mut b = vec![0u8; 32];
        let mut pos = put_uvarint(&mut b, 200);
        pos += put_varint(&mut b[pos..], 12345);
        pos += put_uvarint(&mut b[pos..], tag::LENGTH);
        pos += put_varint(&mut b[pos..], 64);
        b.truncate(pos);
        let p = Params::parse(&b).unwrap();
        assert_eq!(p.length, 64);
    }

    #[test]
    fn out_of_range_enum_is_rejected() {
        let mut b = vec![0u8; 16];
        let mut pos = put_uvarint(&mut b, tag::STAMP_AT);
        pos += put_varint(&mut b[pos..], 9);
        b.truncate(pos);
        assert!(matches!(Params::parse(&b), Err(Error::InvalidStampAtInt(9))));
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        let mut b = vec![0u8; 16];
        let mut pos = put_uvarint(&mut b, tag::INTERVAL);
        pos += put_varint(&mut b[pos..], -5);
        b.truncate(pos);
        assert!(matches!(Params::parse(&b), Err(Error::InvalidParamValue(_))));
    }

    #[test]
    fn truncated_buffer_is_short() {
        let p = sample();
        let b = p.encode();
        assert!(matches!(
            Params::parse(&b[..b.len() - 3]),
            Err(Error::ShortParamBuffer(_))
        ));
    }

    #[test]
    fn varint_overflow_is_detected() {
        let b = [0x80u8; 11];
        assert!(matches!(read_uvarint(&b), Err(Error::ParamOverflow)));
    }

    #[test]
    fn long_fill_string_is_clamped_on_write() {
        let mut p = sample();
        p.server_fill = "x".repeat(MAX_SERVER_FILL_LEN + 10);
        let b = p.encode();
        let q = Params::parse(&b).unwrap();
        assert_eq!(q.server_fill.len(), MAX_SERVER_FILL_LEN);
    }

    #[test]
    fn varint_round_trip() {
        let mut b = [0u8; 10];
        for v in [0i64, 1, -1, 63, -64, 1 << 40, -(1 << 40), i64::MAX, i64::MIN] {
            let n = put_varint(&mut b, v);
            let (w, m) = read_varint(&b[..n]).unwrap();
            assert_eq!((w, m), (v, n));
        }
    }
}
