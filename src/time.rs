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

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::Error;

/// Sentinel for a duration that could not be computed, in nanoseconds.
pub const INVALID_DURATION: i64 = i64::MAX;

// monotonic values are relative to a per-process anchor captured on first use
static ANCHOR: OnceLock<Instant> = OnceLock::new();

fn anchor() -> Instant {
    *ANCHOR.get_or_init(Instant::now)
}

/// Returns the current monotonic clock value in nanoseconds.
pub(crate) fn mono_now() -> i64 {
    anchor().elapsed().as_nanos() as i64
}

fn wall_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(_) => 0,
    }
}

/// Time contains both wall clock (subject to system time adjustments) and
/// monotonic clock (relative to a fixed process anchor) values in
/// nanoseconds. A zero component means the value is absent. The monotonic
/// value should be used for calculating time differences, and the wall value
/// for comparing times between hosts, to the extent their clocks are
/// synchronized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Time {
    #[serde(skip_serializing_if = "is_zero")]
    pub wall: i64,
    #[serde(rename = "monotonic", skip_serializing_if = "is_zero")]
    pub mono: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Time {
    /// Captures the current time from the requested clocks.
    pub fn now(clock: Clock) -> Time {
        Time {
            wall: if clock.wall() { wall_now() } else { 0 },
            mono: if clock.mono() { mono_now() } else { 0 },
        }
    }

    /// Returns the duration self-other in nanoseconds, preferring the
    /// monotonic clock when both operands carry it. Returns
    /// [`INVALID_DURATION`] when the operands share no clock.
    pub fn sub(&self, other: &Time) -> i64 {
        if self.mono != 0 && other.mono != 0 {
            self.mono - other.mono
        } else if self.wall != 0 && other.wall != 0 {
            self.wall - other.wall
        } else {
            INVALID_DURATION
        }
    }

    /// Returns the point in time halfway to other.
    pub fn midpoint(&self, other: &Time) -> Time {
        let mut t = *self;
        if t.wall != 0 && other.wall != 0 {
            t.wall += (other.wall - t.wall) / 2;
        }
        if t.mono != 0 && other.mono != 0 {
            t.mono += (other.mono - t.mono) / 2;
        }
        t
    }

    /// Keeps only the requested clocks, zeroing the others.
    pub fn keep_clocks(mut self, clock: Clock) -> Time {
        if !clock.wall() {
            self.wall = 0;
        }
        if !clock.mono() {
            self.mono = 0;
        }
        self
    }

    pub fn is_wall_zero(&self) -> bool {
        self.wall == 0
    }

    pub fn is_mono_zero(&self) -> bool {
        self.mono == 0
    }

    pub fn is_zero(&self) -> bool {
        self.is_wall_zero() && self.is_mono_zero()
    }
}

/// Timestamp stores the server's receive and send times. When the server
/// stamped at the midpoint, receive and send hold the same value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Timestamp {
    pub receive: Time,
    pub send: Time,
}

impl Timestamp {
    pub fn is_midpoint(&self) -> bool {
        !self.receive.is_zero() && self.receive == self.send
    }

    pub fn is_both_mono(&self) -> bool {
        !self.receive.is_mono_zero() && !self.send.is_mono_zero()
    }

    pub fn is_both_wall(&self) -> bool {
        !self.receive.is_wall_zero() && !self.send.is_wall_zero()
    }

    /// The send time, falling back to the receive time when absent.
    pub fn best_send(&self) -> Time {
        if self.send.is_zero() {
            self.receive
        } else {
            self.send
        }
    }

    /// The receive time, falling back to the send time when absent.
    pub fn best_receive(&self) -> Time {
        if self.receive.is_zero() {
            self.send
        } else {
            self.receive
        }
    }
}

/// Clock selects the clock(s) used for timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Clock {
    Wall = 0x01,
    Monotonic = 0x02,
    Both = 0x03,
}

impl Clock {
    pub fn wall(self) -> bool {
        self as u8 & Clock::Wall as u8 != 0
    }

    pub fn mono(self) -> bool {
        self as u8 & Clock::Monotonic as u8 != 0
    }

    pub(crate) fn from_flags(wall: bool, mono: bool) -> Option<Clock> {
        match (wall, mono) {
            (true, true) => Some(Clock::Both),
            (true, false) => Some(Clock::Wall),
            (false, true) => Some(Clock::Monotonic),
            (false, false) => None,
        }
    }

    pub fn from_int(v: i64) -> Result<Clock, Error> {
        match v {
            1 => Ok(Clock::Wall),
            2 => Ok(Clock::Monotonic),
            3 => Ok(Clock::Both),
            _ => Err(Error::InvalidClockInt(v)),
        }
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Clock::Wall => "wall",
            Clock::Monotonic => "monotonic",
            Clock::Both => "both",
        })
    }
}

impl FromStr for Clock {
    type Err = Error;

    fn from_str(s: &str) -> Result<Clock, Error> {
        match s {
            "wall" => Ok(Clock::Wall),
            "monotonic" => Ok(Clock::Monotonic),
            "both" => Ok(Clock::Both),
            _ => Err(Error::InvalidClockString(s.to_string())),
        }
    }
}

/// StampAt selects when timestamps are taken on the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StampAt {
    #[default]
    None = 0x00,
    Send = 0x01,
    Receive = 0x02,
    Both = 0x03,
    Midpoint = 0x04,
}

impl StampAt {
    pub fn at_send(self) -> bool {
        self as u8 & StampAt::Send as u8 != 0
    }

    pub fn at_receive(self) -> bool {
        self as u8 & StampAt::Receive as u8 != 0
    }

    pub fn midpoint(self) -> bool {
        self == StampAt::Midpoint
    }

    pub fn from_int(v: i64) -> Result<StampAt, Error> {
        match v {
            0 => Ok(StampAt::None),
            1 => Ok(StampAt::Send),
            2 => Ok(StampAt::Receive),
            3 => Ok(StampAt::Both),
            4 => Ok(StampAt::Midpoint),
            _ => Err(Error::InvalidStampAtInt(v)),
        }
    }
}

impl fmt::Display for StampAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StampAt::None => "none",
            StampAt::Send => "send",
            StampAt::Receive => "receive",
            StampAt::Both => "both",
            StampAt::Midpoint => "midpoint",
        })
    }
}

impl FromStr for StampAt {
    type Err = Error;

    fn from_str(s: &str) -> Result<StampAt, Error> {
        match s {
            "none" => Ok(StampAt::None),
            "send" => Ok(StampAt::Send),
            "receive" => Ok(StampAt::Receive),
            "both" => Ok(StampAt::Both),
            "midpoint" => Ok(StampAt::Midpoint),
            _ => Err(Error::InvalidStampAtString(s.to_string())),
        }
    }
}

/// ReceivedStats selects what the server reports about received packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceivedStats {
    #[default]
    None = 0x00,
    Count = 0x01,
    Window = 0x02,
    Both = 0x03,
}

impl ReceivedStats {
    pub fn count(self) -> bool {
        self as u8 & ReceivedStats::Count as u8 != 0
    }

    pub fn window(self) -> bool {
        self as u8 & ReceivedStats::Window as u8 != 0
    }

    pub fn from_int(v: i64) -> Result<ReceivedStats, Error> {
        match v {
            0 => Ok(ReceivedStats::None),
            1 => Ok(ReceivedStats::Count),
            2 => Ok(ReceivedStats::Window),
            3 => Ok(ReceivedStats::Both),
            _ => Err(Error::InvalidReceivedStatsInt(v)),
        }
    }
}

impl fmt::Display for ReceivedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReceivedStats::None => "none",
            ReceivedStats::Count => "count",
            ReceivedStats::Window => "window",
            ReceivedStats::Both => "both",
        })
    }
}

impl FromStr for ReceivedStats {
    type Err = Error;

    fn from_str(s: &str) -> Result<ReceivedStats, Error> {
        match s {
            "none" => Ok(ReceivedStats::None),
            "count" => Ok(ReceivedStats::Count),
            "window" => Ok(ReceivedStats::Window),
            "both" => Ok(ReceivedStats::Both),
            _ => Err(Error::InvalidReceivedStatsString(s.to_string())),
        }
    }
}

/// AllowStamp selects the timestamps the server is willing to provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowStamp {
    None,
    Single,
    Dual,
}

impl AllowStamp {
    /// Returns the StampAt allowed for the StampAt requested. A request for
    /// both timestamps under a single-stamp policy becomes the midpoint.
    pub fn restrict(self, at: StampAt) -> StampAt {
        if at == StampAt::None {
            return StampAt::None;
        }
        match self {
            AllowStamp::None => StampAt::None,
            AllowStamp::Single => match at {
                StampAt::Both => StampAt::Midpoint,
                other => other,
            },
            AllowStamp::Dual => at,
        }
    }
}

impl fmt::Display for AllowStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AllowStamp::None => "none",
            AllowStamp::Single => "single",
            AllowStamp::Dual => "dual",
        })
    }
}

impl FromStr for AllowStamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<AllowStamp, Error> {
        match s {
            "none" => Ok(AllowStamp::None),
            "single" => Ok(AllowStamp::Single),
            "dual" => Ok(AllowStamp::Dual),
            _ => Err(Error::InvalidAllowStampString(s.to_string())),
        }
    }
}

/// Converts a std Duration to nanoseconds, saturating at i64::MAX.
pub(crate) fn dur_to_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Converts non-negative nanoseconds to a std Duration.
pub(crate) fn nanos_to_dur(ns: i64) -> Duration {
    Duration::from_nanos(ns.max(0) as u64)
}
