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

//! Records per-packet data and running statistics during a test, without
//! blocking the send path: the next round-trip record is appended before
//! the send timestamp is read, so reallocation never skews a timestamp.
//! The recorder is shared between the send and receive threads behind a
//! read-write lock; status readers take the read side.

use std::sync::{RwLock, RwLockReadGuard};

use crate::protocol::packet::Packet;
use crate::time::{Clock, Time, Timestamp, INVALID_DURATION};

/// DurationStats keeps basic statistics over nanosecond durations.
/// Welford's method maintains the running mean and sum of squares. The
/// median is computed once at result finalization from per-packet samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationStats {
    pub n: u64,
    pub min: i64,
    pub max: i64,
    pub total: i64,
    mean: f64,
    s: f64,
}

impl DurationStats {
    pub(crate) fn push(&mut self, d: i64) {
        if self.n == 0 {
            self.min = d;
            self.max = d;
            self.total = d;
        } else {
            self.min = self.min.min(d);
            self.max = self.max.max(d);
            self.total += d;
        }
        self.n += 1;
        let om = self.mean;
        let fd = d as f64;
        self.mean += (fd - om) / self.n as f64;
        self.s += (fd - om) * (fd - self.mean);
    }

    pub fn is_zero(&self) -> bool {
        self.n == 0
    }

    /// The arithmetic mean in nanoseconds.
    pub fn mean(&self) -> i64 {
        self.mean as i64
    }

    pub fn variance(&self) -> f64 {
        if self.n > 1 {
            self.s / (self.n - 1) as f64
        } else {
            0.0
        }
    }

    pub fn stddev(&self) -> i64 {
        self.variance().sqrt() as i64
    }
}

/// RoundTripData is the information recorded for each round trip, indexed
/// by sequence number.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundTripData {
    /// client send and receive times
    pub client: Timestamp,
    /// server timestamps echoed in the reply
    pub server: Timestamp,
    /// received-window snapshot from the reply, 0 when absent
    pub received_window: u64,
}

impl RoundTripData {
    pub fn reply_received(&self) -> bool {
        !self.client.receive.is_zero()
    }

    /// The round-trip time from the monotonic clock, with the server
    /// processing time subtracted when both server stamps are present.
    pub fn rtt(&self) -> i64 {
        if !self.reply_received() {
            return INVALID_DURATION;
        }
        let mut rtt = self.client.receive.mono - self.client.send.mono;
        let spt = self.server_processing_time();
        if spt != INVALID_DURATION {
            rtt -= spt;
        }
        rtt
    }

    /// The time between the server receiving the request and sending its
    /// reply. Invalid for midpoint stamps, which contain no spread.
    pub fn server_processing_time(&self) -> i64 {
        if self.server.is_midpoint() {
            return INVALID_DURATION;
        }
        if self.server.is_both_mono() {
            self.server.send.mono - self.server.receive.mono
        } else if self.server.is_both_wall() {
            self.server.send.wall - self.server.receive.wall
        } else {
            INVALID_DURATION
        }
    }

    /// The estimated one-way send delay. Valid only with wall timestamps
    /// and externally synchronized clocks.
    pub fn send_delay(&self) -> i64 {
        if !self.is_wall_timestamped() {
            return INVALID_DURATION;
        }
        self.server.best_receive().wall - self.client.send.wall
    }

    /// The estimated one-way receive delay, under the same conditions as
    /// the send delay.
    pub fn receive_delay(&self) -> i64 {
        if !self.is_wall_timestamped() {
            return INVALID_DURATION;
        }
        self.client.receive.wall - self.server.best_send().wall
    }

    /// The uncorrected send-side clock difference, usable for send IPDV
    /// but not absolute delay.
    pub fn send_mono_diff(&self) -> i64 {
        self.server.best_receive().mono - self.client.send.mono
    }

    pub fn receive_mono_diff(&self) -> i64 {
        self.client.receive.mono - self.server.best_send().mono
    }

    pub fn send_wall_diff(&self) -> i64 {
        self.server.best_receive().wall - self.client.send.wall
    }

    pub fn receive_wall_diff(&self) -> i64 {
        self.client.receive.wall - self.server.best_send().wall
    }

    pub fn is_timestamped(&self) -> bool {
        !self.server.receive.is_zero() || !self.server.send.is_zero()
    }

    pub fn is_mono_timestamped(&self) -> bool {
        !self.server.receive.is_mono_zero() || !self.server.send.is_mono_zero()
    }

    pub fn is_wall_timestamped(&self) -> bool {
        !self.server.receive.is_wall_zero() || !self.server.send.is_wall_zero()
    }
}

/// The recorder state, readable through [`Recorder::read`].
#[derive(Default)]
pub struct RecorderData {
    pub start: Time,
    pub first_send: Time,
    pub last_sent: Time,
    pub first_received: Time,
    pub last_received: Time,

    pub send_call_stats: DurationStats,
    pub timer_error_stats: DurationStats,
    pub rtt_stats: DurationStats,
    pub send_delay_stats: DurationStats,
    pub receive_delay_stats: DurationStats,
    pub server_processing_stats: DurationStats,
    pub rtt_ipdv_stats: DurationStats,
    pub send_ipdv_stats: DurationStats,
    pub receive_ipdv_stats: DurationStats,

    pub server_packets_received: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duplicates: u64,
    pub late_packets: u64,
    /// nanoseconds spent waiting for the reply tail
    pub wait: i64,

    pub round_trips: Vec<RoundTripData>,

    last_seqno: u32,
    last_rtt: i64,
    last_send_diff: i64,
    last_receive_diff: i64,
}

/// One recorder exists per test. All mutation happens inside; concurrent
/// readers use [`read`](Recorder::read) for a consistent snapshot.
pub struct Recorder {
    d: RwLock<RecorderData>,
}

// round-trip reservations beyond this are grown on demand instead
const MAX_PREALLOC_ROUND_TRIPS: usize = 1 << 22;

impl Recorder {
    pub(crate) fn new(expected_round_trips: usize) -> Recorder {
        let d = RecorderData {
            round_trips: Vec::with_capacity(expected_round_trips.min(MAX_PREALLOC_ROUND_TRIPS)),
            last_rtt: INVALID_DURATION,
            last_send_diff: INVALID_DURATION,
            last_receive_diff: INVALID_DURATION,
            ..RecorderData::default()
        };
        Recorder { d: RwLock::new(d) }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RecorderData> {
        self.d.read().unwrap()
    }

    pub(crate) fn set_start(&self, t: Time) {
        self.d.write().unwrap().start = t;
    }

    /// Appends the next round-trip record, then reads the clock, so any
    /// reallocation happens before the send time is taken.
    pub(crate) fn record_pre_send(&self) -> Time {
        let mut d = self.d.write().unwrap();
        d.round_trips.push(RoundTripData::default());
        let tsend = Time::now(Clock::Both);
        d.round_trips.last_mut().unwrap().client.send = tsend;
        tsend
    }

    /// Rolls back the pre-send record after a failed send.
    pub(crate) fn remove_last_stamps(&self) {
        let mut d = self.d.write().unwrap();
        d.round_trips.pop();
    }

    pub(crate) fn record_post_send(&self, tsend: Time, tsent: Time, n: u64) {
        let mut d = self.d.write().unwrap();
        d.send_call_stats.push(tsent.sub(&tsend));
        d.bytes_sent += n;
        if d.first_send.is_zero() {
            d.first_send = tsend;
        }
        d.last_sent = tsent;
    }

    pub(crate) fn record_timer_err(&self, terr: i64) {
        let mut d = self.d.write().unwrap();
        d.timer_error_stats.push(terr.abs());
    }

    /// Records a reply. Returns false for a sequence number that was never
    /// sent. Duplicates bump a counter and do not overwrite the record.
    pub(crate) fn record_receive(&self, p: &Packet, sts: &Timestamp) -> bool {
        let mut d = self.d.write().unwrap();

        let seqno = p.seqno();
        if seqno as usize >= d.round_trips.len() {
            return false;
        }

        if d.round_trips[seqno as usize].reply_received() {
            d.duplicates += 1;
            return true;
        }

        let late = seqno < d.last_seqno;
        if late {
            d.late_packets += 1;
        }
        d.last_seqno = seqno;

        let trecv = p.trcvd;
        let rtd = &mut d.round_trips[seqno as usize];
        rtd.client.receive = trecv;
        rtd.server = *sts;
        if p.has_received_window() {
            rtd.received_window = p.received_window();
        }
        let rtd = d.round_trips[seqno as usize];

        let rtt = rtd.rtt();
        d.rtt_stats.push(rtt);
        if d.last_rtt != INVALID_DURATION {
            let rtt_ipdv = (rtt - d.last_rtt).abs();
            d.rtt_ipdv_stats.push(rtt_ipdv);
        }
        d.last_rtt = rtt;

        // one-way delays need synchronized wall clocks on both ends
        if !rtd.server.best_receive().is_wall_zero() {
            d.send_delay_stats.push(rtd.send_delay());
        }
        if !rtd.server.best_send().is_wall_zero() {
            d.receive_delay_stats.push(rtd.receive_delay());
        }

        let spt = rtd.server_processing_time();
        if spt != INVALID_DURATION {
            d.server_processing_stats.push(spt);
        }

        // one-way IPDV from uncorrected clock differences, monotonic when
        // available
        if rtd.is_timestamped() {
            let (sd, rd) = if rtd.is_mono_timestamped() {
                (rtd.send_mono_diff(), rtd.receive_mono_diff())
            } else {
                (rtd.send_wall_diff(), rtd.receive_wall_diff())
            };
            if d.last_send_diff != INVALID_DURATION {
                let send_ipdv = (sd - d.last_send_diff).abs();
                d.send_ipdv_stats.push(send_ipdv);
            }
            if d.last_receive_diff != INVALID_DURATION {
                let receive_ipdv = (rd - d.last_receive_diff).abs();
                d.receive_ipdv_stats.push(receive_ipdv);
            }
            d.last_send_diff = sd;
            d.last_receive_diff = rd;
        } else {
            d.last_send_diff = INVALID_DURATION;
            d.last_receive_diff = INVALID_DURATION;
        }

        if d.first_received.is_zero() {
            d.first_received = trecv;
        }
        d.last_received = trecv;

        if p.has_received_count() {
            d.server_packets_received = p.received_count();
        }
        d.bytes_received += p.length() as u64;

        true
    }

    pub(crate) fn set_wait(&self, wait: i64) {
        self.d.write().unwrap().wait = wait;
    }

    #[cfg(test)]
    pub(crate) fn push_rtt_for_test(&self, rtt: i64) {
        self.d.write().unwrap().rtt_stats.push(rtt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{Packet, FECHO_REPLY};
    use crate::protocol::flag;

    fn reply_packet(seqno: u32, trcvd_mono: i64) -> Packet {
        let mut p = Packet::new(0, 256, None);
        p.add_fields(FECHO_REPLY, true).unwrap();
        p.set_flag_bits(flag::REPLY);
        p.set_seqno(seqno);
        p.trcvd = Time { wall: 1_000_000 + trcvd_mono, mono: trcvd_mono };
        p
    }

    fn send_n(rec: &Recorder, n: usize) {
        for _ in 0..n {
            let tsend = rec.record_pre_send();
            rec.record_post_send(tsend, Time::now(Clock::Both), 64);
        }
    }

    #[test]
    fn welford_stats_match_simple_formulas() {
        let mut s = DurationStats::default();
        for v in [2i64, 4, 4, 4, 5, 5, 7, 9] {
            s.push(v);
        }
        assert_eq!(s.n, 8);
        assert_eq!(s.min, 2);
        assert_eq!(s.max, 9);
        assert_eq!(s.total, 40);
        assert_eq!(s.mean(), 5);
        // sample variance of this classic set is 32/7
        assert!((s.variance() - 32.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn duplicates_do_not_overwrite() {
        let rec = Recorder::new(4);
        send_n(&rec, 2);

        let p = reply_packet(1, 500);
        assert!(rec.record_receive(&p, &Timestamp::default()));
        let first = rec.read().round_trips[1];

        let mut dup = reply_packet(1, 900);
        dup.trcvd = Time { wall: 2_000_000, mono: 900 };
        assert!(rec.record_receive(&dup, &Timestamp::default()));

        let d = rec.read();
        assert_eq!(d.duplicates, 1);
        assert_eq!(d.rtt_stats.n, 1);
        assert_eq!(d.round_trips[1].client.receive, first.client.receive);
    }

    #[test]
    fn unknown_seqno_is_rejected() {
        let rec = Recorder::new(4);
        send_n(&rec, 1);
        let p = reply_packet(5, 100);
        assert!(!rec.record_receive(&p, &Timestamp::default()));
    }

    #[test]
    fn late_packet_is_counted_and_ipdv_still_computes() {
        let rec = Recorder::new(4);
        send_n(&rec, 3);

        assert!(rec.record_receive(&reply_packet(0, 100), &Timestamp::default()));
        assert!(rec.record_receive(&reply_packet(2, 300), &Timestamp::default()));
        // seqno 1 arrives after 2
        assert!(rec.record_receive(&reply_packet(1, 400), &Timestamp::default()));

        let d = rec.read();
        assert_eq!(d.late_packets, 1);
        assert_eq!(d.duplicates, 0);
        assert_eq!(d.rtt_stats.n, 3);
        assert_eq!(d.rtt_ipdv_stats.n, 2);
    }

    #[test]
    fn server_processing_time_is_subtracted_from_rtt() {
        let rec = Recorder::new(2);
        send_n(&rec, 1);
        let send_mono = rec.read().round_trips[0].client.send.mono;

        let mut p = reply_packet(0, send_mono + 10_000);
        p.trcvd = Time { wall: 0, mono: send_mono + 10_000 };
        let sts = Timestamp {
            receive: Time { wall: 0, mono: 77_000 },
            send: Time { wall: 0, mono: 81_000 },
        };
        assert!(rec.record_receive(&p, &sts));

        let d = rec.read();
        assert_eq!(d.server_processing_stats.n, 1);
        assert_eq!(d.server_processing_stats.max, 4_000);
        assert_eq!(d.rtt_stats.max, 10_000 - 4_000);
    }

    #[test]
    fn midpoint_stamp_contributes_no_processing_time() {
        let rec = Recorder::new(2);
        send_n(&rec, 1);
        let send_mono = rec.read().round_trips[0].client.send.mono;
        let p = reply_packet(0, send_mono + 5_000);
        let mid = Time { wall: 9, mono: 9 };
        assert!(rec.record_receive(&p, &Timestamp { receive: mid, send: mid }));
        let d = rec.read();
        assert_eq!(d.server_processing_stats.n, 0);
        assert_eq!(d.rtt_stats.max, 5_000);
    }
}
