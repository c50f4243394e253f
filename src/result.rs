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

use serde::{Serialize, Serializer};

use crate::error::Error;
use crate::protocol::params::Params;
use crate::recorder::{DurationStats, Recorder, RoundTripData};
use crate::time::{Time, INVALID_DURATION};

/// The lost status of a packet. When the server reports received windows,
/// a loss can be attributed to the upstream or downstream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lost {
    #[serde(rename = "true")]
    True,
    #[serde(rename = "true_down")]
    TrueDown,
    #[serde(rename = "true_up")]
    TrueUp,
    #[serde(rename = "false")]
    False,
}

/// A serializable summary of a DurationStats, with the median filled in
/// from per-packet samples where available.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DurationStatsSummary {
    pub n: u64,
    pub min: i64,
    pub max: i64,
    pub total: i64,
    pub mean: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub median: Option<i64>,
    pub stddev: i64,
    pub variance: f64,
}

impl DurationStatsSummary {
    fn new(s: &DurationStats, median: Option<i64>) -> DurationStatsSummary {
        DurationStatsSummary {
            n: s.n,
            min: if s.n == 0 { 0 } else { s.min },
            max: if s.n == 0 { 0 } else { s.max },
            total: s.total,
            mean: s.mean(),
            median,
            stddev: s.stddev(),
            variance: s.variance(),
        }
    }
}

/// TestResult is the final outcome of a client run, with partial data
/// preserved when either loop failed or the test was cancelled.
#[derive(Serialize)]
pub struct TestResult {
    /// the negotiated test parameters
    pub params: Params,
    pub start_time: Time,

    pub packets_sent: u64,
    pub packets_received: u64,
    pub duplicates: u64,
    pub late_packets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub server_packets_received: u32,

    pub packet_loss_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_loss_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downstream_loss_percent: Option<f64>,

    pub rtt: DurationStatsSummary,
    pub send_call: DurationStatsSummary,
    pub timer_error: DurationStatsSummary,
    pub send_delay: DurationStatsSummary,
    pub receive_delay: DurationStatsSummary,
    pub server_processing: DurationStatsSummary,
    pub ipdv_round_trip: DurationStatsSummary,
    pub ipdv_send: DurationStatsSummary,
    pub ipdv_receive: DurationStatsSummary,

    /// nanoseconds waited for the reply tail
    pub wait: i64,

    #[serde(serialize_with = "ser_opt_err")]
    pub send_err: Option<Error>,
    #[serde(serialize_with = "ser_opt_err")]
    pub receive_err: Option<Error>,
    pub cancelled: bool,

    #[serde(skip)]
    pub round_trips: Vec<RoundTripData>,
    /// per-seqno lost status, aligned with round_trips
    #[serde(skip)]
    pub lost: Vec<Lost>,
}

fn ser_opt_err<S: Serializer>(e: &Option<Error>, s: S) -> Result<S::Ok, S::Error> {
    match e {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

impl TestResult {
    pub(crate) fn finalize(
        rec: &Recorder,
        params: Params,
        send_err: Option<Error>,
        receive_err: Option<Error>,
        cancelled: bool,
    ) -> TestResult {
        let d = rec.read();

        let round_trips = d.round_trips.clone();
        let lost = lost_statuses(&round_trips);

        let packets_sent = d.send_call_stats.n;
        let packets_received = d.rtt_stats.n;
        let packet_loss_percent = if packets_sent > 0 {
            (packets_sent - packets_received) as f64 * 100.0 / packets_sent as f64
        } else {
            0.0
        };

        // directional loss needs the server's received count
        let (upstream_loss_percent, downstream_loss_percent) =
            if d.server_packets_received > 0 && packets_sent > 0 {
                let server_received = d.server_packets_received as u64;
                let up = packets_sent.saturating_sub(server_received) as f64 * 100.0
                    / packets_sent as f64;
                let down = server_received.saturating_sub(packets_received) as f64 * 100.0
                    / server_received as f64;
                (Some(up), Some(down))
            } else {
                (None, None)
            };

        let rtt_median = median(round_trips.iter().map(|r| r.rtt()));
        let send_delay_median = median(round_trips.iter().map(|r| r.send_delay()));
        let receive_delay_median = median(round_trips.iter().map(|r| r.receive_delay()));
        let processing_median = median(round_trips.iter().map(|r| r.server_processing_time()));

        TestResult {
            params,
            start_time: d.start,
            packets_sent,
            packets_received,
            duplicates: d.duplicates,
            late_packets: d.late_packets,
            bytes_sent: d.bytes_sent,
            bytes_received: d.bytes_received,
            server_packets_received: d.server_packets_received,
            packet_loss_percent,
            upstream_loss_percent,
            downstream_loss_percent,
            rtt: DurationStatsSummary::new(&d.rtt_stats, rtt_median),
            send_call: DurationStatsSummary::new(&d.send_call_stats, None),
            timer_error: DurationStatsSummary::new(&d.timer_error_stats, None),
            send_delay: DurationStatsSummary::new(&d.send_delay_stats, send_delay_median),
            receive_delay: DurationStatsSummary::new(&d.receive_delay_stats, receive_delay_median),
            server_processing: DurationStatsSummary::new(
                &d.server_processing_stats,
                processing_median,
            ),
            ipdv_round_trip: DurationStatsSummary::new(&d.rtt_ipdv_stats, None),
            ipdv_send: DurationStatsSummary::new(&d.send_ipdv_stats, None),
            ipdv_receive: DurationStatsSummary::new(&d.receive_ipdv_stats, None),
            wait: d.wait,
            send_err,
            receive_err,
            cancelled,
            round_trips,
            lost,
        }
    }
}

/// Resolves per-packet lost statuses. A missing reply is attributed to the
/// upstream or downstream direction when a later reply's received window
/// covers the sequence number.
fn lost_statuses(round_trips: &[RoundTripData]) -> Vec<Lost> {
    let mut lost = Vec::with_capacity(round_trips.len());
    for (i, rtd) in round_trips.iter().enumerate() {
        if rtd.reply_received() {
            lost.push(Lost::False);
            continue;
        }
        let mut status = Lost::True;
        for (m, later) in round_trips.iter().enumerate().skip(i + 1).take(63) {
            if !later.reply_received() || later.received_window == 0 {
                continue;
            }
            let delta = (m - i) as u32;
            if delta < 64 {
                status = if later.received_window & (1 << delta) != 0 {
                    // the server saw it, so the reply was lost
                    Lost::TrueDown
                } else {
                    Lost::TrueUp
                };
            }
            break;
        }
        lost.push(status);
    }
    lost
}

/// The median of the valid samples, None when there are none.
fn median<I: Iterator<Item = i64>>(samples: I) -> Option<i64> {
    let mut v: Vec<i64> = samples.filter(|&s| s != INVALID_DURATION).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_unstable();
    let n = v.len();
    if n % 2 == 1 {
        Some(v[n / 2])
    } else {
        Some((v[n / 2 - 1] + v[n / 2]) / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;

    fn received(window: u64) -> RoundTripData {
        RoundTripData {
            client: Timestamp {
                receive: Time { wall: 2, mono: 2 },
                send: Time { wall: 1, mono: 1 },
            },
            server: Timestamp::default(),
            received_window: window,
        }
    }

    #[test]
    fn median_of_samples() {
        assert_eq!(median([3i64, 1, 2].into_iter()), Some(2));
        assert_eq!(median([4i64, 1, 2, 3].into_iter()), Some(2));
        assert_eq!(median([INVALID_DURATION, 5].into_iter()), Some(5));
        assert_eq!(median(std::iter::empty()), None);
    }

    #[test]
    fn loss_direction_from_windows() {
        // seqno 1 is missing; seqno 2's window says the server received
        // seqnos 2 and 1, so the reply was lost downstream
        let rts = vec![received(0b1), RoundTripData::default(), received(0b11)];
        assert_eq!(lost_statuses(&rts), vec![Lost::False, Lost::TrueDown, Lost::False]);

        // seqno 2's window says the server did not see seqno 1
        let rts = vec![received(0b1), RoundTripData::default(), received(0b101)];
        assert_eq!(lost_statuses(&rts), vec![Lost::False, Lost::TrueUp, Lost::False]);

        // without window data, direction is unknown
        let rts = vec![received(0), RoundTripData::default(), received(0)];
        assert_eq!(lost_statuses(&rts), vec![Lost::False, Lost::True, Lost::False]);
    }
}
