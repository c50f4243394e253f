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

//! The client engine: open handshake with retransmission, the isochronous
//! send loop with timer-error compensation, the receive loop, the
//! wait-for-tail, and the close packet on the way out.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{ClientConfig, MIN_RESTRICTED_INTERVAL};
use crate::error::{Error, Result};
use crate::event::{emit, Code};
use crate::fill::Filler;
use crate::protocol::packet::{
    Packet, FCLOSE_REQUEST, FECHO_REPLY, FECHO_REQUEST, FOPEN_REPLY, MAX_HEADER_LEN,
};
use crate::protocol::params::{Params, PARAMS_MAX_LEN};
use crate::protocol::{flag, PROTOCOL_VERSION};
use crate::recorder::Recorder;
use crate::result::TestResult;
use crate::sock::{dial, Df, NetConn};
use crate::time::{dur_to_nanos, mono_now, Clock, Time};
use crate::timer::Timer;
use crate::utils::cancel::CancelToken;
use crate::utils::cpu_affinity::CpuAffinityManager;

// how often blocked reads wake up to check for close or cancellation
const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// The test client. Create one per test with [`new`](Client::new), grab a
/// [`cancel_handle`](Client::cancel_handle) if the test may need to be
/// interrupted, then call [`run`](Client::run) once.
pub struct Client {
    cfg: ClientConfig,
    cancel: Arc<CancelToken>,
}

struct OpenOutcome {
    ctoken: u64,
    params: Params,
    closed: bool,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Client {
        Client { cfg, cancel: Arc::new(CancelToken::new()) }
    }

    /// A handle that cancels the running test. Cancellation is not a
    /// failure: `run` returns the partial results with the cancellation
    /// recorded.
    pub fn cancel_handle(&self) -> Arc<CancelToken> {
        self.cancel.clone()
    }

    /// Runs the test and returns the results. An error is returned only
    /// when the test could not be started; failures during the test leave
    /// their errors in the result's send and receive error fields.
    pub fn run(mut self) -> Result<TestResult> {
        self.cfg.validate()?;
        let supplied = self.cfg.params.clone();

        let handler = self.cfg.handler.clone();
        emit(
            &handler,
            Code::Connecting,
            None,
            None,
            format!("connecting to {}", self.cfg.remote_address),
        );

        let (mut conn, raddr) =
            dial(self.cfg.local_address.as_deref(), &self.cfg.remote_address)?;
        let laddr = conn.local_addr().ok();
        let ev = |code: Code, msg: String| emit(&handler, code, laddr, Some(raddr), msg);

        let cap = supplied.length.max(MAX_HEADER_LEN + PARAMS_MAX_LEN);
        let mut spkt = Packet::new(0, cap, self.cfg.hmac_key.as_deref());
        let mut rpkt = Packet::new(0, cap, self.cfg.hmac_key.as_deref());

        let open = match self.open(&conn, &mut spkt, &mut rpkt)? {
            Some(open) => open,
            // cancelled before the server answered
            None => {
                return Ok(TestResult::finalize(&Recorder::new(0), supplied, None, None, true))
            }
        };
        let params = open.params.clone();

        if let Err(e) = self.check_parameters(&ev, &supplied, &params) {
            close_conn(&conn, &mut spkt, open.ctoken);
            return Err(e);
        }

        if open.closed {
            ev(Code::ConnectedClosed, "connection accepted and closed".to_string());
            return Ok(TestResult::finalize(
                &Recorder::new(0),
                params,
                None,
                None,
                self.cancel.is_cancelled(),
            ));
        }
        ev(Code::Connected, "connection established".to_string());

        if self.cfg.no_test {
            // open, then close immediately
            ev(Code::NoTest, "skipping test at user request".to_string());
            let result = TestResult::finalize(&Recorder::new(0), params, None, None, false);
            close_conn(&conn, &mut spkt, open.ctoken);
            return Ok(result);
        }

        // apply socket options now that the parameters are settled;
        // failing to set a requested non-default value is an error
        if let Err(e) = apply_sockopts(&mut conn, &params, self.cfg.df, self.cfg.ttl) {
            close_conn(&conn, &mut spkt, open.ctoken);
            return Err(e);
        }

        // prepare the echo request packet once; it is reused for every send
        spkt.add_fields(FECHO_REQUEST, true)?;
        spkt.set_ctoken(open.ctoken);
        spkt.set_seqno(0);
        spkt.zero_received_stats(params.received_stats);
        let clock = params.clock.unwrap_or(Clock::Both);
        spkt.stamp_zeroes(params.stamp_at, clock);
        let length = spkt.set_len(params.length);
        match self.cfg.filler.as_mut() {
            Some(f) => spkt.read_payload(f.as_mut()),
            None => spkt.zero_payload(),
        }
        spkt.update_hmac();

        let expected = pcount(&params);
        let rec = Recorder::new(expected);
        let closed = AtomicBool::new(false);

        let rsock = conn.try_clone_socket()?;
        rsock.set_read_timeout(Some(RECEIVE_POLL))?;

        let affinity = Mutex::new(CpuAffinityManager::new(self.cfg.thread_lock));

        let cancel = &self.cancel;
        let cfg = &mut self.cfg;
        let mut send_err = None;
        let mut receive_err = None;

        thread::scope(|s| {
            let receiver = s.spawn(|| {
                affinity.lock().unwrap().set_affinity();
                receive_loop(&rsock, &mut rpkt, &rec, &closed, &params, length)
            });

            affinity.lock().unwrap().set_affinity();
            send_err = send_loop(
                &conn,
                &mut spkt,
                &rec,
                cancel,
                cfg.timer.as_mut(),
                cfg.filler.as_mut(),
                cfg.fill_one,
                &params,
            );

            // wait for the reply tail before tearing the receiver down
            if send_err.is_none() && !cancel.is_cancelled() {
                let outstanding = {
                    let d = rec.read();
                    d.rtt_stats.n < d.send_call_stats.n
                };
                if outstanding {
                    let dwait = cfg.waiter.wait(&rec);
                    if !dwait.is_zero() {
                        rec.set_wait(dur_to_nanos(dwait));
                        ev(
                            Code::WaitForPackets,
                            format!("waiting {:?} for final packets", dwait),
                        );
                        let _ = cancel.wait_timeout(dwait);
                    }
                }
            }

            closed.store(true, Ordering::SeqCst);
            receive_err = match receiver.join() {
                Ok(r) => r,
                Err(e) => {
                    log::error!("receive thread panicked: {:?}", e);
                    None
                }
            };
        });

        close_conn(&conn, &mut spkt, open.ctoken);

        Ok(TestResult::finalize(
            &rec,
            params,
            send_err,
            receive_err,
            self.cancel.is_cancelled(),
        ))
    }

    /// The open handshake: retransmit OPEN on a widening timeout schedule
    /// and accept the first conforming reply. Returns None when cancelled.
    fn open(
        &self,
        conn: &NetConn,
        spkt: &mut Packet,
        rpkt: &mut Packet,
    ) -> Result<Option<OpenOutcome>> {
        spkt.set_flag_bits(flag::OPEN);
        spkt.set_payload(&self.cfg.params.encode());
        spkt.update_hmac();

        let mut outcome: Option<OpenOutcome> = None;
        'rounds: for &to in &self.cfg.open_timeouts {
            send_packet(conn.socket(), spkt)?;
            let deadline = Instant::now() + to;
            loop {
                if self.cancel.is_cancelled() {
                    return Ok(None);
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                conn.set_read_timeout(Some((deadline - now).min(RECEIVE_POLL)))?;
                let n = match conn.socket().recv(rpkt.read_to()) {
                    Ok(n) => n,
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock
                                | std::io::ErrorKind::TimedOut
                                | std::io::ErrorKind::Interrupted
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                rpkt.read_reset(n)?;
                if !rpkt.reply() {
                    return Err(Error::ExpectedReplyFlag);
                }
                if rpkt.flags() & flag::OPEN == 0 {
                    if rpkt.flags() & flag::CLOSE != 0 {
                        return Err(Error::ServerClosed);
                    }
                    // not an open reply; keep waiting
                    continue;
                }
                rpkt.add_fields(FOPEN_REPLY, false)?;
                let closed = rpkt.flags() & flag::CLOSE != 0;
                let ctoken = rpkt.ctoken();
                if !closed && ctoken == 0 {
                    return Err(Error::ConnTokenZero);
                }
                let params = Params::parse(rpkt.payload())?;
                outcome = Some(OpenOutcome { ctoken, params, closed });
                break 'rounds;
            }
        }

        match outcome {
            Some(o) => {
                // return the send packet to its pre-open state
                spkt.clear_flag_bits(flag::OPEN | flag::CLOSE);
                spkt.set_payload(&[]);
                spkt.set_ctoken(o.ctoken);
                Ok(Some(o))
            }
            None => Err(Error::OpenTimeout),
        }
    }

    /// Applies the parameter drift policy after the open: restrictions are
    /// events (errors in strict mode); any widening, or an interval below
    /// the hard floor, is always an error.
    fn check_parameters(
        &self,
        ev: &dyn Fn(Code, String),
        supplied: &Params,
        returned: &Params,
    ) -> Result<()> {
        if returned.proto_version != PROTOCOL_VERSION {
            return Err(Error::ProtocolVersionMismatch {
                client: PROTOCOL_VERSION,
                server: returned.proto_version,
            });
        }

        let restricted = |msg: String| -> Result<()> {
            if self.cfg.strict {
                Err(Error::ParamsChanged(msg))
            } else {
                ev(Code::ServerRestriction, msg);
                Ok(())
            }
        };

        if returned.duration < supplied.duration {
            restricted(format!(
                "server reduced duration from {:?} to {:?}",
                supplied.duration, returned.duration
            ))?;
        }
        if returned.duration > supplied.duration {
            return Err(Error::InvalidServerRestriction(format!(
                "server tried to increase duration from {:?} to {:?}",
                supplied.duration, returned.duration
            )));
        }
        if returned.interval > supplied.interval {
            restricted(format!(
                "server increased interval from {:?} to {:?}",
                supplied.interval, returned.interval
            ))?;
        }
        if returned.interval < supplied.interval {
            if returned.interval < MIN_RESTRICTED_INTERVAL {
                return Err(Error::InvalidServerRestriction(format!(
                    "server tried to reduce interval below {:?}, from {:?} to {:?}",
                    MIN_RESTRICTED_INTERVAL, supplied.interval, returned.interval
                )));
            }
            restricted(format!(
                "server reduced interval from {:?} to {:?}",
                supplied.interval, returned.interval
            ))?;
        }
        if returned.length < supplied.length {
            restricted(format!(
                "server reduced length from {} to {}",
                supplied.length, returned.length
            ))?;
        }
        if returned.length > supplied.length {
            return Err(Error::InvalidServerRestriction(format!(
                "server tried to increase length from {} to {}",
                supplied.length, returned.length
            )));
        }
        if returned.stamp_at != supplied.stamp_at {
            restricted(format!(
                "server restricted timestamps from {} to {}",
                supplied.stamp_at, returned.stamp_at
            ))?;
        }
        if returned.clock != supplied.clock {
            let fmt = |c: &Option<Clock>| c.map(|c| c.to_string()).unwrap_or_default();
            restricted(format!(
                "server restricted clocks from {} to {}",
                fmt(&supplied.clock),
                fmt(&returned.clock)
            ))?;
        }
        if returned.dscp != supplied.dscp {
            restricted("server doesn't support DSCP".to_string())?;
        }
        if returned.server_fill != supplied.server_fill {
            restricted(format!(
                "server restricted fill from {} to {}",
                supplied.server_fill, returned.server_fill
            ))?;
        }
        Ok(())
    }
}

/// Sends all packets for the test on an isochronous schedule. Returns the
/// send error, or None on success or cancellation.
#[allow(clippy::too_many_arguments)]
fn send_loop(
    conn: &NetConn,
    spkt: &mut Packet,
    rec: &Recorder,
    cancel: &CancelToken,
    timer: &mut dyn Timer,
    mut filler: Option<&mut Box<dyn Filler>>,
    fill_one: bool,
    params: &Params,
) -> Option<Error> {
    let t0 = Time::now(Clock::Both);
    rec.set_start(t0);
    let duration = dur_to_nanos(params.duration);
    let interval = dur_to_nanos(params.interval).max(1);
    let end = t0.mono + duration;

    let mut seqno: u32 = 0;
    loop {
        // send, stamping times right before and after
        let tsend = rec.record_pre_send();
        let res = conn.socket().send(spkt.bytes());
        let tsent = Time::now(Clock::Both);
        match res {
            Ok(n) if n < spkt.length() => {
                rec.remove_last_stamps();
                return Some(Error::ShortWrite { n, len: spkt.length() });
            }
            Ok(_) => {}
            Err(e) => {
                rec.remove_last_stamps();
                return Some(e.into());
            }
        }
        rec.record_post_send(tsend, tsent, spkt.length() as u64);

        // prepare the next packet before sleeping, so the next send time
        // is as precise as possible
        seqno = seqno.wrapping_add(1);
        spkt.set_seqno(seqno);
        if let Some(f) = filler.as_mut() {
            if !fill_one {
                spkt.read_payload(f.as_mut());
            }
        }
        spkt.update_hmac();

        // align the next send on an interval boundary; past the halfway
        // point of an interval, skip ahead to the one after
        let mut tnext = t0.mono + interval * ((mono_now() - t0.mono) / interval);
        if (tsent.mono - t0.mono) % interval < interval / 2 {
            tnext += interval;
        } else {
            tnext += 2 * interval;
        }
        if tnext >= end {
            return None;
        }

        let tsleep = mono_now();
        match timer.sleep(cancel, tsleep, tnext - tsleep) {
            Ok(t) => rec.record_timer_err((t - tsleep) - (tnext - tsleep)),
            Err(_) => return None,
        }
    }
}

/// Receives replies until the test closes. Returns the receive error, or
/// None on a clean stop.
fn receive_loop(
    sock: &UdpSocket,
    rpkt: &mut Packet,
    rec: &Recorder,
    closed: &AtomicBool,
    params: &Params,
    min_length: usize,
) -> Option<Error> {
    loop {
        let n = match sock.recv(rpkt.read_to()) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                if closed.load(Ordering::SeqCst) {
                    return None;
                }
                continue;
            }
            Err(e) => {
                return if closed.load(Ordering::SeqCst) { None } else { Some(e.into()) };
            }
        };
        rpkt.trcvd = Time::now(Clock::Both);

        if let Err(e) = process_reply(rpkt, n, rec, params, min_length) {
            return if closed.load(Ordering::SeqCst) { None } else { Some(e) };
        }
    }
}

fn process_reply(
    rpkt: &mut Packet,
    n: usize,
    rec: &Recorder,
    params: &Params,
    min_length: usize,
) -> Result<()> {
    rpkt.read_reset(n)?;
    if !rpkt.reply() {
        return Err(Error::ExpectedReplyFlag);
    }
    if rpkt.flags() & flag::CLOSE != 0 {
        return Err(Error::ServerClosed);
    }
    if rpkt.flags() & flag::OPEN != 0 {
        return Err(Error::UnexpectedOpenFlag);
    }

    rpkt.add_fields(FECHO_REPLY, false)?;
    if rpkt.length() < min_length {
        return Err(Error::ShortReply { len: rpkt.length(), expected: min_length });
    }

    // interpret the stats and timestamps the test asked for
    rpkt.add_received_stats_fields(params.received_stats)?;
    let clock = params.clock.unwrap_or(Clock::Both);
    rpkt.add_timestamp_fields(params.stamp_at, clock)?;

    let at = rpkt.stamp_at();
    if at != params.stamp_at {
        return Err(Error::StampAtMismatch { got: at, requested: params.stamp_at });
    }
    if at != crate::time::StampAt::None {
        if let Some(got) = rpkt.clock() {
            if got != clock {
                return Err(Error::ClockMismatch { got, requested: clock });
            }
        }
    }

    let sts = rpkt.timestamp();
    if !rec.record_receive(rpkt, &sts) {
        return Err(Error::UnexpectedSequenceNumber(rpkt.seqno()));
    }
    Ok(())
}

/// Sends one close packet if a token is held. Errors only get logged; the
/// server expires the conn anyway if the close is lost.
fn close_conn(conn: &NetConn, spkt: &mut Packet, ctoken: u64) {
    if ctoken == 0 {
        return;
    }
    if let Err(e) = (|| -> Result<()> {
        spkt.set_fields(FCLOSE_REQUEST, true)?;
        spkt.set_flag_bits(flag::CLOSE);
        spkt.set_ctoken(ctoken);
        spkt.update_hmac();
        send_packet(conn.socket(), spkt)
    })() {
        log::debug!("unable to send close packet ({})", e);
    }
}

fn apply_sockopts(conn: &mut NetConn, params: &Params, df: Df, ttl: u32) -> Result<()> {
    if params.dscp != 0 {
        conn.set_dscp(params.dscp)?;
    }
    if df != Df::Default {
        conn.set_df(df)?;
    }
    if ttl != 0 {
        conn.set_ttl(ttl)?;
    }
    Ok(())
}

fn send_packet(sock: &UdpSocket, p: &Packet) -> Result<()> {
    let n = sock.send(p.bytes())?;
    if n < p.length() {
        return Err(Error::ShortWrite { n, len: p.length() });
    }
    Ok(())
}

/// The number of packets a test of this duration and interval sends.
fn pcount(params: &Params) -> usize {
    let d = dur_to_nanos(params.duration);
    let i = dur_to_nanos(params.interval).max(1);
    1 + (d / i) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use std::time::Duration;

    fn params(duration_ms: u64, interval_ms: u64) -> Params {
        Params {
            duration: Duration::from_millis(duration_ms),
            interval: Duration::from_millis(interval_ms),
            ..Params::default()
        }
    }

    #[test]
    fn pcount_includes_the_first_packet() {
        assert_eq!(pcount(&params(1000, 100)), 11);
        assert_eq!(pcount(&params(100, 100)), 2);
        assert_eq!(pcount(&params(50, 100)), 1);
    }

    fn check(supplied: Params, returned: Params, strict: bool) -> Result<()> {
        let mut cfg = ClientConfig::new("localhost");
        cfg.strict = strict;
        cfg.params = supplied.clone();
        let client = Client::new(cfg);
        client.check_parameters(&|_, _| {}, &supplied, &returned)
    }

    fn base() -> Params {
        Params {
            proto_version: PROTOCOL_VERSION,
            duration: Duration::from_secs(10),
            interval: Duration::from_millis(100),
            length: 172,
            ..Params::default()
        }
    }

    #[test]
    fn unchanged_params_pass() {
        check(base(), base(), true).unwrap();
    }

    #[test]
    fn reduction_is_fine_unless_strict() {
        let mut returned = base();
        returned.duration = Duration::from_secs(2);
        check(base(), returned.clone(), false).unwrap();
        assert!(matches!(check(base(), returned, true), Err(Error::ParamsChanged(_))));
    }

    #[test]
    fn widening_is_always_an_error() {
        let mut returned = base();
        returned.length = 9999;
        assert!(matches!(
            check(base(), returned, false),
            Err(Error::InvalidServerRestriction(_))
        ));
    }

    #[test]
    fn interval_below_floor_is_always_an_error() {
        let mut returned = base();
        returned.interval = Duration::from_millis(1);
        assert!(matches!(
            check(base(), returned, false),
            Err(Error::InvalidServerRestriction(_))
        ));
    }

    #[test]
    fn version_mismatch_is_an_error() {
        let mut returned = base();
        returned.proto_version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            check(base(), returned, false),
            Err(Error::ProtocolVersionMismatch { .. })
        ));
    }
}
