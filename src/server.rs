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

//! The echo server: one listener thread per bound address, each with its
//! own connection manager and packet pool, so per-connection state never
//! crosses threads.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::connmgr::{ConnMgr, Denied, SConn};
use crate::error::{Error, Result};
use crate::event::{emit, Code};
use crate::fill::{parse_filler, Filler};
use crate::protocol::packet::{Packet, FCLOSE_REQUEST, FECHO_REQUEST};
use crate::protocol::params::Params;
use crate::protocol::{flag, PROTOCOL_VERSION};
use crate::sock::{listen, resolve_listen_addrs, NetConn};
use crate::time::{Clock, StampAt, Time, Timestamp};
use crate::utils::cancel::CancelToken;
use crate::utils::cpu_affinity::CpuAffinityManager;

// how often a blocked receive wakes up to check for shutdown
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

// receive buffer capacity when the path MTU is unknown
const MAX_MTU: usize = 64 * 1024;

// number of packets the per-listener pool retains
const PACKET_POOL_CAP: usize = 16;

/// Cloneable handle that stops a running server: listener sockets wake on
/// their next poll and the loops drain out.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<CancelToken>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.cancel();
    }
}

/// The echo server. Bind with [`listen`](Server::listen), then run with
/// [`serve`](Server::serve), which returns only after all listeners stop.
pub struct Server {
    cfg: Arc<ServerConfig>,
    listeners: Vec<Listener>,
    shutdown: Arc<CancelToken>,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Server {
        Server { cfg: Arc::new(cfg), listeners: Vec::new(), shutdown: Arc::new(CancelToken::new()) }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Binds a listener for every configured address.
    pub fn listen(&mut self) -> Result<()> {
        let addrs = resolve_listen_addrs(&self.cfg.addrs, crate::config::DEFAULT_PORT)?;
        for addr in addrs {
            let conn = listen(addr)?;
            let listener = Listener::new(self.cfg.clone(), conn, self.shutdown.clone())?;
            self.listeners.push(listener);
        }
        Ok(())
    }

    /// The bound listener addresses, useful with port 0.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(|l| l.conn.local_addr().ok()).collect()
    }

    /// Runs all listeners until shutdown. Individual listener failures are
    /// surfaced as events and stop the whole server.
    pub fn serve(mut self) -> Result<()> {
        if self.listeners.is_empty() {
            self.listen()?;
        }
        emit(&self.cfg.handler, Code::ServerStart, None, None, "starting server".to_string());

        let affinity = Arc::new(Mutex::new(CpuAffinityManager::new(self.cfg.thread_lock)));
        let shutdown = self.shutdown.clone();
        let cfg = self.cfg.clone();

        let mut handles = Vec::new();
        for mut l in self.listeners.drain(..) {
            let local = l.conn.local_addr().ok();
            let name = local.map(|a| a.to_string()).unwrap_or_else(|| "listener".to_string());
            emit(
                &cfg.handler,
                Code::ListenerStart,
                local,
                None,
                format!("starting listener on {}", name),
            );
            let c_shutdown = shutdown.clone();
            let c_cfg = cfg.clone();
            let c_affinity = affinity.clone();
            let c_name = name.clone();
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || {
                    c_affinity.lock().unwrap().set_affinity();
                    let res = l.run();
                    match &res {
                        Ok(()) => emit(
                            &c_cfg.handler,
                            Code::ListenerStop,
                            local,
                            None,
                            format!("stopped listener on {}", c_name),
                        ),
                        Err(e) => {
                            emit(
                                &c_cfg.handler,
                                Code::ListenerError,
                                local,
                                None,
                                format!("error for listener on {} ({})", c_name, e),
                            );
                            // out of caution, one listener failing stops
                            // the others
                            c_shutdown.cancel();
                        }
                    }
                    res
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        for h in handles {
            if let Err(e) = h.join() {
                log::error!("listener thread panicked: {:?}", e);
            }
        }
        emit(&cfg.handler, Code::ServerStop, None, None, "stopped server".to_string());
        Ok(())
    }

    pub fn listen_and_serve(mut self) -> Result<()> {
        if self.listeners.is_empty() {
            self.listen()?;
        }
        self.serve()
    }
}

/// Pools packets so the hot path reuses buffers instead of allocating.
struct PacketPool {
    pool: Vec<Packet>,
    tlen: usize,
    cap: usize,
    hmac_key: Option<Vec<u8>>,
}

impl PacketPool {
    fn new(tlen: usize, cap: usize, hmac_key: Option<Vec<u8>>) -> PacketPool {
        PacketPool { pool: Vec::with_capacity(PACKET_POOL_CAP), tlen, cap, hmac_key }
    }

    fn get(&mut self) -> Packet {
        match self.pool.pop() {
            Some(mut p) => {
                p.reset();
                p
            }
            None => Packet::new(self.tlen, self.cap, self.hmac_key.as_deref()),
        }
    }

    fn put(&mut self, p: Packet) {
        if self.pool.len() < PACKET_POOL_CAP {
            self.pool.push(p);
        }
    }
}

/// A single-threaded event loop for one bound address.
struct Listener {
    cfg: Arc<ServerConfig>,
    conn: NetConn,
    cmgr: ConnMgr,
    pool: PacketPool,
    filler: Option<Box<dyn Filler>>,
    shutdown: Arc<CancelToken>,
}

impl Listener {
    fn new(
        cfg: Arc<ServerConfig>,
        mut conn: NetConn,
        shutdown: Arc<CancelToken>,
    ) -> Result<Listener> {
        if cfg.ttl != 0 {
            conn.set_ttl(cfg.ttl)?;
        }
        let filler = parse_filler(&cfg.fill)?;
        let cmgr = ConnMgr::new(cfg.packet_burst, cfg.min_interval);
        let pool = PacketPool::new(0, MAX_MTU, cfg.hmac_key.clone());
        Ok(Listener { cfg, conn, cmgr, pool, filler, shutdown })
    }

    fn run(&mut self) -> Result<()> {
        if self.cfg.allow_dscp {
            if let Err(e) = self.conn.dscp_support.clone() {
                self.eventf(Code::NoDscpSupport, None, format!("no DSCP support available ({})", e));
            }
        }
        if self.cfg.set_src_ip {
            if let Ok(a) = self.conn.local_addr() {
                if a.ip().is_unspecified() {
                    self.eventf(
                        Code::NoReceiveDstAddrSupport,
                        None,
                        "no support for determining the packet destination address".to_string(),
                    );
                }
            }
        }
        self.conn.set_read_timeout(Some(POLL_TIMEOUT))?;

        let mut p = self.pool.get();
        let res = self.read_and_reply(&mut p);
        self.pool.put(p);
        res
    }

    fn read_and_reply(&mut self, p: &mut Packet) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            match self.read_one_and_reply(p) {
                Ok(()) => {}
                Err(e) if e.is_temporary() => {}
                Err(e @ Error::Io(_)) => return Err(e),
                Err(e) => {
                    // a protocol problem in one datagram drops it, it does
                    // not stop the listener
                    self.eventf(Code::Drop, p.raddr, e.to_string());
                }
            }
        }
    }

    fn read_one_and_reply(&mut self, p: &mut Packet) -> Result<()> {
        let (n, raddr) = self.conn.socket().recv_from(p.read_to())?;
        p.trcvd = Time::now(Clock::Both);
        p.raddr = Some(raddr);
        p.read_reset(n)?;

        if p.reply() {
            return Err(Error::UnexpectedReplyFlag);
        }

        if p.flags() & flag::OPEN != 0 {
            return self.accept(p);
        }

        if p.flags() & flag::CLOSE != 0 {
            return self.serve_close(p);
        }

        self.serve_echo(p)
    }

    /// Handles an open request: parse and restrict params, register the
    /// connection unless the packet is an open-close, and echo the
    /// restricted params in the reply.
    fn accept(&mut self, p: &mut Packet) -> Result<()> {
        let raddr = p.raddr.expect("receive sets the remote address");
        let mut params = match Params::parse(p.payload()) {
            Ok(params) => params,
            Err(e) => {
                self.eventf(Code::DropUnparseableParams, Some(raddr), e.to_string());
                return Ok(());
            }
        };
        let requested_version = params.proto_version;
        self.restrict_params(&mut params);

        let mut ctoken = 0u64;
        if requested_version != PROTOCOL_VERSION {
            self.eventf(
                Code::ProtocolVersionMismatch,
                Some(raddr),
                format!(
                    "close connection, client version {} != server version {}",
                    requested_version, PROTOCOL_VERSION
                ),
            );
            p.set_flag_bits(flag::CLOSE);
        } else if p.flags() & flag::CLOSE != 0 {
            self.eventf(Code::OpenClose, Some(raddr), "open-close connection".to_string());
        } else {
            let filler = conn_filler(&params);
            let sc = SConn::new(raddr, params.clone(), filler, self.cfg.packet_burst);
            ctoken = self.cmgr.put(sc);
            self.eventf(
                Code::NewConn,
                Some(raddr),
                format!("new connection, token={:016x}", ctoken),
            );
        }

        p.set_ctoken(ctoken);
        p.set_reply(true);
        p.set_payload(&params.encode());
        p.update_hmac();
        self.send(p, raddr)
    }

    fn serve_close(&mut self, p: &mut Packet) -> Result<()> {
        let raddr = p.raddr.expect("receive sets the remote address");
        p.add_fields(FCLOSE_REQUEST, false)?;
        let ctoken = p.ctoken();

        // verify the address before dropping the conn, so a spoofed close
        // cannot tear down someone else's session
        let expected = match self.cmgr.get_mut(ctoken) {
            None => None,
            Some(sc) => Some(sc.raddr),
        };
        match expected {
            None => {
                self.eventf(
                    Code::DropInvalidConnToken,
                    Some(raddr),
                    format!("close for invalid conn token {:016x}", ctoken),
                );
            }
            Some(expected) if expected != raddr => {
                self.eventf(
                    Code::DropAddressMismatch,
                    Some(raddr),
                    format!(
                        "drop close due to address mismatch (expected {} for {:016x})",
                        expected, ctoken
                    ),
                );
            }
            Some(_) => {
                let sc = self.cmgr.remove(ctoken).expect("present above");
                if sc.first_used.is_none() {
                    // opened and closed without ever echoing
                    self.eventf(
                        Code::OpenClose,
                        Some(raddr),
                        format!("open-close connection, token={:016x}", sc.ctoken),
                    );
                } else {
                    self.eventf(
                        Code::CloseConn,
                        Some(raddr),
                        format!(
                            "close connection, token={:016x}, {} bytes served",
                            sc.ctoken, sc.bytes
                        ),
                    );
                }
            }
        }
        // closes are not replied to
        Ok(())
    }

    fn serve_echo(&mut self, p: &mut Packet) -> Result<()> {
        let raddr = p.raddr.expect("receive sets the remote address");
        p.add_fields(FECHO_REQUEST, false)?;

        let ctoken = p.ctoken();
        let seqno = p.seqno();
        let denied = match self.cmgr.admit(ctoken, raddr, seqno) {
            Ok(_) => None,
            Err(d) => Some(d),
        };
        match denied {
            Some(Denied::NoConn) => {
                self.eventf(
                    Code::DropInvalidConnToken,
                    Some(raddr),
                    format!("request for invalid conn token {:016x}", ctoken),
                );
                return Ok(());
            }
            Some(Denied::AddrMismatch(expected)) => {
                self.eventf(
                    Code::DropAddressMismatch,
                    Some(raddr),
                    format!(
                        "drop request due to address mismatch (expected {} for {:016x})",
                        expected, ctoken
                    ),
                );
                return Ok(());
            }
            Some(Denied::ShortInterval) => {
                self.eventf(
                    Code::DropShortInterval,
                    Some(raddr),
                    "drop request due to short packet interval".to_string(),
                );
                return Ok(());
            }
            None => {}
        }

        if self.cfg.max_length > 0 && p.length() > self.cfg.max_length {
            self.eventf(
                Code::DropTooLarge,
                Some(raddr),
                format!("request too large ({} > {})", p.length(), self.cfg.max_length),
            );
            return Ok(());
        }

        p.set_reply(true);

        // copy out what the reply needs so the manager borrow ends before
        // any events fire
        let (received_count, received_window, stats, at, cl, length, dscp, first_used) = {
            let sc = self.cmgr.get_mut(ctoken).expect("admitted above");
            (
                sc.received_count,
                if sc.rwin_valid { sc.received_window } else { 0 },
                sc.params.received_stats,
                sc.params.stamp_at,
                sc.params.clock.unwrap_or(Clock::Both),
                sc.params.length,
                sc.params.dscp,
                sc.first_used,
            )
        };

        // close when the test has overstayed max duration plus grace, but
        // still return the packet
        let mut closing = false;
        if let (Some(max_duration), Some(first_used)) = (self.cfg.max_duration, first_used) {
            if Instant::now().duration_since(first_used) > max_duration + self.cfg.grace {
                closing = true;
            }
        }

        if self.cfg.allow_dscp && self.conn.dscp_support.is_ok() {
            p.dscp = dscp;
        }

        // lay out the reply fields, then pad to the negotiated length
        p.set_len(0);
        if stats.count() {
            p.set_received_count(received_count);
        }
        if stats.window() {
            p.set_received_window(received_window);
        }

        if at != StampAt::None {
            let mut rt = Time::default();
            let mut st = Time::default();
            if at.midpoint() {
                let mt = p.trcvd.midpoint(&Time::now(Clock::Both)).keep_clocks(cl);
                rt = mt;
                st = mt;
            } else {
                if at.at_receive() {
                    rt = p.trcvd.keep_clocks(cl);
                }
                if at.at_send() {
                    st = Time::now(cl);
                }
            }
            p.set_timestamp(Timestamp { receive: rt, send: st });
        } else {
            p.remove_timestamps();
        }

        p.set_len(length);

        let filled = {
            let sc = self.cmgr.get_mut(ctoken).expect("admitted above");
            sc.bytes += p.length() as u64;
            match sc.filler.as_mut() {
                Some(f) => {
                    p.read_payload(f.as_mut());
                    true
                }
                None => false,
            }
        };
        if !filled {
            match self.filler.as_mut() {
                Some(f) => p.read_payload(f.as_mut()),
                None => p.zero_payload(),
            }
        }

        if closing {
            self.eventf(
                Code::DurationLimitExceeded,
                Some(raddr),
                "closing connection due to duration limit exceeded".to_string(),
            );
            self.cmgr.remove(ctoken);
            p.set_flag_bits(flag::CLOSE);
        }

        p.update_hmac();
        self.send(p, raddr)
    }

    fn send(&mut self, p: &Packet, raddr: SocketAddr) -> Result<()> {
        // applied lazily; a no-op when the value is unchanged
        if let Err(e) = self.conn.set_dscp(p.dscp) {
            log::debug!("unable to set DSCP {} ({})", p.dscp, e);
        }
        let n = self.conn.socket().send_to(p.bytes(), raddr)?;
        if n < p.length() {
            return Err(Error::ShortWrite { n, len: p.length() });
        }
        Ok(())
    }

    /// Clamps the client's requested params to this server's limits. The
    /// restricted values are echoed back verbatim in the open reply.
    fn restrict_params(&self, params: &mut Params) {
        params.proto_version = PROTOCOL_VERSION;
        if let Some(max_duration) = self.cfg.max_duration {
            if params.duration > max_duration {
                params.duration = max_duration;
            }
        }
        if let Some(min_interval) = self.cfg.min_interval {
            if params.interval < min_interval {
                params.interval = min_interval;
            }
        }
        // length is clamped to the configured maximum and to what the
        // receive buffer can actually hold
        let mut max_length = MAX_MTU;
        if self.cfg.max_length > 0 {
            max_length = max_length.min(self.cfg.max_length);
        }
        if params.length > max_length {
            params.length = max_length;
        }
        params.stamp_at = self.cfg.allow_stamp.restrict(params.stamp_at);
        if !self.cfg.allow_dscp || self.conn.dscp_support.is_err() {
            params.dscp = 0;
        }
        if !params.server_fill.is_empty() && !self.fill_allowed(&params.server_fill) {
            params.server_fill = String::new();
        }
    }

    fn fill_allowed(&self, fill: &str) -> bool {
        self.cfg.allow_fills.iter().any(|prefix| fill.starts_with(prefix.as_str()))
    }

    fn eventf(&self, code: Code, raddr: Option<SocketAddr>, msg: String) {
        emit(&self.cfg.handler, code, self.conn.local_addr().ok(), raddr, msg);
    }
}

/// A filler for the connection's negotiated server fill, when one was
/// requested and allowed.
fn conn_filler(params: &Params) -> Option<Box<dyn Filler>> {
    if params.server_fill.is_empty() {
        return None;
    }
    parse_filler(&params.server_fill).ok().flatten()
}
