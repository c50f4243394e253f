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

//! Server-side connection state, keyed by random 64-bit tokens. Each
//! listener owns one manager, so no locking is involved; the map is only
//! touched from that listener's thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::fill::Filler;
use crate::protocol::params::Params;
use crate::protocol::{Seqno, INVALID_SEQNO};

/// Time after which idle connections expire and may be removed.
pub(crate) const EXPIRATION_TIME: Duration = Duration::from_secs(60);

// number of entries to check for expiration on each put
const CHECK_EXPIRED_COUNT: usize = 5;

// initial capacity for the connection map
const SCONNS_INIT_SIZE: usize = 32;

/// The state for one client's connection to the server.
pub(crate) struct SConn {
    pub ctoken: u64,
    pub raddr: SocketAddr,
    pub params: Params,
    /// filler built from the negotiated server fill, when the client
    /// requested one the server allows
    pub filler: Option<Box<dyn Filler>>,
    pub first_used: Option<Instant>,
    pub last_used: Option<Instant>,
    pub packet_bucket: f64,
    pub last_seqno: Seqno,
    pub received_count: u32,
    pub received_window: u64,
    pub rwin_valid: bool,
    pub bytes: u64,
}

impl SConn {
    pub fn new(
        raddr: SocketAddr,
        params: Params,
        filler: Option<Box<dyn Filler>>,
        packet_burst: u32,
    ) -> SConn {
        SConn {
            ctoken: 0,
            raddr,
            params,
            filler,
            first_used: None,
            last_used: None,
            packet_bucket: packet_burst as f64,
            last_seqno: INVALID_SEQNO,
            received_count: 0,
            received_window: 0,
            rwin_valid: false,
            bytes: 0,
        }
    }

    pub fn expired(&self) -> bool {
        match self.last_used {
            Some(t) => t.elapsed() > EXPIRATION_TIME,
            None => false,
        }
    }

    /// Slides the received-seqno window. A positive delta shifts and marks
    /// the window valid; a late or duplicate packet sets its bit but marks
    /// the window invalid.
    fn update_window(&mut self, seqno: Seqno) {
        let delta = seqno.wrapping_sub(self.last_seqno) as i32;
        if delta > 0 {
            self.received_window =
                if delta >= 64 { 0 } else { self.received_window << delta };
        }
        if delta >= 0 {
            self.received_window |= 0x1;
            self.rwin_valid = true;
        } else {
            let back = (-delta) as u32;
            if back < 64 {
                self.received_window |= 0x1 << back;
            }
            self.rwin_valid = false;
        }
        self.received_count = self.received_count.wrapping_add(1);
        self.last_seqno = seqno;
    }
}

/// Why an echo request was not admitted.
#[derive(Debug)]
pub(crate) enum Denied {
    /// no live connection for the token
    NoConn,
    /// the token exists, but for a different remote address
    AddrMismatch(SocketAddr),
    /// the token bucket is empty
    ShortInterval,
}

pub(crate) struct ConnMgr {
    sconns: HashMap<u64, SConn>,
    packet_burst: f64,
    min_interval: Option<Duration>,
}

impl ConnMgr {
    pub fn new(packet_burst: u32, min_interval: Option<Duration>) -> ConnMgr {
        ConnMgr {
            sconns: HashMap::with_capacity(SCONNS_INIT_SIZE),
            packet_burst: packet_burst as f64,
            min_interval,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sconns.len()
    }

    /// Inserts a connection under a fresh token and returns the token.
    /// Up to a few expired entries are evicted first.
    pub fn put(&mut self, mut sc: SConn) -> u64 {
        self.remove_some_expired();
        let ct = self.new_ctoken();
        sc.ctoken = ct;
        self.sconns.insert(ct, sc);
        ct
    }

    /// Looks up and admits an echo request: expired entries are deleted,
    /// the remote address must match, and the token bucket must have a
    /// token. last_used advances even when admission fails, so flooding
    /// cannot earn tokens. The received window updates on admission only.
    pub fn admit(
        &mut self,
        ctoken: u64,
        raddr: SocketAddr,
        seqno: Seqno,
    ) -> Result<&mut SConn, Denied> {
        if self.sconns.get(&ctoken).is_some_and(|sc| sc.expired()) {
            self.sconns.remove(&ctoken);
            return Err(Denied::NoConn);
        }
        let sc = match self.sconns.get_mut(&ctoken) {
            Some(sc) => sc,
            None => return Err(Denied::NoConn),
        };
        if sc.raddr != raddr {
            return Err(Denied::AddrMismatch(sc.raddr));
        }

        let now = Instant::now();
        if sc.first_used.is_none() {
            sc.first_used = Some(now);
        }
        if let Some(min_interval) = self.min_interval {
            if min_interval > Duration::ZERO {
                if let Some(last) = sc.last_used {
                    let earned =
                        (now - last).as_secs_f64() / min_interval.as_secs_f64();
                    sc.packet_bucket = (sc.packet_bucket + earned).min(self.packet_burst);
                }
                if sc.packet_bucket < 1.0 {
                    sc.last_used = Some(now);
                    return Err(Denied::ShortInterval);
                }
                sc.packet_bucket -= 1.0;
            }
        }
        sc.last_used = Some(now);

        sc.update_window(seqno);
        Ok(sc)
    }

    pub fn get_mut(&mut self, ctoken: u64) -> Option<&mut SConn> {
        self.sconns.get_mut(&ctoken)
    }

    pub fn remove(&mut self, ctoken: u64) -> Option<SConn> {
        self.sconns.remove(&ctoken)
    }

    /// Checks a handful of entries in hash-iteration order and deletes the
    /// expired ones.
    pub fn remove_some_expired(&mut self) {
        let expired: Vec<u64> = self
            .sconns
            .iter()
            .take(CHECK_EXPIRED_COUNT)
            .filter(|(_, sc)| sc.expired())
            .map(|(&ct, _)| ct)
            .collect();
        for ct in expired {
            self.sconns.remove(&ct);
        }
    }

    fn new_ctoken(&self) -> u64 {
        loop {
            let ct = OsRng.next_u64();
            if ct != 0 && !self.sconns.contains_key(&ct) {
                return ct;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn sconn(port: u16) -> SConn {
        SConn::new(addr(port), Params::default(), None, 5)
    }

    #[test]
    fn put_assigns_unique_nonzero_tokens() {
        let mut cm = ConnMgr::new(5, None);
        let mut tokens = std::collections::HashSet::new();
        for _ in 0..64 {
            let ct = cm.put(sconn(9000));
            assert_ne!(ct, 0);
            assert!(tokens.insert(ct));
        }
        assert_eq!(cm.len(), 64);
    }

    #[test]
    fn admit_unknown_token_is_refused() {
        let mut cm = ConnMgr::new(5, None);
        assert!(matches!(cm.admit(123, addr(9000), 0), Err(Denied::NoConn)));
    }

    #[test]
    fn admit_checks_remote_address() {
        let mut cm = ConnMgr::new(5, None);
        let ct = cm.put(sconn(9000));
        match cm.admit(ct, addr(9001), 0) {
            Err(Denied::AddrMismatch(expected)) => assert_eq!(expected, addr(9000)),
            other => panic!("expected address mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn token_bucket_admits_burst_then_refuses() {
        let mut cm = ConnMgr::new(3, Some(Duration::from_secs(60)));
        let ct = cm.put(sconn(9000));
        for seqno in 0..3 {
            assert!(cm.admit(ct, addr(9000), seqno).is_ok(), "seqno {}", seqno);
        }
        assert!(matches!(cm.admit(ct, addr(9000), 3), Err(Denied::ShortInterval)));
        // the failed attempt advanced last_used, so no tokens were earned
        assert!(matches!(cm.admit(ct, addr(9000), 4), Err(Denied::ShortInterval)));
    }

    #[test]
    fn expired_conn_is_deleted_on_admit() {
        let mut cm = ConnMgr::new(5, None);
        let ct = cm.put(sconn(9000));
        let past = Instant::now().checked_sub(EXPIRATION_TIME + Duration::from_secs(1));
        match past {
            Some(past) => {
                cm.sconns.get_mut(&ct).unwrap().last_used = Some(past);
                assert!(matches!(cm.admit(ct, addr(9000), 0), Err(Denied::NoConn)));
                assert_eq!(cm.len(), 0);
            }
            None => {
                // not enough process uptime to back-date; at least verify
                // the fresh conn is not expired
                assert!(!cm.sconns.get(&ct).unwrap().expired());
            }
        }
    }

    #[test]
    fn remove_some_expired_trims_the_map() {
        let mut cm = ConnMgr::new(5, None);
        let mut tokens = Vec::new();
        for p in 0..4 {
            tokens.push(cm.put(sconn(9000 + p)));
        }
        if let Some(past) = Instant::now().checked_sub(EXPIRATION_TIME + Duration::from_secs(1)) {
            for ct in &tokens {
                cm.sconns.get_mut(ct).unwrap().last_used = Some(past);
            }
            cm.remove_some_expired();
            assert!(cm.len() < 4);
        }
    }

    #[test]
    fn window_tracks_order_and_validity() {
        let mut sc = sconn(9000);
        sc.update_window(0);
        assert_eq!(sc.received_window, 0b1);
        assert!(sc.rwin_valid);
        sc.update_window(1);
        assert_eq!(sc.received_window, 0b11);
        sc.update_window(3);
        assert_eq!(sc.received_window, 0b1101);
        // a late packet sets its bit but invalidates the window
        sc.update_window(2);
        assert_eq!(sc.received_window, 0b1111);
        assert!(!sc.rwin_valid);
        assert_eq!(sc.received_count, 4);
        // a duplicate of the last seqno keeps the window and revalidates
        sc.update_window(2);
        assert!(sc.rwin_valid);
    }
}
