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

//! UDP socket layer: bind/dial plus the DSCP, TTL and DF capability
//! setters the protocol core consumes. Capability availability is probed
//! and reported rather than assumed; failing to apply a non-default value
//! is surfaced, while default values are accepted silently.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::str::FromStr;
use std::time::Duration;

use crate::config::DEFAULT_PORT;
use crate::error::{Error, Result};

/// The IP don't-fragment setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Df {
    /// Leave the OS default in place.
    #[default]
    Default,
    /// Allow fragmentation.
    False,
    /// Set the don't-fragment bit (path MTU discovery on Linux).
    True,
}

impl fmt::Display for Df {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Df::Default => "default",
            Df::False => "false",
            Df::True => "true",
        })
    }
}

impl FromStr for Df {
    type Err = Error;

    fn from_str(s: &str) -> Result<Df> {
        match s {
            "default" => Ok(Df::Default),
            "false" => Ok(Df::False),
            "true" => Ok(Df::True),
            _ => Err(Error::InvalidDfString(s.to_string())),
        }
    }
}

/// A UDP socket with lazily applied IP-level options. Wraps both the
/// client's connected socket and the server's listener sockets.
pub(crate) struct NetConn {
    sock: UdpSocket,
    v6: bool,
    dscp: u8,
    ttl: u32,
    df: Df,

    /// whether the traffic-class sockopt works here, with error detail
    pub dscp_support: std::result::Result<(), String>,
}

impl NetConn {
    pub fn new(sock: UdpSocket, local: SocketAddr) -> NetConn {
        let v6 = local.is_ipv6();
        // probe DSCP support by applying the neutral traffic class
        let dscp_support = {
            let r = socket2::SockRef::from(&sock);
            let res = if v6 { r.set_tclass_v6(0) } else { r.set_tos(0) };
            res.map_err(|e| e.to_string())
        };
        NetConn { sock, v6, dscp: 0, ttl: 0, df: Df::Default, dscp_support }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.sock
    }

    pub fn try_clone_socket(&self) -> Result<UdpSocket> {
        Ok(self.sock.try_clone()?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    pub fn set_read_timeout(&self, d: Option<Duration>) -> Result<()> {
        self.sock.set_read_timeout(d)?;
        Ok(())
    }

    /// Applies a DSCP codepoint by writing it into the high six bits of the
    /// TOS / traffic-class byte. No-op when the value is already applied.
    pub fn set_dscp(&mut self, dscp: u8) -> Result<()> {
        if self.dscp == dscp {
            return Ok(());
        }
        if let Err(e) = &self.dscp_support {
            return Err(Error::NoDscpSupport(e.clone()));
        }
        let tos = (dscp as u32) << 2;
        let r = socket2::SockRef::from(&self.sock);
        let res = if self.v6 { r.set_tclass_v6(tos) } else { r.set_tos(tos) };
        res.map_err(|e| Error::NoDscpSupport(e.to_string()))?;
        self.dscp = dscp;
        Ok(())
    }

    pub fn set_ttl(&mut self, ttl: u32) -> Result<()> {
        if self.ttl == ttl {
            return Ok(());
        }
        let res = if self.v6 {
            socket2::SockRef::from(&self.sock).set_unicast_hops_v6(ttl)
        } else {
            self.sock.set_ttl(ttl)
        };
        res.map_err(|e| Error::TtlError(ttl, e.to_string()))?;
        self.ttl = ttl;
        Ok(())
    }

    pub fn set_df(&mut self, df: Df) -> Result<()> {
        if self.df == df {
            return Ok(());
        }
        set_sockopt_df(&self.sock, self.v6, df)?;
        self.df = df;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn set_sockopt_df(sock: &UdpSocket, v6: bool, df: Df) -> Result<()> {
    use std::os::fd::AsRawFd;

    let (level, opt, val): (libc::c_int, libc::c_int, libc::c_int) = if v6 {
        let val = match df {
            Df::Default => libc::IPV6_PMTUDISC_WANT,
            Df::False => libc::IPV6_PMTUDISC_DONT,
            Df::True => libc::IPV6_PMTUDISC_DO,
        };
        (libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER, val)
    } else {
        let val = match df {
            Df::Default => libc::IP_PMTUDISC_WANT,
            Df::False => libc::IP_PMTUDISC_DONT,
            Df::True => libc::IP_PMTUDISC_DO,
        };
        (libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, val)
    };

    let ret = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            level,
            opt,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::DfError(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_sockopt_df(_sock: &UdpSocket, _v6: bool, _df: Df) -> Result<()> {
    Err(Error::DfNotSupported)
}

/// Resolves an address string to a single socket address, adding the
/// default port when none is given.
pub(crate) fn resolve_addr(s: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(sa) = s.parse::<SocketAddr>() {
        return Ok(sa);
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    if let Some(port) = s.strip_prefix(':').and_then(|p| p.parse::<u16>().ok()) {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    // "host:port", then bare host with the default port
    if let Ok(mut addrs) = s.to_socket_addrs() {
        if let Some(sa) = addrs.next() {
            return Ok(sa);
        }
    }
    if let Ok(mut addrs) = (s, default_port).to_socket_addrs() {
        if let Some(sa) = addrs.next() {
            return Ok(sa);
        }
    }
    Err(Error::NoSuitableAddressFound(s.to_string()))
}

/// Resolves the server bind list. A bare ":port" (or empty) address binds
/// the IPv4 and IPv6 wildcards separately, so socket options can be
/// applied per family. Duplicates are removed.
pub(crate) fn resolve_listen_addrs(addrs: &[String], default_port: u16) -> Result<Vec<SocketAddr>> {
    let mut out: Vec<SocketAddr> = Vec::new();
    for a in addrs {
        if a.is_empty() || a.starts_with(':') {
            let port = if a.is_empty() {
                default_port
            } else {
                a[1..]
                    .parse::<u16>()
                    .map_err(|_| Error::NoSuitableAddressFound(a.clone()))?
            };
            out.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
            out.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port));
        } else {
            out.push(resolve_addr(a, default_port)?);
        }
    }
    out.dedup();
    if out.is_empty() {
        return Err(Error::NoSuitableAddressFound(format!("{:?}", addrs)));
    }
    Ok(out)
}

/// Binds a listener socket. IPv6 wildcard listeners are v6-only so the
/// paired IPv4 listener can coexist.
pub(crate) fn listen(addr: SocketAddr) -> Result<NetConn> {
    let domain = if addr.is_ipv6() { socket2::Domain::IPV6 } else { socket2::Domain::IPV4 };
    let sock = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    if addr.is_ipv6() {
        sock.set_only_v6(true)?;
    }
    sock.bind(&addr.into())?;
    let sock: UdpSocket = sock.into();
    let local = sock.local_addr()?;
    Ok(NetConn::new(sock, local))
}

/// Dials a connected client socket to the server.
pub(crate) fn dial(local: Option<&str>, remote: &str) -> Result<(NetConn, SocketAddr)> {
    let raddr = resolve_addr(remote, DEFAULT_PORT)?;
    let laddr = match local {
        Some(l) => resolve_addr(l, 0)?,
        None => match raddr {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        },
    };
    let sock = UdpSocket::bind(laddr)?;
    sock.connect(raddr)?;
    let local = sock.local_addr()?;
    Ok((NetConn::new(sock, local), raddr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn df_strings_round_trip() {
        for s in ["default", "false", "true"] {
            assert_eq!(Df::from_str(s).unwrap().to_string(), s);
        }
        assert!(Df::from_str("maybe").is_err());
    }

    #[test]
    fn resolve_addr_forms() {
        assert_eq!(
            resolve_addr("127.0.0.1:9000", 2112).unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_addr("127.0.0.1", 2112).unwrap(),
            "127.0.0.1:2112".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_addr(":9000", 2112).unwrap(),
            "0.0.0.0:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(resolve_addr("no.such.host.invalid?", 2112).is_err());
    }

    #[test]
    fn listen_list_expands_wildcards() {
        let addrs = resolve_listen_addrs(&[":9201".to_string()], 2112).unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv4() && addrs[1].is_ipv6());
        let addrs = resolve_listen_addrs(&["127.0.0.1:9202".to_string()], 2112).unwrap();
        assert_eq!(addrs.len(), 1);
    }

    #[test]
    fn dial_and_probe_loopback() {
        let listener = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let laddr = listener.local_addr().unwrap();
        let (mut conn, raddr) = dial(None, &laddr.to_string()).unwrap();
        assert_eq!(raddr, laddr);
        // loopback sockets support TOS on the platforms we test on; either
        // way the probe must have produced a definite answer
        let _ = conn.set_ttl(64);
        match conn.set_dscp(46) {
            Ok(()) => {}
            Err(Error::NoDscpSupport(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
