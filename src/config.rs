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

use std::sync::Arc;
use std::time::Duration;

use crate::average::ExponentialAverager;
use crate::error::{Error, Result};
use crate::event::Handler;
use crate::fill::Filler;
use crate::protocol::params::{Params, MAX_SERVER_FILL_LEN};
use crate::protocol::PROTOCOL_VERSION;
use crate::sock::Df;
use crate::time::{AllowStamp, Clock, ReceivedStats, StampAt};
use crate::timer::{CompTimer, Timer};
use crate::wait::{WaitMaxRTT, Waiter};

// common defaults
pub const DEFAULT_PORT: u16 = 2112;
pub const DEFAULT_TTL: u32 = 0;

// client defaults
pub const DEFAULT_DURATION: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_LENGTH: usize = 0;
pub const DEFAULT_RECEIVED_STATS: ReceivedStats = ReceivedStats::Both;
pub const DEFAULT_STAMP_AT: StampAt = StampAt::Both;
pub const DEFAULT_CLOCK: Clock = Clock::Both;
pub const DEFAULT_COMP_TIMER_MIN_ERROR_FACTOR: f64 = 0.0;
pub const DEFAULT_COMP_TIMER_MAX_ERROR_FACTOR: f64 = 2.0;
pub const DEFAULT_HYBRID_TIMER_SLEEP_FACTOR: f64 = 0.95;
pub const DEFAULT_AVERAGE_WINDOW: usize = 5;
pub const DEFAULT_EXPONENTIAL_AVERAGE_ALPHA: f64 = 0.1;

/// Minimum time open() waits before retransmitting, so clients cannot
/// request a schedule that floods the server.
pub const MIN_OPEN_TIMEOUT: Duration = Duration::from_millis(200);

/// The hard floor below which a server-restricted interval is refused.
pub const MIN_RESTRICTED_INTERVAL: Duration = Duration::from_millis(10);

/// The default timeouts for each open retransmission round.
pub fn default_open_timeouts() -> Vec<Duration> {
    vec![
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
        Duration::from_secs(8),
    ]
}

/// The default timer, a compensating timer with an exponential averager.
pub fn default_timer() -> Box<dyn Timer> {
    Box::new(CompTimer::new(Box::<ExponentialAverager>::default()))
}

/// The default wait for final replies, three times the max RTT with a 4 s
/// fallback.
pub fn default_waiter() -> Box<dyn Waiter> {
    Box::new(WaitMaxRTT { fallback: Duration::from_secs(4), factor: 3 })
}

// server defaults
pub const DEFAULT_MAX_LENGTH: usize = 0;
pub const DEFAULT_PACKET_BURST: u32 = 5;
pub const DEFAULT_ALLOW_STAMP: AllowStamp = AllowStamp::Dual;
pub const DEFAULT_ALLOW_DSCP: bool = true;
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_SERVER_FILL: &str = "pattern";

pub fn default_bind_addrs() -> Vec<String> {
    vec![format!(":{}", DEFAULT_PORT)]
}

/// The fill request prefixes the server honors by default.
pub fn default_allow_fills() -> Vec<String> {
    vec!["rand".to_string()]
}

/// ClientConfig defines the client configuration.
pub struct ClientConfig {
    pub local_address: Option<String>,
    pub remote_address: String,
    pub open_timeouts: Vec<Duration>,
    /// the requested test parameters; the server may restrict them
    pub params: Params,
    /// promote server restrictions from events to errors
    pub strict: bool,
    /// open (and immediately close) a connection without running a test
    pub no_test: bool,
    pub df: Df,
    pub ttl: u32,
    pub timer: Box<dyn Timer>,
    pub waiter: Box<dyn Waiter>,
    pub filler: Option<Box<dyn Filler>>,
    /// fill the payload once instead of before every send
    pub fill_one: bool,
    pub hmac_key: Option<Vec<u8>>,
    pub handler: Option<Arc<dyn Handler>>,
    /// pin the send and receive threads to cores
    pub thread_lock: bool,
}

impl ClientConfig {
    pub fn new(remote_address: &str) -> ClientConfig {
        ClientConfig {
            local_address: None,
            remote_address: remote_address.to_string(),
            open_timeouts: default_open_timeouts(),
            params: Params {
                proto_version: PROTOCOL_VERSION,
                duration: DEFAULT_DURATION,
                interval: DEFAULT_INTERVAL,
                length: DEFAULT_LENGTH,
                received_stats: DEFAULT_RECEIVED_STATS,
                stamp_at: DEFAULT_STAMP_AT,
                clock: Some(DEFAULT_CLOCK),
                dscp: 0,
                server_fill: String::new(),
            },
            strict: false,
            no_test: false,
            df: Df::Default,
            ttl: DEFAULT_TTL,
            timer: default_timer(),
            waiter: default_waiter(),
            filler: None,
            fill_one: false,
            hmac_key: None,
            handler: None,
            thread_lock: false,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.params.interval.is_zero() {
            return Err(Error::IntervalNonPositive);
        }
        if self.params.duration.is_zero() {
            return Err(Error::DurationNonPositive);
        }
        if self.params.server_fill.len() > MAX_SERVER_FILL_LEN {
            return Err(Error::ServerFillTooLong(
                self.params.server_fill.clone(),
                MAX_SERVER_FILL_LEN,
            ));
        }
        for &to in &self.open_timeouts {
            if to < MIN_OPEN_TIMEOUT {
                return Err(Error::OpenTimeoutTooShort(to, MIN_OPEN_TIMEOUT));
            }
        }
        Ok(())
    }
}

/// ServerConfig defines the server configuration.
pub struct ServerConfig {
    /// bind addresses; ":port" binds the IPv4 and IPv6 wildcards
    pub addrs: Vec<String>,
    pub hmac_key: Option<Vec<u8>>,
    /// longest test duration allowed, unlimited when None
    pub max_duration: Option<Duration>,
    /// shortest interval allowed, which also paces the token bucket
    pub min_interval: Option<Duration>,
    /// largest packet length allowed, unlimited when 0
    pub max_length: usize,
    /// token bucket level granted to each new connection
    pub packet_burst: u32,
    /// filler specification for reply payloads
    pub fill: String,
    /// fill request prefixes honored from clients
    pub allow_fills: Vec<String>,
    pub allow_stamp: AllowStamp,
    pub allow_dscp: bool,
    /// reply from the exact destination address on unspecified binds, an
    /// optional capability reported when unavailable
    pub set_src_ip: bool,
    pub ttl: u32,
    /// extra time past max_duration before a connection is force-closed
    pub grace: Duration,
    pub handler: Option<Arc<dyn Handler>>,
    /// pin listener threads to cores
    pub thread_lock: bool,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            addrs: default_bind_addrs(),
            hmac_key: None,
            max_duration: None,
            min_interval: None,
            max_length: DEFAULT_MAX_LENGTH,
            packet_burst: DEFAULT_PACKET_BURST,
            fill: DEFAULT_SERVER_FILL.to_string(),
            allow_fills: default_allow_fills(),
            allow_stamp: DEFAULT_ALLOW_STAMP,
            allow_dscp: DEFAULT_ALLOW_DSCP,
            set_src_ip: false,
            ttl: DEFAULT_TTL,
            grace: DEFAULT_GRACE,
            handler: None,
            thread_lock: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_client_config_validates() {
        ClientConfig::new("localhost").validate().unwrap();
    }

    #[test]
    fn non_positive_interval_is_refused() {
        let mut cfg = ClientConfig::new("localhost");
        cfg.params.interval = Duration::ZERO;
        assert!(matches!(cfg.validate(), Err(Error::IntervalNonPositive)));
    }

    #[test]
    fn short_open_timeout_is_refused() {
        let mut cfg = ClientConfig::new("localhost");
        cfg.open_timeouts = vec![Duration::from_millis(50)];
        assert!(matches!(cfg.validate(), Err(Error::OpenTimeoutTooShort(..))));
    }

    #[test]
    fn long_server_fill_is_refused() {
        let mut cfg = ClientConfig::new("localhost");
        cfg.params.server_fill = "p".repeat(MAX_SERVER_FILL_LEN + 1);
        assert!(matches!(cfg.validate(), Err(Error::ServerFillTooLong(..))));
    }
}
