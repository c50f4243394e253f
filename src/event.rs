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
use std::net::SocketAddr;

use serde::Serialize;

/// Code identifies events to improve context for handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    ServerStart,
    ServerStop,
    ListenerStart,
    ListenerStop,
    ListenerError,
    Drop,
    DropUnparseableParams,
    DropInvalidConnToken,
    DropAddressMismatch,
    DropShortInterval,
    DropTooLarge,
    NewConn,
    OpenClose,
    CloseConn,
    RemoveNoConn,
    DurationLimitExceeded,
    ProtocolVersionMismatch,
    NoDscpSupport,
    NoReceiveDstAddrSupport,
    Connecting,
    Connected,
    ConnectedClosed,
    NoTest,
    WaitForPackets,
    ServerRestriction,
}

/// An event sent to a Handler.
#[derive(Debug, Clone)]
pub struct Event {
    pub code: Code,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub msg: String,
}

impl Event {
    pub fn new(
        code: Code,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        msg: String,
    ) -> Event {
        Event { code, local_addr, remote_addr, msg }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_addr {
            Some(raddr) => write!(f, "[{:?}] [{}] {}", self.code, raddr, self.msg),
            None => write!(f, "[{:?}] {}", self.code, self.msg),
        }
    }
}

/// Handler is called with events as they occur. When no handler is
/// installed, events fall through to the log facade.
pub trait Handler: Send + Sync {
    fn on_event(&self, e: &Event);
}

/// Dispatches an event to the handler, or logs it.
pub(crate) fn emit(
    handler: &Option<std::sync::Arc<dyn Handler>>,
    code: Code,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    msg: String,
) {
    let e = Event::new(code, local_addr, remote_addr, msg);
    match handler {
        Some(h) => h.on_event(&e),
        None => log::info!("{}", e),
    }
}
