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

pub(crate) mod packet;
pub mod params;

/// The wire protocol version. The server forces its own version into the
/// open reply and the client refuses to run on a mismatch.
pub const PROTOCOL_VERSION: i32 = 1;

/// Magic bytes at the start of every datagram.
pub(crate) const MAGIC: [u8; 3] = [0x14, 0xa7, 0x5b];

/// A sequence number, assigned by the client starting at 0.
pub type Seqno = u32;

/// Sentinel for "no sequence number seen yet"; the first delta computed
/// against it wraps to 1.
pub(crate) const INVALID_SEQNO: Seqno = Seqno::MAX;

/// Packet flag bits.
pub(crate) mod flag {
    /// Set when opening a conn, both in the client request and the reply.
    pub const OPEN: u8 = 1 << 0;
    /// Set in all packets from the server, unset in all from the client.
    pub const REPLY: u8 = 1 << 1;
    /// Set when closing a conn.
    pub const CLOSE: u8 = 1 << 2;
    /// Set if an HMAC hash is included, so a missing HMAC can be told apart
    /// from an invalid one.
    pub const HMAC: u8 = 1 << 3;

    pub const ALL: u8 = OPEN | REPLY | CLOSE | HMAC;
}
