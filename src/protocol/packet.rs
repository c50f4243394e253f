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

//! On-wire packet framing.
//!
//! A datagram starts with a fixed header (3 magic bytes, 1 flag byte)
//! followed by optional fields in a fixed canonical order. A field is
//! either absent (zero length) or present at its full capacity, so the
//! buffer structure is externalized simply as which fields are set. The
//! buffer is padded to a target length and the remainder after the last
//! field is the payload. Multibyte integers are little-endian.
//!
//! Canonical field order and capacities in bytes:
//!
//! | field           | cap |
//! |-----------------|-----|
//! | magic           | 3   |
//! | flags           | 1   |
//! | HMAC-MD5        | 16  |
//! | conn token      | 8   |
//! | seqno           | 4   |
//! | received count  | 4   |
//! | received window | 8   |
//! | receive wall    | 8   |
//! | receive mono    | 8   |
//! | midpoint wall   | 8   |
//! | midpoint mono   | 8   |
//! | send wall       | 8   |
//! | send mono       | 8   |

use std::net::SocketAddr;

use hmac::{Hmac, Mac};
use md5::Md5;

use crate::error::{Error, Result};
use crate::fill::Filler;
use crate::protocol::{flag, MAGIC};
use crate::time::{Clock, ReceivedStats, StampAt, Time, Timestamp};

type HmacMd5 = Hmac<Md5>;

pub(crate) const HMAC_SIZE: usize = 16;

/// Field indexes, in canonical on-wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fidx {
    Magic,
    Flags,
    Hmac,
    ConnToken,
    Seqno,
    RCount,
    RWindow,
    RWall,
    RMono,
    MWall,
    MMono,
    SWall,
    SMono,
}

const FIELD_COUNT: usize = 13;

// field capacities, in canonical order (sync with Fidx)
const FIELD_CAPS: [usize; FIELD_COUNT] = [3, 1, HMAC_SIZE, 8, 4, 4, 8, 8, 8, 8, 8, 8, 8];

/// Length of the required header (magic and flags).
pub(crate) const MIN_HEADER_LEN: usize = 4;

/// Length of the header with every optional field present.
pub(crate) const MAX_HEADER_LEN: usize = 92;

const FINIT: &[Fidx] = &[Fidx::Magic, Fidx::Flags];
const FINIT_HMAC: &[Fidx] = &[Fidx::Magic, Fidx::Flags, Fidx::Hmac];

pub(crate) const FOPEN_REPLY: &[Fidx] = &[Fidx::Magic, Fidx::Flags, Fidx::ConnToken];
pub(crate) const FCLOSE_REQUEST: &[Fidx] = &[Fidx::Magic, Fidx::Flags, Fidx::ConnToken];
pub(crate) const FECHO_REQUEST: &[Fidx] = &[Fidx::Magic, Fidx::Flags, Fidx::ConnToken, Fidx::Seqno];
pub(crate) const FECHO_REPLY: &[Fidx] = &[Fidx::Magic, Fidx::Flags, Fidx::ConnToken, Fidx::Seqno];

#[derive(Debug, Clone, Copy, Default)]
struct Field {
    pos: usize,
    len: usize,
    cap: usize,
}

/// Fbuf provides access to fields in a byte buffer, each with a position,
/// length and capacity. tlen is the target buffer length; the payload is
/// the padding after the fields needed to meet it. The buffer length is
/// always at least the summed field lengths.
#[derive(Debug)]
struct Fbuf {
    buf: Box<[u8]>,
    len: usize,
    fields: [Field; FIELD_COUNT],
    tlen: usize,
}

impl Fbuf {
    fn new(tlen: usize, cap: usize) -> Fbuf {
        let fcap: usize = FIELD_CAPS.iter().sum();
        let cap = cap.max(fcap);
        let mut fields = [Field::default(); FIELD_COUNT];
        for (f, c) in fields.iter_mut().zip(FIELD_CAPS) {
            f.cap = c;
        }
        Fbuf {
            buf: vec![0u8; cap].into_boxed_slice(),
            len: tlen.min(cap),
            fields,
            tlen,
        }
    }

    fn validate(&self) -> Result<()> {
        let flen = self.sum_lens();
        if flen > self.len {
            return Err(Error::FieldsLengthTooLarge { flen, blen: self.len });
        }
        let fcap: usize = FIELD_CAPS.iter().sum();
        if fcap > self.buf.len() {
            return Err(Error::FieldsCapacityTooLarge { fcap, bcap: self.buf.len() });
        }
        Ok(())
    }

    /// Lays out exactly the given fields (canonical order), clearing all
    /// others.
    fn set_fields(&mut self, fidxs: &[Fidx], set_len: bool) -> Result<()> {
        let mut want = fidxs.iter().peekable();
        let mut pos = 0;
        for j in 0..FIELD_COUNT {
            self.fields[j].pos = pos;
            if matches!(want.peek(), Some(&&f) if f as usize == j) {
                want.next();
                self.fields[j].len = self.fields[j].cap;
                pos += self.fields[j].len;
            } else {
                self.fields[j].len = 0;
            }
        }
        if set_len {
            self.set_len(pos);
        }
        self.validate()
    }

    /// Marks the given fields present, keeping any other field lengths, and
    /// recomputes positions. The buffer contents are not moved; this is
    /// used to interpret data already laid out on the wire.
    fn add_fields(&mut self, fidxs: &[Fidx], set_len: bool) -> Result<()> {
        let mut want = fidxs.iter().peekable();
        let mut pos = 0;
        for j in 0..FIELD_COUNT {
            self.fields[j].pos = pos;
            if matches!(want.peek(), Some(&&f) if f as usize == j) {
                want.next();
                self.fields[j].len = self.fields[j].cap;
            }
            pos += self.fields[j].len;
        }
        if set_len {
            self.set_len(pos);
        }
        self.validate()
    }

    fn set_len(&mut self, tlen: usize) -> usize {
        self.tlen = tlen;
        let l = tlen.max(self.sum_lens()).min(self.buf.len());
        self.len = l;
        l
    }

    /// Grows or shrinks a field in place, shifting the bytes after it.
    fn set_field_len(&mut self, f: Fidx, newlen: usize) {
        let fi = f as usize;
        let Field { pos, len, .. } = self.fields[fi];
        if newlen == len {
            return;
        }
        let old_total = self.len;
        if newlen > len {
            let grow = newlen - len;
            assert!(old_total + grow <= self.buf.len(), "field growth beyond buffer capacity");
            self.buf.copy_within(pos..old_total, pos + grow);
            self.len = old_total + grow;
        } else {
            let shrink = len - newlen;
            self.buf.copy_within(pos + len..old_total, pos + newlen);
            self.len = old_total - shrink;
        }
        self.fields[fi].len = newlen;
        // update positions after the field
        let mut p = self.fields[fi].pos;
        for j in fi..FIELD_COUNT {
            self.fields[j].pos = p;
            p += self.fields[j].len;
        }
        // restore the target length if the fields still fit in it
        if self.tlen >= self.sum_lens() {
            self.len = self.tlen;
        }
    }

    fn set(&mut self, f: Fidx, b: &[u8]) {
        let cap = self.fields[f as usize].cap;
        assert!(b.len() == cap, "set for field with size != field cap");
        self.set_to(f).copy_from_slice(b);
    }

    fn set_to(&mut self, f: Fidx) -> &mut [u8] {
        let fi = f as usize;
        if self.fields[fi].len != self.fields[fi].cap {
            self.set_field_len(f, self.fields[fi].cap);
        }
        let Field { pos, cap, .. } = self.fields[fi];
        &mut self.buf[pos..pos + cap]
    }

    fn setb(&mut self, f: Fidx, b: u8) {
        self.set_to(f)[0] = b;
    }

    fn get(&self, f: Fidx) -> &[u8] {
        let Field { pos, len, .. } = self.fields[f as usize];
        &self.buf[pos..pos + len]
    }

    fn getb(&self, f: Fidx) -> u8 {
        self.get(f)[0]
    }

    fn isset(&self, f: Fidx) -> bool {
        self.fields[f as usize].len > 0
    }

    fn zero(&mut self, f: Fidx) {
        self.set_to(f).fill(0);
    }

    fn remove(&mut self, f: Fidx) {
        if self.fields[f as usize].len > 0 {
            self.set_field_len(f, 0);
        }
    }

    fn sum_lens(&self) -> usize {
        self.fields.iter().map(|f| f.len).sum()
    }

    fn payload(&self) -> &[u8] {
        &self.buf[self.sum_lens()..self.len]
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        let flen = self.sum_lens();
        &mut self.buf[flen..self.len]
    }

    fn set_payload(&mut self, b: &[u8]) {
        let flen = self.sum_lens();
        assert!(flen + b.len() <= self.buf.len(), "payload beyond buffer capacity");
        self.len = flen + b.len();
        self.buf[flen..self.len].copy_from_slice(b);
    }

    fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// A reusable send or receive packet.
#[derive(Debug)]
pub(crate) struct Packet {
    fb: Fbuf,
    hmac_key: Option<Vec<u8>>,

    /// remote address, set on server receive
    pub raddr: Option<SocketAddr>,
    /// post-read timestamp, set on receive
    pub trcvd: Time,
    /// DSCP value to apply before send
    pub dscp: u8,
}

impl Packet {
    pub fn new(tlen: usize, cap: usize, hmac_key: Option<&[u8]>) -> Packet {
        let mut p = Packet {
            fb: Fbuf::new(tlen, cap),
            hmac_key: hmac_key.map(|k| k.to_vec()),
            raddr: None,
            trcvd: Time::default(),
            dscp: 0,
        };
        let init = if p.hmac_key.is_some() { FINIT_HMAC } else { FINIT };
        p.fb.set_fields(init, true).expect("initial field layout");
        p.fb.set(Fidx::Magic, &MAGIC);
        p
    }

    /// Resets a pooled packet for reuse on the send path.
    pub fn reset(&mut self) {
        let init = if self.hmac_key.is_some() { FINIT_HMAC } else { FINIT };
        self.fb.set_fields(init, true).expect("initial field layout");
        self.fb.set(Fidx::Magic, &MAGIC);
        self.fb.setb(Fidx::Flags, 0);
        self.raddr = None;
        self.dscp = 0;
    }

    /// Prepares the buffer for reading a datagram of n bytes, then runs
    /// receive-path validation.
    pub fn read_reset(&mut self, n: usize) -> Result<()> {
        let init = if self.hmac_key.is_some() { FINIT_HMAC } else { FINIT };
        self.fb.set_fields(init, false)?;
        self.fb.len = n.min(self.fb.buf.len());
        self.fb.tlen = n;
        self.fb.validate()?;
        self.validate()
    }

    /// The full capacity buffer, for reading a datagram into. The buffer
    /// length is restored to the capacity so a short previous datagram
    /// cannot fail the next layout validation.
    pub fn read_to(&mut self) -> &mut [u8] {
        self.fb.len = self.fb.buf.len();
        &mut self.fb.buf
    }

    /// Receive-path validation: magic, flag bits, open/close exclusion,
    /// midpoint exclusivity, clock-mode agreement, then HMAC.
    fn validate(&mut self) -> Result<()> {
        if self.fb.get(Fidx::Magic) != MAGIC {
            return Err(Error::BadMagic(self.fb.get(Fidx::Magic).to_vec()));
        }

        if self.flags() & !flag::ALL != 0 {
            return Err(Error::InvalidFlagBitsSet(self.flags()));
        }
        // open and close only combine in a reply, where they mean the
        // connection was accepted and immediately closed
        if self.flags() & flag::OPEN != 0
            && self.flags() & flag::CLOSE != 0
            && self.flags() & flag::REPLY == 0
        {
            return Err(Error::OpenCloseBothSet);
        }

        // a midpoint timestamp excludes the receive/send pair
        if self.has_midpoint_stamp() && (self.has_receive_stamp() || self.has_send_stamp()) {
            return Err(Error::NonexclusiveMidpointStamp);
        }

        // clock mode must agree between receive and send stamps
        if self.has_receive_stamp() && self.has_send_stamp() {
            let rclock =
                Clock::from_flags(self.fb.isset(Fidx::RWall), self.fb.isset(Fidx::RMono)).unwrap();
            let sclock =
                Clock::from_flags(self.fb.isset(Fidx::SWall), self.fb.isset(Fidx::SMono)).unwrap();
            if sclock != rclock {
                return Err(Error::InconsistentClocks { send: sclock, receive: rclock });
            }
        }

        if let Some(key) = self.hmac_key.clone() {
            if self.flags() & flag::HMAC == 0 {
                return Err(Error::NoHmac);
            }
            self.fb.add_fields(&[Fidx::Hmac], false)?;
            let mut mac = [0u8; HMAC_SIZE];
            mac.copy_from_slice(self.fb.get(Fidx::Hmac));
            self.fb.zero(Fidx::Hmac);
            let mut h = HmacMd5::new_from_slice(&key).expect("HMAC accepts any key length");
            h.update(self.fb.bytes());
            // verify_slice compares in constant time
            h.verify_slice(&mac).map_err(|_| Error::BadHmac)?;
        } else if self.flags() & flag::HMAC != 0 {
            return Err(Error::UnexpectedHmac);
        }
        Ok(())
    }

    pub fn set_fields(&mut self, fidxs: &[Fidx], set_len: bool) -> Result<()> {
        self.fb.set_fields(fidxs, set_len)
    }

    pub fn add_fields(&mut self, fidxs: &[Fidx], set_len: bool) -> Result<()> {
        self.fb.add_fields(fidxs, set_len)
    }

    // flags

    pub fn flags(&self) -> u8 {
        self.fb.getb(Fidx::Flags)
    }

    pub fn set_flag_bits(&mut self, f: u8) {
        let flags = self.flags() | f;
        self.fb.setb(Fidx::Flags, flags);
    }

    pub fn clear_flag_bits(&mut self, f: u8) {
        let flags = self.flags() & !f;
        self.fb.setb(Fidx::Flags, flags);
    }

    pub fn reply(&self) -> bool {
        self.flags() & flag::REPLY != 0
    }

    pub fn set_reply(&mut self, r: bool) {
        if r {
            self.set_flag_bits(flag::REPLY);
        } else {
            self.clear_flag_bits(flag::REPLY);
        }
    }

    // conn token

    pub fn ctoken(&self) -> u64 {
        u64::from_le_bytes(self.fb.get(Fidx::ConnToken).try_into().unwrap())
    }

    pub fn set_ctoken(&mut self, ctoken: u64) {
        self.fb.set_to(Fidx::ConnToken).copy_from_slice(&ctoken.to_le_bytes());
    }

    // sequence number

    pub fn seqno(&self) -> u32 {
        u32::from_le_bytes(self.fb.get(Fidx::Seqno).try_into().unwrap())
    }

    pub fn set_seqno(&mut self, seqno: u32) {
        self.fb.set_to(Fidx::Seqno).copy_from_slice(&seqno.to_le_bytes());
    }

    // received stats

    pub fn has_received_count(&self) -> bool {
        self.fb.isset(Fidx::RCount)
    }

    pub fn received_count(&self) -> u32 {
        u32::from_le_bytes(self.fb.get(Fidx::RCount).try_into().unwrap())
    }

    pub fn set_received_count(&mut self, count: u32) {
        self.fb.set_to(Fidx::RCount).copy_from_slice(&count.to_le_bytes());
    }

    pub fn has_received_window(&self) -> bool {
        self.fb.isset(Fidx::RWindow)
    }

    pub fn received_window(&self) -> u64 {
        u64::from_le_bytes(self.fb.get(Fidx::RWindow).try_into().unwrap())
    }

    pub fn set_received_window(&mut self, window: u64) {
        self.fb.set_to(Fidx::RWindow).copy_from_slice(&window.to_le_bytes());
    }

    /// On the request path, zeroes the received-stats fields the client
    /// wants so the reply has room for them, and removes the rest.
    pub fn zero_received_stats(&mut self, rs: ReceivedStats) {
        if rs.count() {
            self.fb.zero(Fidx::RCount);
        } else {
            self.fb.remove(Fidx::RCount);
        }
        if rs.window() {
            self.fb.zero(Fidx::RWindow);
        } else {
            self.fb.remove(Fidx::RWindow);
        }
    }

    /// On the reply path, marks the expected received-stats fields present.
    pub fn add_received_stats_fields(&mut self, rs: ReceivedStats) -> Result<()> {
        match (rs.count(), rs.window()) {
            (true, true) => self.fb.add_fields(&[Fidx::RCount, Fidx::RWindow], false),
            (true, false) => self.fb.add_fields(&[Fidx::RCount], false),
            (false, true) => self.fb.add_fields(&[Fidx::RWindow], false),
            (false, false) => Ok(()),
        }
    }

    // timestamps

    pub fn has_receive_stamp(&self) -> bool {
        self.fb.isset(Fidx::RWall) || self.fb.isset(Fidx::RMono)
    }

    pub fn has_midpoint_stamp(&self) -> bool {
        self.fb.isset(Fidx::MWall) || self.fb.isset(Fidx::MMono)
    }

    pub fn has_send_stamp(&self) -> bool {
        self.fb.isset(Fidx::SWall) || self.fb.isset(Fidx::SMono)
    }

    pub fn timestamp(&self) -> Timestamp {
        let mut ts = Timestamp::default();
        let get = |wf: Fidx, mf: Fidx, t: &mut Time| {
            let wb = self.fb.get(wf);
            if !wb.is_empty() {
                t.wall = i64::from_le_bytes(wb.try_into().unwrap());
            }
            let mb = self.fb.get(mf);
            if !mb.is_empty() {
                t.mono = i64::from_le_bytes(mb.try_into().unwrap());
            }
        };
        get(Fidx::RWall, Fidx::RMono, &mut ts.receive);
        get(Fidx::MWall, Fidx::MMono, &mut ts.receive);
        get(Fidx::MWall, Fidx::MMono, &mut ts.send);
        get(Fidx::SWall, Fidx::SMono, &mut ts.send);
        ts
    }

    pub fn set_timestamp(&mut self, ts: Timestamp) {
        let mut set = |t: &Time, wf: Fidx, mf: Fidx| {
            if t.wall != 0 {
                self.fb.set_to(wf).copy_from_slice(&t.wall.to_le_bytes());
            }
            if t.mono != 0 {
                self.fb.set_to(mf).copy_from_slice(&t.mono.to_le_bytes());
            }
        };
        if ts.is_midpoint() {
            set(&ts.receive, Fidx::MWall, Fidx::MMono);
            return;
        }
        if !ts.receive.is_zero() {
            set(&ts.receive, Fidx::RWall, Fidx::RMono);
        }
        if !ts.send.is_zero() {
            set(&ts.send, Fidx::SWall, Fidx::SMono);
        }
    }

    /// The clocks present in any timestamp field, if any timestamp is set.
    pub fn clock(&self) -> Option<Clock> {
        let wall =
            self.fb.isset(Fidx::RWall) || self.fb.isset(Fidx::SWall) || self.fb.isset(Fidx::MWall);
        let mono =
            self.fb.isset(Fidx::RMono) || self.fb.isset(Fidx::SMono) || self.fb.isset(Fidx::MMono);
        Clock::from_flags(wall, mono)
    }

    pub fn stamp_at(&self) -> StampAt {
        if self.has_midpoint_stamp() {
            return StampAt::Midpoint;
        }
        match (self.has_receive_stamp(), self.has_send_stamp()) {
            (true, true) => StampAt::Both,
            (true, false) => StampAt::Receive,
            (false, true) => StampAt::Send,
            (false, false) => StampAt::None,
        }
    }

    /// On the request path, zeroes the timestamp fields the client wants so
    /// the reply has room for them, and removes the rest.
    pub fn stamp_zeroes(&mut self, at: StampAt, clock: Clock) {
        let mut zts = |wanted: bool, wf: Fidx, mf: Fidx| {
            if wanted {
                if clock.wall() {
                    self.fb.zero(wf);
                } else {
                    self.fb.remove(wf);
                }
                if clock.mono() {
                    self.fb.zero(mf);
                } else {
                    self.fb.remove(mf);
                }
            } else {
                self.fb.remove(wf);
                self.fb.remove(mf);
            }
        };
        zts(at.at_receive(), Fidx::RWall, Fidx::RMono);
        zts(at.midpoint(), Fidx::MWall, Fidx::MMono);
        zts(at.at_send(), Fidx::SWall, Fidx::SMono);
    }

    /// On the reply path, marks the expected timestamp fields present.
    pub fn add_timestamp_fields(&mut self, at: StampAt, clock: Clock) -> Result<()> {
        let mut tfs = Vec::with_capacity(4);
        let mut atf = |wanted: bool, wf: Fidx, mf: Fidx| {
            if wanted {
                if clock.wall() {
                    tfs.push(wf);
                }
                if clock.mono() {
                    tfs.push(mf);
                }
            }
        };
        atf(at.at_receive(), Fidx::RWall, Fidx::RMono);
        atf(at.midpoint(), Fidx::MWall, Fidx::MMono);
        atf(at.at_send(), Fidx::SWall, Fidx::SMono);
        self.fb.add_fields(&tfs, false)
    }

    pub fn remove_timestamps(&mut self) {
        self.fb.remove(Fidx::RWall);
        self.fb.remove(Fidx::RMono);
        self.fb.remove(Fidx::MWall);
        self.fb.remove(Fidx::MMono);
        self.fb.remove(Fidx::SWall);
        self.fb.remove(Fidx::SMono);
    }

    // HMAC

    /// With a key configured, sets the HMAC flag and computes the MAC over
    /// the whole buffer with the MAC field zeroed. Without a key, clears
    /// any stale HMAC field.
    pub fn update_hmac(&mut self) {
        if let Some(key) = self.hmac_key.clone() {
            self.set_flag_bits(flag::HMAC);
            self.fb.zero(Fidx::Hmac);
            let mut h = HmacMd5::new_from_slice(&key).expect("HMAC accepts any key length");
            h.update(self.fb.bytes());
            let mac = h.finalize().into_bytes();
            self.fb.set(Fidx::Hmac, &mac);
        } else if self.fb.isset(Fidx::Hmac) {
            self.clear_flag_bits(flag::HMAC);
            self.fb.remove(Fidx::Hmac);
        }
    }

    // payload

    pub fn payload(&self) -> &[u8] {
        self.fb.payload()
    }

    pub fn set_payload(&mut self, b: &[u8]) {
        self.fb.set_payload(b);
    }

    pub fn zero_payload(&mut self) {
        self.fb.payload_mut().fill(0);
    }

    pub fn read_payload(&mut self, filler: &mut dyn Filler) {
        filler.fill(self.fb.payload_mut());
    }

    // length

    pub fn length(&self) -> usize {
        self.fb.len
    }

    pub fn set_len(&mut self, tlen: usize) -> usize {
        self.fb.set_len(tlen)
    }

    pub fn bytes(&self) -> &[u8] {
        self.fb.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = &[0xde, 0xad, 0xbe, 0xef];

    fn reread(p: &Packet, key: Option<&[u8]>) -> Result<Packet> {
        let wire = p.bytes().to_vec();
        let mut q = Packet::new(0, wire.len().max(MAX_HEADER_LEN), key);
        q.read_to()[..wire.len()].copy_from_slice(&wire);
        q.read_reset(wire.len())?;
        Ok(q)
    }

    #[test]
    fn echo_request_round_trip() {
        let mut p = Packet::new(0, 256, None);
        p.set_fields(FECHO_REQUEST, true).unwrap();
        p.set_ctoken(0x1122334455667788);
        p.set_seqno(42);
        p.zero_received_stats(ReceivedStats::Both);
        p.stamp_zeroes(StampAt::Both, Clock::Both);
        let len = p.set_len(172);
        assert_eq!(len, 172);
        p.zero_payload();

        let mut q = reread(&p, None).unwrap();
        q.add_fields(FECHO_REQUEST, false).unwrap();
        assert_eq!(q.ctoken(), 0x1122334455667788);
        assert_eq!(q.seqno(), 42);
        assert_eq!(q.length(), 172);
        assert_eq!(q.flags(), 0);
    }

    #[test]
    fn echo_reply_stats_and_stamps_round_trip() {
        let mut p = Packet::new(0, 256, None);
        p.set_fields(FECHO_REPLY, true).unwrap();
        p.set_reply(true);
        p.set_ctoken(7);
        p.set_seqno(3);
        p.set_received_count(11);
        p.set_received_window(0b1011);
        let ts = Timestamp {
            receive: Time { wall: 1_000_000, mono: 500 },
            send: Time { wall: 1_000_900, mono: 1_400 },
        };
        p.set_timestamp(ts);

        let mut q = reread(&p, None).unwrap();
        q.add_fields(FECHO_REPLY, false).unwrap();
        q.add_received_stats_fields(ReceivedStats::Both).unwrap();
        q.add_timestamp_fields(StampAt::Both, Clock::Both).unwrap();
        assert!(q.reply());
        assert_eq!(q.received_count(), 11);
        assert_eq!(q.received_window(), 0b1011);
        assert_eq!(q.stamp_at(), StampAt::Both);
        assert_eq!(q.clock(), Some(Clock::Both));
        assert_eq!(q.timestamp(), ts);
    }

    #[test]
    fn midpoint_stamp_reads_as_equal_receive_and_send() {
        let mut p = Packet::new(0, 256, None);
        p.set_fields(FECHO_REPLY, true).unwrap();
        p.set_reply(true);
        let mt = Time { wall: 77, mono: 99 };
        p.set_timestamp(Timestamp { receive: mt, send: mt });
        assert!(p.has_midpoint_stamp());
        assert!(!p.has_receive_stamp());
        assert!(!p.has_send_stamp());

        let mut q = reread(&p, None).unwrap();
        q.add_fields(FECHO_REPLY, false).unwrap();
        q.add_timestamp_fields(StampAt::Midpoint, Clock::Both).unwrap();
        assert_eq!(q.stamp_at(), StampAt::Midpoint);
        let ts = q.timestamp();
        assert_eq!(ts.receive, mt);
        assert_eq!(ts.send, mt);
        assert!(ts.is_midpoint());
    }

    #[test]
    fn open_and_close_both_set_is_rejected() {
        let mut p = Packet::new(0, 256, None);
        p.set_flag_bits(flag::OPEN | flag::CLOSE);
        let err = reread(&p, None).unwrap_err();
        assert!(matches!(err, Error::OpenCloseBothSet));
    }

    #[test]
    fn open_close_reply_is_accepted_and_closed() {
        let mut p = Packet::new(0, 256, None);
        p.set_fields(FOPEN_REPLY, true).unwrap();
        p.set_flag_bits(flag::OPEN | flag::CLOSE | flag::REPLY);
        p.set_ctoken(0);
        reread(&p, None).unwrap();
    }

    #[test]
    fn invalid_flag_bits_are_rejected() {
        let mut p = Packet::new(0, 256, None);
        p.set_flag_bits(0x40);
        let err = reread(&p, None).unwrap_err();
        assert!(matches!(err, Error::InvalidFlagBitsSet(_)));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut p = Packet::new(0, 256, None);
        p.set_flag_bits(flag::REPLY);
        let mut wire = p.bytes().to_vec();
        wire[1] ^= 0xff;
        let mut q = Packet::new(0, 256, None);
        q.read_to()[..wire.len()].copy_from_slice(&wire);
        assert!(matches!(q.read_reset(wire.len()), Err(Error::BadMagic(_))));
    }

    #[test]
    fn midpoint_is_exclusive_with_pair() {
        let mut p = Packet::new(0, 256, None);
        p.set_fields(FECHO_REPLY, true).unwrap();
        p.set_reply(true);
        // force both a midpoint and a receive stamp into the layout
        p.fb.set_to(Fidx::MMono).copy_from_slice(&1i64.to_le_bytes());
        p.fb.set_to(Fidx::RMono).copy_from_slice(&2i64.to_le_bytes());
        let err = reread(&p, None).unwrap_err();
        assert!(matches!(err, Error::NonexclusiveMidpointStamp));
    }

    #[test]
    fn inconsistent_clocks_are_rejected() {
        let mut p = Packet::new(0, 256, None);
        p.set_fields(FECHO_REPLY, true).unwrap();
        p.set_reply(true);
        p.fb.set_to(Fidx::RWall).copy_from_slice(&1i64.to_le_bytes());
        p.fb.set_to(Fidx::SMono).copy_from_slice(&2i64.to_le_bytes());
        let err = reread(&p, None).unwrap_err();
        assert!(matches!(err, Error::InconsistentClocks { .. }));
    }

    #[test]
    fn hmac_round_trip_and_bit_flips() {
        let mut p = Packet::new(0, 256, Some(KEY));
        p.add_fields(FECHO_REQUEST, true).unwrap();
        p.set_ctoken(99);
        p.set_seqno(1);
        p.set_len(64);
        p.zero_payload();
        p.update_hmac();
        assert!(p.flags() & flag::HMAC != 0);

        // intact packet validates
        reread(&p, Some(KEY)).unwrap();

        // flipping any bit invalidates the MAC, including in the MAC itself
        for byte in [3usize, 4, 30, 63] {
            let mut wire = p.bytes().to_vec();
            wire[byte] ^= 0x01;
            let mut q = Packet::new(0, 256, Some(KEY));
            q.read_to()[..wire.len()].copy_from_slice(&wire);
            let err = q.read_reset(wire.len()).unwrap_err();
            assert!(
                matches!(err, Error::BadHmac | Error::OpenCloseBothSet | Error::InvalidFlagBitsSet(_)),
                "byte {}: {:?}",
                byte,
                err
            );
        }
    }

    #[test]
    fn missing_hmac_is_rejected_when_key_expected() {
        let p = Packet::new(0, 256, None);
        let err = reread(&p, Some(KEY)).unwrap_err();
        assert!(matches!(err, Error::NoHmac));
    }

    #[test]
    fn unexpected_hmac_is_rejected_without_key() {
        let mut p = Packet::new(0, 256, Some(KEY));
        p.update_hmac();
        let err = reread(&p, None).unwrap_err();
        assert!(matches!(err, Error::UnexpectedHmac));
    }

    #[test]
    fn short_datagram_fails_length_validation() {
        let mut q = Packet::new(0, 256, None);
        q.read_to()[..2].copy_from_slice(&MAGIC[..2]);
        assert!(matches!(
            q.read_reset(2),
            Err(Error::FieldsLengthTooLarge { .. })
        ));
    }

    #[test]
    fn payload_is_padding_after_fields() {
        let mut p = Packet::new(0, 256, None);
        p.set_fields(FECHO_REQUEST, true).unwrap();
        assert_eq!(p.length(), 16);
        assert!(p.payload().is_empty());
        p.set_len(64);
        assert_eq!(p.payload().len(), 48);
        p.zero_payload();
        assert!(p.payload().iter().all(|&b| b == 0));
    }

    #[test]
    fn growing_a_field_shifts_the_tail() {
        let mut p = Packet::new(0, 256, None);
        p.set_fields(FCLOSE_REQUEST, true).unwrap();
        p.set_ctoken(0xaabbccdd00112233);
        // inserting the seqno field after the token shifts the tail without
        // clobbering earlier fields
        p.set_seqno(5);
        assert_eq!(p.ctoken(), 0xaabbccdd00112233);
        assert_eq!(p.seqno(), 5);
    }

    #[test]
    fn max_header_len_matches_field_caps() {
        assert_eq!(FIELD_CAPS.iter().sum::<usize>(), MAX_HEADER_LEN);
        assert_eq!(FIELD_CAPS[Fidx::Magic as usize] + FIELD_CAPS[Fidx::Flags as usize], MIN_HEADER_LEN);
    }
}
