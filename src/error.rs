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

use crate::time::{Clock, StampAt};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("only {n}/{len} bytes were sent")]
    ShortWrite { n: usize, len: usize },

    // wire format
    #[error("bad magic: {0:02x?}")]
    BadMagic(Vec<u8>),

    #[error("invalid flag bits set ({0:#04x})")]
    InvalidFlagBitsSet(u8),

    #[error("open and close flags are both set")]
    OpenCloseBothSet,

    #[error("non-exclusive midpoint timestamp")]
    NonexclusiveMidpointStamp,

    #[error("inconsistent clock mode between send and receive timestamps, {send} != {receive}")]
    InconsistentClocks { send: Clock, receive: Clock },

    #[error("no HMAC present")]
    NoHmac,

    #[error("invalid HMAC")]
    BadHmac,

    #[error("unexpected HMAC present")]
    UnexpectedHmac,

    #[error("fields length exceeds buffer length, {flen} > {blen}")]
    FieldsLengthTooLarge { flen: usize, blen: usize },

    #[error("fields capacity exceeds buffer capacity, {fcap} > {bcap}")]
    FieldsCapacityTooLarge { fcap: usize, bcap: usize },

    // params
    #[error("param buffer too short ({0} bytes left)")]
    ShortParamBuffer(usize),

    #[error("param value overflow")]
    ParamOverflow,

    #[error("invalid param value: {0}")]
    InvalidParamValue(String),

    #[error("invalid Clock int: {0}")]
    InvalidClockInt(i64),

    #[error("invalid Clock string: {0}")]
    InvalidClockString(String),

    #[error("invalid StampAt int: {0}")]
    InvalidStampAtInt(i64),

    #[error("invalid StampAt string: {0}")]
    InvalidStampAtString(String),

    #[error("invalid ReceivedStats int: {0}")]
    InvalidReceivedStatsInt(i64),

    #[error("invalid ReceivedStats string: {0}")]
    InvalidReceivedStatsString(String),

    #[error("invalid AllowStamp string: {0}")]
    InvalidAllowStampString(String),

    // client protocol
    #[error("unexpected open flag set")]
    UnexpectedOpenFlag,

    #[error("reply flag not set")]
    ExpectedReplyFlag,

    #[error("unexpected reply flag set")]
    UnexpectedReplyFlag,

    #[error("received short reply ({len} < {expected} bytes)")]
    ShortReply { len: usize, expected: usize },

    #[error("server stamped at {got}, but {requested} was requested")]
    StampAtMismatch { got: StampAt, requested: StampAt },

    #[error("server clock {got}, but {requested} was requested")]
    ClockMismatch { got: Clock, requested: Clock },

    #[error("unexpected reply sequence number {0}")]
    UnexpectedSequenceNumber(u32),

    #[error("received invalid zero conn token")]
    ConnTokenZero,

    #[error("server closed connection")]
    ServerClosed,

    #[error("no reply from server after open timeouts")]
    OpenTimeout,

    #[error("open timeout {0:?} must be >= {1:?}")]
    OpenTimeoutTooShort(std::time::Duration, std::time::Duration),

    #[error("client protocol version {client} != server version {server}")]
    ProtocolVersionMismatch { client: i32, server: i32 },

    #[error("server restricted params: {0}")]
    ParamsChanged(String),

    #[error("invalid server restriction: {0}")]
    InvalidServerRestriction(String),

    // socket capabilities
    #[error("unable to set DSCP value ({0})")]
    NoDscpSupport(String),

    #[error("unable to set do not fragment bit ({0})")]
    DfError(String),

    #[error("setting the do not fragment bit is not supported on this platform")]
    DfNotSupported,

    #[error("invalid DF string: {0}")]
    InvalidDfString(String),

    #[error("unable to set TTL {0} ({1})")]
    TtlError(u32, String),

    #[error("no suitable listen address found for {0}")]
    NoSuitableAddressFound(String),

    // configuration
    #[error("interval must be > 0")]
    IntervalNonPositive,

    #[error("duration must be > 0")]
    DurationNonPositive,

    #[error("server fill string ({0}) must be at most {1} bytes")]
    ServerFillTooLong(String, usize),

    #[error("invalid window {0} to window average")]
    InvalidWinAvgWindow(String),

    #[error("invalid alpha {0} to exponential average")]
    InvalidExpAvgAlpha(String),

    #[error("invalid sleep factor {0} to hybrid timer")]
    InvalidSleepFactor(String),

    #[error("invalid wait {0}")]
    InvalidWaitString(String),

    #[error("invalid fill pattern {0}")]
    InvalidFillPattern(String),

    #[error("no such Averager {0}")]
    NoSuchAverager(String),

    #[error("no such Filler {0}")]
    NoSuchFiller(String),

    #[error("no such Timer {0}")]
    NoSuchTimer(String),

    #[error("no such Waiter {0}")]
    NoSuchWaiter(String),
}

impl Error {
    /// A stable identifier for the error, independent of the formatted
    /// message.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::ShortWrite { .. } => "short_write",
            Error::BadMagic(_) => "bad_magic",
            Error::InvalidFlagBitsSet(_) => "invalid_flag_bits_set",
            Error::OpenCloseBothSet => "open_close_both_set",
            Error::NonexclusiveMidpointStamp => "nonexclusive_midpoint_stamp",
            Error::InconsistentClocks { .. } => "inconsistent_clocks",
            Error::NoHmac => "no_hmac",
            Error::BadHmac => "bad_hmac",
            Error::UnexpectedHmac => "unexpected_hmac",
            Error::FieldsLengthTooLarge { .. } => "fields_length_too_large",
            Error::FieldsCapacityTooLarge { .. } => "fields_capacity_too_large",
            Error::ShortParamBuffer(_) => "short_param_buffer",
            Error::ParamOverflow => "param_overflow",
            Error::InvalidParamValue(_) => "invalid_param_value",
            Error::InvalidClockInt(_) => "invalid_clock_int",
            Error::InvalidClockString(_) => "invalid_clock_string",
            Error::InvalidStampAtInt(_) => "invalid_stamp_at_int",
            Error::InvalidStampAtString(_) => "invalid_stamp_at_string",
            Error::InvalidReceivedStatsInt(_) => "invalid_received_stats_int",
            Error::InvalidReceivedStatsString(_) => "invalid_received_stats_string",
            Error::InvalidAllowStampString(_) => "invalid_allow_stamp_string",
            Error::UnexpectedOpenFlag => "unexpected_open_flag",
            Error::ExpectedReplyFlag => "expected_reply_flag",
            Error::UnexpectedReplyFlag => "unexpected_reply_flag",
            Error::ShortReply { .. } => "short_reply",
            Error::StampAtMismatch { .. } => "stamp_at_mismatch",
            Error::ClockMismatch { .. } => "clock_mismatch",
            Error::UnexpectedSequenceNumber(_) => "unexpected_sequence_number",
            Error::ConnTokenZero => "conn_token_zero",
            Error::ServerClosed => "server_closed",
            Error::OpenTimeout => "open_timeout",
            Error::OpenTimeoutTooShort(..) => "open_timeout_too_short",
            Error::ProtocolVersionMismatch { .. } => "protocol_version_mismatch",
            Error::ParamsChanged(_) => "params_changed",
            Error::InvalidServerRestriction(_) => "invalid_server_restriction",
            Error::NoDscpSupport(_) => "no_dscp_support",
            Error::DfError(_) => "df_error",
            Error::DfNotSupported => "df_not_supported",
            Error::InvalidDfString(_) => "invalid_df_string",
            Error::TtlError(..) => "ttl_error",
            Error::NoSuitableAddressFound(_) => "no_suitable_address_found",
            Error::IntervalNonPositive => "interval_non_positive",
            Error::DurationNonPositive => "duration_non_positive",
            Error::ServerFillTooLong(..) => "server_fill_too_long",
            Error::InvalidWinAvgWindow(_) => "invalid_win_avg_window",
            Error::InvalidExpAvgAlpha(_) => "invalid_exp_avg_alpha",
            Error::InvalidSleepFactor(_) => "invalid_sleep_factor",
            Error::InvalidWaitString(_) => "invalid_wait_string",
            Error::InvalidFillPattern(_) => "invalid_fill_pattern",
            Error::NoSuchAverager(_) => "no_such_averager",
            Error::NoSuchFiller(_) => "no_such_filler",
            Error::NoSuchTimer(_) => "no_such_timer",
            Error::NoSuchWaiter(_) => "no_such_waiter",
        }
    }

    /// True for I/O errors the socket layer considers transient, which the
    /// receive loops retry instead of treating as fatal.
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
