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

//! rlat measures isochronous round-trip latency over UDP. A client sends
//! a steady cadence of timestamped requests; the server echoes each one
//! with optional timestamps and received-packet statistics; the client
//! records round-trip times, one-way delays, jitter, loss, duplicates and
//! reordering.

pub mod average;
pub mod client;
pub mod config;
mod connmgr;
mod error;
pub mod event;
pub mod fill;
pub(crate) mod protocol;
pub mod recorder;
pub mod result;
pub mod server;
pub mod sock;
pub mod time;
pub mod timer;
pub(crate) mod utils;
pub mod wait;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use event::{Code, Event, Handler};
pub use protocol::params::Params;
pub use protocol::PROTOCOL_VERSION;
pub use result::{Lost, TestResult};
pub use server::{Server, ShutdownHandle};
pub use utils::cancel::CancelToken;
