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

//! Client/server tests over loopback.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rlat::{
    Client, ClientConfig, Code, Error, Event, Handler, Server, ServerConfig, ShutdownHandle,
    TestResult,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Collects events so tests can assert on what the server or client saw.
#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    fn codes(&self) -> Vec<Code> {
        self.events.lock().unwrap().iter().map(|e| e.code).collect()
    }

    fn has(&self, code: Code) -> bool {
        self.codes().contains(&code)
    }
}

impl Handler for EventLog {
    fn on_event(&self, e: &Event) {
        log::debug!("event: {}", e);
        self.events.lock().unwrap().push(e.clone());
    }
}

struct TestServer {
    addr: String,
    shutdown: ShutdownHandle,
    handle: thread::JoinHandle<rlat::Result<()>>,
}

impl TestServer {
    fn start(mut cfg: ServerConfig) -> TestServer {
        cfg.addrs = vec!["127.0.0.1:0".to_string()];
        let mut server = Server::new(cfg);
        server.listen().expect("bind loopback listener");
        let addr = server.local_addrs()[0].to_string();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.serve());
        TestServer { addr, shutdown, handle }
    }

    fn stop(self) {
        self.shutdown.shutdown();
        self.handle.join().expect("server thread").expect("server exits cleanly");
    }
}

fn quick_client(addr: &str) -> ClientConfig {
    let mut cfg = ClientConfig::new(addr);
    cfg.params.duration = Duration::from_millis(500);
    cfg.params.interval = Duration::from_millis(50);
    cfg.params.length = 64;
    cfg.open_timeouts = vec![Duration::from_millis(500), Duration::from_secs(1)];
    cfg
}

fn run_ok(cfg: ClientConfig) -> TestResult {
    let result = Client::new(cfg).run().expect("test starts");
    assert!(result.send_err.is_none(), "send error: {:?}", result.send_err);
    assert!(result.receive_err.is_none(), "receive error: {:?}", result.receive_err);
    result
}

#[test]
fn basic_round_trips() {
    init_logging();
    let server_events = Arc::new(EventLog::default());
    let server = TestServer::start(ServerConfig {
        handler: Some(server_events.clone()),
        ..ServerConfig::default()
    });

    let result = run_ok(quick_client(&server.addr));

    // 500ms at 50ms intervals is up to 11 sends counting the first; timer
    // misses can skip an interval on a loaded machine
    assert!(result.packets_sent >= 8 && result.packets_sent <= 11, "{}", result.packets_sent);
    assert!(
        result.packets_received >= result.packets_sent - 1,
        "{} of {} received",
        result.packets_received,
        result.packets_sent
    );
    assert_eq!(result.duplicates, 0);
    assert!(result.packet_loss_percent < 20.0);
    assert_eq!(result.rtt.n, result.packets_received);
    assert!(result.rtt.max > 0);
    // both stamps are on by default, so processing time is visible
    assert_eq!(result.server_processing.n, result.packets_received);
    assert!(result.bytes_sent >= 64 * result.packets_sent);
    assert!(result.server_packets_received as u64 >= result.packets_received);
    assert!(!result.cancelled);

    assert!(server_events.has(Code::NewConn));
    // give the listener a moment to process the client's close packet
    thread::sleep(Duration::from_millis(200));
    server.stop();
    assert!(server_events.has(Code::CloseConn), "server events: {:?}", server_events.codes());
}

#[test]
fn hmac_end_to_end() {
    init_logging();
    let key = b"test-hmac-key".to_vec();
    let server = TestServer::start(ServerConfig {
        hmac_key: Some(key.clone()),
        ..ServerConfig::default()
    });

    let mut cfg = quick_client(&server.addr);
    cfg.params.duration = Duration::from_millis(200);
    cfg.hmac_key = Some(key);
    let result = run_ok(cfg);
    assert!(result.packets_received > 0);
    server.stop();
}

#[test]
fn hmac_mismatch_drops_everything() {
    init_logging();
    let server_events = Arc::new(EventLog::default());
    let server = TestServer::start(ServerConfig {
        handler: Some(server_events.clone()),
        ..ServerConfig::default()
    });

    let mut cfg = quick_client(&server.addr);
    cfg.hmac_key = Some(vec![0xde, 0xad, 0xbe, 0xef]);
    cfg.open_timeouts = vec![Duration::from_millis(200)];
    match Client::new(cfg).run() {
        Err(Error::OpenTimeout) => {}
        other => panic!("expected open timeout, got {:?}", other.map(|r| r.packets_sent)),
    }

    assert!(server_events.has(Code::Drop), "server events: {:?}", server_events.codes());
    server.stop();
}

#[test]
fn server_clamps_duration() {
    init_logging();
    let server = TestServer::start(ServerConfig {
        max_duration: Some(Duration::from_millis(300)),
        ..ServerConfig::default()
    });

    // strict mode promotes the restriction to an error
    let mut cfg = quick_client(&server.addr);
    cfg.params.duration = Duration::from_secs(10);
    cfg.strict = true;
    match Client::new(cfg).run() {
        Err(Error::ParamsChanged(_)) => {}
        other => panic!("expected params-changed, got {:?}", other.map(|r| r.packets_sent)),
    }

    // otherwise the clamped duration is used
    let mut cfg = quick_client(&server.addr);
    cfg.params.duration = Duration::from_secs(10);
    let result = run_ok(cfg);
    assert_eq!(result.params.duration, Duration::from_millis(300));
    assert!(result.packets_sent <= 7, "{} packets", result.packets_sent);
    server.stop();
}

#[test]
fn server_raises_interval() {
    init_logging();
    let server = TestServer::start(ServerConfig {
        min_interval: Some(Duration::from_millis(100)),
        ..ServerConfig::default()
    });

    let mut cfg = quick_client(&server.addr);
    cfg.params.duration = Duration::from_millis(400);
    cfg.params.interval = Duration::from_millis(20);
    let result = run_ok(cfg);
    assert_eq!(result.params.interval, Duration::from_millis(100));
    assert!(result.packets_sent <= 5, "{} packets", result.packets_sent);
    server.stop();
}

#[test]
fn open_close_never_registers_a_conn() {
    init_logging();
    let server_events = Arc::new(EventLog::default());
    let server = TestServer::start(ServerConfig {
        handler: Some(server_events.clone()),
        ..ServerConfig::default()
    });

    let mut cfg = quick_client(&server.addr);
    cfg.no_test = true;
    let result = Client::new(cfg).run().expect("open-close succeeds");
    assert_eq!(result.packets_sent, 0);
    assert_eq!(result.packets_received, 0);

    // the close lands after run() returns; give the listener a moment
    thread::sleep(Duration::from_millis(200));
    assert!(server_events.has(Code::OpenClose), "server events: {:?}", server_events.codes());
    assert!(!server_events.has(Code::CloseConn));
    server.stop();
}

#[test]
fn cancellation_returns_partial_results() {
    init_logging();
    let server = TestServer::start(ServerConfig::default());

    let mut cfg = quick_client(&server.addr);
    cfg.params.duration = Duration::from_secs(30);
    let client = Client::new(cfg);
    let cancel = client.cancel_handle();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        cancel.cancel();
    });

    let result = client.run().expect("cancellation is not a failure");
    canceller.join().unwrap();
    assert!(result.cancelled);
    assert!(result.packets_sent > 0);
    assert!(result.packets_sent < 30, "cancelled long before the duration");
    server.stop();
}

#[test]
fn midpoint_stamp_under_single_stamp_policy() {
    init_logging();
    let server = TestServer::start(ServerConfig {
        allow_stamp: rlat::time::AllowStamp::Single,
        ..ServerConfig::default()
    });

    let mut cfg = quick_client(&server.addr);
    cfg.params.duration = Duration::from_millis(200);
    let result = run_ok(cfg);
    // a request for both stamps under a single-stamp policy becomes the
    // midpoint, which carries no processing-time spread
    assert_eq!(result.params.stamp_at, rlat::time::StampAt::Midpoint);
    assert!(result.packets_received > 0);
    assert_eq!(result.server_processing.n, 0);
    server.stop();
}

#[test]
fn unreachable_server_times_out() {
    init_logging();
    // nothing listens here; the port is bound and dropped to find a free one
    let addr = {
        let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.local_addr().unwrap().to_string()
    };
    let mut cfg = quick_client(&addr);
    cfg.open_timeouts = vec![Duration::from_millis(200), Duration::from_millis(200)];
    match Client::new(cfg).run() {
        Err(Error::OpenTimeout) => {}
        Err(Error::Io(_)) => {
            // some loopback stacks answer with ICMP refusals instead
        }
        other => panic!("expected open timeout, got {:?}", other.map(|r| r.packets_sent)),
    }
}
