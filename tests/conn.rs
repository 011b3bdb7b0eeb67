//! End-to-end exercises driving a client and server endpoint against each other with a
//! scripted stand-in for the TLS stack.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use slog::{o, Discard, Logger};

use quill_proto::{
    Cipher, Config, ConnectionError, ConnectionHandle, Directionality, EncLevel, Endpoint, Event,
    Io, ListenKeys, ReadError, Secret, SessionFactory, Side, Timer, TlsEvent, TlsSession,
    TransportParameters,
};

fn secret(seed: u8) -> Secret {
    Secret::new(Cipher::Aes128Gcm, &[seed; 32])
}

fn msg(body: &[u8]) -> Vec<u8> {
    let mut out = (body.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(body);
    out
}

fn full_msg(buf: &[u8]) -> Option<Vec<u8>> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return None;
    }
    Some(buf[4..4 + len].to_vec())
}

/// A deterministic handshake: the "ClientHello" and "ServerHello" are just each side's
/// transport parameters behind a length prefix, and both sides install fixed secrets.
struct ScriptTls {
    side: Side,
    params: Vec<u8>,
    events: VecDeque<TlsEvent>,
    initial_in: Vec<u8>,
    handshake_in: Vec<u8>,
    started: bool,
    responded: bool,
    complete: bool,
}

impl ScriptTls {
    fn new(side: Side, params: Vec<u8>) -> Self {
        ScriptTls {
            side,
            params,
            events: VecDeque::new(),
            initial_in: Vec::new(),
            handshake_in: Vec::new(),
            started: false,
            responded: false,
            complete: false,
        }
    }
}

impl TlsSession for ScriptTls {
    fn provide_data(&mut self, level: EncLevel, data: &[u8]) {
        match level {
            EncLevel::Initial => self.initial_in.extend_from_slice(data),
            EncLevel::Handshake => self.handshake_in.extend_from_slice(data),
            _ => {}
        }
    }

    fn progress(&mut self) {
        match self.side {
            Side::Client => {
                if !self.started {
                    self.started = true;
                    self.events.push_back(TlsEvent::HandshakeData {
                        level: EncLevel::Initial,
                        data: msg(&self.params),
                    });
                }
                if !self.complete {
                    if let Some(server_params) = full_msg(&self.initial_in) {
                        self.complete = true;
                        self.events.push_back(TlsEvent::WriteSecret {
                            level: EncLevel::Handshake,
                            secret: secret(1),
                        });
                        self.events.push_back(TlsEvent::ReadSecret {
                            level: EncLevel::Handshake,
                            secret: secret(2),
                        });
                        self.events
                            .push_back(TlsEvent::TransportParameters(server_params));
                        self.events.push_back(TlsEvent::HandshakeData {
                            level: EncLevel::Handshake,
                            data: b"fin".to_vec(),
                        });
                        self.events.push_back(TlsEvent::WriteSecret {
                            level: EncLevel::OneRtt,
                            secret: secret(3),
                        });
                        self.events.push_back(TlsEvent::ReadSecret {
                            level: EncLevel::OneRtt,
                            secret: secret(4),
                        });
                        self.events.push_back(TlsEvent::HandshakeComplete);
                    }
                }
            }
            Side::Server => {
                if !self.responded {
                    if let Some(client_params) = full_msg(&self.initial_in) {
                        self.responded = true;
                        self.events
                            .push_back(TlsEvent::TransportParameters(client_params));
                        self.events.push_back(TlsEvent::HandshakeData {
                            level: EncLevel::Initial,
                            data: msg(&self.params),
                        });
                        self.events.push_back(TlsEvent::ReadSecret {
                            level: EncLevel::Handshake,
                            secret: secret(1),
                        });
                        self.events.push_back(TlsEvent::WriteSecret {
                            level: EncLevel::Handshake,
                            secret: secret(2),
                        });
                        self.events.push_back(TlsEvent::ReadSecret {
                            level: EncLevel::OneRtt,
                            secret: secret(3),
                        });
                        self.events.push_back(TlsEvent::WriteSecret {
                            level: EncLevel::OneRtt,
                            secret: secret(4),
                        });
                    }
                }
                if self.responded && !self.complete && self.handshake_in.ends_with(b"fin") {
                    self.complete = true;
                    self.events.push_back(TlsEvent::HandshakeComplete);
                }
            }
        }
    }

    fn poll_event(&mut self) -> Option<TlsEvent> {
        self.events.pop_front()
    }

    fn is_handshaking(&self) -> bool {
        !self.complete
    }
}

struct ScriptFactory;

impl SessionFactory for ScriptFactory {
    fn start_session(
        &self,
        side: Side,
        _server_name: Option<&str>,
        params: &TransportParameters,
    ) -> Box<dyn TlsSession> {
        let mut blob = Vec::new();
        params.write(&mut blob);
        Box::new(ScriptTls::new(side, blob))
    }
}

fn config() -> Config {
    Config {
        max_remote_bi_streams: 8,
        max_remote_uni_streams: 8,
        ..Config::default()
    }
}

type TimerTable = HashMap<(ConnectionHandle, Timer), u64>;

struct Pair {
    client: Endpoint,
    server: Endpoint,
    client_addr: SocketAddrV6,
    server_addr: SocketAddrV6,
    client_timers: TimerTable,
    server_timers: TimerTable,
    time: u64,
}

impl Pair {
    fn new() -> Self {
        Pair::with_configs(config(), config())
    }

    fn with_configs(client_config: Config, server_config: Config) -> Self {
        let log = Logger::root(Discard, o!());
        let client =
            Endpoint::new(log.clone(), client_config, Arc::new(ScriptFactory), None).unwrap();
        let server = Endpoint::new(
            log,
            server_config,
            Arc::new(ScriptFactory),
            Some(ListenKeys::new(&mut rand::thread_rng())),
        )
        .unwrap();
        Pair {
            client,
            server,
            client_addr: SocketAddrV6::new(Ipv6Addr::LOCALHOST, 1111, 0, 0),
            server_addr: SocketAddrV6::new(Ipv6Addr::LOCALHOST, 4433, 0, 0),
            client_timers: TimerTable::new(),
            server_timers: TimerTable::new(),
            time: 10_000,
        }
    }

    /// Shuttle datagrams both ways until neither side has anything to transmit
    fn drive(&mut self) {
        for _ in 0..64 {
            let mut progressed = false;
            while let Some(io) = self.client.poll_io(self.time) {
                match io {
                    Io::Transmit { packet, .. } => {
                        self.server
                            .handle(self.time, self.client_addr, BytesMut::from(&packet[..]));
                        progressed = true;
                    }
                    Io::TimerStart {
                        connection,
                        timer,
                        time,
                    } => {
                        self.client_timers.insert((connection, timer), time);
                    }
                    Io::TimerStop { connection, timer } => {
                        self.client_timers.remove(&(connection, timer));
                    }
                }
            }
            while let Some(io) = self.server.poll_io(self.time) {
                match io {
                    Io::Transmit { packet, .. } => {
                        self.client
                            .handle(self.time, self.server_addr, BytesMut::from(&packet[..]));
                        progressed = true;
                    }
                    Io::TimerStart {
                        connection,
                        timer,
                        time,
                    } => {
                        self.server_timers.insert((connection, timer), time);
                    }
                    Io::TimerStop { connection, timer } => {
                        self.server_timers.remove(&(connection, timer));
                    }
                }
            }
            if !progressed {
                return;
            }
        }
        panic!("endpoints did not go quiet");
    }

    /// Move the clock forward, firing whatever timers come due, then settle
    fn advance(&mut self, dt: u64) {
        self.time += dt;
        let now = self.time;
        let due: Vec<(ConnectionHandle, Timer)> = self
            .client_timers
            .iter()
            .filter(|(_, &t)| t <= now)
            .map(|(&k, _)| k)
            .collect();
        for (handle, timer) in due {
            self.client_timers.remove(&(handle, timer));
            self.client.timeout(now, handle, timer);
        }
        let due: Vec<(ConnectionHandle, Timer)> = self
            .server_timers
            .iter()
            .filter(|(_, &t)| t <= now)
            .map(|(&k, _)| k)
            .collect();
        for (handle, timer) in due {
            self.server_timers.remove(&(handle, timer));
            self.server.timeout(now, handle, timer);
        }
        self.drive();
    }
}

#[test]
fn handshake_stream_and_close() {
    let mut pair = Pair::new();
    let client_ch = pair.client.connect(pair.server_addr, "example.com").unwrap();
    pair.drive();

    let mut connected = false;
    while let Some((ch, event)) = pair.client.poll() {
        if let Event::Connected = event {
            assert_eq!(ch, client_ch);
            connected = true;
        }
    }
    assert!(connected, "client never became established");
    let server_ch = pair.server.accept().expect("server accepted a connection");

    // Client-initiated uni stream carrying "hello" and FIN
    let stream_id = pair
        .client
        .open(client_ch, Directionality::Uni)
        .expect("peer advertised uni streams");
    assert_eq!(pair.client.write(client_ch, stream_id, b"hello").unwrap(), 5);
    pair.client.finish(client_ch, stream_id);
    pair.drive();

    let mut readable = None;
    while let Some((ch, event)) = pair.server.poll() {
        if let Event::StreamReadable { stream } = event {
            assert_eq!(ch, server_ch);
            readable = Some(stream);
        }
    }
    let rs = readable.expect("server saw no readable stream");
    assert_eq!(rs, stream_id);
    let mut buf = [0; 32];
    assert_eq!(pair.server.read(server_ch, rs, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    assert!(matches!(
        pair.server.read(server_ch, rs, &mut buf),
        Err(ReadError::Finished)
    ));
    // Let the server's delayed ack fire
    pair.advance(30_000);

    // The ACK of the FIN finishes the stream at the client
    let mut finished = false;
    while let Some((_, event)) = pair.client.poll() {
        if let Event::StreamFinished { stream } = event {
            assert_eq!(stream, stream_id);
            finished = true;
        }
    }
    assert!(finished, "client never saw the stream finish");

    // Application close reaches the peer
    pair.client
        .close(pair.time, client_ch, 42, Bytes::from_static(b"bye"));
    pair.drive();
    let mut lost = false;
    while let Some((ch, event)) = pair.server.poll() {
        if let Event::ConnectionLost {
            reason: ConnectionError::ApplicationClosed { reason },
        } = event
        {
            assert_eq!(ch, server_ch);
            assert_eq!(reason.error_code, 42);
            lost = true;
        }
    }
    assert!(lost, "server never observed the close");
}

#[test]
fn short_peer_ack_delay_caps_timer() {
    // The client advertises a 5 ms ack budget; the server's delayed ACK must honor it
    // rather than its own 25 ms default.
    let client_config = Config {
        max_ack_delay: 5,
        ..config()
    };
    let mut pair = Pair::with_configs(client_config, config());
    let client_ch = pair.client.connect(pair.server_addr, "example.com").unwrap();
    pair.drive();
    while pair.client.poll().is_some() {}
    let server_ch = pair.server.accept().expect("server accepted a connection");

    let stream_id = pair
        .client
        .open(client_ch, Directionality::Uni)
        .expect("peer advertised uni streams");
    pair.client.write(client_ch, stream_id, b"hello").unwrap();
    pair.client.finish(client_ch, stream_id);
    pair.drive();
    while pair.server.poll().is_some() {}
    let mut buf = [0; 16];
    assert_eq!(pair.server.read(server_ch, stream_id, &mut buf).unwrap(), 5);

    // 6 ms is past the peer's 5 ms budget but far short of 25 ms
    pair.advance(6_000);
    let mut finished = false;
    while let Some((_, event)) = pair.client.poll() {
        if let Event::StreamFinished { stream } = event {
            assert_eq!(stream, stream_id);
            finished = true;
        }
    }
    assert!(
        finished,
        "server did not flush its ack within the peer's ack-delay budget"
    );
}

#[test]
fn bidirectional_echo() {
    let mut pair = Pair::new();
    let client_ch = pair.client.connect(pair.server_addr, "example.com").unwrap();
    pair.drive();
    let server_ch = pair.server.accept().expect("server accepted");

    let stream_id = pair
        .client
        .open(client_ch, Directionality::Bi)
        .expect("peer advertised bidi streams");
    pair.client.write(client_ch, stream_id, b"ping").unwrap();
    pair.drive();

    let mut buf = [0; 32];
    // Drain server readability and echo back on the same stream
    while pair.server.poll().is_some() {}
    assert_eq!(pair.server.read(server_ch, stream_id, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"ping");
    pair.server.write(server_ch, stream_id, b"pong").unwrap();
    pair.drive();

    while pair.client.poll().is_some() {}
    assert_eq!(pair.client.read(client_ch, stream_id, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"pong");
}
