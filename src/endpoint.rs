use std::collections::VecDeque;
use std::net::SocketAddrV6;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use fnv::{FnvHashMap, FnvHashSet};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use ring::hmac;
use slab::Slab;
use slog::Logger;

use crate::coding::BufMutExt;
use crate::congestion::{Controller, NewReno};
use crate::connection::{ClosedConnection, Connection, ConnectionHandle};
use crate::crypto::{reset_token_for, Secret, TlsSession};
use crate::packet::{
    set_payload_length, ConnectionId, Header, PacketDecodeError, PacketNumber, PartialDecode,
};
use crate::stream::{ReadError, WriteError};
use crate::suite::CryptoSuite;
use crate::transport_parameters::TransportParameters;
use crate::{
    Directionality, Side, StreamId, TransportErrorCode, AEAD_TAG_SIZE, MAX_CID_SIZE,
    MIN_INITIAL_SIZE, RESET_TOKEN_SIZE, VERSION,
};

/// Constructs TLS sessions for new connections; the TLS stack itself is outside this crate
pub trait SessionFactory: Send + Sync {
    fn start_session(
        &self,
        side: Side,
        server_name: Option<&str>,
        params: &TransportParameters,
    ) -> Box<dyn TlsSession>;
}

/// Server-side check of address-validation and retry tokens; opaque to the core
pub trait TokenValidator: Send + Sync {
    fn validate(&self, remote: &SocketAddrV6, token: &[u8]) -> bool;
}

/// Parameters governing the core QUIC state machine
pub struct Config {
    /// Maximum number of peer-initiated bidirectional streams that may exist at one time
    pub max_remote_bi_streams: u64,
    /// Maximum number of peer-initiated unidirectional streams that may exist at one time
    pub max_remote_uni_streams: u64,
    /// Maximum duration of inactivity to accept before timing out the connection (ms).
    ///
    /// The effective value is the minimum of this and the peer's. 0 for none.
    pub idle_timeout: u64,
    /// Maximum number of bytes the peer may transmit on any one stream before becoming blocked
    pub stream_receive_window: u64,
    /// Maximum number of bytes the peer may transmit across all streams before becoming blocked
    pub receive_window: u64,
    /// Maximum number of incoming connections to buffer
    ///
    /// Calling `Endpoint::accept` removes a connection from the buffer, so this does not need
    /// to be large.
    pub accept_buffer: u32,
    /// The delayed-ack budget we advertise to the peer (ms)
    pub max_ack_delay: u64,
    /// How many of our connection IDs the peer is asked to hold
    pub active_connection_id_limit: u64,
    /// Length of locally issued connection IDs, 0 or 4..=20. Zero-length IDs limit the
    /// endpoint to one connection per remote address.
    pub local_cid_len: usize,
    /// Assumed UDP payload capacity; the peer's max_udp_payload_size can only lower it
    pub mtu: u16,
    /// Builds a congestion controller per connection from the datagram size
    pub congestion_factory: fn(u64) -> Box<dyn Controller>,
    /// Optional server-side token validation plug-in
    pub token_validator: Option<Arc<dyn TokenValidator>>,
}

impl Default for Config {
    fn default() -> Self {
        const EXPECTED_RTT: u64 = 100; // ms
        const MAX_STREAM_BANDWIDTH: u64 = 12500 * 1000; // bytes/s
        // Window size needed to avoid pipeline stalls
        const STREAM_RWND: u64 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT;
        Config {
            max_remote_bi_streams: 0,
            max_remote_uni_streams: 0,
            idle_timeout: 10_000,
            stream_receive_window: STREAM_RWND,
            receive_window: 8 * STREAM_RWND,
            accept_buffer: 1024,
            max_ack_delay: 25,
            active_connection_id_limit: 4,
            local_cid_len: 8,
            mtu: crate::MIN_MTU,
            congestion_factory: |mss| Box::new(NewReno::new(mss)),
            token_validator: None,
        }
    }
}

/// Long-lived keys that let a restarted server remain intelligible to old clients
pub struct ListenKeys {
    /// Keys stateless-reset tokens for every connection ID this endpoint issues
    pub reset: hmac::Key,
}

impl ListenKeys {
    /// Be careful to use a cryptography-grade RNG.
    pub fn new<R: Rng>(rng: &mut R) -> Self {
        let mut reset_value = [0; 64];
        rng.fill_bytes(&mut reset_value);
        let reset = hmac::Key::new(hmac::HMAC_SHA256, &reset_value);
        ListenKeys { reset }
    }
}

#[derive(Debug, Fail)]
pub enum EndpointError {
    #[fail(display = "connection ID length out of bounds")]
    IllegalCidLength,
}

/// Shared work queues the connections push into while being driven
pub struct Context {
    pub rng: OsRng,
    pub config: Arc<Config>,
    pub io: VecDeque<Io>,
    pub events: VecDeque<(ConnectionHandle, Event)>,
    pub incoming: VecDeque<ConnectionHandle>,
    pub incoming_handshakes: usize,
    pub dirty_conns: FnvHashSet<ConnectionHandle>,
    pub readable_conns: FnvHashSet<ConnectionHandle>,
    /// Present iff this endpoint accepts incoming connections
    pub reset_key: Option<hmac::Key>,
}

/// The main entry point to the library
///
/// This object performs no I/O whatsoever. Instead, it generates a stream of I/O operations
/// for a backend to perform via `poll_io`, and consumes incoming datagrams and timer
/// expirations via `handle` and `timeout`. Datagrams are routed to connections by Destination
/// CID; connections that have closed are kept as cheap residues that keep answering their
/// CIDs until the drain period ends.
pub struct Endpoint {
    log: Logger,
    pub(crate) ctx: Context,
    session_factory: Arc<dyn SessionFactory>,
    connection_ids_initial: FnvHashMap<ConnectionId, ConnectionHandle>,
    connection_ids: FnvHashMap<ConnectionId, ConnectionHandle>,
    connection_remotes: FnvHashMap<SocketAddrV6, ConnectionHandle>,
    connections: Slab<Handler>,
    listen: bool,
}

enum Handler {
    Alive(Connection),
    Closed(ClosedConnection),
}

impl Endpoint {
    pub fn new(
        log: Logger,
        config: Config,
        session_factory: Arc<dyn SessionFactory>,
        listen: Option<ListenKeys>,
    ) -> Result<Self, EndpointError> {
        if config.local_cid_len != 0 && (config.local_cid_len < 4 || config.local_cid_len > MAX_CID_SIZE)
        {
            return Err(EndpointError::IllegalCidLength);
        }
        let listening = listen.is_some();
        Ok(Endpoint {
            ctx: Context {
                rng: OsRng,
                config: Arc::new(config),
                io: VecDeque::new(),
                events: VecDeque::new(),
                incoming: VecDeque::new(),
                incoming_handshakes: 0,
                dirty_conns: FnvHashSet::default(),
                readable_conns: FnvHashSet::default(),
                reset_key: listen.map(|x| x.reset),
            },
            log,
            session_factory,
            connection_ids_initial: FnvHashMap::default(),
            connection_ids: FnvHashMap::default(),
            connection_remotes: FnvHashMap::default(),
            connections: Slab::new(),
            listen: listening,
        })
    }

    fn conn(&self, handle: ConnectionHandle) -> Option<&Connection> {
        match self.connections.get(handle.0) {
            Some(Handler::Alive(conn)) => Some(conn),
            _ => None,
        }
    }

    /// Get an application-facing event
    pub fn poll(&mut self) -> Option<(ConnectionHandle, Event)> {
        if let Some(x) = self.ctx.events.pop_front() {
            return Some(x);
        }
        loop {
            let &handle = self.ctx.readable_conns.iter().next()?;
            if let Some(Handler::Alive(conn)) = self.connections.get_mut(handle.0) {
                if let Some(event) = conn.poll() {
                    return Some((handle, event));
                }
            }
            self.ctx.readable_conns.remove(&handle);
        }
    }

    /// Get a pending IO operation
    pub fn poll_io(&mut self, now: u64) -> Option<Io> {
        loop {
            if let Some(x) = self.ctx.io.pop_front() {
                return Some(x);
            }
            let &handle = self.ctx.dirty_conns.iter().next()?;
            self.flush_pending(now, handle);
            self.ctx.dirty_conns.remove(&handle);
        }
    }

    /// Process an incoming UDP datagram
    pub fn handle(&mut self, now: u64, remote: SocketAddrV6, mut data: BytesMut) {
        let datagram_len = data.len();
        while !data.is_empty() {
            match PartialDecode::new(data, self.ctx.config.local_cid_len) {
                Ok(partial_decode) => {
                    match self.handle_decode(now, remote, partial_decode, datagram_len) {
                        Some(rest) => {
                            data = rest;
                        }
                        None => {
                            return;
                        }
                    }
                }
                Err(PacketDecodeError::UnsupportedVersion {
                    source,
                    destination,
                }) => {
                    if !self.listen {
                        debug!(self.log, "dropping packet with unsupported version");
                        return;
                    }
                    trace!(self.log, "sending version negotiation");
                    let mut buf = Vec::<u8>::new();
                    Header::VersionNegotiate {
                        random: self.ctx.rng.gen(),
                        src_cid: destination,
                        dst_cid: source,
                    }
                    .encode(&mut buf);
                    buf.write::<u32>(0x0a1a_2a3a); // reserved version to exercise negotiation
                    buf.write(VERSION);
                    self.ctx.io.push_back(Io::Transmit {
                        destination: remote,
                        packet: buf.into(),
                    });
                    return;
                }
                Err(e) => {
                    trace!(self.log, "unable to decode invariant header"; "reason" => %e);
                    return;
                }
            }
        }
    }

    fn handle_decode(
        &mut self,
        now: u64,
        remote: SocketAddrV6,
        partial_decode: PartialDecode,
        datagram_len: usize,
    ) -> Option<BytesMut> {
        let dst_cid = partial_decode.dst_cid();
        let known = {
            let by_cid = if self.ctx.config.local_cid_len > 0 {
                self.connection_ids.get(&dst_cid)
            } else {
                None
            };
            by_cid
                .or_else(|| self.connection_ids_initial.get(&dst_cid))
                .or_else(|| self.connection_remotes.get(&remote))
                .cloned()
        };
        if let Some(handle) = known {
            match self.connections.get_mut(handle.0) {
                Some(Handler::Alive(conn)) => {
                    let rest = conn.handle_decode(&mut self.ctx, now, remote, partial_decode);
                    self.ctx.dirty_conns.insert(handle);
                    return rest;
                }
                Some(Handler::Closed(residue)) => {
                    // A lingering close: answer with the stored packet, rate-limited
                    if let Some(datagram) = residue.on_datagram() {
                        trace!(self.log, "re-answering a closed connection");
                        self.ctx.io.push_back(Io::Transmit {
                            destination: residue.remote,
                            packet: datagram,
                        });
                    }
                    return None;
                }
                None => return None,
            }
        }

        //
        // Potentially create a new connection
        //

        if !self.listen {
            debug!(self.log, "dropping packet for unrecognized connection"; "dcid" => %dst_cid);
            return None;
        }
        if partial_decode.has_long_header() {
            if partial_decode.is_initial() {
                if datagram_len < MIN_INITIAL_SIZE {
                    debug!(self.log, "ignoring short initial"; "dcid" => %dst_cid);
                    return None;
                }
                if let Some(token) = partial_decode.initial_token() {
                    if !token.is_empty() {
                        let valid = self
                            .ctx
                            .config
                            .token_validator
                            .as_ref()
                            .map_or(false, |v| v.validate(&remote, token));
                        if !valid {
                            debug!(self.log, "ignoring initial with unknown token");
                            return None;
                        }
                    }
                }
                return self.handle_first_initial(now, remote, partial_decode);
            }
            debug!(
                self.log,
                "ignoring non-initial packet for unknown connection"; "dcid" => %dst_cid
            );
            return None;
        }
        trace!(self.log, "dropping unrecognized short packet");
        None
    }

    /// Accept-start: derive Initial secrets from the client's DCID, build the connection, and
    /// feed it the whole datagram
    fn handle_first_initial(
        &mut self,
        now: u64,
        remote: SocketAddrV6,
        partial_decode: PartialDecode,
    ) -> Option<BytesMut> {
        let dst_cid = partial_decode.dst_cid();
        if dst_cid.len() < 8 {
            debug!(self.log, "ignoring initial with undersized dcid");
            return None;
        }
        if self.ctx.incoming.len() + self.ctx.incoming_handshakes
            >= self.ctx.config.accept_buffer as usize
        {
            debug!(self.log, "rejecting connection due to full accept buffer");
            let client_scid = partial_decode.src_cid().unwrap_or_else(|| ConnectionId::new(&[]));
            self.ctx.io.push_back(Io::Transmit {
                destination: remote,
                packet: initial_close(
                    &dst_cid,
                    &client_scid,
                    &dst_cid,
                    TransportErrorCode::CONNECTION_REFUSED,
                ),
            });
            return None;
        }
        let loc_cid = self.new_cid();
        let reset_token = match self.ctx.reset_key {
            Some(ref key) => reset_token_for(key, &loc_cid),
            None => {
                let mut token = [0; RESET_TOKEN_SIZE];
                self.ctx.rng.fill_bytes(&mut token);
                token
            }
        };
        let mut params = TransportParameters::new(&self.ctx.config);
        params.original_dst_cid = Some(dst_cid);
        params.initial_src_cid = Some(loc_cid);
        params.stateless_reset_token = Some(reset_token);
        let tls = self
            .session_factory
            .start_session(Side::Server, None, &params);
        let suite = CryptoSuite::new(Side::Server, tls, &dst_cid);

        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        let conn = Connection::new(
            self.log.new(o!("connection" => loc_cid)),
            &self.ctx.config,
            dst_cid,
            loc_cid,
            // Placeholder until the client's SCID is read from its Initial
            dst_cid,
            remote,
            Side::Server,
            suite,
            handle,
            reset_token,
        );
        entry.insert(Handler::Alive(conn));
        self.connection_ids_initial.insert(dst_cid, handle);
        if self.ctx.config.local_cid_len > 0 {
            self.connection_ids.insert(loc_cid, handle);
        }
        self.connection_remotes.insert(remote, handle);
        self.ctx.incoming_handshakes += 1;
        trace!(self.log, "accepting connection"; "dcid" => %dst_cid);

        let rest = match self.connections.get_mut(handle.0) {
            Some(Handler::Alive(conn)) => {
                conn.handle_decode(&mut self.ctx, now, remote, partial_decode)
            }
            _ => unreachable!(),
        };
        self.ctx.dirty_conns.insert(handle);
        rest
    }

    /// Initiate a connection
    pub fn connect(
        &mut self,
        remote: SocketAddrV6,
        server_name: &str,
    ) -> Result<ConnectionHandle, EndpointError> {
        let loc_cid = self.new_cid();
        // The first DCID must carry at least 64 bits of entropy
        let rem_cid = ConnectionId::random(&mut self.ctx.rng, 8);
        trace!(self.log, "initial dcid"; "value" => %rem_cid);
        let mut reset_token = [0; RESET_TOKEN_SIZE];
        self.ctx.rng.fill_bytes(&mut reset_token);
        let mut params = TransportParameters::new(&self.ctx.config);
        params.initial_src_cid = Some(loc_cid);
        let tls = self
            .session_factory
            .start_session(Side::Client, Some(server_name), &params);
        let suite = CryptoSuite::new(Side::Client, tls, &rem_cid);

        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        let mut conn = Connection::new(
            self.log.new(o!("connection" => loc_cid)),
            &self.ctx.config,
            rem_cid,
            loc_cid,
            rem_cid,
            remote,
            Side::Client,
            suite,
            handle,
            reset_token,
        );
        conn.connect(&mut self.ctx);
        entry.insert(Handler::Alive(conn));
        if self.ctx.config.local_cid_len > 0 {
            self.connection_ids.insert(loc_cid, handle);
        }
        self.connection_remotes.insert(remote, handle);
        self.ctx.dirty_conns.insert(handle);
        Ok(handle)
    }

    fn new_cid(&mut self) -> ConnectionId {
        loop {
            let cid = ConnectionId::random(&mut self.ctx.rng, self.ctx.config.local_cid_len);
            if !self.connection_ids.contains_key(&cid) {
                break cid;
            }
            assert!(self.ctx.config.local_cid_len > 0);
        }
    }

    fn flush_pending(&mut self, now: u64, handle: ConnectionHandle) {
        while let Some(packet) = match self.connections.get_mut(handle.0) {
            Some(Handler::Alive(conn)) => conn.next_packet(&mut self.ctx, now),
            _ => None,
        } {
            let destination = match self.connections.get(handle.0) {
                Some(Handler::Alive(conn)) => conn.remote,
                _ => unreachable!(),
            };
            self.ctx.io.push_back(Io::Transmit {
                destination,
                packet: packet.into(),
            });
        }
        // Routing-table deltas from connection ID issuance and retirement
        let mut swap_to_closed = false;
        let mut forget_now = false;
        if let Some(Handler::Alive(conn)) = self.connections.get_mut(handle.0) {
            for (cid, _token) in conn.local_cids.issued.drain(..) {
                self.connection_ids.insert(cid, handle);
            }
            for cid in conn.local_cids.retired.drain(..) {
                self.connection_ids.remove(&cid);
            }
            if let Some(setting) = conn.set_idle.take() {
                self.ctx.io.push_back(timer_update(handle, Timer::Idle, setting));
            }
            if let Some(setting) = conn.set_loss_detection.take() {
                self.ctx
                    .io
                    .push_back(timer_update(handle, Timer::LossDetection, setting));
            }
            if let Some(setting) = conn.set_ack_delay.take() {
                self.ctx
                    .io
                    .push_back(timer_update(handle, Timer::AckDelay, setting));
            }
            if conn.is_drained() {
                forget_now = true;
            } else if conn.is_closed() {
                swap_to_closed = true;
            }
        }
        if forget_now {
            self.forget(handle);
        } else if swap_to_closed {
            // Swap the heavyweight state for a residue that serves the close until drained
            let residue = match self.connections.get(handle.0) {
                Some(Handler::Alive(conn)) => {
                    if conn.counted_incoming {
                        self.ctx.incoming_handshakes -= 1;
                    }
                    conn.to_closed()
                }
                _ => unreachable!(),
            };
            trace!(self.log, "parking closed connection");
            self.connections[handle.0] = Handler::Closed(residue);
        }
    }

    fn forget(&mut self, handle: ConnectionHandle) {
        match self.connections.get(handle.0) {
            Some(Handler::Alive(conn)) => {
                if conn.side.is_server() {
                    self.connection_ids_initial.remove(&conn.init_cid);
                    if conn.counted_incoming {
                        self.ctx.incoming_handshakes -= 1;
                    }
                }
                let cids: Vec<ConnectionId> = conn.local_cids.iter().cloned().collect();
                for cid in cids {
                    self.connection_ids.remove(&cid);
                }
                self.connection_remotes.remove(&conn.remote);
            }
            Some(Handler::Closed(residue)) => {
                self.connection_ids_initial.remove(&residue.init_cid);
                for cid in &residue.cids {
                    self.connection_ids.remove(cid);
                }
                self.connection_remotes.remove(&residue.remote);
            }
            None => return,
        }
        self.ctx.dirty_conns.remove(&handle);
        self.ctx.readable_conns.remove(&handle);
        self.connections.remove(handle.0);
    }

    /// Handle a timer expiring
    pub fn timeout(&mut self, now: u64, handle: ConnectionHandle, timer: Timer) {
        match timer {
            Timer::Close => {
                self.ctx.io.push_back(Io::TimerStop {
                    connection: handle,
                    timer: Timer::Idle,
                });
                self.ctx
                    .events
                    .push_back((handle, Event::ConnectionDrained));
                self.forget(handle);
            }
            Timer::Idle => {
                if let Some(Handler::Alive(conn)) = self.connections.get_mut(handle.0) {
                    conn.on_idle_timeout(&mut self.ctx);
                }
                self.ctx.io.push_back(Io::TimerStop {
                    connection: handle,
                    timer: Timer::LossDetection,
                });
                self.forget(handle);
            }
            Timer::LossDetection => {
                if let Some(Handler::Alive(conn)) = self.connections.get_mut(handle.0) {
                    conn.check_packet_loss(&mut self.ctx, now);
                }
            }
            Timer::AckDelay => {
                // The flush path emits whatever ACKs have come due
                self.ctx.dirty_conns.insert(handle);
            }
        }
    }

    /// Transmit data on a stream
    ///
    /// Returns the number of bytes written on success.
    pub fn write(
        &mut self,
        handle: ConnectionHandle,
        stream: StreamId,
        data: &[u8],
    ) -> Result<usize, WriteError> {
        match self.connections.get_mut(handle.0) {
            Some(Handler::Alive(conn)) => conn.write(&mut self.ctx, stream, data),
            _ => Err(WriteError::UnknownStream),
        }
    }

    /// Indicate that no more data will be sent on a stream
    ///
    /// All previously transmitted data will still be delivered. Incoming data on bidirectional
    /// streams is unaffected.
    ///
    /// # Panics
    /// - when applied to a stream that does not have an active outgoing channel
    pub fn finish(&mut self, handle: ConnectionHandle, stream: StreamId) {
        if let Some(Handler::Alive(conn)) = self.connections.get_mut(handle.0) {
            conn.finish(&mut self.ctx, stream);
        }
    }

    /// Read data from a stream
    ///
    /// Treats a stream like a simple pipe, subject to head-of-line blocking within the stream.
    /// Consider `read_unordered` for higher throughput over lossy links.
    pub fn read(
        &mut self,
        handle: ConnectionHandle,
        stream: StreamId,
        buf: &mut [u8],
    ) -> Result<usize, ReadError> {
        self.ctx.dirty_conns.insert(handle); // May need to send flow control frames after reading
        let result = match self.connections.get_mut(handle.0) {
            Some(Handler::Alive(conn)) => conn.read(stream, buf),
            _ => return Err(ReadError::UnknownStream),
        };
        match result {
            x @ Err(ReadError::Finished) | x @ Err(ReadError::Reset { .. }) => {
                if let Some(Handler::Alive(conn)) = self.connections.get_mut(handle.0) {
                    conn.maybe_cleanup(stream);
                }
                x
            }
            x => x,
        }
    }

    /// Read a segment from a stream without ordering guarantees
    ///
    /// On success, returns `Ok((data, offset))` where `offset` is the position `data` begins
    /// in the stream. Some segments may be received multiple times.
    pub fn read_unordered(
        &mut self,
        handle: ConnectionHandle,
        stream: StreamId,
    ) -> Result<(Bytes, u64), ReadError> {
        self.ctx.dirty_conns.insert(handle);
        let result = match self.connections.get_mut(handle.0) {
            Some(Handler::Alive(conn)) => conn.read_unordered(stream),
            _ => return Err(ReadError::UnknownStream),
        };
        match result {
            x @ Err(ReadError::Finished) | x @ Err(ReadError::Reset { .. }) => {
                if let Some(Handler::Alive(conn)) = self.connections.get_mut(handle.0) {
                    conn.maybe_cleanup(stream);
                }
                x
            }
            x => x,
        }
    }

    /// Abandon transmitting data on a stream
    pub fn reset(&mut self, handle: ConnectionHandle, stream: StreamId, error_code: u64) {
        if let Some(Handler::Alive(conn)) = self.connections.get_mut(handle.0) {
            conn.reset(&mut self.ctx, stream, error_code);
        }
    }

    /// Instruct the peer to abandon transmitting data on a stream
    pub fn stop_sending(&mut self, handle: ConnectionHandle, stream: StreamId, error_code: u64) {
        if let Some(Handler::Alive(conn)) = self.connections.get_mut(handle.0) {
            conn.stop_sending(&mut self.ctx, stream, error_code);
        }
    }

    /// Create a new stream
    ///
    /// Returns `None` if the maximum number of streams currently permitted by the remote
    /// endpoint are already open.
    pub fn open(
        &mut self,
        handle: ConnectionHandle,
        directionality: Directionality,
    ) -> Option<StreamId> {
        match self.connections.get_mut(handle.0) {
            Some(Handler::Alive(conn)) => conn.open(&mut self.ctx, directionality),
            _ => None,
        }
    }

    /// Ping the remote endpoint
    ///
    /// Useful for preventing an otherwise idle connection from timing out.
    pub fn ping(&mut self, handle: ConnectionHandle) {
        if let Some(Handler::Alive(conn)) = self.connections.get_mut(handle.0) {
            conn.ping(&mut self.ctx);
        }
    }

    /// Close a connection immediately
    ///
    /// This does not ensure delivery of outstanding data. It is the application's
    /// responsibility to call this only when all important communications have been completed.
    pub fn close(&mut self, now: u64, handle: ConnectionHandle, error_code: u64, reason: Bytes) {
        let drained = match self.connections.get(handle.0) {
            Some(Handler::Alive(conn)) => conn.is_drained(),
            _ => return,
        };
        if drained {
            self.forget(handle);
            return;
        }
        if let Some(Handler::Alive(conn)) = self.connections.get_mut(handle.0) {
            conn.close(&mut self.ctx, now, error_code, reason);
        }
        self.ctx.dirty_conns.insert(handle);
    }

    pub fn accept(&mut self) -> Option<ConnectionHandle> {
        self.ctx.incoming.pop_front()
    }

    /// Look up whether we're the client or server of `handle`
    pub fn get_side(&self, handle: ConnectionHandle) -> Option<Side> {
        self.conn(handle).map(|c| c.side)
    }

    pub fn get_remote_address(&self, handle: ConnectionHandle) -> Option<&SocketAddrV6> {
        self.conn(handle).map(|c| &c.remote)
    }

    /// The number of bytes of packets containing retransmittable frames that have not been
    /// acknowledged or declared lost
    pub fn get_bytes_in_flight(&self, handle: ConnectionHandle) -> u64 {
        self.conn(handle).map_or(0, |c| c.get_bytes_in_flight())
    }

    /// Number of bytes worth of non-ack-only packets that may be sent
    pub fn get_congestion_state(&self, handle: ConnectionHandle) -> u64 {
        self.conn(handle).map_or(0, |c| c.congestion_state())
    }
}

fn timer_update(connection: ConnectionHandle, timer: Timer, setting: Option<u64>) -> Io {
    match setting {
        Some(time) => Io::TimerStart {
            connection,
            timer,
            time,
        },
        None => Io::TimerStop { connection, timer },
    }
}

/// Build a close packet protected with Initial keys derived from the client's DCID, for
/// refusing connections before any state exists
fn initial_close(
    keys_dst_cid: &ConnectionId,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    code: TransportErrorCode,
) -> Box<[u8]> {
    let secret = Secret::initial(keys_dst_cid, Side::Server, true);
    let keys = match secret.keys() {
        Ok(x) => x,
        Err(_) => return Box::new([]),
    };
    let number = PacketNumber::U8(0);
    let header = Header::Initial {
        dst_cid: *dst_cid,
        src_cid: *src_cid,
        token: Bytes::new(),
        number,
    };
    let mut buf = Vec::new();
    let partial = header.encode(&mut buf);
    let header_len = partial.header_len();
    crate::frame::ConnectionClose {
        error_code: code,
        frame_type: None,
        reason: Bytes::new(),
    }
    .encode(&mut buf, 128);
    let min_payload = 4usize.saturating_sub(number.len());
    if buf.len() - header_len < min_payload {
        buf.resize(header_len + min_payload, 0);
    }
    set_payload_length(&mut buf, header_len, number.len(), AEAD_TAG_SIZE);
    keys.encrypt(0, &mut buf, header_len);
    partial.finish(&mut buf, keys.header_key());
    buf.into()
}

/// Events of interest to the application
#[derive(Debug)]
pub enum Event {
    /// A connection was successfully established
    Connected,
    /// A connection was lost
    ConnectionLost {
        reason: crate::connection::ConnectionError,
    },
    /// A closed connection was fully drained and dropped
    ConnectionDrained,
    /// A stream has data or errors waiting to be read
    StreamReadable { stream: StreamId },
    /// A formerly write-blocked stream might now accept a write
    StreamWritable { stream: StreamId },
    /// All data sent on `stream` has been received by the peer
    StreamFinished { stream: StreamId },
    /// At least one new stream of a certain directionality may be opened
    StreamAvailable { directionality: Directionality },
}

/// I/O operations to be immediately executed by the backend
#[derive(Debug)]
pub enum Io {
    Transmit {
        destination: SocketAddrV6,
        packet: Box<[u8]>,
    },
    /// Start or reset a timer
    TimerStart {
        connection: ConnectionHandle,
        timer: Timer,
        /// Absolute μs
        time: u64,
    },
    TimerStop {
        connection: ConnectionHandle,
        timer: Timer,
    },
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum Timer {
    Close,
    LossDetection,
    AckDelay,
    Idle,
}

impl slog::Value for Timer {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}
