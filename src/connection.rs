use std::net::SocketAddrV6;
use std::{cmp, io, mem};

use bytes::{Buf, Bytes, BytesMut};
use fnv::{FnvHashMap, FnvHashSet};
use slog::Logger;

use crate::cid::{LocalCids, RemoteCids};
use crate::coding::{BufExt, BufMutExt};
use crate::congestion::Controller;
use crate::crypto::{EncLevel, Keys, ACK_DELAY_EXPONENT};
use crate::endpoint::{Config, Context, Event, Io, Timer};
use crate::frame::{self, Frame};
use crate::packet::{
    set_payload_length, ConnectionId, Header, LongType, Packet, PacketNumber, PartialDecode,
};
use crate::range_set::RangeSet;
use crate::spaces::{AckHandle, PacketSpace, RttEstimator, SentPacket, SpaceId, PACKET_THRESHOLD};
use crate::stream::{self, ReadError, Streams, WriteError};
use crate::suite::CryptoSuite;
use crate::transport_parameters::TransportParameters;
use crate::{
    Directionality, Side, StreamId, TransportError, AEAD_TAG_SIZE, MIN_INITIAL_SIZE,
    RESET_TOKEN_SIZE,
};

/// Cap on our own delayed-ack timer (μs)
const LOCAL_MAX_ACK_DELAY: u64 = 25_000;
/// Don't bother coalescing another packet into less room than this
const MIN_PACKET_SPACE: usize = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

/// Per-connection protocol state machine
///
/// Owns the key schedule, the three packet number spaces, stream state, and connection-ID
/// management; produces datagrams and timer updates through the endpoint's `Context`.
pub struct Connection {
    log: Logger,
    pub side: Side,
    pub handle: ConnectionHandle,
    pub remote: SocketAddrV6,
    /// DCID of the client's very first Initial; routes pre-handshake packets and anchors the
    /// original_destination_connection_id check
    pub init_cid: ConnectionId,
    /// SCID the peer committed to during the handshake
    rem_handshake_cid: Option<ConnectionId>,
    /// SCID of a Retry we honored (client only)
    retry_src_cid: Option<ConnectionId>,
    /// Token to carry in Initial packets
    token: Bytes,
    pub local_cids: LocalCids,
    rem_cids: RemoteCids,
    suite: CryptoSuite,
    spaces: [PacketSpace; 3],
    rtt: RttEstimator,
    cc: Box<dyn Controller>,
    pto_count: u32,
    /// ECN-CE counts last seen per space, to detect increases
    ecn_ce_seen: [u64; 3],

    key_phase: bool,
    /// Keys of the previous phase, kept for packets sent before the update boundary
    prev_read_keys: Option<(u64, Keys)>,

    pub streams: Streams,
    /// Connection-level flow control: the peer's grant and our usage of it
    pub max_data: u64,
    pub data_sent: u64,
    /// Our current grant to the peer
    pub local_max_data: u64,
    /// Window we maintain for the peer ahead of consumption
    local_window: u64,
    /// Sum of stream limits consumed by the peer; bounded by `local_max_data`
    data_recvd: u64,
    /// Bytes delivered to the application, driving window replenishment
    consumed: u64,
    max_data_handle: Option<AckHandle>,

    params: TransportParameters,
    pub peer_params: Option<TransportParameters>,
    /// Effective idle timeout (μs) after the min-of-both rule; 0 disables
    idle_timeout: u64,
    pub mtu: u16,

    state: State,
    pub app_closed: bool,
    /// Still counted in the endpoint's incoming-handshake budget
    pub counted_incoming: bool,

    // Send triggers not owned by a component
    ping_pending: bool,
    path_response: Option<u64>,
    pending_stop: Vec<StreamId>,
    pending_reset: Vec<StreamId>,
    pending_max_stream_data: FnvHashSet<StreamId>,
    msd_handles: FnvHashMap<StreamId, AckHandle>,
    max_streams_handles: [Option<AckHandle>; 2],
    data_blocked_pending: bool,
    blocked_stream_advert: Vec<StreamId>,
    streams_blocked_pending: [bool; 2],
    /// Streams blocked on connection-level flow control or congestion
    pub blocked_streams: FnvHashSet<StreamId>,
    readable_streams: FnvHashSet<StreamId>,

    // Timer updates: None if no change, Some(None) to stop, Some(Some(_)) to reset
    pub set_idle: Option<Option<u64>>,
    pub set_loss_detection: Option<Option<u64>>,
    pub set_ack_delay: Option<Option<u64>>,
}

impl Connection {
    pub fn new(
        log: Logger,
        config: &Config,
        init_cid: ConnectionId,
        loc_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddrV6,
        side: Side,
        suite: CryptoSuite,
        handle: ConnectionHandle,
        reset_token: [u8; RESET_TOKEN_SIZE],
    ) -> Self {
        let params = TransportParameters::new(config);
        let streams = Streams::new(
            side,
            config.max_remote_bi_streams,
            config.max_remote_uni_streams,
            config.stream_receive_window,
        );
        Connection {
            log,
            side,
            handle,
            remote,
            init_cid,
            rem_handshake_cid: None,
            retry_src_cid: None,
            token: Bytes::new(),
            local_cids: LocalCids::new(config.local_cid_len, loc_cid, reset_token),
            rem_cids: RemoteCids::new(rem_cid, params.active_connection_id_limit),
            suite,
            spaces: [
                PacketSpace::new(false),
                PacketSpace::new(false),
                PacketSpace::new(true),
            ],
            rtt: RttEstimator::new(),
            cc: (config.congestion_factory)(u64::from(config.mtu)),
            pto_count: 0,
            ecn_ce_seen: [0; 3],
            key_phase: false,
            prev_read_keys: None,
            streams,
            max_data: 0,
            data_sent: 0,
            local_max_data: config.receive_window,
            local_window: config.receive_window,
            data_recvd: 0,
            consumed: 0,
            max_data_handle: None,
            params,
            peer_params: None,
            idle_timeout: config.idle_timeout * 1_000,
            mtu: config.mtu,
            state: State::Handshake,
            app_closed: false,
            counted_incoming: side.is_server(),
            ping_pending: false,
            path_response: None,
            pending_stop: Vec::new(),
            pending_reset: Vec::new(),
            pending_max_stream_data: FnvHashSet::default(),
            msd_handles: FnvHashMap::default(),
            max_streams_handles: [None, None],
            data_blocked_pending: false,
            blocked_stream_advert: Vec::new(),
            streams_blocked_pending: [false; 2],
            blocked_streams: FnvHashSet::default(),
            readable_streams: FnvHashSet::default(),
            set_idle: None,
            set_loss_detection: None,
            set_ack_delay: None,
        }
    }

    /// Client: kick TLS to produce the first flight
    pub fn connect(&mut self, ctx: &mut Context) {
        debug_assert!(self.side.is_client());
        if let Err(e) = self.suite.pump() {
            debug!(self.log, "TLS refused to start"; "reason" => %e);
        }
        ctx.dirty_conns.insert(self.handle);
    }

    fn space(&self, id: SpaceId) -> &PacketSpace {
        &self.spaces[id as usize]
    }

    fn space_mut(&mut self, id: SpaceId) -> &mut PacketSpace {
        &mut self.spaces[id as usize]
    }

    pub fn is_handshaking(&self) -> bool {
        matches!(self.state, State::Handshake)
    }

    /// The transport parameters we advertise
    pub fn local_params(&self) -> &TransportParameters {
        &self.params
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, State::Established)
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn is_drained(&self) -> bool {
        matches!(self.state, State::Drained)
    }

    pub fn set_drained(&mut self) {
        self.state = State::Drained;
    }

    fn bytes_in_flight(&self) -> u64 {
        self.spaces.iter().map(|s| s.in_flight).sum()
    }

    pub fn get_bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight()
    }

    /// Bytes of non-ack-only packets that may still be sent under the congestion window
    pub fn congestion_state(&self) -> u64 {
        self.cc.window().saturating_sub(self.bytes_in_flight())
    }

    fn congestion_blocked(&self) -> bool {
        self.cc.window().saturating_sub(self.bytes_in_flight()) < u64::from(self.mtu)
    }

    fn blocked(&self) -> bool {
        self.data_sent >= self.max_data || self.congestion_blocked()
    }

    //
    // Receive path
    //

    pub fn handle_decode(
        &mut self,
        ctx: &mut Context,
        now: u64,
        remote: SocketAddrV6,
        partial_decode: PartialDecode,
    ) -> Option<BytesMut> {
        let level = match partial_decode.space() {
            None => {
                // Retry or Version Negotiation; neither is protected
                match partial_decode.finish(None) {
                    Ok((packet, _)) => self.handle_unprotected(ctx, now, packet),
                    Err(e) => {
                        trace!(self.log, "malformed unprotected packet"; "reason" => %e);
                    }
                }
                return None;
            }
            Some(SpaceId::Initial) => EncLevel::Initial,
            Some(SpaceId::Handshake) => EncLevel::Handshake,
            Some(SpaceId::Data) => {
                if partial_decode.is_zero_rtt() {
                    trace!(self.log, "dropping 0-RTT packet (not supported)");
                    return None;
                }
                EncLevel::OneRtt
            }
        };
        let space_id = level.space();
        if self.space(space_id).discarded || !self.suite.has_read_keys(level) {
            trace!(self.log, "dropping packet for level without keys");
            return None;
        }
        let result = {
            let header_key = match self.suite.read_keys(level) {
                Ok(keys) => keys.header_key(),
                Err(_) => return None,
            };
            partial_decode.finish(Some(header_key))
        };
        match result {
            Ok((packet, rest)) => {
                self.handle_packet(ctx, now, remote, packet, space_id, level);
                rest
            }
            Err(e) => {
                trace!(self.log, "unable to complete packet decoding"; "reason" => %e);
                None
            }
        }
    }

    fn handle_unprotected(&mut self, ctx: &mut Context, now: u64, packet: Packet) {
        match packet.header {
            Header::Retry {
                src_cid, ref token, ..
            } => {
                let token = token.clone();
                self.handle_retry(ctx, now, src_cid, token, &packet.header_data);
            }
            Header::VersionNegotiate { .. } => {
                if self.side.is_server() || !self.is_handshaking() {
                    return;
                }
                if self.space(SpaceId::Initial).largest_rx.is_some() {
                    // The peer already answered with a real packet; spurious
                    return;
                }
                if packet.payload.len() % 4 != 0 {
                    debug!(self.log, "malformed version negotiation");
                    return;
                }
                let mut payload = io::Cursor::new(&packet.payload[..]);
                while payload.has_remaining() {
                    let version: u32 = payload.get().unwrap();
                    if version == crate::VERSION {
                        // Our version is supported, so this packet is spurious
                        return;
                    }
                }
                debug!(self.log, "remote doesn't support our version");
                ctx.events.push_back((
                    self.handle,
                    Event::ConnectionLost {
                        reason: ConnectionError::VersionMismatch,
                    },
                ));
                self.state = State::Draining;
            }
            _ => unreachable!("protected packet in handle_unprotected"),
        }
    }

    fn handle_retry(
        &mut self,
        ctx: &mut Context,
        _now: u64,
        src_cid: ConnectionId,
        token: Bytes,
        raw: &[u8],
    ) {
        if self.side.is_server() {
            debug!(self.log, "dropping retry sent to a server");
            return;
        }
        if !self.is_handshaking()
            || self.space(SpaceId::Initial).largest_rx.is_some()
            || self.retry_src_cid.is_some()
        {
            trace!(self.log, "dropping spurious retry");
            return;
        }
        // The pseudo-packet is keyed by the DCID of our first Initial
        if token.is_empty() || !crate::crypto::verify_retry(&self.rem_cids.pick(), raw) {
            debug!(self.log, "retry integrity check failed");
            return;
        }
        trace!(self.log, "retrying"; "rem_cid" => %src_cid);
        self.retry_src_cid = Some(src_cid);
        self.token = token;
        self.rem_cids.replace_initial(src_cid);
        self.suite.rekey_initial(&src_cid);
        // The whole Initial flight is implicitly lost; CRYPTO content re-queues itself
        let space = self.space_mut(SpaceId::Initial);
        for (_, packet) in mem::replace(&mut space.sent, Default::default()) {
            for waiter in &packet.waiters {
                waiter.mark_lost();
            }
        }
        space.in_flight = 0;
        space.ack_eliciting_in_flight = 0;
        ctx.dirty_conns.insert(self.handle);
    }

    fn handle_packet(
        &mut self,
        ctx: &mut Context,
        now: u64,
        remote: SocketAddrV6,
        mut packet: Packet,
        space_id: SpaceId,
        level: EncLevel,
    ) {
        let rx_dcid = *packet.header.dst_cid();
        let number = match self.decrypt_packet(&mut packet, space_id, level) {
            Ok(number) => number,
            Err(()) => {
                // A failed short-header open may really be a stateless reset
                if level == EncLevel::OneRtt
                    && packet.payload.len() >= RESET_TOKEN_SIZE
                    && self.rem_cids.is_reset_token(
                        &packet.payload[packet.payload.len() - RESET_TOKEN_SIZE..],
                    )
                {
                    debug!(self.log, "got stateless reset");
                    if !self.is_drained() {
                        ctx.events.push_back((
                            self.handle,
                            Event::ConnectionLost {
                                reason: ConnectionError::Reset,
                            },
                        ));
                        self.state = State::Drained;
                    }
                } else {
                    debug!(self.log, "failed to authenticate packet");
                }
                return;
            }
        };
        trace!(self.log, "got packet"; "pn" => number, "space" => ?space_id, "len" => packet.payload.len());

        if self.is_closed() {
            // Closing: occasionally re-answer with the stored close; draining: stay silent
            if let State::Closed(ref mut state) = self.state {
                state.packets_since_close = state.packets_since_close.wrapping_add(1);
                if state.packets_since_close % 3 == 1 {
                    ctx.io.push_back(Io::Transmit {
                        destination: remote,
                        packet: state.datagram.clone(),
                    });
                }
            }
            for frame in frame::Iter::new(packet.payload.freeze()) {
                match frame {
                    Frame::ConnectionClose(_) | Frame::ApplicationClose(_) => {
                        trace!(self.log, "draining");
                        self.state = State::Draining;
                        return;
                    }
                    _ => {}
                }
            }
            return;
        }

        // Remember the SCID the peer committed to in the handshake
        if self.rem_handshake_cid.is_none() {
            match packet.header {
                Header::Initial { src_cid, .. } | Header::Long { src_cid, .. } => {
                    trace!(self.log, "got remote connection id"; "rem_cid" => %src_cid);
                    self.rem_handshake_cid = Some(src_cid);
                    // Either side names itself in its first long-header packet
                    self.rem_cids.replace_initial(src_cid);
                }
                _ => {}
            }
        }

        if !self.space_mut(space_id).record_received(now, number, false) {
            trace!(self.log, "dropping duplicate packet"; "pn" => number);
            return;
        }
        self.reset_idle_timeout(now);

        let result =
            self.process_payload(ctx, now, space_id, level, number, rx_dcid, packet.payload.freeze());
        match result {
            Ok(true) => {
                // The peer closed; enter draining
                self.state = State::Draining;
                self.start_drain_timer(ctx, now);
            }
            Ok(false) => {
                // A server can drop Initial keys once it processes a Handshake packet
                if self.side.is_server() && space_id == SpaceId::Handshake {
                    self.discard_space(ctx, SpaceId::Initial);
                }
                self.after_handshake_progress(ctx, now);
            }
            Err(e) => {
                debug!(self.log, "transport error"; "reason" => %e);
                self.transport_close(ctx, now, e);
            }
        }
        self.set_ack_delay = Some(self.next_ack_time());
        ctx.dirty_conns.insert(self.handle);
    }

    /// Advance anything gated on handshake progress
    fn after_handshake_progress(&mut self, ctx: &mut Context, now: u64) {
        if self.suite.handshake_complete && self.is_handshaking() {
            match self.suite.take_peer_params() {
                Some(raw) => {
                    if let Err(e) = self.apply_peer_params(ctx, &raw) {
                        self.transport_close(ctx, now, e);
                        return;
                    }
                }
                None => {
                    self.transport_close(
                        ctx,
                        now,
                        TransportError::TRANSPORT_PARAMETER_ERROR
                            .reason("peer sent no transport parameters"),
                    );
                    return;
                }
            }
            self.state = State::Established;
            trace!(self.log, "connection established");
            match self.side {
                Side::Client => {
                    ctx.events.push_back((self.handle, Event::Connected));
                }
                Side::Server => {
                    ctx.incoming_handshakes -= 1;
                    self.counted_incoming = false;
                    ctx.incoming.push_back(self.handle);
                }
            }
        }
        if self.suite.maybe_discard_handshake() {
            self.discard_space(ctx, SpaceId::Handshake);
        }
    }

    fn discard_space(&mut self, ctx: &mut Context, space_id: SpaceId) {
        if self.space(space_id).discarded {
            return;
        }
        if space_id == SpaceId::Initial && !self.suite.discard_initial() {
            // Handshake keys aren't installed yet; keep the space alive
            return;
        }
        trace!(self.log, "discarding number space"; "space" => ?space_id);
        self.space_mut(space_id).discard();
        self.pto_count = 0;
        self.set_loss_detection_alarm();
        ctx.dirty_conns.insert(self.handle);
    }

    fn decrypt_packet(
        &mut self,
        packet: &mut Packet,
        space_id: SpaceId,
        level: EncLevel,
    ) -> Result<u64, ()> {
        let number = packet
            .header
            .number()
            .expect("protected packet without number")
            .expand(self.space(space_id).largest_rx.unwrap_or(0));
        let key_phase = match packet.header {
            Header::Short { key_phase, .. } => key_phase,
            _ => false,
        };
        if level == EncLevel::OneRtt && key_phase != self.key_phase {
            // Either a packet from before our last update, or the peer updating now
            if let Some((boundary, ref keys)) = self.prev_read_keys {
                if number < boundary {
                    keys.decrypt(number, &packet.header_data, &mut packet.payload)
                        .map_err(|_| ())?;
                    return Ok(number);
                }
            }
            let new_keys = self.suite.next_read_keys().map_err(|_| ())?;
            new_keys
                .decrypt(number, &packet.header_data, &mut packet.payload)
                .map_err(|_| ())?;
            trace!(self.log, "key update accepted"; "boundary" => number);
            let prev = self.suite.current_read_keys().ok();
            self.suite.commit_key_update();
            self.prev_read_keys = prev.map(|keys| (number, keys));
            self.key_phase = !self.key_phase;
            return Ok(number);
        }
        let keys = self.suite.read_keys(level).map_err(|_| ())?;
        keys.decrypt(number, &packet.header_data, &mut packet.payload)
            .map_err(|_| ())?;
        Ok(number)
    }

    fn process_payload(
        &mut self,
        ctx: &mut Context,
        now: u64,
        space_id: SpaceId,
        level: EncLevel,
        number: u64,
        rx_dcid: ConnectionId,
        payload: Bytes,
    ) -> Result<bool, TransportError> {
        let mut ack_eliciting = false;
        for frame in frame::Iter::new(payload) {
            match frame {
                Frame::Padding => {}
                _ => {
                    trace!(self.log, "got frame"; "type" => %frame.ty(), "pn" => number);
                }
            }
            if space_id != SpaceId::Data {
                // Frames permitted in Initial and Handshake packets
                match frame {
                    Frame::Padding
                    | Frame::Ping
                    | Frame::Ack(_)
                    | Frame::Crypto(_)
                    | Frame::ConnectionClose(_) => {}
                    _ => {
                        return Err(TransportError::PROTOCOL_VIOLATION
                            .reason("illegal frame type for encryption level")
                            .frame(frame.ty()));
                    }
                }
            }
            ack_eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Ack(ack) => {
                    self.on_ack_received(ctx, now, space_id, ack)?;
                }
                Frame::Crypto(crypto) => {
                    self.suite.handle_crypto(level, &crypto)?;
                }
                Frame::Stream(frame) => {
                    self.handle_stream(ctx, frame)?;
                }
                Frame::ResetStream(frame) => {
                    self.handle_reset_stream(ctx, frame)?;
                }
                Frame::StopSending { id, error_code } => {
                    self.handle_stop_sending(ctx, id, error_code)?;
                }
                Frame::MaxData(offset) => {
                    let was_blocked = self.blocked();
                    self.max_data = cmp::max(offset, self.max_data);
                    if was_blocked && !self.blocked() {
                        for stream in self.blocked_streams.drain() {
                            ctx.events
                                .push_back((self.handle, Event::StreamWritable { stream }));
                        }
                    }
                }
                Frame::MaxStreamData { id, offset } => {
                    if id.initiator() != self.side && id.directionality() == Directionality::Uni {
                        return Err(TransportError::STREAM_STATE_ERROR
                            .reason("MAX_STREAM_DATA on a receive-only stream")
                            .frame(frame::Type::MAX_STREAM_DATA));
                    }
                    if let Some(ss) = self.streams.get_send_mut(id) {
                        if offset > ss.max_data {
                            trace!(self.log, "stream limit increased"; "stream" => id.0, "new" => offset);
                            let was_blocked = ss.blocked;
                            ss.max_data = offset;
                            ss.blocked = false;
                            if was_blocked {
                                ctx.events.push_back((
                                    self.handle,
                                    Event::StreamWritable { stream: id },
                                ));
                            }
                        }
                    }
                }
                Frame::MaxStreams {
                    directionality,
                    count,
                } => {
                    let limit = match directionality {
                        Directionality::Uni => &mut self.streams.max_uni,
                        Directionality::Bi => &mut self.streams.max_bi,
                    };
                    if count > *limit {
                        *limit = count;
                        ctx.events
                            .push_back((self.handle, Event::StreamAvailable { directionality }));
                    }
                }
                Frame::DataBlocked { offset } => {
                    debug!(self.log, "peer blocked at connection level"; "offset" => offset);
                }
                Frame::StreamDataBlocked { id, offset } => {
                    debug!(self.log, "peer blocked at stream level"; "stream" => id.0, "offset" => offset);
                }
                Frame::StreamsBlocked {
                    directionality,
                    limit,
                } => {
                    debug!(self.log, "peer blocked on stream count"; "dir" => %directionality, "limit" => limit);
                }
                Frame::NewConnectionId(frame) => {
                    let peer_cid_empty = self.rem_cids.pick().is_empty();
                    self.rem_cids.on_new_cid(&frame, peer_cid_empty)?;
                }
                Frame::RetireConnectionId { sequence } => {
                    self.local_cids.on_retire(sequence, &rx_dcid)?;
                    self.local_cids
                        .replenish(&mut ctx.rng, ctx.reset_key.as_ref());
                }
                Frame::PathChallenge(token) => {
                    // Only the most recent challenge is answered
                    self.path_response = Some(token);
                }
                Frame::PathResponse(token) => {
                    trace!(self.log, "ignoring unsolicited PATH_RESPONSE"; "token" => token);
                }
                Frame::NewToken { token } => {
                    if self.side.is_server() {
                        return Err(TransportError::PROTOCOL_VIOLATION
                            .reason("client sent NEW_TOKEN")
                            .frame(frame::Type::NEW_TOKEN));
                    }
                    trace!(self.log, "got address validation token"; "len" => token.len());
                }
                Frame::HandshakeDone => {
                    self.suite.handle_handshake_done()?;
                }
                Frame::ConnectionClose(reason) => {
                    ctx.events.push_back((
                        self.handle,
                        Event::ConnectionLost {
                            reason: ConnectionError::ConnectionClosed { reason },
                        },
                    ));
                    return Ok(true);
                }
                Frame::ApplicationClose(reason) => {
                    ctx.events.push_back((
                        self.handle,
                        Event::ConnectionLost {
                            reason: ConnectionError::ApplicationClosed { reason },
                        },
                    ));
                    return Ok(true);
                }
                Frame::Invalid(ty) => {
                    debug!(self.log, "received malformed frame"; "type" => %ty);
                    return Err(TransportError::FRAME_ENCODING_ERROR
                        .reason("malformed frame")
                        .frame(ty));
                }
            }
        }

        // Receive-side ACK scheduling
        if ack_eliciting {
            let out_of_order = self
                .space(space_id)
                .largest_rx
                .map_or(false, |largest| number < largest);
            // Our delay budget is bounded by whatever the peer said it will assume
            let ack_delay = LOCAL_MAX_ACK_DELAY.min(self.peer_max_ack_delay());
            let space = self.space_mut(space_id);
            space.unacked_eliciting += 1;
            if out_of_order || space.unacked_eliciting >= 2 || space_id != SpaceId::Data {
                space.ack_at = Some(now);
            } else if space.ack_at.is_none() {
                space.ack_at = Some(now + ack_delay);
            }
            space.permit_ack_only = true;
        }
        Ok(false)
    }

    fn handle_stream(
        &mut self,
        ctx: &mut Context,
        frame: frame::Stream,
    ) -> Result<(), TransportError> {
        let id = frame.id;
        if id.initiator() == self.side && id.directionality() == Directionality::Uni {
            return Err(TransportError::STREAM_STATE_ERROR
                .reason("STREAM frame for our send-only stream")
                .frame(frame.ty()));
        }
        let local_max_data = self.local_max_data;
        let data_recvd = self.data_recvd;
        let new_bytes = {
            let stream = match self.streams.get_remote_or_open(id)? {
                Some(x) => x,
                None => {
                    trace!(self.log, "dropping frame for closed stream"; "stream" => id.0);
                    return Ok(());
                }
            };
            let rs = match stream.recv_mut() {
                Some(x) => x,
                None => {
                    trace!(self.log, "dropping frame for drained stream"; "stream" => id.0);
                    return Ok(());
                }
            };
            // Aggregate flow control is enforced against the not-yet-seen portion
            let end = frame.offset + frame.data.len() as u64;
            if end.saturating_sub(rs.limit()) + data_recvd > local_max_data {
                debug!(self.log, "connection flow control exceeded"; "stream" => id.0);
                return Err(TransportError::FLOW_CONTROL_ERROR
                    .reason("connection data limit exceeded"));
            }
            rs.ingest(&frame)?
        };
        self.data_recvd += new_bytes;
        self.readable_streams.insert(id);
        ctx.readable_conns.insert(self.handle);
        Ok(())
    }

    fn handle_reset_stream(
        &mut self,
        ctx: &mut Context,
        frame: frame::ResetStream,
    ) -> Result<(), TransportError> {
        let id = frame.id;
        if id.initiator() == self.side && id.directionality() == Directionality::Uni {
            return Err(TransportError::STREAM_STATE_ERROR
                .reason("RESET_STREAM for our send-only stream")
                .frame(frame::Type::RESET_STREAM));
        }
        let local_max_data = self.local_max_data;
        let data_recvd = self.data_recvd;
        let new_bytes = {
            let stream = match self.streams.get_remote_or_open(id)? {
                Some(x) => x,
                None => {
                    trace!(self.log, "RESET_STREAM on closed stream");
                    return Ok(());
                }
            };
            let rs = match stream.recv_mut() {
                Some(x) => x,
                None => return Ok(()),
            };
            let delta = frame.final_offset.saturating_sub(rs.limit());
            if delta + data_recvd > local_max_data {
                return Err(TransportError::FLOW_CONTROL_ERROR
                    .reason("reset final size exceeds connection data limit"));
            }
            rs.reset(frame.final_offset, frame.error_code)?;
            delta
        };
        self.data_recvd += new_bytes;
        self.readable_streams.insert(id);
        ctx.readable_conns.insert(self.handle);
        Ok(())
    }

    fn handle_stop_sending(
        &mut self,
        ctx: &mut Context,
        id: StreamId,
        error_code: u64,
    ) -> Result<(), TransportError> {
        if id.initiator() != self.side && id.directionality() == Directionality::Uni {
            return Err(TransportError::STREAM_STATE_ERROR
                .reason("STOP_SENDING for a receive-only stream")
                .frame(frame::Type::STOP_SENDING));
        }
        let newly_reset = {
            let ss = match self.streams.get_remote_or_open(id)? {
                Some(stream) => match stream.send_mut() {
                    Some(x) => x,
                    None => return Ok(()),
                },
                None => return Ok(()),
            };
            if ss.state == stream::SendState::DataRecvd {
                // Everything was already delivered; nothing to stop
                return Ok(());
            }
            ss.stop_reason = Some(error_code);
            ss.reset(error_code)
        };
        if newly_reset {
            self.pending_reset.push(id);
            ctx.dirty_conns.insert(self.handle);
        }
        Ok(())
    }

    //
    // ACK processing and loss detection
    //

    fn on_ack_received(
        &mut self,
        ctx: &mut Context,
        now: u64,
        space_id: SpaceId,
        ack: frame::Ack,
    ) -> Result<(), TransportError> {
        if ack.largest >= self.space(space_id).next_pn() {
            return Err(TransportError::PROTOCOL_VIOLATION
                .reason("ack of an unsent packet")
                .frame(frame::Type::ACK));
        }
        trace!(self.log, "got ack"; "largest" => ack.largest, "space" => ?space_id);
        let was_blocked = self.blocked();
        let ack_delay_exp = self
            .peer_params
            .as_ref()
            .map_or(ACK_DELAY_EXPONENT, |p| p.ack_delay_exponent);
        // Ack delay is only meaningful in the application space
        let ack_delay = if space_id == SpaceId::Data {
            ack.delay << ack_delay_exp
        } else {
            0
        };

        let mut newly_acked = Vec::new();
        for range in ack.iter() {
            let pns: Vec<u64> = self
                .space(space_id)
                .sent
                .range(range)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in pns {
                let packet = self.space_mut(space_id).take_sent(pn).unwrap();
                if packet.skipped {
                    return Err(TransportError::PROTOCOL_VIOLATION
                        .reason("ack of a deliberately skipped packet number")
                        .frame(frame::Type::ACK));
                }
                newly_acked.push((pn, packet));
            }
        }
        {
            let space = self.space_mut(space_id);
            space.largest_acked =
                Some(space.largest_acked.map_or(ack.largest, |x| cmp::max(x, ack.largest)));
        }
        if newly_acked.is_empty() {
            // Late or duplicate ACK; nothing else to do
            self.detect_lost_packets(ctx, now, space_id);
            return Ok(());
        }

        let mut acked_eliciting = false;
        for (pn, packet) in &newly_acked {
            if *pn == ack.largest && packet.ack_eliciting {
                self.rtt
                    .on_sample(now.saturating_sub(packet.time_sent), ack_delay);
            }
            acked_eliciting |= packet.ack_eliciting;
        }
        let mut touched = FnvHashSet::default();
        for (_, packet) in &newly_acked {
            for handle in &packet.waiters {
                handle.mark_acked();
            }
            if packet.in_flight {
                self.cc
                    .on_ack(now, packet.time_sent, u64::from(packet.size), false);
            }
            self.space_mut(space_id).pending_acks.subtract(&packet.acks);
            for &id in &packet.streams {
                touched.insert(id);
            }
        }
        for id in touched {
            self.settle_stream(ctx, id);
        }
        if acked_eliciting {
            self.pto_count = 0;
        }

        // ECN feedback: a CE increase is a congestion signal; decreases are ignored
        if let Some(counts) = ack.ecn {
            let seen = &mut self.ecn_ce_seen[space_id as usize];
            if counts.ce > *seen {
                *seen = counts.ce;
                let sent_time = newly_acked.last().map(|(_, p)| p.time_sent).unwrap_or(now);
                self.cc.on_congestion_event(now, sent_time, false);
            }
        }

        self.detect_lost_packets(ctx, now, space_id);
        if was_blocked && !self.blocked() {
            for stream in self.blocked_streams.drain() {
                ctx.events
                    .push_back((self.handle, Event::StreamWritable { stream }));
            }
        }
        ctx.dirty_conns.insert(self.handle);
        Ok(())
    }

    /// Advance a stream's send half after its packets were acknowledged
    fn settle_stream(&mut self, ctx: &mut Context, id: StreamId) {
        let finished = match self.streams.get_send_mut(id) {
            Some(ss) => ss.ack_scan(),
            None => return,
        };
        if finished {
            ctx.events
                .push_back((self.handle, Event::StreamFinished { stream: id }));
            self.streams.maybe_cleanup(id);
        }
    }

    fn detect_lost_packets(&mut self, ctx: &mut Context, now: u64, space_id: SpaceId) {
        let largest_acked = match self.space(space_id).largest_acked {
            Some(x) => x,
            None => return,
        };
        let loss_delay = self.rtt.loss_delay();
        let mut lost = Vec::new();
        let mut new_loss_time = None;
        for (&pn, packet) in self.space(space_id).sent.range(..largest_acked) {
            if packet.time_sent + loss_delay <= now || largest_acked - pn >= PACKET_THRESHOLD {
                lost.push(pn);
            } else {
                let when = packet.time_sent + loss_delay;
                new_loss_time = Some(new_loss_time.map_or(when, |x: u64| x.min(when)));
            }
        }
        self.space_mut(space_id).loss_time = new_loss_time;
        if lost.is_empty() {
            self.set_loss_detection_alarm();
            return;
        }
        trace!(self.log, "packets lost"; "pns" => ?lost, "space" => ?space_id);
        let mut latest_lost_sent = 0;
        let mut oldest_lost_sent = u64::max_value();
        let mut any_in_flight = false;
        let mut touched = FnvHashSet::default();
        for pn in lost {
            let packet = self.space_mut(space_id).take_sent(pn).unwrap();
            if packet.skipped {
                continue;
            }
            for handle in &packet.waiters {
                handle.mark_lost();
            }
            for &id in &packet.streams {
                touched.insert(id);
            }
            if packet.in_flight {
                any_in_flight = true;
                latest_lost_sent = latest_lost_sent.max(packet.time_sent);
                oldest_lost_sent = oldest_lost_sent.min(packet.time_sent);
            }
        }
        for id in touched {
            // Lost stream content re-queues itself through its handles
            self.streams.queue_send(id);
        }
        if any_in_flight {
            let persistent = self.rtt.has_sample()
                && latest_lost_sent.saturating_sub(oldest_lost_sent)
                    > 3 * (self.rtt.pto_base() + self.peer_max_ack_delay());
            self.cc
                .on_congestion_event(now, latest_lost_sent, persistent);
        }
        self.set_loss_detection_alarm();
        ctx.dirty_conns.insert(self.handle);
    }

    fn peer_max_ack_delay(&self) -> u64 {
        self.peer_params
            .as_ref()
            .map_or(25_000, |p| p.max_ack_delay * 1_000)
    }

    /// Full probe timeout with exponential backoff
    fn pto(&self) -> u64 {
        (self.rtt.pto_base() + self.peer_max_ack_delay()) * (1 << self.pto_count.min(20))
    }

    fn set_loss_detection_alarm(&mut self) {
        // Time-threshold loss takes precedence over the probe timeout
        let mut earliest: Option<u64> = None;
        for id in SpaceId::iter() {
            if let Some(t) = self.space(id).loss_time {
                earliest = Some(earliest.map_or(t, |x| x.min(t)));
            }
        }
        if earliest.is_none() {
            for id in SpaceId::iter() {
                let space = self.space(id);
                if space.ack_eliciting_in_flight == 0 {
                    continue;
                }
                if let Some(base) = space.time_of_last_ack_eliciting {
                    let delay = if id == SpaceId::Data {
                        self.pto()
                    } else {
                        self.rtt.pto_base() * (1 << self.pto_count.min(20))
                    };
                    let t = base + delay;
                    earliest = Some(earliest.map_or(t, |x| x.min(t)));
                }
            }
        }
        self.set_loss_detection = Some(earliest);
    }

    /// The loss-detection timer fired: declare time-threshold losses or arm probes
    pub fn check_packet_loss(&mut self, ctx: &mut Context, now: u64) {
        for id in SpaceId::iter() {
            if let Some(t) = self.space(id).loss_time {
                if t <= now {
                    self.detect_lost_packets(ctx, now, id);
                    ctx.dirty_conns.insert(self.handle);
                    return;
                }
            }
        }
        // PTO: solicit an ACK with probes in the most urgent live space
        for id in SpaceId::iter() {
            let live = {
                let space = self.space(id);
                !space.discarded && space.ack_eliciting_in_flight > 0
            };
            if live {
                trace!(self.log, "PTO fired"; "space" => ?id, "count" => self.pto_count);
                self.space_mut(id).probes_pending = 2;
                self.pto_count = self.pto_count.saturating_add(1);
                self.set_loss_detection_alarm();
                ctx.dirty_conns.insert(self.handle);
                return;
            }
        }
        self.set_loss_detection = Some(None);
    }

    //
    // Send path
    //

    fn ack_due(&self, space_id: SpaceId, now: u64) -> bool {
        let space = self.space(space_id);
        !space.pending_acks.is_empty()
            && space.permit_ack_only
            && space.ack_at.map_or(false, |t| t <= now)
    }

    fn space_can_send(&self, level: EncLevel, space_id: SpaceId) -> bool {
        if self.suite.has_pending(level) {
            return true;
        }
        if space_id != SpaceId::Data || !self.is_established() {
            return false;
        }
        self.streams.has_sendable()
            || self.ping_pending
            || self.path_response.is_some()
            || !self.pending_stop.is_empty()
            || !self.pending_reset.is_empty()
            || !self.pending_max_stream_data.is_empty()
            || self.msd_handles.values().any(|h| h.is_lost())
            || self.max_data_due()
            || self.max_streams_due(Directionality::Bi)
            || self.max_streams_due(Directionality::Uni)
            || self.local_cids.has_pending()
            || self.rem_cids.has_pending()
            || self.data_blocked_pending
            || !self.blocked_stream_advert.is_empty()
            || self.streams_blocked_pending.iter().any(|&x| x)
    }

    fn max_data_due(&self) -> bool {
        self.local_max_data - self.consumed < self.local_window / 2
            || self
                .max_data_handle
                .as_ref()
                .map_or(false, |h| h.is_lost())
    }

    fn max_streams_due(&self, directionality: Directionality) -> bool {
        self.streams.max_streams_dirty[directionality as usize]
            || self.max_streams_handles[directionality as usize]
                .as_ref()
                .map_or(false, |h| h.is_lost())
    }

    /// Build the next outgoing datagram, coalescing one packet per level with data to move
    pub fn next_packet(&mut self, ctx: &mut Context, now: u64) -> Option<Vec<u8>> {
        match self.state {
            State::Handshake | State::Established => {}
            _ => return None,
        }
        let mtu = self.mtu as usize;
        let mut datagram: Vec<u8> = Vec::new();
        let mut sent_eliciting = false;

        for level in [EncLevel::Initial, EncLevel::Handshake, EncLevel::OneRtt]
            .iter()
            .cloned()
        {
            let space_id = level.space();
            if self.space(space_id).discarded || !self.suite.has_write_keys(level) {
                continue;
            }
            let remaining = mtu.saturating_sub(datagram.len());
            if remaining < MIN_PACKET_SPACE {
                break;
            }
            let probes = self.space(space_id).probes_pending > 0;
            let ack_due = self.ack_due(space_id, now);
            let data_pending = self.space_can_send(level, space_id);
            if !probes && !ack_due && !data_pending {
                continue;
            }
            let congested = self.congestion_blocked();
            if congested && !probes && !ack_due {
                trace!(self.log, "blocked by congestion");
                continue;
            }

            let pn = self.space_mut(space_id).take_pn(&mut ctx.rng, now);
            let number = PacketNumber::new(pn, self.space(space_id).largest_acked);
            let dst_cid = self.rem_cids.pick();
            let src_cid = self.local_cids.current();
            let header = match level {
                EncLevel::Initial => Header::Initial {
                    dst_cid,
                    src_cid,
                    token: self.token.clone(),
                    number,
                },
                EncLevel::Handshake => Header::Long {
                    ty: LongType::Handshake,
                    dst_cid,
                    src_cid,
                    number,
                },
                EncLevel::OneRtt => Header::Short {
                    dst_cid,
                    number,
                    spin: false,
                    key_phase: self.key_phase,
                },
                EncLevel::ZeroRtt => unreachable!("0-RTT is never transmitted"),
            };
            let mut buf = Vec::with_capacity(remaining);
            let partial = header.encode(&mut buf);
            let header_len = partial.header_len();
            let max_size = remaining - AEAD_TAG_SIZE;
            let mut waiters = Vec::new();
            let mut stream_ids = Vec::new();
            let mut sent_acks = RangeSet::new();

            // ACK
            if !self.space(space_id).pending_acks.is_empty() && (ack_due || data_pending || probes)
            {
                let space = &mut self.spaces[space_id as usize];
                let delay = now.saturating_sub(space.largest_rx_time) >> ACK_DELAY_EXPONENT;
                trace!(self.log, "sending ack"; "ranges" => ?space.pending_acks.iter().collect::<Vec<_>>());
                frame::Ack::encode(delay, &space.pending_acks, None, &mut buf);
                sent_acks = space.pending_acks.clone();
                space.unacked_eliciting = 0;
                space.ack_at = None;
                space.permit_ack_only = false;
            }
            let after_ack = buf.len();

            if !congested || probes {
                // CRYPTO, plus HANDSHAKE_DONE on a server
                self.suite
                    .write_pending(level, pn, max_size, &mut buf, &mut waiters);

                if level == EncLevel::OneRtt && self.is_established() {
                    self.write_control_frames(max_size, &mut buf, &mut waiters);
                    // STREAM data, constrained by connection-level flow control
                    let mut conn_budget = self.max_data.saturating_sub(self.data_sent);
                    let mut requeue = Vec::new();
                    while let Some(id) = self.streams.pop_sendable() {
                        let used = {
                            let ss = match self.streams.get_send_mut(id) {
                                Some(x) => x,
                                None => continue,
                            };
                            if !ss.has_pending() {
                                continue;
                            }
                            ss.write_pending(id, pn, max_size, conn_budget, &mut buf, &mut waiters)
                        };
                        conn_budget -= used;
                        self.data_sent += used;
                        stream_ids.push(id);
                        let more = self
                            .streams
                            .get_send_mut(id)
                            .map_or(false, |ss| ss.has_pending());
                        if more {
                            requeue.push(id);
                            if buf.len() + frame::Stream::SIZE_BOUND >= max_size {
                                break;
                            }
                        }
                    }
                    for id in requeue {
                        self.streams.queue_send(id);
                    }
                    // PATH_RESPONSE
                    if buf.len() + 9 <= max_size {
                        if let Some(token) = self.path_response.take() {
                            buf.write(frame::Type::PATH_RESPONSE);
                            buf.write(token);
                        }
                    }
                    // PING (application keep-alive)
                    if self.ping_pending && buf.len() < max_size {
                        self.ping_pending = false;
                        trace!(self.log, "ping");
                        buf.write(frame::Type::PING);
                    }
                }
            }

            let mut ack_eliciting = buf.len() > after_ack;
            // A probe must elicit an acknowledgment
            if probes && !ack_eliciting && buf.len() < max_size {
                trace!(self.log, "sending PING probe");
                buf.write(frame::Type::PING);
                ack_eliciting = true;
            }
            if self.space(space_id).probes_pending > 0 {
                self.space_mut(space_id).probes_pending -= 1;
            }

            if buf.len() == header_len {
                // Nothing fit after all; the allocated number is simply never transmitted
                continue;
            }

            // Header protection needs four bytes of number-plus-payload to sample past
            let min_payload = 4usize.saturating_sub(number.len());
            if buf.len() - header_len < min_payload {
                buf.resize(header_len + min_payload, 0);
            }

            // Initial flights are padded against amplification abuse
            let mut padded = false;
            if level == EncLevel::Initial && (self.side.is_client() || ack_eliciting) {
                let projected = datagram.len() + buf.len() + AEAD_TAG_SIZE;
                if projected < MIN_INITIAL_SIZE {
                    buf.resize(buf.len() + (MIN_INITIAL_SIZE - projected), 0);
                    padded = true;
                }
            }

            if level != EncLevel::OneRtt {
                set_payload_length(&mut buf, header_len, number.len(), AEAD_TAG_SIZE);
            }
            {
                let keys = self
                    .suite
                    .write_keys(level)
                    .expect("write keys vanished mid-build");
                keys.encrypt(pn, &mut buf, header_len);
                partial.finish(&mut buf, keys.header_key());
            }

            let size = buf.len() as u16;
            sent_eliciting |= ack_eliciting;
            self.space_mut(space_id).on_packet_sent(
                pn,
                SentPacket {
                    time_sent: now,
                    size,
                    ack_eliciting,
                    in_flight: ack_eliciting || padded,
                    skipped: false,
                    mtu_probe: false,
                    acks: sent_acks,
                    waiters,
                    streams: stream_ids,
                },
            );
            datagram.extend_from_slice(&buf);

            // A client drops Initial keys once it first sends at the Handshake level
            if level == EncLevel::Handshake
                && self.side.is_client()
                && !self.space(SpaceId::Initial).discarded
            {
                self.discard_space(ctx, SpaceId::Initial);
            }
        }

        if datagram.is_empty() {
            return None;
        }
        if sent_eliciting {
            self.reset_idle_timeout(now);
        }
        self.set_loss_detection_alarm();
        self.set_ack_delay = Some(self.next_ack_time());
        Some(datagram)
    }

    fn write_control_frames(
        &mut self,
        max_size: usize,
        buf: &mut Vec<u8>,
        waiters: &mut Vec<AckHandle>,
    ) {
        // STOP_SENDING
        for id in mem::replace(&mut self.pending_stop, Vec::new()) {
            let keep = {
                let rs = match self.streams.get_recv_mut(id) {
                    Some(x) => x,
                    None => continue,
                };
                let code = match rs.stop_reason {
                    Some(x) => x,
                    None => continue,
                };
                if rs.stop_handle.as_ref().map_or(false, |h| h.is_acked()) || rs.is_finished() {
                    continue;
                }
                let due = rs.stop_handle.as_ref().map_or(true, |h| h.is_lost());
                if due && buf.len() + 17 <= max_size {
                    trace!(self.log, "STOP_SENDING"; "stream" => id.0);
                    buf.write(frame::Type::STOP_SENDING);
                    buf.write_var(id.0);
                    buf.write_var(code);
                    let handle = match rs.stop_handle {
                        Some(ref h) => {
                            h.rearm();
                            h.clone()
                        }
                        None => {
                            let h = AckHandle::new();
                            rs.stop_handle = Some(h.clone());
                            h
                        }
                    };
                    waiters.push(handle);
                }
                true
            };
            if keep {
                self.pending_stop.push(id);
            }
        }

        // RESET_STREAM
        for id in mem::replace(&mut self.pending_reset, Vec::new()) {
            let keep = {
                let ss = match self.streams.get_send_mut(id) {
                    Some(x) => x,
                    None => continue,
                };
                let code = match ss.reset_code {
                    Some(x) => x,
                    None => continue,
                };
                if ss.reset_handle.as_ref().map_or(false, |h| h.is_acked()) {
                    continue;
                }
                let due = ss.reset_handle.as_ref().map_or(true, |h| h.is_lost());
                if due && buf.len() + 25 <= max_size {
                    trace!(self.log, "RESET_STREAM"; "stream" => id.0);
                    frame::ResetStream {
                        id,
                        error_code: code,
                        final_offset: ss.offset(),
                    }
                    .encode(buf);
                    let handle = match ss.reset_handle {
                        Some(ref h) => {
                            h.rearm();
                            h.clone()
                        }
                        None => {
                            let h = AckHandle::new();
                            ss.reset_handle = Some(h.clone());
                            h
                        }
                    };
                    waiters.push(handle);
                }
                true
            };
            if keep {
                self.pending_reset.push(id);
            }
        }

        // MAX_STREAM_DATA carries the current value, never a stale one
        let lost: Vec<StreamId> = self
            .msd_handles
            .iter()
            .filter(|(_, h)| h.is_lost())
            .map(|(&id, _)| id)
            .collect();
        for id in lost {
            self.pending_max_stream_data.insert(id);
        }
        for id in mem::replace(&mut self.pending_max_stream_data, FnvHashSet::default()) {
            if buf.len() + 17 > max_size {
                self.pending_max_stream_data.insert(id);
                continue;
            }
            let value = {
                match self.streams.get_recv_mut(id) {
                    Some(rs) if !rs.is_finished() => rs.max_data,
                    _ => {
                        self.msd_handles.remove(&id);
                        continue;
                    }
                }
            };
            trace!(self.log, "MAX_STREAM_DATA"; "stream" => id.0, "value" => value);
            buf.write(frame::Type::MAX_STREAM_DATA);
            buf.write_var(id.0);
            buf.write_var(value);
            let handle = AckHandle::new();
            self.msd_handles.insert(id, handle.clone());
            waiters.push(handle);
        }

        // MAX_STREAMS
        for &directionality in &[Directionality::Bi, Directionality::Uni] {
            if !self.max_streams_due(directionality) || buf.len() + 9 > max_size {
                continue;
            }
            let count = match directionality {
                Directionality::Bi => self.streams.max_remote_bi,
                Directionality::Uni => self.streams.max_remote_uni,
            };
            trace!(self.log, "MAX_STREAMS"; "dir" => %directionality, "value" => count);
            buf.write(match directionality {
                Directionality::Bi => frame::Type::MAX_STREAMS_BIDI,
                Directionality::Uni => frame::Type::MAX_STREAMS_UNI,
            });
            buf.write_var(count);
            self.streams.max_streams_dirty[directionality as usize] = false;
            let handle = AckHandle::new();
            self.max_streams_handles[directionality as usize] = Some(handle.clone());
            waiters.push(handle);
        }

        // MAX_DATA
        if self.max_data_due() && buf.len() + 9 <= max_size {
            self.local_max_data = cmp::max(self.local_max_data, self.consumed + self.local_window);
            trace!(self.log, "MAX_DATA"; "value" => self.local_max_data);
            buf.write(frame::Type::MAX_DATA);
            buf.write_var(self.local_max_data);
            let handle = AckHandle::new();
            self.max_data_handle = Some(handle.clone());
            waiters.push(handle);
        }

        // Blocked advertisements are informational and not retransmitted
        if self.data_blocked_pending && buf.len() + 9 <= max_size {
            self.data_blocked_pending = false;
            buf.write(frame::Type::DATA_BLOCKED);
            buf.write_var(self.max_data);
        }
        for id in mem::replace(&mut self.blocked_stream_advert, Vec::new()) {
            if buf.len() + 17 > max_size {
                self.blocked_stream_advert.push(id);
                continue;
            }
            let offset = match self.streams.get_send_mut(id) {
                Some(ss) => ss.max_data,
                None => continue,
            };
            buf.write(frame::Type::STREAM_DATA_BLOCKED);
            buf.write_var(id.0);
            buf.write_var(offset);
        }
        for &directionality in &[Directionality::Bi, Directionality::Uni] {
            if !self.streams_blocked_pending[directionality as usize] || buf.len() + 9 > max_size {
                continue;
            }
            self.streams_blocked_pending[directionality as usize] = false;
            buf.write(match directionality {
                Directionality::Bi => frame::Type::STREAMS_BLOCKED_BIDI,
                Directionality::Uni => frame::Type::STREAMS_BLOCKED_UNI,
            });
            buf.write_var(match directionality {
                Directionality::Bi => self.streams.max_bi,
                Directionality::Uni => self.streams.max_uni,
            });
        }

        // Connection ID maintenance
        self.local_cids.write_pending(max_size, buf, waiters);
        self.rem_cids.write_pending(max_size, buf, waiters);
    }

    //
    // Transport parameters
    //

    fn apply_peer_params(&mut self, ctx: &mut Context, raw: &[u8]) -> Result<(), TransportError> {
        let params = TransportParameters::read(self.side, &mut io::Cursor::new(raw))?;
        // Authenticate the CIDs exchanged during the handshake
        if params.initial_src_cid != self.rem_handshake_cid {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR
                .reason("initial_source_connection_id mismatch"));
        }
        if self.side.is_client() {
            if params.original_dst_cid != Some(self.init_cid) {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR
                    .reason("original_destination_connection_id mismatch"));
            }
            match (self.retry_src_cid, params.retry_src_cid) {
                (Some(a), Some(b)) if a == b => {}
                (None, None) => {}
                _ => {
                    return Err(TransportError::TRANSPORT_PARAMETER_ERROR
                        .reason("retry_source_connection_id mismatch"));
                }
            }
            if let Some(token) = params.stateless_reset_token {
                self.rem_cids.set_initial_token(token);
            }
        }
        trace!(self.log, "applying peer transport parameters");
        self.max_data = params.initial_max_data;
        self.streams.apply_params(
            params.initial_max_streams_bidi,
            params.initial_max_streams_uni,
            params.initial_max_stream_data_bidi_remote,
            params.initial_max_stream_data_bidi_local,
            params.initial_max_stream_data_uni,
        );
        self.idle_timeout = match (self.idle_timeout, params.max_idle_timeout * 1_000) {
            (0, x) | (x, 0) => x,
            (a, b) => cmp::min(a, b),
        };
        self.mtu = cmp::min(u64::from(self.mtu), params.max_udp_payload_size) as u16;
        self.local_cids.set_limit(params.active_connection_id_limit);
        self.local_cids
            .replenish(&mut ctx.rng, ctx.reset_key.as_ref());
        self.peer_params = Some(params);
        Ok(())
    }

    //
    // Application surface
    //

    pub fn open(&mut self, ctx: &mut Context, directionality: Directionality) -> Option<StreamId> {
        match self.streams.open(directionality) {
            Some(id) => Some(id),
            None => {
                self.streams_blocked_pending[directionality as usize] = true;
                ctx.dirty_conns.insert(self.handle);
                None
            }
        }
    }

    pub fn write(
        &mut self,
        ctx: &mut Context,
        id: StreamId,
        data: &[u8],
    ) -> Result<usize, WriteError> {
        assert!(
            id.directionality() == Directionality::Bi || id.initiator() == self.side,
            "only streams supporting outgoing data may be written"
        );
        if self.is_closed() {
            return Err(WriteError::Blocked);
        }
        if self.blocked() {
            if self.data_sent >= self.max_data {
                trace!(self.log, "write blocked by connection flow control"; "stream" => id.0);
                self.data_blocked_pending = true;
            } else {
                trace!(self.log, "write blocked by congestion"; "stream" => id.0);
            }
            self.blocked_streams.insert(id);
            ctx.dirty_conns.insert(self.handle);
            return Err(WriteError::Blocked);
        }
        let result = {
            let ss = match self.streams.get_send_mut(id) {
                Some(x) => x,
                None => return Err(WriteError::UnknownStream),
            };
            ss.write(data)
        };
        match result {
            Ok(n) => {
                trace!(self.log, "write"; "stream" => id.0, "len" => n);
                self.streams.queue_send(id);
                ctx.dirty_conns.insert(self.handle);
                Ok(n)
            }
            Err(WriteError::Blocked) => {
                trace!(self.log, "write blocked by stream flow control"; "stream" => id.0);
                self.blocked_stream_advert.push(id);
                ctx.dirty_conns.insert(self.handle);
                Err(WriteError::Blocked)
            }
            Err(e) => Err(e),
        }
    }

    pub fn finish(&mut self, ctx: &mut Context, id: StreamId) {
        {
            let ss = self
                .streams
                .get_send_mut(id)
                .expect("unknown or receive-only stream");
            ss.finish();
        }
        self.streams.queue_send(id);
        ctx.dirty_conns.insert(self.handle);
    }

    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> Result<usize, ReadError> {
        let result = {
            let rs = match self.streams.get_recv_mut(id) {
                Some(x) => x,
                None => return Err(ReadError::UnknownStream),
            };
            rs.read(buf)
        };
        if let Ok(n) = result {
            self.consumed += n as u64;
            self.note_read_credit(id);
        }
        result
    }

    pub fn read_unordered(&mut self, id: StreamId) -> Result<(Bytes, u64), ReadError> {
        let result = {
            let rs = match self.streams.get_recv_mut(id) {
                Some(x) => x,
                None => return Err(ReadError::UnknownStream),
            };
            rs.read_unordered()
        };
        if let Ok((ref data, _)) = result {
            self.consumed += data.len() as u64;
            self.note_read_credit(id);
        }
        result
    }

    fn note_read_credit(&mut self, id: StreamId) {
        if let Some(rs) = self.streams.get_recv_mut(id) {
            if rs.credit_due().is_some() {
                self.pending_max_stream_data.insert(id);
            }
        }
    }

    pub fn reset(&mut self, ctx: &mut Context, id: StreamId, error_code: u64) {
        assert!(
            id.directionality() == Directionality::Bi || id.initiator() == self.side,
            "only streams supporting outgoing data may be reset"
        );
        let newly = {
            let ss = match self.streams.get_send_mut(id) {
                Some(x) => x,
                None => return,
            };
            ss.reset(error_code)
        };
        if newly {
            self.pending_reset.push(id);
            ctx.dirty_conns.insert(self.handle);
        }
    }

    pub fn stop_sending(&mut self, ctx: &mut Context, id: StreamId, error_code: u64) {
        assert!(
            id.directionality() == Directionality::Bi || id.initiator() != self.side,
            "only streams supporting incoming data may be stopped"
        );
        let queue = {
            let rs = match self.streams.get_recv_mut(id) {
                Some(x) => x,
                None => return,
            };
            if rs.is_finished() {
                false
            } else {
                rs.stop_reason = Some(error_code);
                true
            }
        };
        if queue {
            self.pending_stop.push(id);
            ctx.dirty_conns.insert(self.handle);
        }
    }

    pub fn ping(&mut self, ctx: &mut Context) {
        self.ping_pending = true;
        ctx.dirty_conns.insert(self.handle);
    }

    pub fn poll(&mut self) -> Option<Event> {
        if let Some(&stream) = self.readable_streams.iter().next() {
            self.readable_streams.remove(&stream);
            return Some(Event::StreamReadable { stream });
        }
        None
    }

    /// Discard state for a stream if it's fully closed
    pub fn maybe_cleanup(&mut self, id: StreamId) {
        self.streams.maybe_cleanup(id);
    }

    //
    // Timers and close machinery
    //

    pub fn reset_idle_timeout(&mut self, now: u64) {
        if self.idle_timeout == 0 {
            return;
        }
        self.set_idle = Some(Some(now + self.idle_timeout));
    }

    /// The earliest pending delayed-ACK deadline
    pub fn next_ack_time(&self) -> Option<u64> {
        let mut earliest = None;
        for id in SpaceId::iter() {
            if self.space(id).pending_acks.is_empty() {
                continue;
            }
            if let Some(t) = self.space(id).ack_at {
                earliest = Some(earliest.map_or(t, |x: u64| x.min(t)));
            }
        }
        earliest
    }

    /// Idle expiry is a silent close
    pub fn on_idle_timeout(&mut self, ctx: &mut Context) {
        if self.is_drained() {
            return;
        }
        trace!(self.log, "idle timeout");
        ctx.events.push_back((
            self.handle,
            Event::ConnectionLost {
                reason: ConnectionError::TimedOut,
            },
        ));
        self.state = State::Drained;
    }

    fn make_close_datagram(&mut self, reason: &CloseReason) -> Box<[u8]> {
        let mut datagram = Vec::new();
        for level in [EncLevel::Initial, EncLevel::Handshake, EncLevel::OneRtt]
            .iter()
            .cloned()
        {
            let space_id = level.space();
            if self.space(space_id).discarded || !self.suite.has_write_keys(level) {
                continue;
            }
            let pn = self.space(space_id).next_pn();
            let number = PacketNumber::new(pn, self.space(space_id).largest_acked);
            let dst_cid = self.rem_cids.pick();
            let src_cid = self.local_cids.current();
            let header = match level {
                EncLevel::Initial => Header::Initial {
                    dst_cid,
                    src_cid,
                    token: self.token.clone(),
                    number,
                },
                EncLevel::Handshake => Header::Long {
                    ty: LongType::Handshake,
                    dst_cid,
                    src_cid,
                    number,
                },
                _ => Header::Short {
                    dst_cid,
                    number,
                    spin: false,
                    key_phase: self.key_phase,
                },
            };
            let mut buf = Vec::new();
            let partial = header.encode(&mut buf);
            let header_len = partial.header_len();
            let max_len = self.mtu as usize - header_len - AEAD_TAG_SIZE;
            match (level, reason) {
                // Application close details must not leak in handshake-level packets
                (EncLevel::OneRtt, CloseReason::Application(x)) => x.encode(&mut buf, max_len),
                (_, CloseReason::Application(_)) => frame::ConnectionClose {
                    error_code: crate::TransportErrorCode::APPLICATION_ERROR,
                    frame_type: None,
                    reason: Bytes::new(),
                }
                .encode(&mut buf, max_len),
                (_, CloseReason::Connection(x)) => x.encode(&mut buf, max_len),
            }
            let min_payload = 4usize.saturating_sub(number.len());
            if buf.len() - header_len < min_payload {
                buf.resize(header_len + min_payload, 0);
            }
            // A client's Initial datagrams must stay amplification-proof even when closing
            if level == EncLevel::Initial && self.side.is_client() {
                let projected = datagram.len() + buf.len() + AEAD_TAG_SIZE;
                if projected < MIN_INITIAL_SIZE {
                    buf.resize(buf.len() + (MIN_INITIAL_SIZE - projected), 0);
                }
            }
            if level != EncLevel::OneRtt {
                set_payload_length(&mut buf, header_len, number.len(), AEAD_TAG_SIZE);
            }
            let keys = match self.suite.write_keys(level) {
                Ok(x) => x,
                Err(_) => continue,
            };
            keys.encrypt(pn, &mut buf, header_len);
            partial.finish(&mut buf, keys.header_key());
            datagram.extend_from_slice(&buf);
        }
        datagram.into()
    }

    fn transport_close(&mut self, ctx: &mut Context, now: u64, error: TransportError) {
        ctx.events.push_back((
            self.handle,
            Event::ConnectionLost {
                reason: ConnectionError::TransportError { error },
            },
        ));
        let reason = CloseReason::Connection(frame::ConnectionClose {
            error_code: error.code,
            frame_type: error.frame,
            reason: Bytes::new(),
        });
        self.enter_closed(ctx, now, reason);
    }

    /// Close initiated by the application
    pub fn close(&mut self, ctx: &mut Context, now: u64, error_code: u64, reason: Bytes) {
        self.app_closed = true;
        if self.is_closed() {
            return;
        }
        let reason = CloseReason::Application(frame::ApplicationClose { error_code, reason });
        self.enter_closed(ctx, now, reason);
    }

    fn enter_closed(&mut self, ctx: &mut Context, now: u64, reason: CloseReason) {
        trace!(self.log, "connection closed");
        let datagram = self.make_close_datagram(&reason);
        ctx.io.push_back(Io::Transmit {
            destination: self.remote,
            packet: datagram.clone(),
        });
        self.state = State::Closed(state::Closed {
            reason,
            datagram,
            packets_since_close: 0,
        });
        self.start_drain_timer(ctx, now);
        ctx.dirty_conns.insert(self.handle);
    }

    fn start_drain_timer(&mut self, ctx: &mut Context, now: u64) {
        self.set_loss_detection = Some(None);
        self.set_ack_delay = Some(None);
        ctx.io.push_back(Io::TimerStart {
            connection: self.handle,
            timer: Timer::Close,
            time: now + 3 * self.pto(),
        });
    }

    /// Capture what the endpoint needs to keep serving this connection's CIDs after the full
    /// state is dropped
    pub fn to_closed(&self) -> ClosedConnection {
        let datagram = match self.state {
            State::Closed(ref state) => Some(state.datagram.clone()),
            _ => None,
        };
        ClosedConnection {
            cids: self.local_cids.iter().cloned().collect(),
            init_cid: self.init_cid,
            remote: self.remote,
            datagram,
            packets_since_close: 0,
        }
    }
}

/// Residue of a closed connection: enough to keep answering its CIDs for three PTOs
pub struct ClosedConnection {
    pub cids: Vec<ConnectionId>,
    pub init_cid: ConnectionId,
    pub remote: SocketAddrV6,
    datagram: Option<Box<[u8]>>,
    packets_since_close: u8,
}

impl ClosedConnection {
    /// Rate-limited close retransmission in response to an incoming datagram
    pub fn on_datagram(&mut self) -> Option<Box<[u8]>> {
        self.packets_since_close = self.packets_since_close.wrapping_add(1);
        if self.packets_since_close % 3 == 1 {
            self.datagram.clone()
        } else {
            None
        }
    }
}

/// Reasons why a connection might be lost
#[derive(Debug, Clone, Fail)]
pub enum ConnectionError {
    /// The peer doesn't implement any supported version
    #[fail(display = "peer doesn't implement any supported version")]
    VersionMismatch,
    /// The peer violated the QUIC specification as understood by this implementation
    #[fail(display = "{}", error)]
    TransportError { error: TransportError },
    /// The peer's QUIC stack aborted the connection automatically
    #[fail(display = "aborted by peer: {}", reason)]
    ConnectionClosed { reason: frame::ConnectionClose },
    /// The peer closed the connection
    #[fail(display = "closed by peer: {}", reason)]
    ApplicationClosed { reason: frame::ApplicationClose },
    /// The peer is unable to continue processing this connection, usually due to having restarted
    #[fail(display = "reset by peer")]
    Reset,
    /// The peer has become unreachable
    #[fail(display = "timed out")]
    TimedOut,
}

impl From<TransportError> for ConnectionError {
    fn from(error: TransportError) -> Self {
        ConnectionError::TransportError { error }
    }
}

pub enum State {
    Handshake,
    Established,
    /// We sent CONNECTION_CLOSE and linger to re-answer until three PTOs elapse
    Closed(state::Closed),
    /// The peer closed; nothing further is emitted
    Draining,
    /// Waiting for the endpoint to reap us
    Drained,
}

impl State {
    pub fn is_closed(&self) -> bool {
        matches!(self, State::Closed(_) | State::Draining | State::Drained)
    }
}

pub mod state {
    use super::CloseReason;

    pub struct Closed {
        pub reason: CloseReason,
        /// The serialized close, replayed at most once per few incoming packets
        pub datagram: Box<[u8]>,
        pub packets_since_close: u8,
    }
}

#[derive(Clone)]
pub enum CloseReason {
    Connection(frame::ConnectionClose),
    Application(frame::ApplicationClose),
}

impl From<TransportError> for CloseReason {
    fn from(x: TransportError) -> Self {
        CloseReason::Connection(frame::ConnectionClose {
            error_code: x.code,
            frame_type: x.frame,
            reason: Bytes::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{TlsEvent, TlsSession};
    use crate::endpoint::Config;
    use rand::rngs::OsRng;
    use std::collections::VecDeque;
    use std::net::Ipv6Addr;
    use std::sync::Arc;

    /// TLS stand-in that never progresses; enough to exercise the packet machinery
    struct NullTls;

    impl TlsSession for NullTls {
        fn provide_data(&mut self, _: EncLevel, _: &[u8]) {}
        fn progress(&mut self) {}
        fn poll_event(&mut self) -> Option<TlsEvent> {
            None
        }
        fn is_handshaking(&self) -> bool {
            true
        }
    }

    fn test_ctx() -> Context {
        Context {
            rng: OsRng,
            config: Arc::new(Config::default()),
            io: VecDeque::new(),
            events: VecDeque::new(),
            incoming: VecDeque::new(),
            incoming_handshakes: 0,
            dirty_conns: FnvHashSet::default(),
            readable_conns: FnvHashSet::default(),
            reset_key: None,
        }
    }

    fn test_conn() -> (Connection, Context) {
        let ctx = test_ctx();
        let log = slog::Logger::root(slog::Discard, o!());
        let rem_cid = ConnectionId::new(&[0xab; 8]);
        let suite = CryptoSuite::new(Side::Client, Box::new(NullTls), &rem_cid);
        let conn = Connection::new(
            log,
            &ctx.config,
            rem_cid,
            ConnectionId::new(&[0x11; 8]),
            rem_cid,
            std::net::SocketAddrV6::new(Ipv6Addr::LOCALHOST, 4433, 0, 0),
            Side::Client,
            suite,
            ConnectionHandle(0),
            [0; RESET_TOKEN_SIZE],
        );
        (conn, ctx)
    }

    fn eliciting_packet(time_sent: u64, handle: &AckHandle) -> SentPacket {
        SentPacket {
            time_sent,
            size: 1200,
            ack_eliciting: true,
            in_flight: true,
            skipped: false,
            mtu_probe: false,
            acks: RangeSet::new(),
            waiters: vec![handle.clone()],
            streams: Vec::new(),
        }
    }

    #[test]
    fn packet_threshold_loss() {
        let (mut conn, mut ctx) = test_conn();
        let handles: Vec<AckHandle> = (0..10).map(|_| AckHandle::new()).collect();
        for pn in 0..10u64 {
            let allocated = conn.spaces[0].take_pn(&mut ctx.rng, 0);
            assert_eq!(allocated, pn);
            conn.spaces[0].on_packet_sent(pn, eliciting_packet(0, &handles[pn as usize]));
        }
        let window_before = conn.cc.window();
        let ack = frame::Ack {
            largest: 9,
            delay: 0,
            ranges: vec![2..10],
            ecn: None,
        };
        conn.on_ack_received(&mut ctx, 1_000, SpaceId::Initial, ack)
            .unwrap();
        for pn in 2..10 {
            assert!(handles[pn].is_acked(), "pn {} should be acked", pn);
        }
        // 0 and 1 trail the largest acknowledged by more than the packet threshold
        assert!(handles[0].is_lost());
        assert!(handles[1].is_lost());
        // Slow start credited the eight acked packets, then the loss event halved the window
        assert_eq!(conn.cc.window(), (window_before + 8 * 1200) / 2);
        assert_eq!(conn.get_bytes_in_flight(), 0);
        // Once acked, a handle never reverts
        assert!(handles[9].is_acked());
    }

    #[test]
    fn ack_of_unsent_packet_rejected() {
        let (mut conn, mut ctx) = test_conn();
        let ack = frame::Ack {
            largest: 5,
            delay: 0,
            ranges: vec![5..6],
            ecn: None,
        };
        let err = conn
            .on_ack_received(&mut ctx, 0, SpaceId::Initial, ack)
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::PROTOCOL_VIOLATION);
    }

    #[test]
    fn ack_of_skipped_pn_rejected() {
        let (mut conn, mut ctx) = test_conn();
        // The application space burns a number as an ACK honeypot
        let h0 = AckHandle::new();
        let h2 = AckHandle::new();
        let pn0 = conn.spaces[2].take_pn(&mut ctx.rng, 0);
        let pn2 = conn.spaces[2].take_pn(&mut ctx.rng, 0);
        assert_eq!((pn0, pn2), (0, 2));
        conn.spaces[2].on_packet_sent(pn0, eliciting_packet(0, &h0));
        conn.spaces[2].on_packet_sent(pn2, eliciting_packet(0, &h2));
        let ack = frame::Ack {
            largest: 2,
            delay: 0,
            ranges: vec![0..3],
            ecn: None,
        };
        let err = conn
            .on_ack_received(&mut ctx, 1_000, SpaceId::Data, ack)
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::PROTOCOL_VIOLATION);
    }

    #[test]
    fn spurious_loss_superseded_by_ack() {
        let handle = AckHandle::new();
        handle.mark_lost();
        assert!(handle.is_lost());
        handle.mark_acked();
        assert!(handle.is_acked());
        handle.mark_lost();
        assert!(handle.is_acked());
    }

    #[test]
    fn idle_timeout_closes_silently() {
        let (mut conn, mut ctx) = test_conn();
        conn.on_idle_timeout(&mut ctx);
        assert!(conn.is_drained());
        assert!(ctx.io.is_empty());
        assert_matches!(
            ctx.events.pop_front(),
            Some((_, Event::ConnectionLost {
                reason: ConnectionError::TimedOut,
            }))
        );
    }

    #[test]
    fn transport_error_emits_close_and_drains() {
        let (mut conn, mut ctx) = test_conn();
        conn.transport_close(
            &mut ctx,
            0,
            TransportError::FLOW_CONTROL_ERROR.reason("test"),
        );
        assert!(conn.is_closed());
        // A close datagram went out under the only installed level (Initial)
        assert_matches!(ctx.io.pop_front(), Some(Io::Transmit { .. }));
        // And the drain timer was armed
        assert_matches!(
            ctx.io.pop_front(),
            Some(Io::TimerStart {
                timer: Timer::Close,
                ..
            })
        );
        // Closing is idempotent toward the application
        conn.close(&mut ctx, 0, 0, Bytes::new());
        assert!(conn.app_closed);
    }

    #[test]
    fn closed_residue_rate_limits_reanswers() {
        let (mut conn, mut ctx) = test_conn();
        conn.close(&mut ctx, 0, 7, Bytes::from_static(b"done"));
        let mut residue = conn.to_closed();
        assert!(!residue.cids.is_empty());
        let mut answered = 0;
        for _ in 0..9 {
            if residue.on_datagram().is_some() {
                answered += 1;
            }
        }
        assert_eq!(answered, 3);
    }
}
