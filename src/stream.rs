use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use fnv::{FnvHashMap, FnvHashSet};

use crate::assembler::Assembler;
use crate::frame;
use crate::range_set::RangeSet;
use crate::spaces::AckHandle;
use crate::{Directionality, Side, StreamId, TransportError};

/// Send-half states (RFC 9000 §3.1)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendState {
    Ready,
    Send,
    DataSent,
    DataRecvd,
    ResetSent,
    ResetRecvd,
}

impl SendState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SendState::DataRecvd | SendState::ResetRecvd)
    }

    pub fn was_reset(self) -> bool {
        matches!(self, SendState::ResetSent | SendState::ResetRecvd)
    }
}

/// Receive-half states (RFC 9000 §3.2)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvState {
    Recv,
    SizeKnown { size: u64 },
    DataRecvd { size: u64 },
    DataRead,
    ResetRecvd { size: u64, error_code: u64 },
    ResetRead,
}

impl RecvState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecvState::DataRead | RecvState::ResetRead)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum ReadError {
    /// No data currently available; retry after the next receipt
    #[fail(display = "blocked")]
    Blocked,
    /// The peer abandoned the stream
    #[fail(display = "reset by peer: error {}", error_code)]
    Reset { error_code: u64 },
    /// All data has been delivered and consumed
    #[fail(display = "finished")]
    Finished,
    #[fail(display = "unknown stream")]
    UnknownStream,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum WriteError {
    /// Flow control or congestion prevents writing now
    #[fail(display = "blocked")]
    Blocked,
    /// The peer asked us to stop via STOP_SENDING
    #[fail(display = "stopped by peer: error {}", error_code)]
    Stopped { error_code: u64 },
    #[fail(display = "unknown stream")]
    UnknownStream,
}

/// A STREAM fragment in flight, keyed under the packet that carried it
#[derive(Debug)]
struct SentFragment {
    offset: u64,
    data: Bytes,
    fin: bool,
    handle: AckHandle,
}

/// The send half of a stream
#[derive(Debug)]
pub struct Send {
    pub state: SendState,
    /// Peer-granted flow control limit
    pub max_data: u64,
    /// Bytes accepted from the application
    buffered: u64,
    /// Bytes handed to packets at least once
    flushed: u64,
    pending: VecDeque<Bytes>,
    fragments: BTreeMap<u64, Vec<SentFragment>>,
    fin_pending: bool,
    fin_sent: bool,
    /// Set when the application or a STOP_SENDING asked for a reset
    pub reset_code: Option<u64>,
    /// The STOP_SENDING code that forced the reset, if any
    pub stop_reason: Option<u64>,
    pub reset_handle: Option<AckHandle>,
    /// Stream hit its flow control limit; advertise STREAM_DATA_BLOCKED
    pub blocked: bool,
}

impl Send {
    pub fn new(max_data: u64) -> Self {
        Send {
            state: SendState::Ready,
            max_data,
            buffered: 0,
            flushed: 0,
            pending: VecDeque::new(),
            fragments: BTreeMap::new(),
            fin_pending: false,
            fin_sent: false,
            reset_code: None,
            stop_reason: None,
            reset_handle: None,
            blocked: false,
        }
    }

    /// Total length of the stream as transmitted so far (the RESET_STREAM final size)
    pub fn offset(&self) -> u64 {
        self.buffered
    }

    /// Queue application data, limited by stream flow control; connection-level limits are the
    /// caller's concern
    pub fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if let Some(error_code) = self.stop_reason {
            return Err(WriteError::Stopped { error_code });
        }
        match self.state {
            SendState::Ready | SendState::Send => {}
            _ => return Err(WriteError::Blocked),
        }
        let budget = self.max_data.saturating_sub(self.buffered);
        if budget == 0 {
            self.blocked = true;
            return Err(WriteError::Blocked);
        }
        let n = (budget as usize).min(data.len());
        self.pending.push_back(Bytes::copy_from_slice(&data[..n]));
        self.buffered += n as u64;
        self.state = SendState::Send;
        Ok(n)
    }

    /// Mark the end of the stream; previously written data is still delivered
    pub fn finish(&mut self) {
        debug_assert!(matches!(self.state, SendState::Ready | SendState::Send));
        self.fin_pending = true;
        self.state = SendState::DataSent;
    }

    /// Abandon transmission. Returns false when the stream was already finished or reset.
    pub fn reset(&mut self, error_code: u64) -> bool {
        match self.state {
            SendState::DataRecvd | SendState::ResetSent | SendState::ResetRecvd => false,
            _ => {
                self.state = SendState::ResetSent;
                self.reset_code = Some(error_code);
                self.pending.clear();
                self.fragments.clear();
                self.fin_pending = false;
                true
            }
        }
    }

    /// Whether any STREAM frame needs (re)transmission
    pub fn has_pending(&self) -> bool {
        if self.state.was_reset() {
            return false;
        }
        !self.pending.is_empty()
            || (self.fin_pending && !self.fin_sent)
            || self
                .fragments
                .values()
                .flatten()
                .any(|frag| frag.handle.is_lost())
    }

    /// Emit STREAM frames into `buf`; `conn_budget` caps *new* bytes (connection flow control)
    ///
    /// Returns the number of new bytes consumed from the connection-level budget.
    pub fn write_pending(
        &mut self,
        id: StreamId,
        pn: u64,
        max_size: usize,
        conn_budget: u64,
        buf: &mut Vec<u8>,
        waiters: &mut Vec<AckHandle>,
    ) -> u64 {
        if self.state.was_reset() {
            return 0;
        }
        let mut new_bytes = 0;
        // New data first
        while !self.pending.is_empty() || (self.fin_pending && !self.fin_sent) {
            let room = match max_size.checked_sub(buf.len() + frame::Stream::SIZE_BOUND) {
                Some(x) => x,
                None => break,
            };
            let budget = (conn_budget - new_bytes).min(room as u64) as usize;
            let mut chunk = match self.pending.pop_front() {
                Some(x) => x,
                None => Bytes::new(),
            };
            if budget == 0 && !chunk.is_empty() {
                self.pending.push_front(chunk);
                break;
            }
            if chunk.len() > budget {
                let rest = chunk.split_off(budget);
                self.pending.push_front(rest);
            }
            let offset = self.flushed;
            self.flushed += chunk.len() as u64;
            new_bytes += chunk.len() as u64;
            let fin = self.fin_pending && self.pending.is_empty() && !self.fin_sent && {
                // FIN rides the frame only when it delimits the true end
                self.flushed == self.buffered
            };
            if chunk.is_empty() && !fin {
                break;
            }
            if fin {
                self.fin_sent = true;
            }
            let frame = frame::Stream {
                id,
                offset,
                fin,
                data: chunk.clone(),
            };
            frame.encode(true, buf);
            let handle = AckHandle::new();
            waiters.push(handle.clone());
            self.fragments
                .entry(pn)
                .or_insert_with(Vec::new)
                .push(SentFragment {
                    offset,
                    data: chunk,
                    fin,
                    handle,
                });
        }
        // Then retransmits
        self.retransmit(id, pn, max_size, buf, waiters);
        new_bytes
    }

    fn retransmit(
        &mut self,
        id: StreamId,
        pn: u64,
        max_size: usize,
        buf: &mut Vec<u8>,
        waiters: &mut Vec<AckHandle>,
    ) {
        let pns: Vec<u64> = self.fragments.keys().cloned().collect();
        for old_pn in pns {
            let frags = self.fragments.remove(&old_pn).unwrap();
            let mut keep = Vec::new();
            for mut frag in frags {
                if frag.handle.is_acked() {
                    continue;
                }
                if frag.handle.is_waiting() {
                    keep.push(frag);
                    continue;
                }
                let room = match max_size.checked_sub(buf.len() + frame::Stream::SIZE_BOUND) {
                    Some(x) => x,
                    None => {
                        keep.push(frag);
                        continue;
                    }
                };
                if room == 0 && !frag.data.is_empty() {
                    keep.push(frag);
                    continue;
                }
                {
                    let take = frag.data.len().min(room);
                    let chunk = frag.data.split_to(take);
                    let fin = frag.fin && frag.data.is_empty();
                    let frame = frame::Stream {
                        id,
                        offset: frag.offset,
                        fin,
                        data: chunk.clone(),
                    };
                    frame.encode(true, buf);
                    let handle = AckHandle::new();
                    waiters.push(handle.clone());
                    self.fragments
                        .entry(pn)
                        .or_insert_with(Vec::new)
                        .push(SentFragment {
                            offset: frag.offset,
                            data: chunk,
                            fin,
                            handle,
                        });
                    frag.offset += take as u64;
                }
                if !frag.data.is_empty() {
                    keep.push(frag);
                }
            }
            if !keep.is_empty() {
                self.fragments
                    .entry(old_pn)
                    .or_insert_with(Vec::new)
                    .extend(keep);
            }
        }
    }

    /// Reap acknowledged fragments and advance terminal transitions. Returns true when the
    /// stream newly reached DataRecvd or ResetRecvd.
    pub fn ack_scan(&mut self) -> bool {
        if self.state == SendState::ResetSent {
            if self
                .reset_handle
                .as_ref()
                .map_or(false, |h| h.is_acked())
            {
                self.state = SendState::ResetRecvd;
                return true;
            }
            return false;
        }
        let mut fin_acked = false;
        let pns: Vec<u64> = self.fragments.keys().cloned().collect();
        for pn in pns {
            let frags = self.fragments.get_mut(&pn).unwrap();
            frags.retain(|frag| {
                if frag.handle.is_acked() {
                    if frag.fin {
                        fin_acked = true;
                    }
                    false
                } else {
                    true
                }
            });
            if frags.is_empty() {
                self.fragments.remove(&pn);
            }
        }
        if fin_acked {
            self.fin_pending = false;
        }
        if self.state == SendState::DataSent
            && self.fin_sent
            && !self.fin_pending
            && self.pending.is_empty()
            && self.fragments.is_empty()
        {
            self.state = SendState::DataRecvd;
            return true;
        }
        false
    }
}

/// The receive half of a stream
#[derive(Debug)]
pub struct Recv {
    pub state: RecvState,
    assembler: Assembler,
    recvd: RangeSet,
    /// Credit currently granted to the peer
    pub max_data: u64,
    /// Receive window to maintain ahead of the read cursor
    window: u64,
    /// STOP_SENDING to transmit, with its error code
    pub stop_reason: Option<u64>,
    pub stop_handle: Option<AckHandle>,
}

impl Recv {
    pub fn new(window: u64) -> Self {
        Recv {
            state: RecvState::Recv,
            assembler: Assembler::new(),
            recvd: RangeSet::new(),
            max_data: window,
            window,
            stop_reason: None,
            stop_handle: None,
        }
    }

    pub fn final_size(&self) -> Option<u64> {
        match self.state {
            RecvState::SizeKnown { size }
            | RecvState::DataRecvd { size }
            | RecvState::ResetRecvd { size, .. } => Some(size),
            _ => None,
        }
    }

    /// Highest contiguous-or-not byte offset seen; lower-bounds the final size
    pub fn limit(&self) -> u64 {
        self.recvd.max().map_or(0, |x| x + 1)
    }

    pub fn bytes_read(&self) -> u64 {
        self.assembler.offset()
    }

    /// Whether the peer can learn nothing new from us continuing to read
    pub fn is_finished(&self) -> bool {
        !matches!(self.state, RecvState::Recv | RecvState::SizeKnown { .. })
    }

    /// Apply a received STREAM frame. Returns the count of not-previously-received bytes for
    /// connection-level accounting; the caller enforces the connection data limit.
    pub fn ingest(&mut self, frame: &frame::Stream) -> Result<u64, TransportError> {
        let end = frame.offset + frame.data.len() as u64;
        if let Some(size) = self.final_size() {
            if end > size || (frame.fin && end != size) {
                return Err(TransportError::FINAL_SIZE_ERROR
                    .reason("stream data past the final size")
                    .frame(frame::Frame::Stream(frame.clone()).ty()));
            }
        }
        if end > self.max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR
                .reason("stream flow control limit exceeded"));
        }
        if frame.fin && self.limit() > end {
            return Err(TransportError::FINAL_SIZE_ERROR
                .reason("final size below received data"));
        }
        let new_bytes = end.saturating_sub(self.limit());
        if frame.fin {
            if let RecvState::Recv = self.state {
                self.state = RecvState::SizeKnown { size: end };
            }
        }
        self.recvd.insert(frame.offset..end);
        self.assembler.insert(frame.offset, frame.data.clone());
        if let RecvState::SizeKnown { size } = self.state {
            if self.recvd.len() == 1 && self.recvd.min() == Some(0) && self.limit() == size {
                self.state = RecvState::DataRecvd { size };
            } else if size == 0 {
                self.state = RecvState::DataRecvd { size };
            }
        }
        Ok(new_bytes)
    }

    pub fn reset(&mut self, size: u64, error_code: u64) -> Result<(), TransportError> {
        if let Some(known) = self.final_size() {
            if known != size {
                return Err(TransportError::FINAL_SIZE_ERROR
                    .reason("reset contradicts known final size"));
            }
        }
        if size < self.limit() {
            return Err(TransportError::FINAL_SIZE_ERROR
                .reason("reset final size below received data"));
        }
        match self.state {
            RecvState::DataRead | RecvState::ResetRead | RecvState::ResetRecvd { .. } => {}
            _ => {
                self.state = RecvState::ResetRecvd { size, error_code };
                self.assembler.clear();
            }
        }
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        match self.state {
            RecvState::ResetRecvd { error_code, .. } => {
                self.state = RecvState::ResetRead;
                return Err(ReadError::Reset { error_code });
            }
            RecvState::ResetRead => return Err(ReadError::Reset {
                error_code: 0,
            }),
            RecvState::DataRead => return Err(ReadError::Finished),
            _ => {}
        }
        let n = self.assembler.read(buf);
        if n == 0 {
            if let RecvState::DataRecvd { size } = self.state {
                if self.assembler.offset() == size {
                    self.state = RecvState::DataRead;
                    return Err(ReadError::Finished);
                }
            }
            return Err(ReadError::Blocked);
        }
        Ok(n)
    }

    /// Take the next chunk without head-of-line blocking
    pub fn read_unordered(&mut self) -> Result<(Bytes, u64), ReadError> {
        match self.state {
            RecvState::ResetRecvd { error_code, .. } => {
                self.state = RecvState::ResetRead;
                return Err(ReadError::Reset { error_code });
            }
            RecvState::ResetRead => return Err(ReadError::Reset { error_code: 0 }),
            RecvState::DataRead => return Err(ReadError::Finished),
            _ => {}
        }
        match self.assembler.pop_unordered() {
            Some((offset, data)) => Ok((data, offset)),
            None => {
                if let RecvState::DataRecvd { size } = self.state {
                    if self.assembler.offset() >= size {
                        self.state = RecvState::DataRead;
                        return Err(ReadError::Finished);
                    }
                }
                Err(ReadError::Blocked)
            }
        }
    }

    /// New credit to grant once consumption crosses half the window; the current value is
    /// always advertised, never a stale one
    pub fn credit_due(&mut self) -> Option<u64> {
        if self.is_finished() {
            return None;
        }
        if self.max_data - self.bytes_read() < self.window / 2 {
            self.max_data = self.bytes_read() + self.window;
            Some(self.max_data)
        } else {
            None
        }
    }
}

/// A stream with whichever halves its type and origin dictate
#[derive(Debug)]
pub struct Stream {
    pub send: Option<Send>,
    pub recv: Option<Recv>,
}

impl Stream {
    pub fn new_bi(send_limit: u64, recv_window: u64) -> Self {
        Stream {
            send: Some(Send::new(send_limit)),
            recv: Some(Recv::new(recv_window)),
        }
    }

    pub fn new_send(limit: u64) -> Self {
        Stream {
            send: Some(Send::new(limit)),
            recv: None,
        }
    }

    pub fn new_recv(window: u64) -> Self {
        Stream {
            recv: Some(Recv::new(window)),
            send: None,
        }
    }

    pub fn send(&self) -> Option<&Send> {
        self.send.as_ref()
    }

    pub fn recv(&self) -> Option<&Recv> {
        self.recv.as_ref()
    }

    pub fn send_mut(&mut self) -> Option<&mut Send> {
        self.send.as_mut()
    }

    pub fn recv_mut(&mut self) -> Option<&mut Recv> {
        self.recv.as_mut()
    }

    /// Both halves (that exist) have reached a terminal state
    pub fn is_removable(&self) -> bool {
        self.send.as_ref().map_or(true, |s| s.state.is_terminal())
            && self.recv.as_ref().map_or(true, |r| r.state.is_terminal())
    }
}

/// Per-connection stream directory with count-based admission control
pub struct Streams {
    pub streams: FnvHashMap<StreamId, Stream>,
    side: Side,
    /// How many streams of each class we may open (peer's MAX_STREAMS)
    pub max_uni: u64,
    pub max_bi: u64,
    next_uni: u64,
    next_bi: u64,
    /// How many the peer may open; we replenish as streams drain
    pub max_remote_uni: u64,
    pub max_remote_bi: u64,
    next_remote_uni: u64,
    next_remote_bi: u64,
    /// Base window used to size replenishment
    remote_uni_window: u64,
    remote_bi_window: u64,
    /// Initial flow-control limits for stream creation. `init_send_bidi` limits the send half
    /// of bidi streams we open; `init_send_bidi_remote` the send half of bidi streams the peer
    /// opened (the peer's initial_max_stream_data_bidi_local).
    pub stream_receive_window: u64,
    pub init_send_bidi: u64,
    pub init_send_bidi_remote: u64,
    pub init_send_uni: u64,
    /// Streams with frames to (re)send
    send_queue: VecDeque<StreamId>,
    queued: FnvHashSet<StreamId>,
    /// MAX_STREAMS updates owed to the peer
    pub max_streams_dirty: [bool; 2],
}

impl Streams {
    pub fn new(
        side: Side,
        max_remote_bi: u64,
        max_remote_uni: u64,
        stream_receive_window: u64,
    ) -> Self {
        Streams {
            streams: FnvHashMap::default(),
            side,
            max_uni: 0,
            max_bi: 0,
            next_uni: 0,
            next_bi: 0,
            max_remote_uni,
            max_remote_bi,
            next_remote_uni: 0,
            next_remote_bi: 0,
            remote_uni_window: max_remote_uni,
            remote_bi_window: max_remote_bi,
            stream_receive_window,
            init_send_bidi: 0,
            init_send_bidi_remote: 0,
            init_send_uni: 0,
            send_queue: VecDeque::new(),
            queued: FnvHashSet::default(),
            max_streams_dirty: [false; 2],
        }
    }

    /// Open a locally initiated stream, if the peer's stream count limit permits
    pub fn open(&mut self, directionality: Directionality) -> Option<StreamId> {
        let (next, max) = match directionality {
            Directionality::Uni => (&mut self.next_uni, self.max_uni),
            Directionality::Bi => (&mut self.next_bi, self.max_bi),
        };
        if *next >= max {
            return None;
        }
        let id = StreamId::new(self.side, directionality, *next);
        *next += 1;
        let stream = match directionality {
            Directionality::Uni => Stream::new_send(self.init_send_uni),
            Directionality::Bi => Stream::new_bi(self.init_send_bidi, self.stream_receive_window),
        };
        let old = self.streams.insert(id, stream);
        debug_assert!(old.is_none());
        Some(id)
    }

    /// Validate a peer-referenced stream id, implicitly opening remote streams up to it.
    /// Returns None for locally closed (removed) streams.
    pub fn get_remote_or_open(
        &mut self,
        id: StreamId,
    ) -> Result<Option<&mut Stream>, TransportError> {
        if id.initiator() == self.side {
            let next = match id.directionality() {
                Directionality::Uni => self.next_uni,
                Directionality::Bi => self.next_bi,
            };
            if id.index() >= next {
                return Err(TransportError::STREAM_STATE_ERROR
                    .reason("peer referenced an unopened local stream"));
            }
            return Ok(self.streams.get_mut(&id));
        }
        let (next, max) = match id.directionality() {
            Directionality::Uni => (&mut self.next_remote_uni, self.max_remote_uni),
            Directionality::Bi => (&mut self.next_remote_bi, self.max_remote_bi),
        };
        if id.index() >= max {
            return Err(TransportError::STREAM_LIMIT_ERROR
                .reason("peer exceeded stream count limit"));
        }
        // Stream ids below are created implicitly
        while *next <= id.index() {
            let new_id = StreamId::new(!self.side, id.directionality(), *next);
            *next += 1;
            let stream = match id.directionality() {
                Directionality::Uni => Stream::new_recv(self.stream_receive_window),
                Directionality::Bi => {
                    Stream::new_bi(self.init_send_bidi_remote, self.stream_receive_window)
                }
            };
            self.streams.insert(new_id, stream);
        }
        Ok(self.streams.get_mut(&id))
    }

    pub fn get_send_mut(&mut self, id: StreamId) -> Option<&mut Send> {
        self.streams.get_mut(&id)?.send_mut()
    }

    pub fn get_recv_mut(&mut self, id: StreamId) -> Option<&mut Recv> {
        self.streams.get_mut(&id)?.recv_mut()
    }

    /// Apply the peer's transport parameters to local open limits and send windows
    pub fn apply_params(
        &mut self,
        max_bi: u64,
        max_uni: u64,
        send_bidi: u64,
        send_bidi_remote: u64,
        send_uni: u64,
    ) {
        self.max_bi = self.max_bi.max(max_bi);
        self.max_uni = self.max_uni.max(max_uni);
        self.init_send_bidi = send_bidi;
        self.init_send_bidi_remote = send_bidi_remote;
        self.init_send_uni = send_uni;
        let side = self.side;
        for (id, stream) in &mut self.streams {
            if let Some(send) = stream.send_mut() {
                let init = match (id.directionality(), id.initiator() == side) {
                    (Directionality::Uni, _) => send_uni,
                    (Directionality::Bi, true) => send_bidi,
                    (Directionality::Bi, false) => send_bidi_remote,
                };
                send.max_data = send.max_data.max(init);
            }
        }
    }

    pub fn queue_send(&mut self, id: StreamId) {
        if self.queued.insert(id) {
            self.send_queue.push_back(id);
        }
    }

    pub fn pop_sendable(&mut self) -> Option<StreamId> {
        let id = self.send_queue.pop_front()?;
        self.queued.remove(&id);
        Some(id)
    }

    pub fn has_sendable(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Discard a fully closed stream, replenishing the peer's stream count where owed
    pub fn maybe_cleanup(&mut self, id: StreamId) {
        let removable = match self.streams.get(&id) {
            Some(stream) => stream.is_removable(),
            None => return,
        };
        if !removable {
            return;
        }
        self.streams.remove(&id);
        self.queued.remove(&id);
        if id.initiator() != self.side {
            match id.directionality() {
                Directionality::Uni => {
                    self.max_remote_uni += 1;
                    self.max_streams_dirty[Directionality::Uni as usize] = true;
                }
                Directionality::Bi => {
                    self.max_remote_bi += 1;
                    self.max_streams_dirty[Directionality::Bi as usize] = true;
                }
            }
        }
    }

    pub fn remote_window(&self, directionality: Directionality) -> u64 {
        match directionality {
            Directionality::Uni => self.remote_uni_window,
            Directionality::Bi => self.remote_bi_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bi_stream() -> Stream {
        Stream::new_bi(1000, 1000)
    }

    #[test]
    fn send_fin_ack_reaches_data_recvd() {
        let mut stream = bi_stream();
        let send = stream.send_mut().unwrap();
        assert_eq!(send.write(b"hello").unwrap(), 5);
        assert_eq!(send.state, SendState::Send);
        send.finish();
        assert_eq!(send.state, SendState::DataSent);

        let mut buf = Vec::new();
        let mut waiters = Vec::new();
        let used = send.write_pending(StreamId(2), 0, 1200, u64::max_value(), &mut buf, &mut waiters);
        assert_eq!(used, 5);
        assert_eq!(waiters.len(), 1);
        assert!(!send.has_pending());

        // Peer acknowledges the packet
        waiters[0].mark_acked();
        assert!(send.ack_scan());
        assert_eq!(send.state, SendState::DataRecvd);
        assert!(stream.is_removable() == false); // recv half still open
    }

    #[test]
    fn zero_length_fin_is_sent_and_retransmitted() {
        let mut send = Send::new(1000);
        send.finish();
        let mut buf = Vec::new();
        let mut waiters = Vec::new();
        send.write_pending(StreamId(2), 0, 1200, 0, &mut buf, &mut waiters);
        assert!(!buf.is_empty());
        assert_eq!(waiters.len(), 1);
        waiters[0].mark_lost();
        assert!(send.has_pending());
        let mut buf2 = Vec::new();
        let mut waiters2 = Vec::new();
        send.write_pending(StreamId(2), 1, 1200, 0, &mut buf2, &mut waiters2);
        assert!(!buf2.is_empty());
        waiters2[0].mark_acked();
        assert!(send.ack_scan());
        assert_eq!(send.state, SendState::DataRecvd);
    }

    #[test]
    fn write_respects_stream_flow_control() {
        let mut send = Send::new(4);
        assert_eq!(send.write(b"abcdef").unwrap(), 4);
        assert_eq!(send.write(b"gh"), Err(WriteError::Blocked));
        assert!(send.blocked);
        send.max_data = 10;
        assert_eq!(send.write(b"efgh").unwrap(), 4);
    }

    #[test]
    fn stop_sending_forces_reset() {
        let mut send = Send::new(100);
        send.write(b"data").unwrap();
        // Peer's STOP_SENDING carries code 7; we reset with it
        send.stop_reason = Some(7);
        assert!(send.reset(7));
        assert_eq!(send.state, SendState::ResetSent);
        assert_eq!(send.write(b"more"), Err(WriteError::Stopped { error_code: 7 }));
        let handle = AckHandle::new();
        send.reset_handle = Some(handle.clone());
        handle.mark_acked();
        assert!(send.ack_scan());
        assert_eq!(send.state, SendState::ResetRecvd);
    }

    #[test]
    fn recv_out_of_order_and_fin() {
        let mut recv = Recv::new(1000);
        let late = frame::Stream {
            id: StreamId(3),
            offset: 6,
            fin: true,
            data: Bytes::from_static(b"world"),
        };
        assert_eq!(recv.ingest(&late).unwrap(), 11);
        assert_eq!(recv.state, RecvState::SizeKnown { size: 11 });
        let early = frame::Stream {
            id: StreamId(3),
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"hello "),
        };
        assert_eq!(recv.ingest(&early).unwrap(), 0);
        assert_eq!(recv.state, RecvState::DataRecvd { size: 11 });
        let mut buf = [0; 32];
        assert_eq!(recv.read(&mut buf).unwrap(), 11);
        assert_eq!(&buf[..11], b"hello world");
        assert_eq!(recv.read(&mut buf), Err(ReadError::Finished));
        assert_eq!(recv.state, RecvState::DataRead);
    }

    #[test]
    fn zero_length_fin_delivered() {
        let mut recv = Recv::new(1000);
        let frame = frame::Stream {
            id: StreamId(3),
            offset: 0,
            fin: true,
            data: Bytes::new(),
        };
        recv.ingest(&frame).unwrap();
        assert_eq!(recv.state, RecvState::DataRecvd { size: 0 });
        let mut buf = [0; 8];
        assert_eq!(recv.read(&mut buf), Err(ReadError::Finished));
    }

    #[test]
    fn final_size_contradictions() {
        let mut recv = Recv::new(1000);
        let fin = frame::Stream {
            id: StreamId(3),
            offset: 0,
            fin: true,
            data: Bytes::from_static(b"abcd"),
        };
        recv.ingest(&fin).unwrap();
        // Data past the final size
        let past = frame::Stream {
            id: StreamId(3),
            offset: 4,
            fin: false,
            data: Bytes::from_static(b"x"),
        };
        let err = recv.ingest(&past).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FINAL_SIZE_ERROR);
        // Reset with a different size
        let err = recv.reset(9, 0).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FINAL_SIZE_ERROR);
        // Reset with the same size is fine but state is already SizeKnown
        recv.reset(4, 3).unwrap();
    }

    #[test]
    fn duplicate_stream_data_idempotent() {
        let mut recv = Recv::new(1000);
        let frame = frame::Stream {
            id: StreamId(3),
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"abcd"),
        };
        assert_eq!(recv.ingest(&frame).unwrap(), 4);
        assert_eq!(recv.ingest(&frame).unwrap(), 0);
        let overlapping = frame::Stream {
            id: StreamId(3),
            offset: 2,
            fin: false,
            data: Bytes::from_static(b"cdef"),
        };
        assert_eq!(recv.ingest(&overlapping).unwrap(), 2);
        let mut buf = [0; 8];
        assert_eq!(recv.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"abcdef");
    }

    #[test]
    fn stream_flow_control_violation() {
        let mut recv = Recv::new(4);
        let frame = frame::Stream {
            id: StreamId(3),
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"abcdef"),
        };
        let err = recv.ingest(&frame).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn credit_replenishes_at_half_window() {
        let mut recv = Recv::new(100);
        assert_eq!(recv.credit_due(), None);
        let frame = frame::Stream {
            id: StreamId(3),
            offset: 0,
            fin: false,
            data: Bytes::from(vec![0; 60]),
        };
        recv.ingest(&frame).unwrap();
        let mut buf = [0; 60];
        recv.read(&mut buf).unwrap();
        // 60 read, 40 credit left of 100 window
        assert_eq!(recv.credit_due(), Some(160));
        assert_eq!(recv.credit_due(), None);
    }

    #[test]
    fn stream_admission() {
        let mut streams = Streams::new(Side::Client, 2, 1, 1000);
        // Local opens gated by peer limit
        assert_eq!(streams.open(Directionality::Bi), None);
        streams.apply_params(1, 0, 500, 500, 500);
        let id = streams.open(Directionality::Bi).unwrap();
        assert_eq!(id, StreamId::new(Side::Client, Directionality::Bi, 0));
        assert_eq!(streams.open(Directionality::Bi), None);

        // Remote streams implicitly open up to the referenced index
        let sid = StreamId::new(Side::Server, Directionality::Bi, 1);
        assert!(streams.get_remote_or_open(sid).unwrap().is_some());
        assert!(streams
            .streams
            .contains_key(&StreamId::new(Side::Server, Directionality::Bi, 0)));
        // Beyond the advertised limit
        let sid = StreamId::new(Side::Server, Directionality::Bi, 2);
        let err = streams.get_remote_or_open(sid).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_LIMIT_ERROR);
        // Reference to a local stream we never opened
        let sid = StreamId::new(Side::Client, Directionality::Bi, 5);
        let err = streams.get_remote_or_open(sid).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_STATE_ERROR);
    }

    #[test]
    fn cleanup_replenishes_remote_count() {
        let mut streams = Streams::new(Side::Client, 0, 1, 1000);
        let sid = StreamId::new(Side::Server, Directionality::Uni, 0);
        streams.get_remote_or_open(sid).unwrap();
        {
            let recv = streams.get_recv_mut(sid).unwrap();
            let frame = frame::Stream {
                id: sid,
                offset: 0,
                fin: true,
                data: Bytes::new(),
            };
            recv.ingest(&frame).unwrap();
            let mut buf = [0; 1];
            assert_eq!(recv.read(&mut buf), Err(ReadError::Finished));
        }
        streams.maybe_cleanup(sid);
        assert!(!streams.streams.contains_key(&sid));
        assert_eq!(streams.max_remote_uni, 2);
        assert!(streams.max_streams_dirty[Directionality::Uni as usize]);
    }
}
