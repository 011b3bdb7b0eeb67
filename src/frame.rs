use std::ops::Range;
use std::{fmt, mem};

use bytes::{Buf, BufMut, Bytes};

use crate::coding::{self, BufExt, BufMutExt, UnexpectedEnd};
use crate::packet::ConnectionId;
use crate::range_set::RangeSet;
use crate::{Directionality, StreamId, TransportErrorCode, MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// A QUIC frame type discriminator as it appears on the wire
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Type(pub u64);

impl Type {
    /// Whether receipt of a frame of this type obligates the peer to send an ACK
    pub fn is_ack_eliciting(self) -> bool {
        !matches!(
            self,
            Type::PADDING | Type::ACK | Type::ACK_ECN | Type::CONNECTION_CLOSE | Type::APPLICATION_CLOSE
        )
    }

    fn stream(self) -> Option<StreamInfo> {
        if (0x08..=0x0f).contains(&self.0) {
            Some(StreamInfo(self.0 as u8))
        } else {
            None
        }
    }
}

impl coding::Codec for Type {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Type(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl Type {
            $(pub const $name: Type = Type($val);)*
        }

        impl fmt::Display for Type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if (0x08..=0x0f).contains(&x) => f.write_str("STREAM"),
                    _ => write!(f, "<unknown 0x{:x}>", self.0),
                }
            }
        }
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
    PATH_CHALLENGE = 0x1a,
    PATH_RESPONSE = 0x1b,
    CONNECTION_CLOSE = 0x1c,
    APPLICATION_CLOSE = 0x1d,
    HANDSHAKE_DONE = 0x1e,
}

/// Flag bits packed into the low three bits of a STREAM frame type
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct StreamInfo(u8);

impl StreamInfo {
    fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }
    fn len(self) -> bool {
        self.0 & 0x02 != 0
    }
    fn off(self) -> bool {
        self.0 & 0x04 != 0
    }
}

/// Every frame defined by RFC 9000 §19, as a tagged union for exhaustive dispatch
#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending { id: StreamId, error_code: u64 },
    Crypto(Crypto),
    NewToken { token: Bytes },
    Stream(Stream),
    MaxData(u64),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { directionality: Directionality, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { directionality: Directionality, limit: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    ConnectionClose(ConnectionClose),
    ApplicationClose(ApplicationClose),
    HandshakeDone,
    Invalid(Type),
}

impl Frame {
    pub fn ty(&self) -> Type {
        use self::Frame::*;
        match *self {
            Padding => Type::PADDING,
            Ping => Type::PING,
            Ack(_) => Type::ACK,
            ResetStream(_) => Type::RESET_STREAM,
            StopSending { .. } => Type::STOP_SENDING,
            Crypto(_) => Type::CRYPTO,
            NewToken { .. } => Type::NEW_TOKEN,
            Stream(ref x) => {
                let mut ty = 0x08;
                if x.offset != 0 {
                    ty |= 0x04;
                }
                ty |= 0x02;
                if x.fin {
                    ty |= 0x01;
                }
                Type(ty)
            }
            MaxData(_) => Type::MAX_DATA,
            MaxStreamData { .. } => Type::MAX_STREAM_DATA,
            MaxStreams { directionality: Directionality::Bi, .. } => Type::MAX_STREAMS_BIDI,
            MaxStreams { .. } => Type::MAX_STREAMS_UNI,
            DataBlocked { .. } => Type::DATA_BLOCKED,
            StreamDataBlocked { .. } => Type::STREAM_DATA_BLOCKED,
            StreamsBlocked { directionality: Directionality::Bi, .. } => Type::STREAMS_BLOCKED_BIDI,
            StreamsBlocked { .. } => Type::STREAMS_BLOCKED_UNI,
            NewConnectionId(_) => Type::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => Type::RETIRE_CONNECTION_ID,
            PathChallenge(_) => Type::PATH_CHALLENGE,
            PathResponse(_) => Type::PATH_RESPONSE,
            ConnectionClose(_) => Type::CONNECTION_CLOSE,
            ApplicationClose(_) => Type::APPLICATION_CLOSE,
            HandshakeDone => Type::HANDSHAKE_DONE,
            Invalid(ty) => ty,
        }
    }

    pub fn is_ack_eliciting(&self) -> bool {
        self.ty().is_ack_eliciting()
    }
}

/// An ACK frame, decoded into ascending packet-number ranges
#[derive(Debug, Clone)]
pub struct Ack {
    pub largest: u64,
    /// Raw delay field; scale by the peer's ack_delay_exponent
    pub delay: u64,
    pub ranges: Vec<Range<u64>>,
    pub ecn: Option<EcnCounts>,
}

impl Ack {
    pub fn encode<W: BufMut>(delay: u64, ranges: &RangeSet, ecn: Option<&EcnCounts>, buf: &mut W) {
        debug_assert!(!ranges.is_empty());
        let mut rest = ranges.iter().rev();
        let first = rest.next().unwrap();
        let largest = first.end - 1;
        buf.write(if ecn.is_some() { Type::ACK_ECN } else { Type::ACK });
        buf.write_var(largest);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(largest - first.start);
        let mut prev = first.start;
        for block in rest {
            buf.write_var(prev - block.end - 1);
            buf.write_var(block.end - 1 - block.start);
            prev = block.start;
        }
        if let Some(x) = ecn {
            x.encode(buf);
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.ranges.iter().cloned()
    }

    fn decode(bytes: &mut Bytes, ecn: bool) -> Result<Ack, UnexpectedEnd> {
        let largest = bytes.get_var()?;
        let delay = bytes.get_var()?;
        let count = bytes.get_var()?;
        let first = bytes.get_var()?;
        if first > largest {
            return Err(UnexpectedEnd);
        }
        let mut smallest = largest - first;
        let mut ranges = Vec::with_capacity(count as usize + 1);
        ranges.push(smallest..largest + 1);
        for _ in 0..count {
            let gap = bytes.get_var()?;
            let len = bytes.get_var()?;
            if gap.checked_add(2).map_or(true, |x| x > smallest) {
                return Err(UnexpectedEnd);
            }
            let next_largest = smallest - gap - 2;
            if len > next_largest {
                return Err(UnexpectedEnd);
            }
            smallest = next_largest - len;
            ranges.push(smallest..next_largest + 1);
        }
        ranges.reverse();
        let ecn = if ecn {
            Some(EcnCounts {
                ect0: bytes.get_var()?,
                ect1: bytes.get_var()?,
                ce: bytes.get_var()?,
            })
        } else {
            None
        };
        Ok(Ack {
            largest,
            delay,
            ranges,
            ecn,
        })
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

impl EcnCounts {
    fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write_var(self.ect0);
        buf.write_var(self.ect1);
        buf.write_var(self.ce);
    }
}

#[derive(Debug, Clone)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    /// Bytes of overhead when carrying `offset`, before the length field
    pub const SIZE_BOUND: usize = 1 + 8 + 8;

    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write(Type::CRYPTO);
        buf.write_var(self.offset);
        buf.write_var(self.data.len() as u64);
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl Stream {
    /// Worst-case header size with an explicit length
    pub const SIZE_BOUND: usize = 1 + 8 + 8 + 8;

    /// The wire type byte with this frame's flag bits
    pub fn ty(&self) -> Type {
        let mut ty = 0x08;
        if self.offset != 0 {
            ty |= 0x04;
        }
        if self.fin {
            ty |= 0x01;
        }
        Type(ty)
    }

    /// Encode the frame; `length` controls whether an explicit length is written, which is
    /// required unless this is the last frame of the packet
    pub fn encode<W: BufMut>(&self, length: bool, buf: &mut W) {
        let mut ty = 0x08;
        if self.offset != 0 {
            ty |= 0x04;
        }
        if length {
            ty |= 0x02;
        }
        if self.fin {
            ty |= 0x01;
        }
        buf.write_var(ty);
        buf.write_var(self.id.0);
        if self.offset != 0 {
            buf.write_var(self.offset);
        }
        if length {
            buf.write_var(self.data.len() as u64);
        }
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Copy, Clone)]
pub struct ResetStream {
    pub id: StreamId,
    pub error_code: u64,
    pub final_offset: u64,
}

impl ResetStream {
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write(Type::RESET_STREAM);
        buf.write_var(self.id.0);
        buf.write_var(self.error_code);
        buf.write_var(self.final_offset);
    }
}

#[derive(Debug, Copy, Clone)]
pub struct NewConnectionId {
    pub sequence: u64,
    pub retire_prior_to: u64,
    pub id: ConnectionId,
    pub reset_token: [u8; RESET_TOKEN_SIZE],
}

impl NewConnectionId {
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write(Type::NEW_CONNECTION_ID);
        buf.write_var(self.sequence);
        buf.write_var(self.retire_prior_to);
        buf.write(self.id.len() as u8);
        buf.put_slice(&self.id);
        buf.put_slice(&self.reset_token);
    }
}

/// Connection termination initiated by the transport, carrying an RFC 9000 §20 code
#[derive(Debug, Clone)]
pub struct ConnectionClose {
    pub error_code: TransportErrorCode,
    pub frame_type: Option<Type>,
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error_code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl ConnectionClose {
    /// Encode, truncating the reason to honor `max_len` bytes of total frame size
    pub fn encode<W: BufMut>(&self, buf: &mut W, max_len: usize) {
        let prefix = 1 + 8 + 8 + 8;
        let reason_len = self.reason.len().min(max_len.saturating_sub(prefix));
        buf.write(Type::CONNECTION_CLOSE);
        buf.write_var(self.error_code.0);
        buf.write_var(self.frame_type.map_or(0, |x| x.0));
        buf.write_var(reason_len as u64);
        buf.put_slice(&self.reason[..reason_len]);
    }
}

/// Connection termination initiated by the application
#[derive(Debug, Clone)]
pub struct ApplicationClose {
    pub error_code: u64,
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "application error {}", self.error_code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl ApplicationClose {
    pub fn encode<W: BufMut>(&self, buf: &mut W, max_len: usize) {
        let prefix = 1 + 8 + 8;
        let reason_len = self.reason.len().min(max_len.saturating_sub(prefix));
        buf.write(Type::APPLICATION_CLOSE);
        buf.write_var(self.error_code);
        buf.write_var(reason_len as u64);
        buf.put_slice(&self.reason[..reason_len]);
    }
}

/// Parses a packet payload into frames
///
/// Malformed input yields a single `Frame::Invalid` and then terminates.
pub struct Iter {
    bytes: Bytes,
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Iter { bytes: payload }
    }

    fn take_len(&mut self) -> Result<Bytes, UnexpectedEnd> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.len() as u64 {
            return Err(UnexpectedEnd);
        }
        Ok(self.bytes.split_to(len as usize))
    }

    fn try_next(&mut self) -> Result<Frame, UnexpectedEnd> {
        let ty = Type(self.bytes.get_var()?);
        Ok(match ty {
            Type::PADDING => Frame::Padding,
            Type::PING => Frame::Ping,
            Type::ACK => Frame::Ack(Ack::decode(&mut self.bytes, false)?),
            Type::ACK_ECN => Frame::Ack(Ack::decode(&mut self.bytes, true)?),
            Type::RESET_STREAM => Frame::ResetStream(ResetStream {
                id: StreamId(self.bytes.get_var()?),
                error_code: self.bytes.get_var()?,
                final_offset: self.bytes.get_var()?,
            }),
            Type::STOP_SENDING => Frame::StopSending {
                id: StreamId(self.bytes.get_var()?),
                error_code: self.bytes.get_var()?,
            },
            Type::CRYPTO => {
                let offset = self.bytes.get_var()?;
                let data = self.take_len()?;
                Frame::Crypto(Crypto { offset, data })
            }
            Type::NEW_TOKEN => Frame::NewToken {
                token: self.take_len()?,
            },
            Type::MAX_DATA => Frame::MaxData(self.bytes.get_var()?),
            Type::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_BIDI => Frame::MaxStreams {
                directionality: Directionality::Bi,
                count: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_UNI => Frame::MaxStreams {
                directionality: Directionality::Uni,
                count: self.bytes.get_var()?,
            },
            Type::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var()?,
            },
            Type::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            Type::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                directionality: Directionality::Bi,
                limit: self.bytes.get_var()?,
            },
            Type::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                directionality: Directionality::Uni,
                limit: self.bytes.get_var()?,
            },
            Type::NEW_CONNECTION_ID => {
                let sequence = self.bytes.get_var()?;
                let retire_prior_to = self.bytes.get_var()?;
                let len = self.bytes.get::<u8>()? as usize;
                if len > MAX_CID_SIZE || len > self.bytes.len() {
                    return Err(UnexpectedEnd);
                }
                let id = ConnectionId::new(&self.bytes.split_to(len));
                if self.bytes.len() < RESET_TOKEN_SIZE {
                    return Err(UnexpectedEnd);
                }
                let mut reset_token = [0; RESET_TOKEN_SIZE];
                reset_token.copy_from_slice(&self.bytes.split_to(RESET_TOKEN_SIZE));
                Frame::NewConnectionId(NewConnectionId {
                    sequence,
                    retire_prior_to,
                    id,
                    reset_token,
                })
            }
            Type::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: self.bytes.get_var()?,
            },
            Type::PATH_CHALLENGE => Frame::PathChallenge(self.bytes.get()?),
            Type::PATH_RESPONSE => Frame::PathResponse(self.bytes.get()?),
            Type::CONNECTION_CLOSE => {
                let error_code = TransportErrorCode(self.bytes.get_var()?);
                let frame_type = match self.bytes.get_var()? {
                    0 => None,
                    x => Some(Type(x)),
                };
                let reason = self.take_len()?;
                Frame::ConnectionClose(ConnectionClose {
                    error_code,
                    frame_type,
                    reason,
                })
            }
            Type::APPLICATION_CLOSE => Frame::ApplicationClose(ApplicationClose {
                error_code: self.bytes.get_var()?,
                reason: self.take_len()?,
            }),
            Type::HANDSHAKE_DONE => Frame::HandshakeDone,
            _ => {
                if let Some(info) = ty.stream() {
                    let id = StreamId(self.bytes.get_var()?);
                    let offset = if info.off() { self.bytes.get_var()? } else { 0 };
                    let data = if info.len() {
                        self.take_len()?
                    } else {
                        mem::replace(&mut self.bytes, Bytes::new())
                    };
                    Frame::Stream(Stream {
                        id,
                        offset,
                        fin: info.fin(),
                        data,
                    })
                } else {
                    return Err(UnexpectedEnd);
                }
            }
        })
    }
}

impl Iterator for Iter {
    type Item = Frame;
    fn next(&mut self) -> Option<Frame> {
        if self.bytes.is_empty() {
            return None;
        }
        let before = self.bytes.clone();
        match self.try_next() {
            Ok(x) => Some(x),
            Err(UnexpectedEnd) => {
                // Stop parsing; report the offending type if it was readable
                let ty = {
                    let mut b = before;
                    b.get_var().map(Type).unwrap_or(Type::PADDING)
                };
                self.bytes.clear();
                Some(Frame::Invalid(ty))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(buf: Vec<u8>) -> Vec<Frame> {
        Iter::new(Bytes::from(buf)).collect()
    }

    #[test]
    fn ack_roundtrip() {
        let mut ranges = RangeSet::new();
        ranges.insert(0..3);
        ranges.insert(5..6);
        ranges.insert(9..12);
        let mut buf = Vec::new();
        Ack::encode(42, &ranges, None, &mut buf);
        let parsed = frames(buf);
        assert_eq!(parsed.len(), 1);
        match parsed[0] {
            Frame::Ack(ref ack) => {
                assert_eq!(ack.largest, 11);
                assert_eq!(ack.delay, 42);
                assert_eq!(ack.ranges, vec![0..3, 5..6, 9..12]);
                assert!(ack.ecn.is_none());
            }
            ref x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn ack_ecn_roundtrip() {
        let mut ranges = RangeSet::new();
        ranges.insert_one(7);
        let counts = EcnCounts {
            ect0: 12,
            ect1: 0,
            ce: 3,
        };
        let mut buf = Vec::new();
        Ack::encode(0, &ranges, Some(&counts), &mut buf);
        match &frames(buf)[0] {
            Frame::Ack(ack) => assert_eq!(ack.ecn, Some(counts)),
            x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn stream_forms() {
        // Implicit length runs to the end of the packet
        let frame = Stream {
            id: StreamId(4),
            offset: 1000,
            fin: true,
            data: Bytes::from_static(b"ab"),
        };
        let mut buf = Vec::new();
        frame.encode(false, &mut buf);
        match &frames(buf)[0] {
            Frame::Stream(x) => {
                assert_eq!(x.id, StreamId(4));
                assert_eq!(x.offset, 1000);
                assert!(x.fin);
                assert_eq!(&x.data[..], b"ab");
            }
            x => panic!("unexpected frame {:?}", x),
        }
        // Zero-length frame with FIN and explicit length survives followed by padding
        let frame = Stream {
            id: StreamId(4),
            offset: 2,
            fin: true,
            data: Bytes::new(),
        };
        let mut buf = Vec::new();
        frame.encode(true, &mut buf);
        buf.push(0); // PADDING
        let parsed = frames(buf);
        assert_matches!(parsed[0], Frame::Stream(ref x) if x.fin && x.data.is_empty());
        assert_matches!(parsed[1], Frame::Padding);
    }

    #[test]
    fn malformed_stops_iteration() {
        // CRYPTO frame whose length runs past the end
        let mut buf = Vec::new();
        buf.write(Type::CRYPTO);
        buf.write_var(0);
        buf.write_var(50);
        buf.extend_from_slice(b"short");
        let parsed = frames(buf);
        assert_eq!(parsed.len(), 1);
        assert_matches!(parsed[0], Frame::Invalid(Type::CRYPTO));
    }

    #[test]
    fn new_connection_id_roundtrip() {
        let frame = NewConnectionId {
            sequence: 3,
            retire_prior_to: 1,
            id: ConnectionId::new(&[0xab; 8]),
            reset_token: [0x1b; RESET_TOKEN_SIZE],
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        match &frames(buf)[0] {
            Frame::NewConnectionId(x) => {
                assert_eq!(x.sequence, 3);
                assert_eq!(x.retire_prior_to, 1);
                assert_eq!(&x.id[..], &[0xab; 8][..]);
                assert_eq!(x.reset_token, [0x1b; RESET_TOKEN_SIZE]);
            }
            x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn close_truncates_reason() {
        let close = ConnectionClose {
            error_code: TransportErrorCode::PROTOCOL_VIOLATION,
            frame_type: Some(Type::STREAM_DATA_BLOCKED),
            reason: Bytes::from_static(&[b'x'; 100]),
        };
        let mut buf = Vec::new();
        close.encode(&mut buf, 40);
        assert!(buf.len() <= 40);
        match &frames(buf)[0] {
            Frame::ConnectionClose(x) => {
                assert_eq!(x.error_code, TransportErrorCode::PROTOCOL_VIOLATION);
                assert_eq!(x.frame_type, Some(Type::STREAM_DATA_BLOCKED));
                assert!(x.reason.len() < 100);
            }
            x => panic!("unexpected frame {:?}", x),
        }
    }
}
