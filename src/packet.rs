use std::{fmt, io, ops};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::coding::{self, BufExt, BufMutExt};
use crate::crypto::HeaderKey;
use crate::spaces::SpaceId;
use crate::{MAX_CID_SIZE, VERSION};

/// An opaque connection-routing label, 0-20 bytes
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(data: &[u8]) -> Self {
        debug_assert!(data.len() <= MAX_CID_SIZE);
        let mut x = ConnectionId {
            len: data.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        x.bytes[..data.len()].copy_from_slice(data);
        x
    }

    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut x = ConnectionId {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut x.bytes[..len]);
        x
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn encode_long<W: BufMut>(&self, buf: &mut W) {
        buf.write(self.len);
        buf.put_slice(self);
    }

    fn decode_long<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        let len = buf.get::<u8>()? as usize;
        if len > MAX_CID_SIZE || buf.remaining() < len {
            return Err(coding::UnexpectedEnd);
        }
        let mut bytes = [0; MAX_CID_SIZE];
        buf.copy_to_slice(&mut bytes[..len]);
        Ok(ConnectionId {
            len: len as u8,
            bytes,
        })
    }
}

impl ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl slog::Value for ConnectionId {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// A packet number truncated for the wire against the largest acknowledged value
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    /// Truncate `n` using the smallest encoding that the receiver can unambiguously expand
    pub fn new(n: u64, largest_acked: Option<u64>) -> Self {
        let range = match largest_acked {
            Some(x) => n - x,
            None => n + 1,
        };
        if range < 1 << 7 {
            PacketNumber::U8(n as u8)
        } else if range < 1 << 15 {
            PacketNumber::U16(n as u16)
        } else if range < 1 << 23 {
            PacketNumber::U24(n as u32)
        } else {
            PacketNumber::U32(n as u32)
        }
    }

    pub fn len(self) -> usize {
        use self::PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub fn encode<W: BufMut>(self, buf: &mut W) {
        use self::PacketNumber::*;
        match self {
            U8(x) => buf.write(x),
            U16(x) => buf.write(x),
            U24(x) => {
                buf.put_u8((x >> 16) as u8);
                buf.put_u16(x as u16);
            }
            U32(x) => buf.write(x),
        }
    }

    pub fn decode(len: usize, bytes: &[u8]) -> Self {
        let mut x = 0u32;
        for &b in &bytes[..len] {
            x = x << 8 | u32::from(b);
        }
        match len {
            1 => PacketNumber::U8(x as u8),
            2 => PacketNumber::U16(x as u16),
            3 => PacketNumber::U24(x),
            4 => PacketNumber::U32(x),
            _ => unreachable!("illegal packet number length"),
        }
    }

    /// Recover the full value given the largest number authenticated so far in this space
    pub fn expand(self, largest: u64) -> u64 {
        use self::PacketNumber::*;
        let (truncated, bits) = match self {
            U8(x) => (u64::from(x), 8u64),
            U16(x) => (u64::from(x), 16),
            U24(x) => (u64::from(x), 24),
            U32(x) => (u64::from(x), 32),
        };
        let expected = largest + 1;
        let win = 1u64 << bits;
        let hwin = win / 2;
        let mask = win - 1;
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x)
            && candidate < (1 << 62) - win
        {
            candidate + win
        } else if candidate > expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    ZeroRtt,
    Handshake,
}

/// A fully parsed or to-be-encoded packet header
#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
    },
    Short {
        dst_cid: ConnectionId,
        number: PacketNumber,
        spin: bool,
        key_phase: bool,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl Header {
    /// Write the header, leaving the payload-length placeholder (where applicable) to be
    /// patched by `set_payload_length` once the payload size is known
    pub fn encode(&self, buf: &mut Vec<u8>) -> PartialEncode {
        use self::Header::*;
        match *self {
            Initial {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
            } => {
                buf.write(0xc0u8 | (number.len() as u8 - 1));
                buf.write(VERSION);
                dst_cid.encode_long(buf);
                src_cid.encode_long(buf);
                buf.write_var(token.len() as u64);
                buf.put_slice(token);
                buf.write::<u16>(0); // payload length placeholder
                let pn_offset = buf.len();
                number.encode(buf);
                PartialEncode {
                    pn_offset,
                    pn_len: number.len(),
                    long: true,
                }
            }
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                let ty_bits = match ty {
                    LongType::ZeroRtt => 0x1u8,
                    LongType::Handshake => 0x2,
                };
                buf.write(0xc0u8 | ty_bits << 4 | (number.len() as u8 - 1));
                buf.write(VERSION);
                dst_cid.encode_long(buf);
                src_cid.encode_long(buf);
                buf.write::<u16>(0);
                let pn_offset = buf.len();
                number.encode(buf);
                PartialEncode {
                    pn_offset,
                    pn_len: number.len(),
                    long: true,
                }
            }
            Retry {
                ref dst_cid,
                ref src_cid,
                ref token,
            } => {
                buf.write(0xc0u8 | 0x3 << 4);
                buf.write(VERSION);
                dst_cid.encode_long(buf);
                src_cid.encode_long(buf);
                buf.put_slice(token);
                PartialEncode {
                    pn_offset: buf.len(),
                    pn_len: 0,
                    long: true,
                }
            }
            Short {
                ref dst_cid,
                number,
                spin,
                key_phase,
            } => {
                buf.write(
                    0x40u8 | (spin as u8) << 5 | (key_phase as u8) << 2 | (number.len() as u8 - 1),
                );
                buf.put_slice(dst_cid);
                let pn_offset = buf.len();
                number.encode(buf);
                PartialEncode {
                    pn_offset,
                    pn_len: number.len(),
                    long: false,
                }
            }
            VersionNegotiate {
                random,
                ref dst_cid,
                ref src_cid,
            } => {
                buf.write(0x80u8 | random & 0x7f);
                buf.write::<u32>(0);
                dst_cid.encode_long(buf);
                src_cid.encode_long(buf);
                PartialEncode {
                    pn_offset: buf.len(),
                    pn_len: 0,
                    long: true,
                }
            }
        }
    }

    pub fn number(&self) -> Option<PacketNumber> {
        use self::Header::*;
        match *self {
            Initial { number, .. } | Long { number, .. } | Short { number, .. } => Some(number),
            _ => None,
        }
    }

    pub fn space(&self) -> SpaceId {
        use self::Header::*;
        match *self {
            Initial { .. } => SpaceId::Initial,
            Long {
                ty: LongType::Handshake,
                ..
            } => SpaceId::Handshake,
            _ => SpaceId::Data,
        }
    }

    pub fn dst_cid(&self) -> &ConnectionId {
        use self::Header::*;
        match *self {
            Initial { ref dst_cid, .. }
            | Long { ref dst_cid, .. }
            | Retry { ref dst_cid, .. }
            | Short { ref dst_cid, .. }
            | VersionNegotiate { ref dst_cid, .. } => dst_cid,
        }
    }
}

pub struct PartialEncode {
    pn_offset: usize,
    pn_len: usize,
    long: bool,
}

impl PartialEncode {
    pub fn header_len(&self) -> usize {
        self.pn_offset + self.pn_len
    }

    /// Apply header protection. Must be called after the payload is sealed.
    pub fn finish(self, buf: &mut [u8], header_key: &HeaderKey) {
        if self.pn_len == 0 {
            return;
        }
        let sample_start = self.pn_offset + 4;
        let mask = {
            let sample = &buf[sample_start..sample_start + header_key.sample_size()];
            header_key.mask(sample)
        };
        buf[0] ^= mask[0] & if self.long { 0x0f } else { 0x1f };
        for i in 0..self.pn_len {
            buf[self.pn_offset + i] ^= mask[1 + i];
        }
    }
}

/// Patch the payload-length field of a long header once frames are written
pub fn set_payload_length(buf: &mut [u8], header_len: usize, pn_len: usize, tag_len: usize) {
    let len = buf.len() - header_len + pn_len + tag_len;
    debug_assert!(len < 0x4000);
    let slot = header_len - pn_len - 2;
    buf[slot] = 0x40 | (len >> 8) as u8;
    buf[slot + 1] = len as u8;
}

/// A packet with header protection removed, ready for AEAD verification
#[derive(Debug)]
pub struct Packet {
    pub header: Header,
    /// The unprotected header bytes, used as associated data
    pub header_data: Bytes,
    /// Ciphertext and tag
    pub payload: BytesMut,
}

/// Invariant-header parse of the first packet in a datagram
///
/// Header protection requires keys, so decoding happens in two steps: `new` parses everything
/// available without keys (enough to route), and `finish` unprotects the packet number and
/// yields any coalesced remainder.
#[derive(Debug)]
pub struct PartialDecode {
    plain: PlainHeader,
    buf: BytesMut,
    pn_offset: usize,
    rest: Option<BytesMut>,
}

#[derive(Debug)]
enum PlainHeader {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
    },
    Short {
        dst_cid: ConnectionId,
        spin: bool,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl PartialDecode {
    pub fn new(mut bytes: BytesMut, local_cid_len: usize) -> Result<Self, PacketDecodeError> {
        // Parse with a cursor first; only afterwards is `bytes` split, so offsets stay valid.
        let (plain, pn_offset, split_at) = {
            let mut buf = io::Cursor::new(&bytes[..]);
            Self::parse(&mut buf, local_cid_len)?
        };
        let rest = match split_at {
            Some(end) if end < bytes.len() => Some(bytes.split_off(end)),
            _ => None,
        };
        Ok(PartialDecode {
            plain,
            buf: bytes,
            pn_offset,
            rest,
        })
    }

    fn parse(
        buf: &mut io::Cursor<&[u8]>,
        local_cid_len: usize,
    ) -> Result<(PlainHeader, usize, Option<usize>), PacketDecodeError> {
        use self::PacketDecodeError::InvalidHeader;
        let total = buf.get_ref().len();
        let first = buf
            .get::<u8>()
            .map_err(|_| InvalidHeader("empty datagram"))?;
        if first & 0x80 == 0 {
            // Short header
            if first & 0x40 == 0 {
                return Err(InvalidHeader("fixed bit unset"));
            }
            if total < 1 + local_cid_len {
                return Err(InvalidHeader("cid truncated"));
            }
            let dst_cid = ConnectionId::new(&buf.get_ref()[1..1 + local_cid_len]);
            return Ok((
                PlainHeader::Short {
                    dst_cid,
                    spin: first & 0x20 != 0,
                },
                1 + local_cid_len,
                None,
            ));
        }
        let version = buf
            .get::<u32>()
            .map_err(|_| InvalidHeader("version truncated"))?;
        let dst_cid = ConnectionId::decode_long(buf)
            .map_err(|_| InvalidHeader("destination cid truncated"))?;
        let src_cid =
            ConnectionId::decode_long(buf).map_err(|_| InvalidHeader("source cid truncated"))?;
        if version == 0 {
            return Ok((
                PlainHeader::VersionNegotiate {
                    random: first & 0x7f,
                    dst_cid,
                    src_cid,
                },
                buf.position() as usize,
                None,
            ));
        }
        if version != VERSION {
            return Err(PacketDecodeError::UnsupportedVersion {
                source: src_cid,
                destination: dst_cid,
            });
        }
        match (first >> 4) & 0x3 {
            0x0 => {
                let token_len = buf
                    .get_var()
                    .map_err(|_| InvalidHeader("token truncated"))?;
                if token_len > buf.remaining() as u64 {
                    return Err(InvalidHeader("token truncated"));
                }
                let token_start = buf.position() as usize;
                let token = Bytes::copy_from_slice(
                    &buf.get_ref()[token_start..token_start + token_len as usize],
                );
                buf.advance(token_len as usize);
                let (pn_offset, end) = Self::payload_bounds(buf)?;
                Ok((
                    PlainHeader::Initial {
                        dst_cid,
                        src_cid,
                        token,
                    },
                    pn_offset,
                    Some(end),
                ))
            }
            ty @ 0x1 | ty @ 0x2 => {
                let ty = if ty == 0x1 {
                    LongType::ZeroRtt
                } else {
                    LongType::Handshake
                };
                let (pn_offset, end) = Self::payload_bounds(buf)?;
                Ok((
                    PlainHeader::Long {
                        ty,
                        dst_cid,
                        src_cid,
                    },
                    pn_offset,
                    Some(end),
                ))
            }
            _ => {
                // Retry: everything after the header minus the 16-byte integrity tag is token
                let token_start = buf.position() as usize;
                if total < token_start + 16 {
                    return Err(InvalidHeader("retry tag truncated"));
                }
                let token = Bytes::copy_from_slice(&buf.get_ref()[token_start..total - 16]);
                Ok((
                    PlainHeader::Retry {
                        dst_cid,
                        src_cid,
                        token,
                    },
                    token_start,
                    None,
                ))
            }
        }
    }

    /// Bound the first packet by its length field
    fn payload_bounds(buf: &mut io::Cursor<&[u8]>) -> Result<(usize, usize), PacketDecodeError> {
        let len = buf
            .get_var()
            .map_err(|_| PacketDecodeError::InvalidHeader("payload length truncated"))?;
        let pn_offset = buf.position() as usize;
        if len > buf.remaining() as u64 {
            return Err(PacketDecodeError::InvalidHeader("payload underruns length"));
        }
        Ok((pn_offset, pn_offset + len as usize))
    }

    pub fn dst_cid(&self) -> ConnectionId {
        use self::PlainHeader::*;
        match self.plain {
            Initial { dst_cid, .. }
            | Long { dst_cid, .. }
            | Retry { dst_cid, .. }
            | Short { dst_cid, .. }
            | VersionNegotiate { dst_cid, .. } => dst_cid,
        }
    }

    pub fn has_long_header(&self) -> bool {
        !matches!(self.plain, PlainHeader::Short { .. })
    }

    pub fn is_initial(&self) -> bool {
        matches!(self.plain, PlainHeader::Initial { .. })
    }

    /// The address-validation token of an Initial packet
    pub fn initial_token(&self) -> Option<&Bytes> {
        match self.plain {
            PlainHeader::Initial { ref token, .. } => Some(token),
            _ => None,
        }
    }

    /// The source CID of a long-header packet
    pub fn src_cid(&self) -> Option<ConnectionId> {
        use self::PlainHeader::*;
        match self.plain {
            Initial { src_cid, .. }
            | Long { src_cid, .. }
            | Retry { src_cid, .. }
            | VersionNegotiate { src_cid, .. } => Some(src_cid),
            Short { .. } => None,
        }
    }

    pub fn is_zero_rtt(&self) -> bool {
        matches!(
            self.plain,
            PlainHeader::Long {
                ty: LongType::ZeroRtt,
                ..
            }
        )
    }

    /// The number space the packet belongs to; `None` for unprotected packet types
    pub fn space(&self) -> Option<SpaceId> {
        use self::PlainHeader::*;
        match self.plain {
            Initial { .. } => Some(SpaceId::Initial),
            Long {
                ty: LongType::Handshake,
                ..
            } => Some(SpaceId::Handshake),
            Long { .. } | Short { .. } => Some(SpaceId::Data),
            _ => None,
        }
    }

    /// Remove header protection and split header from payload
    ///
    /// `header_key` may be `None` only for Retry and Version Negotiation packets.
    pub fn finish(
        self,
        header_key: Option<&HeaderKey>,
    ) -> Result<(Packet, Option<BytesMut>), PacketDecodeError> {
        let PartialDecode {
            plain,
            mut buf,
            pn_offset,
            rest,
        } = self;
        // Unprotected packet types carry no packet number
        match plain {
            PlainHeader::Retry {
                dst_cid,
                src_cid,
                token,
            } => {
                // Integrity verification needs the whole packet, so keep it intact
                return Ok((
                    Packet {
                        header: Header::Retry {
                            dst_cid,
                            src_cid,
                            token,
                        },
                        header_data: buf.freeze(),
                        payload: BytesMut::new(),
                    },
                    None,
                ));
            }
            PlainHeader::VersionNegotiate {
                random,
                dst_cid,
                src_cid,
            } => {
                let payload = buf.split_off(pn_offset);
                return Ok((
                    Packet {
                        header: Header::VersionNegotiate {
                            random,
                            dst_cid,
                            src_cid,
                        },
                        header_data: buf.freeze(),
                        payload,
                    },
                    None,
                ));
            }
            _ => {}
        }
        let header_key = header_key.expect("header key required for protected packets");
        let sample_len = header_key.sample_size();
        if buf.len() < pn_offset + 4 + sample_len {
            return Err(PacketDecodeError::InvalidHeader(
                "packet too short to sample",
            ));
        }
        let mask = {
            let sample = &buf[pn_offset + 4..pn_offset + 4 + sample_len];
            header_key.mask(sample)
        };
        let long = buf[0] & 0x80 != 0;
        buf[0] ^= mask[0] & if long { 0x0f } else { 0x1f };
        let first = buf[0];
        let pn_len = (first & 0x03) as usize + 1;
        for i in 0..pn_len {
            buf[pn_offset + i] ^= mask[1 + i];
        }
        let number = PacketNumber::decode(pn_len, &buf[pn_offset..]);
        let header = match plain {
            PlainHeader::Initial {
                dst_cid,
                src_cid,
                token,
            } => Header::Initial {
                dst_cid,
                src_cid,
                token,
                number,
            },
            PlainHeader::Long {
                ty,
                dst_cid,
                src_cid,
            } => Header::Long {
                ty,
                dst_cid,
                src_cid,
                number,
            },
            PlainHeader::Short { dst_cid, spin } => Header::Short {
                dst_cid,
                number,
                spin,
                key_phase: first & 0x04 != 0,
            },
            _ => unreachable!(),
        };
        let payload = buf.split_off(pn_offset + pn_len);
        Ok((
            Packet {
                header,
                header_data: buf.freeze(),
                payload,
            },
            rest,
        ))
    }
}

#[derive(Debug, Fail)]
pub enum PacketDecodeError {
    #[fail(display = "unsupported version")]
    UnsupportedVersion {
        source: ConnectionId,
        destination: ConnectionId,
    },
    #[fail(display = "invalid header: {}", _0)]
    InvalidHeader(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Secret;
    use crate::Side;

    #[test]
    fn pn_truncation() {
        // RFC 9000 §A.2 worked example
        let pn = PacketNumber::new(0xac5c02, Some(0xabe8b3));
        assert_eq!(pn, PacketNumber::U16(0x5c02));
        let mut buf = Vec::new();
        pn.encode(&mut buf);
        assert_eq!(buf, [0x5c, 0x02]);
        // And the receiver's expansion from §A.3
        let decoded = PacketNumber::decode(2, &buf);
        assert_eq!(decoded.expand(0xabe8b3), 0xac5c02);
    }

    #[test]
    fn pn_expand_wraparound() {
        // §A.3 example: expecting 0xa82f9b32, receiving 0x9b32 in 2 bytes
        let pn = PacketNumber::U16(0x9b32);
        assert_eq!(pn.expand(0xa82f_9b31), 0xa82f_9b32);
        // Value behind the window resolves downward
        let pn = PacketNumber::U8(0xff);
        assert_eq!(pn.expand(0x1ff), 0x1ff);
        // First packet in a space
        let pn = PacketNumber::U8(0);
        assert_eq!(pn.expand(0), 0);
    }

    #[test]
    fn pn_len_choice() {
        assert_eq!(PacketNumber::new(0, None).len(), 1);
        assert_eq!(PacketNumber::new(200, Some(0)).len(), 2);
        assert_eq!(PacketNumber::new(1 << 20, Some(0)).len(), 3);
        assert_eq!(PacketNumber::new(1 << 30, Some(0)).len(), 4);
    }

    #[test]
    fn header_roundtrip_protected() {
        let dcid = ConnectionId::new(&[0x11; 8]);
        let scid = ConnectionId::new(&[0x22; 5]);
        let secret = Secret::initial(&ConnectionId::new(&[0x33; 8]), Side::Client, true);
        let keys = secret.keys().unwrap();
        let header = Header::Initial {
            dst_cid: dcid,
            src_cid: scid,
            token: Bytes::new(),
            number: PacketNumber::U16(0x1234),
        };
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        let header_len = partial.header_len();
        buf.extend_from_slice(&[0u8; 32]); // payload stand-in
        set_payload_length(&mut buf, header_len, 2, 16);
        buf.extend_from_slice(&[0u8; 16]); // tag stand-in
        partial.finish(&mut buf, keys.header_key());

        let decode = PartialDecode::new(BytesMut::from(&buf[..]), 8).unwrap();
        assert!(decode.is_initial());
        assert_eq!(decode.dst_cid(), dcid);
        let (packet, rest) = decode.finish(Some(keys.header_key())).unwrap();
        assert!(rest.is_none());
        match packet.header {
            Header::Initial { number, .. } => assert_eq!(number, PacketNumber::U16(0x1234)),
            ref x => panic!("unexpected header {:?}", x),
        }
        assert_eq!(packet.header_data.len(), header_len);
        assert_eq!(packet.payload.len(), 48);
    }

    #[test]
    fn coalesced_split() {
        let secret = Secret::initial(&ConnectionId::new(&[0x33; 8]), Side::Client, true);
        let keys = secret.keys().unwrap();
        let mut buf = Vec::new();
        let header = Header::Initial {
            dst_cid: ConnectionId::new(&[0x11; 8]),
            src_cid: ConnectionId::new(&[0x22; 8]),
            token: Bytes::new(),
            number: PacketNumber::U8(0),
        };
        let partial = header.encode(&mut buf);
        let header_len = partial.header_len();
        buf.extend_from_slice(&[0u8; 24]);
        set_payload_length(&mut buf, header_len, 1, 16);
        buf.extend_from_slice(&[0u8; 16]);
        partial.finish(&mut buf, keys.header_key());
        let first_len = buf.len();
        buf.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]); // trailing coalesced data

        let decode = PartialDecode::new(BytesMut::from(&buf[..]), 8).unwrap();
        let (_, rest) = decode.finish(Some(keys.header_key())).unwrap();
        let rest = rest.unwrap();
        assert_eq!(&rest[..], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(first_len + rest.len(), buf.len());
    }

    #[test]
    fn version_negotiation_parse() {
        let mut buf = Vec::new();
        Header::VersionNegotiate {
            random: 0x23,
            dst_cid: ConnectionId::new(&[1; 4]),
            src_cid: ConnectionId::new(&[2; 4]),
        }
        .encode(&mut buf);
        buf.write(0x0a1a_2a3au32);
        buf.write(VERSION);
        let decode = PartialDecode::new(BytesMut::from(&buf[..]), 0).unwrap();
        assert!(decode.has_long_header());
        let (packet, _) = decode.finish(None).unwrap();
        assert_matches!(packet.header, Header::VersionNegotiate { .. });
        assert_eq!(packet.payload.len(), 8);
    }

    #[test]
    fn unsupported_version() {
        let mut buf = vec![0xc0u8];
        buf.write(0xff00_001du32); // draft version
        buf.write(4u8);
        buf.extend_from_slice(&[9; 4]);
        buf.write(0u8);
        let err = PartialDecode::new(BytesMut::from(&buf[..]), 0).unwrap_err();
        assert_matches!(err, PacketDecodeError::UnsupportedVersion { destination, .. }
            if destination == ConnectionId::new(&[9; 4]));
    }
}
