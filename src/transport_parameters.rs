use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut};

use crate::coding::{self, BufExt, BufMutExt, UnexpectedEnd};
use crate::endpoint::Config;
use crate::packet::ConnectionId;
use crate::{Side, TransportError, MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// The transport parameters negotiated through the TLS extension (RFC 9000 §18)
///
/// Each side sends one blob during the handshake; values constrain the *sender's peer*.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    /// Milliseconds; 0 disables
    pub max_idle_timeout: u64,
    pub max_udp_payload_size: u64,
    pub ack_delay_exponent: u8,
    /// Milliseconds
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,

    pub original_dst_cid: Option<ConnectionId>,
    pub initial_src_cid: Option<ConnectionId>,
    pub retry_src_cid: Option<ConnectionId>,
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
    pub preferred_address: Option<PreferredAddress>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        TransportParameters {
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            max_idle_timeout: 0,
            max_udp_payload_size: 65527,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
            original_dst_cid: None,
            initial_src_cid: None,
            retry_src_cid: None,
            stateless_reset_token: None,
            preferred_address: None,
        }
    }
}

impl TransportParameters {
    pub fn new(config: &Config) -> Self {
        TransportParameters {
            initial_max_data: config.receive_window,
            initial_max_stream_data_bidi_local: config.stream_receive_window,
            initial_max_stream_data_bidi_remote: config.stream_receive_window,
            initial_max_stream_data_uni: config.stream_receive_window,
            initial_max_streams_bidi: config.max_remote_bi_streams,
            initial_max_streams_uni: config.max_remote_uni_streams,
            max_idle_timeout: config.idle_timeout,
            max_ack_delay: config.max_ack_delay,
            active_connection_id_limit: config.active_connection_id_limit,
            ..Default::default()
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PreferredAddress {
    pub address_v4: Option<SocketAddrV4>,
    pub address_v6: Option<SocketAddrV6>,
    pub cid: ConnectionId,
    pub reset_token: [u8; RESET_TOKEN_SIZE],
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum Error {
    #[fail(display = "malformed transport parameters")]
    Malformed,
    #[fail(display = "transport parameter had illegal value")]
    IllegalValue,
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Error::Malformed
    }
}

impl From<Error> for TransportError {
    fn from(e: Error) -> Self {
        TransportError::TRANSPORT_PARAMETER_ERROR.reason(match e {
            Error::Malformed => "malformed",
            Error::IllegalValue => "illegal value",
        })
    }
}

fn write_varint_param<W: BufMut>(buf: &mut W, id: u64, value: u64) {
    buf.write_var(id);
    buf.write_var(coding::var_len(value) as u64);
    buf.write_var(value);
}

fn write_cid_param<W: BufMut>(buf: &mut W, id: u64, cid: &ConnectionId) {
    buf.write_var(id);
    buf.write_var(cid.len() as u64);
    buf.put_slice(cid);
}

impl TransportParameters {
    pub fn write<W: BufMut>(&self, buf: &mut W) {
        if let Some(ref x) = self.original_dst_cid {
            write_cid_param(buf, 0x00, x);
        }
        if self.max_idle_timeout != 0 {
            write_varint_param(buf, 0x01, self.max_idle_timeout);
        }
        if let Some(ref x) = self.stateless_reset_token {
            buf.write_var(0x02);
            buf.write_var(RESET_TOKEN_SIZE as u64);
            buf.put_slice(x);
        }
        if self.max_udp_payload_size != 65527 {
            write_varint_param(buf, 0x03, self.max_udp_payload_size);
        }
        if self.initial_max_data != 0 {
            write_varint_param(buf, 0x04, self.initial_max_data);
        }
        if self.initial_max_stream_data_bidi_local != 0 {
            write_varint_param(buf, 0x05, self.initial_max_stream_data_bidi_local);
        }
        if self.initial_max_stream_data_bidi_remote != 0 {
            write_varint_param(buf, 0x06, self.initial_max_stream_data_bidi_remote);
        }
        if self.initial_max_stream_data_uni != 0 {
            write_varint_param(buf, 0x07, self.initial_max_stream_data_uni);
        }
        if self.initial_max_streams_bidi != 0 {
            write_varint_param(buf, 0x08, self.initial_max_streams_bidi);
        }
        if self.initial_max_streams_uni != 0 {
            write_varint_param(buf, 0x09, self.initial_max_streams_uni);
        }
        if self.ack_delay_exponent != 3 {
            write_varint_param(buf, 0x0a, u64::from(self.ack_delay_exponent));
        }
        if self.max_ack_delay != 25 {
            write_varint_param(buf, 0x0b, self.max_ack_delay);
        }
        if self.disable_active_migration {
            buf.write_var(0x0c);
            buf.write_var(0);
        }
        if let Some(ref x) = self.preferred_address {
            buf.write_var(0x0d);
            buf.write_var((4 + 2 + 16 + 2 + 1 + x.cid.len() + RESET_TOKEN_SIZE) as u64);
            match x.address_v4 {
                Some(addr) => {
                    buf.put_slice(&addr.ip().octets());
                    buf.put_u16(addr.port());
                }
                None => {
                    buf.put_slice(&[0; 6]);
                }
            }
            match x.address_v6 {
                Some(addr) => {
                    buf.put_slice(&addr.ip().octets());
                    buf.put_u16(addr.port());
                }
                None => {
                    buf.put_slice(&[0; 18]);
                }
            }
            buf.put_u8(x.cid.len() as u8);
            buf.put_slice(&x.cid);
            buf.put_slice(&x.reset_token);
        }
        if self.active_connection_id_limit != 2 {
            write_varint_param(buf, 0x0e, self.active_connection_id_limit);
        }
        if let Some(ref x) = self.initial_src_cid {
            write_cid_param(buf, 0x0f, x);
        }
        if let Some(ref x) = self.retry_src_cid {
            write_cid_param(buf, 0x10, x);
        }
    }

    /// Parse the peer's parameters. `side` is *our* side; server-only parameters received by a
    /// server are malformed.
    pub fn read<B: Buf>(side: Side, buf: &mut B) -> Result<Self, Error> {
        let mut params = TransportParameters::default();
        // Duplicate detection; one bit per known id
        let mut seen = 0u32;
        while buf.has_remaining() {
            let id = buf.get_var()?;
            let len = buf.get_var()?;
            if len > buf.remaining() as u64 {
                return Err(Error::Malformed);
            }
            let len = len as usize;
            if id < 32 {
                if seen & 1 << id != 0 {
                    return Err(Error::Malformed);
                }
                seen |= 1 << id;
            }
            if side.is_server() && matches!(id, 0x00 | 0x02 | 0x0d | 0x10) {
                return Err(Error::Malformed);
            }
            match id {
                0x00 => params.original_dst_cid = Some(decode_cid(len, buf)?),
                0x01 => params.max_idle_timeout = decode_varint(len, buf)?,
                0x02 => {
                    if len != RESET_TOKEN_SIZE {
                        return Err(Error::Malformed);
                    }
                    let mut tok = [0; RESET_TOKEN_SIZE];
                    buf.copy_to_slice(&mut tok);
                    params.stateless_reset_token = Some(tok);
                }
                0x03 => {
                    params.max_udp_payload_size = decode_varint(len, buf)?;
                    if params.max_udp_payload_size < 1200 {
                        return Err(Error::IllegalValue);
                    }
                }
                0x04 => params.initial_max_data = decode_varint(len, buf)?,
                0x05 => params.initial_max_stream_data_bidi_local = decode_varint(len, buf)?,
                0x06 => params.initial_max_stream_data_bidi_remote = decode_varint(len, buf)?,
                0x07 => params.initial_max_stream_data_uni = decode_varint(len, buf)?,
                0x08 => {
                    params.initial_max_streams_bidi = decode_varint(len, buf)?;
                    if params.initial_max_streams_bidi > 1 << 60 {
                        return Err(Error::IllegalValue);
                    }
                }
                0x09 => {
                    params.initial_max_streams_uni = decode_varint(len, buf)?;
                    if params.initial_max_streams_uni > 1 << 60 {
                        return Err(Error::IllegalValue);
                    }
                }
                0x0a => {
                    let x = decode_varint(len, buf)?;
                    if x > 20 {
                        return Err(Error::IllegalValue);
                    }
                    params.ack_delay_exponent = x as u8;
                }
                0x0b => {
                    params.max_ack_delay = decode_varint(len, buf)?;
                    if params.max_ack_delay >= 1 << 14 {
                        return Err(Error::IllegalValue);
                    }
                }
                0x0c => {
                    if len != 0 {
                        return Err(Error::Malformed);
                    }
                    params.disable_active_migration = true;
                }
                0x0d => params.preferred_address = Some(decode_preferred_address(len, buf)?),
                0x0e => {
                    params.active_connection_id_limit = decode_varint(len, buf)?;
                    if params.active_connection_id_limit < 2 {
                        return Err(Error::IllegalValue);
                    }
                }
                0x0f => params.initial_src_cid = Some(decode_cid(len, buf)?),
                0x10 => params.retry_src_cid = Some(decode_cid(len, buf)?),
                _ => buf.advance(len),
            }
        }
        Ok(params)
    }
}

fn decode_varint<B: Buf>(len: usize, buf: &mut B) -> Result<u64, Error> {
    if len > 8 {
        return Err(Error::Malformed);
    }
    let before = buf.remaining();
    let x = buf.get_var()?;
    if before - buf.remaining() != len {
        return Err(Error::Malformed);
    }
    Ok(x)
}

fn decode_cid<B: Buf>(len: usize, buf: &mut B) -> Result<ConnectionId, Error> {
    if len > MAX_CID_SIZE || buf.remaining() < len {
        return Err(Error::Malformed);
    }
    let mut bytes = [0; MAX_CID_SIZE];
    buf.copy_to_slice(&mut bytes[..len]);
    Ok(ConnectionId::new(&bytes[..len]))
}

fn decode_preferred_address<B: Buf>(len: usize, buf: &mut B) -> Result<PreferredAddress, Error> {
    if len < 4 + 2 + 16 + 2 + 1 + RESET_TOKEN_SIZE {
        return Err(Error::Malformed);
    }
    let mut v4 = [0; 4];
    buf.copy_to_slice(&mut v4);
    let v4_port = buf.get::<u16>()?;
    let mut v6 = [0; 16];
    buf.copy_to_slice(&mut v6);
    let v6_port = buf.get::<u16>()?;
    let cid_len = buf.get::<u8>()? as usize;
    if cid_len > MAX_CID_SIZE || len != 4 + 2 + 16 + 2 + 1 + cid_len + RESET_TOKEN_SIZE {
        return Err(Error::Malformed);
    }
    let mut cid = [0; MAX_CID_SIZE];
    buf.copy_to_slice(&mut cid[..cid_len]);
    let mut reset_token = [0; RESET_TOKEN_SIZE];
    buf.copy_to_slice(&mut reset_token);
    let v4 = Ipv4Addr::from(v4);
    let v6 = Ipv6Addr::from(v6);
    Ok(PreferredAddress {
        address_v4: if v4.is_unspecified() && v4_port == 0 {
            None
        } else {
            Some(SocketAddrV4::new(v4, v4_port))
        },
        address_v6: if v6.is_unspecified() && v6_port == 0 {
            None
        } else {
            Some(SocketAddrV6::new(v6, v6_port, 0, 0))
        },
        cid: ConnectionId::new(&cid[..cid_len]),
        reset_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let params = TransportParameters {
            initial_max_data: 42,
            initial_max_stream_data_bidi_local: 10_000,
            initial_max_stream_data_bidi_remote: 10_000,
            initial_max_stream_data_uni: 5_000,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 3,
            max_idle_timeout: 30_000,
            ack_delay_exponent: 8,
            max_ack_delay: 50,
            disable_active_migration: true,
            active_connection_id_limit: 7,
            initial_src_cid: Some(ConnectionId::new(&[0xac; 8])),
            original_dst_cid: Some(ConnectionId::new(&[0x11; 8])),
            stateless_reset_token: Some([0xee; RESET_TOKEN_SIZE]),
            preferred_address: Some(PreferredAddress {
                address_v4: Some(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 4433)),
                address_v6: None,
                cid: ConnectionId::new(&[0x33; 4]),
                reset_token: [0x2a; RESET_TOKEN_SIZE],
            }),
            ..Default::default()
        };
        let mut buf = Vec::new();
        params.write(&mut buf);
        let read = TransportParameters::read(Side::Client, &mut std::io::Cursor::new(&buf[..]))
            .unwrap();
        assert_eq!(read, params);
    }

    #[test]
    fn unknown_parameters_skipped() {
        let mut buf = Vec::new();
        buf.write_var(0x7fff_1234); // grease
        buf.write_var(3);
        buf.put_slice(b"abc");
        buf.write_var(0x04);
        buf.write_var(1);
        buf.write_var(9);
        let read = TransportParameters::read(Side::Client, &mut std::io::Cursor::new(&buf[..]))
            .unwrap();
        assert_eq!(read.initial_max_data, 9);
    }

    #[test]
    fn duplicates_rejected() {
        let mut buf = Vec::new();
        write_varint_param(&mut buf, 0x04, 9);
        write_varint_param(&mut buf, 0x04, 9);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut std::io::Cursor::new(&buf[..])),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn server_only_params_rejected_by_server() {
        let mut buf = Vec::new();
        buf.write_var(0x02);
        buf.write_var(RESET_TOKEN_SIZE as u64);
        buf.put_slice(&[0; RESET_TOKEN_SIZE]);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut std::io::Cursor::new(&buf[..])),
            Err(Error::Malformed)
        );
        assert!(
            TransportParameters::read(Side::Client, &mut std::io::Cursor::new(&buf[..])).is_ok()
        );
    }

    #[test]
    fn illegal_values() {
        let mut buf = Vec::new();
        write_varint_param(&mut buf, 0x0a, 21);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut std::io::Cursor::new(&buf[..])),
            Err(Error::IllegalValue)
        );
        let mut buf = Vec::new();
        write_varint_param(&mut buf, 0x03, 1100);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut std::io::Cursor::new(&buf[..])),
            Err(Error::IllegalValue)
        );
    }
}
