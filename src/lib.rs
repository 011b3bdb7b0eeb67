//! Low-level protocol logic for the QUIC transport protocol
//!
//! This crate contains no networking code and does not get any relevant timestamps from the
//! operating system. Most users may want to use the futures-based API of a higher-level crate
//! instead; this API is for embedding the protocol state machine under an external event loop.
//!
//! The `Endpoint` type routes datagrams to `Connection`s, which drive the actual protocol. All
//! I/O is surfaced as `Io` operations for the caller to execute, and all time is an absolute
//! microsecond count supplied by the caller.

#[macro_use]
extern crate failure;
#[macro_use]
extern crate slog;
#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
#[macro_use]
extern crate hex_literal;

use std::fmt;
use std::ops;

mod assembler;
mod cid;
mod coding;
mod congestion;
mod connection;
mod crypto;
mod endpoint;
mod frame;
mod packet;
mod range_set;
mod spaces;
mod stream;
mod suite;
mod transport_parameters;

pub use crate::cid::{LocalCids, RemoteCids};
pub use crate::congestion::{Controller, NewReno};
pub use crate::connection::{ClosedConnection, Connection, ConnectionError, ConnectionHandle};
pub use crate::crypto::{Cipher, CryptoError, EncLevel, Secret, TlsEvent, TlsSession};
pub use crate::endpoint::{
    Config, Endpoint, EndpointError, Event, Io, ListenKeys, SessionFactory, Timer, TokenValidator,
};
pub use crate::frame::{Frame, Type as FrameType};
pub use crate::packet::ConnectionId;
pub use crate::spaces::{AckHandle, SpaceId};
pub use crate::stream::{ReadError, WriteError};
pub use crate::transport_parameters::TransportParameters;

/// The QUIC protocol version implemented
pub const VERSION: u32 = 0x0000_0001;

/// Smallest datagram a client may send to initiate a connection, and the floor for path MTU
pub const MIN_INITIAL_SIZE: usize = 1200;
/// Assumed UDP payload capacity before the peer's limit is known
pub const MIN_MTU: u16 = 1200;
/// Largest legal connection ID
pub const MAX_CID_SIZE: usize = 20;
/// Length of a stateless reset token
pub const RESET_TOKEN_SIZE: usize = 16;
/// Length of an AEAD authentication tag for every QUIC v1 suite
pub const AEAD_TAG_SIZE: usize = 16;
/// Timer granularity (μs), the floor for loss and probe timeouts
pub const TIMER_GRANULARITY: u64 = 1_000;
/// Largest value representable as a variable-length integer
pub const MAX_VAR_INT: u64 = (1 << 62) - 1;

/// Whether an endpoint initiated a connection or accepted it
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Whether a stream carries data in one direction or both
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Directionality {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl fmt::Display for Directionality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Directionality::Bi => "bidirectional",
            Directionality::Uni => "unidirectional",
        };
        f.write_str(s)
    }
}

/// Identifier for a stream within a particular connection
///
/// The low two bits encode the initiator and directionality; the remainder is a 62-bit index
/// allocated sequentially within each of the four (initiator, directionality) classes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        write!(
            f,
            "{} {} stream {}",
            initiator,
            self.directionality(),
            self.index()
        )
    }
}

impl StreamId {
    pub fn new(initiator: Side, directionality: Directionality, index: u64) -> Self {
        StreamId(index << 2 | (directionality as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn directionality(self) -> Directionality {
        if self.0 & 0x2 == 0 {
            Directionality::Bi
        } else {
            Directionality::Uni
        }
    }

    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<StreamId> {
        Ok(StreamId(coding::read_var(buf)?))
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        coding::write_var(buf, self.0);
    }
}

/// Transport-level errors from RFC 9000 §20, plus the TLS alert range
///
/// Carries the offending frame type when one is known, for CONNECTION_CLOSE emission.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransportError {
    pub code: TransportErrorCode,
    /// Frame type that triggered the error, if any
    pub frame: Option<frame::Type>,
    pub reason: &'static str,
}

impl TransportError {
    pub fn crypto(alert: u8) -> Self {
        TransportError {
            code: TransportErrorCode(0x100 | u64::from(alert)),
            frame: None,
            reason: "TLS alert",
        }
    }

    pub fn reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }

    pub fn frame(mut self, ty: frame::Type) -> Self {
        self.frame = Some(ty);
        self
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl failure::Fail for TransportError {}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransportErrorCode(pub u64);

macro_rules! transport_errors {
    {$($name:ident($val:expr);)*} => {
        impl TransportErrorCode {
            $(pub const $name: TransportErrorCode = TransportErrorCode($val);)*
        }

        impl TransportError {
            $(
                #[allow(non_upper_case_globals)]
                pub const $name: TransportError = TransportError {
                    code: TransportErrorCode($val),
                    frame: None,
                    reason: "",
                };
            )*
        }

        impl fmt::Display for TransportErrorCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if (0x100..0x200).contains(&x) => {
                        write!(f, "CRYPTO_ERROR (TLS alert {})", x - 0x100)
                    }
                    x => write!(f, "<unknown transport error 0x{:x}>", x),
                }
            }
        }
    }
}

transport_errors! {
    NO_ERROR(0x0);
    INTERNAL_ERROR(0x1);
    CONNECTION_REFUSED(0x2);
    FLOW_CONTROL_ERROR(0x3);
    STREAM_LIMIT_ERROR(0x4);
    STREAM_STATE_ERROR(0x5);
    FINAL_SIZE_ERROR(0x6);
    FRAME_ENCODING_ERROR(0x7);
    TRANSPORT_PARAMETER_ERROR(0x8);
    CONNECTION_ID_LIMIT_ERROR(0x9);
    PROTOCOL_VIOLATION(0xa);
    INVALID_TOKEN(0xb);
    APPLICATION_ERROR(0xc);
    CRYPTO_BUFFER_EXCEEDED(0xd);
    KEY_UPDATE_ERROR(0xe);
    AEAD_LIMIT_REACHED(0xf);
    NO_VIABLE_PATH(0x10);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_encoding() {
        let id = StreamId::new(Side::Server, Directionality::Uni, 7);
        assert_eq!(id.0, 7 << 2 | 0x2 | 0x1);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.directionality(), Directionality::Uni);
        assert_eq!(id.index(), 7);
        let id = StreamId::new(Side::Client, Directionality::Bi, 0);
        assert_eq!(id.0, 0);
    }

    #[test]
    fn error_code_display() {
        assert_eq!(
            format!("{}", TransportError::FLOW_CONTROL_ERROR),
            "FLOW_CONTROL_ERROR"
        );
        assert_eq!(
            format!("{}", TransportError::crypto(80)),
            "CRYPTO_ERROR (TLS alert 80): TLS alert"
        );
    }
}
