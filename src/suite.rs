use std::collections::BTreeMap;

use bytes::Bytes;

use crate::assembler::Assembler;
use crate::coding::Codec;
use crate::crypto::{CryptoError, EncLevel, Keys, Secret, TlsEvent, TlsSession};
use crate::frame;
use crate::packet::ConnectionId;
use crate::spaces::AckHandle;
use crate::{Side, TransportError};

/// A CRYPTO stream fragment in flight, keyed under the packet that carried it
struct SentFragment {
    offset: u64,
    data: Bytes,
    handle: AckHandle,
}

/// Per-level secret slots plus CRYPTO stream plumbing
struct CryptoData {
    read_secret: Option<Secret>,
    write_secret: Option<Secret>,
    read_keys: Option<Keys>,
    write_keys: Option<Keys>,
    recv: Assembler,
    /// Handshake bytes queued by TLS for this level
    outbound: Vec<u8>,
    /// Cursor into `outbound` below which everything has been emitted at least once
    write_offset: u64,
    fragments: BTreeMap<u64, Vec<SentFragment>>,
}

impl CryptoData {
    fn new() -> Self {
        CryptoData {
            read_secret: None,
            write_secret: None,
            read_keys: None,
            write_keys: None,
            recv: Assembler::new(),
            outbound: Vec::new(),
            write_offset: 0,
            fragments: BTreeMap::new(),
        }
    }

    fn discard(&mut self) {
        *self = CryptoData::new();
    }

    fn has_pending(&self) -> bool {
        if (self.write_offset as usize) < self.outbound.len() {
            return true;
        }
        self.fragments
            .values()
            .flatten()
            .any(|frag| frag.handle.is_lost())
    }

    /// Emit new data, or retransmit lost fragments when the buffer is drained
    fn write_pending(
        &mut self,
        pn: u64,
        max_size: usize,
        buf: &mut Vec<u8>,
        waiters: &mut Vec<AckHandle>,
    ) {
        while (self.write_offset as usize) < self.outbound.len() {
            let room = match max_size.checked_sub(buf.len() + frame::Crypto::SIZE_BOUND) {
                Some(x) if x > 0 => x,
                _ => return,
            };
            let offset = self.write_offset;
            let end = self.outbound.len().min(offset as usize + room);
            let data = Bytes::copy_from_slice(&self.outbound[offset as usize..end]);
            self.write_offset = end as u64;
            let frame = frame::Crypto {
                offset,
                data: data.clone(),
            };
            frame.encode(buf);
            let handle = AckHandle::new();
            waiters.push(handle.clone());
            self.fragments
                .entry(pn)
                .or_insert_with(Vec::new)
                .push(SentFragment {
                    offset,
                    data,
                    handle,
                });
        }
        self.retransmit(pn, max_size, buf, waiters);
    }

    fn retransmit(
        &mut self,
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
                // Lost: re-emit what fits now, keep the remainder flagged for later
                let room = max_size
                    .checked_sub(buf.len() + frame::Crypto::SIZE_BOUND)
                    .unwrap_or(0);
                if room > 0 {
                    let take = frag.data.len().min(room);
                    let chunk = frag.data.split_to(take);
                    let frame = frame::Crypto {
                        offset: frag.offset,
                        data: chunk.clone(),
                    };
                    frame.encode(buf);
                    let handle = AckHandle::new();
                    waiters.push(handle.clone());
                    self.fragments
                        .entry(pn)
                        .or_insert_with(Vec::new)
                        .push(SentFragment {
                            offset: frag.offset,
                            data: chunk,
                            handle,
                        });
                    frag.offset += take as u64;
                }
                if !frag.data.is_empty() {
                    keep.push(frag);
                }
            }
            if !keep.is_empty() {
                let entry = self.fragments.entry(old_pn).or_insert_with(Vec::new);
                entry.extend(keep);
            }
        }
    }
}

/// Drives the TLS handshake and owns all packet-protection key state
///
/// Holds one read/write secret slot per encryption level, fragments outbound handshake data
/// into CRYPTO frames with retransmission, reassembles inbound CRYPTO data, and applies the
/// key-discard rules as the handshake advances.
pub struct CryptoSuite {
    pub tls: Box<dyn TlsSession>,
    side: Side,
    levels: [CryptoData; 4],
    /// TLS reported the handshake finished
    pub handshake_complete: bool,
    /// Client: HANDSHAKE_DONE received. Server: HANDSHAKE_DONE acknowledged.
    handshake_done: bool,
    done_handle: Option<AckHandle>,
    peer_params: Option<Vec<u8>>,
}

impl CryptoSuite {
    pub fn new(side: Side, tls: Box<dyn TlsSession>, initial_dst_cid: &ConnectionId) -> Self {
        let mut suite = CryptoSuite {
            tls,
            side,
            levels: [
                CryptoData::new(),
                CryptoData::new(),
                CryptoData::new(),
                CryptoData::new(),
            ],
            handshake_complete: false,
            handshake_done: false,
            done_handle: None,
            peer_params: None,
        };
        suite.rekey_initial(initial_dst_cid);
        suite
    }

    /// (Re)derive Initial secrets; also used after Retry changes the DCID
    pub fn rekey_initial(&mut self, dst_cid: &ConnectionId) {
        let level = &mut self.levels[EncLevel::Initial as usize];
        level.read_secret = Some(Secret::initial(dst_cid, self.side, false));
        level.write_secret = Some(Secret::initial(dst_cid, self.side, true));
        level.read_keys = None;
        level.write_keys = None;
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn has_read_keys(&self, level: EncLevel) -> bool {
        self.levels[level as usize].read_secret.is_some()
    }

    pub fn has_write_keys(&self, level: EncLevel) -> bool {
        self.levels[level as usize].write_secret.is_some()
    }

    pub fn read_keys(&mut self, level: EncLevel) -> Result<&Keys, CryptoError> {
        let data = &mut self.levels[level as usize];
        if data.read_keys.is_none() {
            let secret = data
                .read_secret
                .as_ref()
                .ok_or(CryptoError::KeysUnavailable)?;
            data.read_keys = Some(secret.keys()?);
        }
        Ok(data.read_keys.as_ref().unwrap())
    }

    pub fn write_keys(&mut self, level: EncLevel) -> Result<&Keys, CryptoError> {
        let data = &mut self.levels[level as usize];
        if data.write_keys.is_none() {
            let secret = data
                .write_secret
                .as_ref()
                .ok_or(CryptoError::KeysUnavailable)?;
            data.write_keys = Some(secret.keys()?);
        }
        Ok(data.write_keys.as_ref().unwrap())
    }

    /// A fresh derivation of the current-phase read keys, for retention across an update
    pub fn current_read_keys(&self) -> Result<Keys, CryptoError> {
        let data = &self.levels[EncLevel::OneRtt as usize];
        let secret = data
            .read_secret
            .as_ref()
            .ok_or(CryptoError::KeysUnavailable)?;
        secret.keys()
    }

    /// Derive the read keys for the next key phase without committing to them
    pub fn next_read_keys(&self) -> Result<Keys, CryptoError> {
        let data = &self.levels[EncLevel::OneRtt as usize];
        let secret = data
            .read_secret
            .as_ref()
            .ok_or(CryptoError::KeysUnavailable)?;
        secret.update().keys()
    }

    /// Rotate both 1-RTT secrets after a key update is confirmed
    pub fn commit_key_update(&mut self) {
        let data = &mut self.levels[EncLevel::OneRtt as usize];
        if let Some(read) = data.read_secret.take() {
            data.read_secret = Some(read.update());
        }
        if let Some(write) = data.write_secret.take() {
            data.write_secret = Some(write.update());
        }
        data.read_keys = None;
        data.write_keys = None;
    }

    /// Feed a received CRYPTO frame, pass in-order bytes to TLS, and pump the handshake
    pub fn handle_crypto(
        &mut self,
        level: EncLevel,
        frame: &frame::Crypto,
    ) -> Result<(), TransportError> {
        {
            let data = &mut self.levels[level as usize];
            let end = frame.offset + frame.data.len() as u64;
            if end <= data.recv.offset() {
                // Wholly duplicated
                return Ok(());
            }
            data.recv.insert(frame.offset, frame.data.clone());
            while let Some(chunk) = data.recv.read_chunk() {
                self.tls.provide_data(level, &chunk);
            }
        }
        self.pump()
    }

    /// Run TLS forward and absorb everything it produced
    pub fn pump(&mut self) -> Result<(), TransportError> {
        self.tls.progress();
        while let Some(event) = self.tls.poll_event() {
            match event {
                TlsEvent::HandshakeData { level, data } => {
                    self.levels[level as usize].outbound.extend_from_slice(&data);
                }
                TlsEvent::ReadSecret { level, secret } => {
                    let data = &mut self.levels[level as usize];
                    data.read_secret = Some(secret);
                    data.read_keys = None;
                }
                TlsEvent::WriteSecret { level, secret } => {
                    let data = &mut self.levels[level as usize];
                    data.write_secret = Some(secret);
                    data.write_keys = None;
                }
                TlsEvent::TransportParameters(bytes) => {
                    self.peer_params = Some(bytes);
                }
                TlsEvent::HandshakeComplete => {
                    self.handshake_complete = true;
                }
                TlsEvent::Alert(code) => {
                    return Err(TransportError::crypto(code));
                }
            }
        }
        Ok(())
    }

    /// The peer's raw transport parameters, once TLS has surfaced them
    pub fn take_peer_params(&mut self) -> Option<Vec<u8>> {
        self.peer_params.take()
    }

    pub fn has_pending(&self, level: EncLevel) -> bool {
        if self.levels[level as usize].has_pending() {
            return true;
        }
        level == EncLevel::OneRtt && self.handshake_done_pending()
    }

    fn handshake_done_pending(&self) -> bool {
        self.side.is_server()
            && self.handshake_complete
            && !self.handshake_done
            && self
                .done_handle
                .as_ref()
                .map_or(true, |h| h.is_lost())
    }

    /// Write CRYPTO (and, for a server, HANDSHAKE_DONE) frames for `level` into `buf`
    pub fn write_pending(
        &mut self,
        level: EncLevel,
        pn: u64,
        max_size: usize,
        buf: &mut Vec<u8>,
        waiters: &mut Vec<AckHandle>,
    ) {
        if level == EncLevel::OneRtt && self.side.is_server() && self.handshake_complete {
            if self.done_handle.as_ref().map_or(false, |h| h.is_acked()) {
                self.handshake_done = true;
                self.done_handle = None;
            }
            if self.handshake_done_pending() && buf.len() < max_size {
                frame::Type::HANDSHAKE_DONE.encode(buf);
                let handle = match self.done_handle {
                    Some(ref h) => {
                        h.rearm();
                        h.clone()
                    }
                    None => {
                        let h = AckHandle::new();
                        self.done_handle = Some(h.clone());
                        h
                    }
                };
                waiters.push(handle);
            }
        }
        self.levels[level as usize].write_pending(pn, max_size, buf, waiters);
    }

    /// Client-side HANDSHAKE_DONE receipt; a server receiving one is a protocol violation
    pub fn handle_handshake_done(&mut self) -> Result<(), TransportError> {
        if self.side.is_server() {
            return Err(TransportError::PROTOCOL_VIOLATION
                .reason("HANDSHAKE_DONE sent by client")
                .frame(frame::Type::HANDSHAKE_DONE));
        }
        self.handshake_done = true;
        Ok(())
    }

    /// Handshake confirmation is asymmetric (RFC 9001 §4.1.2)
    pub fn handshake_confirmed(&self) -> bool {
        if self.side.is_server() {
            self.handshake_complete
        } else {
            self.handshake_done
        }
    }

    /// Drop Initial keys: clients on first Handshake send, servers on first Handshake receipt.
    /// Refuses until both Handshake secrets are installed, so a stray early trigger can't
    /// strand the connection without usable keys.
    pub fn discard_initial(&mut self) -> bool {
        let installed = self.levels[EncLevel::Initial as usize].read_secret.is_some()
            || self.levels[EncLevel::Initial as usize].write_secret.is_some();
        if !installed {
            return false;
        }
        let handshake = &self.levels[EncLevel::Handshake as usize];
        if handshake.read_secret.is_none() || handshake.write_secret.is_none() {
            return false;
        }
        self.levels[EncLevel::Initial as usize].discard();
        true
    }

    /// Drop Handshake keys once the handshake is confirmed
    pub fn maybe_discard_handshake(&mut self) -> bool {
        let confirmed = self.handshake_confirmed();
        let data = &mut self.levels[EncLevel::Handshake as usize];
        if confirmed
            && (data.read_secret.is_some() || data.write_secret.is_some())
        {
            data.discard();
            return true;
        }
        false
    }

    pub fn is_handshaking(&self) -> bool {
        !self.handshake_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Cipher;
    use std::collections::VecDeque;

    /// Scripted stand-in for a TLS stack: completes once `need` handshake bytes arrive,
    /// then exports Handshake and 1-RTT secrets and queues a response flight.
    struct FakeTls {
        need: usize,
        received: usize,
        handshaking: bool,
        events: VecDeque<TlsEvent>,
    }

    impl FakeTls {
        fn new(need: usize) -> Self {
            FakeTls {
                need,
                received: 0,
                handshaking: true,
                events: VecDeque::new(),
            }
        }
    }

    fn secret(seed: u8) -> Secret {
        Secret::new(Cipher::Aes128Gcm, &[seed; 32])
    }

    impl TlsSession for FakeTls {
        fn provide_data(&mut self, _level: EncLevel, data: &[u8]) {
            self.received += data.len();
        }

        fn progress(&mut self) {
            if self.handshaking && self.received >= self.need {
                self.handshaking = false;
                self.events.push_back(TlsEvent::ReadSecret {
                    level: EncLevel::Handshake,
                    secret: secret(1),
                });
                self.events.push_back(TlsEvent::WriteSecret {
                    level: EncLevel::Handshake,
                    secret: secret(2),
                });
                self.events.push_back(TlsEvent::HandshakeData {
                    level: EncLevel::Handshake,
                    data: b"finished".to_vec(),
                });
                self.events.push_back(TlsEvent::TransportParameters(vec![0x04, 0x01, 0x09]));
                self.events.push_back(TlsEvent::ReadSecret {
                    level: EncLevel::OneRtt,
                    secret: secret(3),
                });
                self.events.push_back(TlsEvent::WriteSecret {
                    level: EncLevel::OneRtt,
                    secret: secret(4),
                });
                self.events.push_back(TlsEvent::HandshakeComplete);
            }
        }

        fn poll_event(&mut self) -> Option<TlsEvent> {
            self.events.pop_front()
        }

        fn is_handshaking(&self) -> bool {
            self.handshaking
        }
    }

    fn client_suite(need: usize) -> CryptoSuite {
        CryptoSuite::new(
            Side::Client,
            Box::new(FakeTls::new(need)),
            &ConnectionId::new(&[0x42; 8]),
        )
    }

    #[test]
    fn handshake_completion_across_fragments() {
        let mut suite = client_suite(1850);
        // Server flight split across two CRYPTO frames, delivered out of order
        let late = frame::Crypto {
            offset: 1200,
            data: Bytes::from(vec![0; 650]),
        };
        suite.handle_crypto(EncLevel::Handshake, &late).unwrap();
        assert!(!suite.handshake_complete);
        let early = frame::Crypto {
            offset: 0,
            data: Bytes::from(vec![0; 1200]),
        };
        suite.handle_crypto(EncLevel::Handshake, &early).unwrap();
        assert!(suite.handshake_complete);
        assert!(suite.has_read_keys(EncLevel::OneRtt));
        assert!(suite.has_write_keys(EncLevel::OneRtt));
        // Client is not confirmed until HANDSHAKE_DONE
        assert!(!suite.handshake_confirmed());
        assert!(!suite.maybe_discard_handshake());
        suite.handle_handshake_done().unwrap();
        assert!(suite.handshake_confirmed());
        assert!(suite.maybe_discard_handshake());
        assert!(!suite.has_read_keys(EncLevel::Handshake));
    }

    #[test]
    fn duplicate_crypto_tolerated() {
        let mut suite = client_suite(100);
        let frame = frame::Crypto {
            offset: 0,
            data: Bytes::from(vec![0; 100]),
        };
        suite.handle_crypto(EncLevel::Initial, &frame).unwrap();
        assert!(suite.handshake_complete);
        // Replay of consumed data is a no-op
        suite.handle_crypto(EncLevel::Initial, &frame).unwrap();
    }

    #[test]
    fn crypto_send_and_retransmit() {
        let mut suite = client_suite(usize::max_value());
        suite.levels[EncLevel::Initial as usize]
            .outbound
            .extend_from_slice(&[0x5a; 300]);
        let mut buf = Vec::new();
        let mut waiters = Vec::new();
        suite.write_pending(EncLevel::Initial, 0, 200, &mut buf, &mut waiters);
        assert_eq!(waiters.len(), 1);
        assert!(!buf.is_empty());
        // Remaining bytes go out under the next packet
        let mut buf2 = Vec::new();
        suite.write_pending(EncLevel::Initial, 1, 1200, &mut buf2, &mut waiters);
        assert_eq!(waiters.len(), 2);
        assert!(!suite.has_pending(EncLevel::Initial));

        // First packet lost: content is re-emitted under a new packet number
        waiters[0].mark_lost();
        assert!(suite.has_pending(EncLevel::Initial));
        let mut buf3 = Vec::new();
        let mut waiters2 = Vec::new();
        suite.write_pending(EncLevel::Initial, 2, 1200, &mut buf3, &mut waiters2);
        assert_eq!(waiters2.len(), 1);
        assert!(!buf3.is_empty());
        // Acked content is forgotten
        waiters[1].mark_acked();
        waiters2[0].mark_acked();
        let mut buf4 = Vec::new();
        let mut waiters3 = Vec::new();
        suite.write_pending(EncLevel::Initial, 3, 1200, &mut buf4, &mut waiters3);
        assert!(buf4.is_empty());
        assert!(waiters3.is_empty());
    }

    #[test]
    fn server_emits_handshake_done_until_acked() {
        let mut suite = CryptoSuite::new(
            Side::Server,
            Box::new(FakeTls::new(0)),
            &ConnectionId::new(&[0x42; 8]),
        );
        suite.pump().unwrap();
        assert!(suite.handshake_complete);
        assert!(suite.handshake_confirmed()); // server side confirms on completion

        let mut buf = Vec::new();
        let mut waiters = Vec::new();
        suite.write_pending(EncLevel::OneRtt, 0, 1200, &mut buf, &mut waiters);
        assert_eq!(buf, vec![0x1e]);
        assert_eq!(waiters.len(), 1);
        // Not re-sent while in flight
        let mut buf2 = Vec::new();
        suite.write_pending(EncLevel::OneRtt, 1, 1200, &mut buf2, &mut waiters);
        assert!(buf2.is_empty());
        // Lost: emitted again
        waiters[0].mark_lost();
        let mut buf3 = Vec::new();
        suite.write_pending(EncLevel::OneRtt, 2, 1200, &mut buf3, &mut waiters);
        assert_eq!(buf3, vec![0x1e]);
        // Acked: finished for good
        waiters[0].mark_acked();
        let mut buf4 = Vec::new();
        suite.write_pending(EncLevel::OneRtt, 3, 1200, &mut buf4, &mut waiters);
        assert!(buf4.is_empty());
        assert!(!suite.handshake_done_pending());
    }

    #[test]
    fn initial_keys_held_until_handshake_keys_installed() {
        // TLS never progresses, so no Handshake secrets exist yet
        let mut suite = client_suite(usize::max_value());
        assert!(suite.has_read_keys(EncLevel::Initial));
        assert!(!suite.discard_initial());
        assert!(suite.has_read_keys(EncLevel::Initial));
        assert!(suite.has_write_keys(EncLevel::Initial));
        // A lone read secret is not enough
        suite.levels[EncLevel::Handshake as usize].read_secret = Some(secret(1));
        assert!(!suite.discard_initial());
        assert!(suite.has_read_keys(EncLevel::Initial));
        // Both installed: the drop goes through, exactly once
        suite.levels[EncLevel::Handshake as usize].write_secret = Some(secret(2));
        assert!(suite.discard_initial());
        assert!(!suite.has_read_keys(EncLevel::Initial));
        assert!(!suite.has_write_keys(EncLevel::Initial));
        assert!(!suite.discard_initial());
    }

    #[test]
    fn client_may_not_send_handshake_done() {
        let mut suite = CryptoSuite::new(
            Side::Server,
            Box::new(FakeTls::new(0)),
            &ConnectionId::new(&[0x42; 8]),
        );
        assert!(suite.handle_handshake_done().is_err());
    }
}
