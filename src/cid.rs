use std::collections::BTreeMap;

use rand::RngCore;
use ring::hmac;

use crate::coding::Codec;
use crate::crypto::reset_token_for;
use crate::frame;
use crate::packet::ConnectionId;
use crate::spaces::AckHandle;
use crate::{TransportError, RESET_TOKEN_SIZE};

struct IssuedCid {
    cid: ConnectionId,
    token: [u8; RESET_TOKEN_SIZE],
    /// None until announced; rearmed and resent when the carrying packet is lost
    handle: Option<AckHandle>,
    /// Sequence 0 travels in the handshake and is never announced
    announce: bool,
}

/// Connection IDs we issued for the peer to address us by
///
/// Every entry is mirrored into the endpoint's routing table; `issued`/`retired` event queues
/// carry the deltas out to it when the connection is next driven.
pub struct LocalCids {
    cid_len: usize,
    next_seq: u64,
    /// Peer's active_connection_id_limit
    limit: u64,
    active: BTreeMap<u64, IssuedCid>,
    pub issued: Vec<(ConnectionId, [u8; RESET_TOKEN_SIZE])>,
    pub retired: Vec<ConnectionId>,
}

impl LocalCids {
    pub fn new(cid_len: usize, initial: ConnectionId, token: [u8; RESET_TOKEN_SIZE]) -> Self {
        let mut active = BTreeMap::new();
        active.insert(
            0,
            IssuedCid {
                cid: initial,
                token,
                handle: None,
                announce: false,
            },
        );
        LocalCids {
            cid_len,
            next_seq: 1,
            limit: 2,
            active,
            issued: Vec::new(),
            retired: Vec::new(),
        }
    }

    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    pub fn cid_len(&self) -> usize {
        self.cid_len
    }

    /// Issue fresh CIDs until the peer's limit is reached
    pub fn replenish<R: RngCore>(&mut self, rng: &mut R, reset_key: Option<&hmac::Key>) {
        if self.cid_len == 0 {
            return;
        }
        while (self.active.len() as u64) < self.limit {
            let cid = ConnectionId::random(rng, self.cid_len);
            let token = match reset_key {
                Some(key) => reset_token_for(key, &cid),
                None => {
                    let mut t = [0; RESET_TOKEN_SIZE];
                    rng.fill_bytes(&mut t);
                    t
                }
            };
            let seq = self.next_seq;
            self.next_seq += 1;
            self.active.insert(
                seq,
                IssuedCid {
                    cid,
                    token,
                    handle: None,
                    announce: true,
                },
            );
            self.issued.push((cid, token));
        }
    }

    /// Handle RETIRE_CONNECTION_ID; `rx_dcid` is the CID the carrying packet was addressed to
    pub fn on_retire(
        &mut self,
        sequence: u64,
        rx_dcid: &ConnectionId,
    ) -> Result<(), TransportError> {
        if sequence >= self.next_seq {
            return Err(TransportError::PROTOCOL_VIOLATION
                .reason("retirement of an unissued connection id")
                .frame(frame::Type::RETIRE_CONNECTION_ID));
        }
        if let Some(entry) = self.active.remove(&sequence) {
            if entry.cid == *rx_dcid {
                self.active.insert(sequence, entry);
                return Err(TransportError::PROTOCOL_VIOLATION
                    .reason("RETIRE_CONNECTION_ID for the packet's own cid")
                    .frame(frame::Type::RETIRE_CONNECTION_ID));
            }
            self.retired.push(entry.cid);
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.active.values().any(|entry| {
            entry.announce
                && entry
                    .handle
                    .as_ref()
                    .map_or(true, |h| h.is_lost())
        })
    }

    /// Emit NEW_CONNECTION_ID frames for unannounced or lost entries
    pub fn write_pending(
        &mut self,
        max_size: usize,
        buf: &mut Vec<u8>,
        waiters: &mut Vec<AckHandle>,
    ) {
        const BOUND: usize = 1 + 8 + 8 + 1 + 20 + RESET_TOKEN_SIZE;
        for (&seq, entry) in self.active.iter_mut() {
            if !entry.announce {
                continue;
            }
            let due = entry.handle.as_ref().map_or(true, |h| h.is_lost());
            if !due || buf.len() + BOUND > max_size {
                continue;
            }
            frame::NewConnectionId {
                sequence: seq,
                retire_prior_to: 0,
                id: entry.cid,
                reset_token: entry.token,
            }
            .encode(buf);
            let handle = match entry.handle {
                Some(ref h) => {
                    h.rearm();
                    h.clone()
                }
                None => {
                    let h = AckHandle::new();
                    entry.handle = Some(h.clone());
                    h
                }
            };
            waiters.push(handle);
        }
    }

    /// The CID we stamp as source on long headers: the lowest live sequence
    pub fn current(&self) -> ConnectionId {
        self.active
            .values()
            .next()
            .map(|entry| entry.cid)
            .unwrap_or_else(|| ConnectionId::new(&[]))
    }

    /// All live CIDs, e.g. for teardown bookkeeping
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionId> {
        self.active.values().map(|entry| &entry.cid)
    }
}

/// Connection IDs the peer told us to address it by
pub struct RemoteCids {
    entries: BTreeMap<u64, (ConnectionId, Option<[u8; RESET_TOKEN_SIZE]>)>,
    /// Our advertised active_connection_id_limit
    limit: u64,
    retire_prior_to: u64,
    /// Sequence we currently stamp on outgoing short headers
    current: u64,
    /// RETIRE_CONNECTION_ID frames owed, with retransmit handles
    pending_retire: Vec<(u64, Option<AckHandle>)>,
}

impl RemoteCids {
    /// `initial` is the peer's handshake SCID, sequence 0
    pub fn new(initial: ConnectionId, limit: u64) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(0, (initial, None));
        RemoteCids {
            entries,
            limit,
            retire_prior_to: 0,
            current: 0,
            pending_retire: Vec::new(),
        }
    }

    /// Replace sequence 0 before the handshake completes (Retry, server SCID update)
    pub fn replace_initial(&mut self, cid: ConnectionId) {
        self.entries.insert(0, (cid, None));
    }

    /// Reset token for sequence 0, learned from transport parameters
    pub fn set_initial_token(&mut self, token: [u8; RESET_TOKEN_SIZE]) {
        if let Some(entry) = self.entries.get_mut(&0) {
            entry.1 = Some(token);
        }
    }

    /// The CID to put in outgoing packet headers
    pub fn pick(&self) -> ConnectionId {
        if let Some((cid, _)) = self.entries.get(&self.current) {
            return *cid;
        }
        self.entries
            .values()
            .next()
            .expect("no remote connection id available")
            .0
    }

    /// Whether `token` matches any known stateless reset token
    pub fn is_reset_token(&self, token: &[u8]) -> bool {
        self.entries.values().any(|(_, t)| match t {
            Some(t) => constant_time_eq::constant_time_eq(t, token),
            None => false,
        })
    }

    pub fn on_new_cid(
        &mut self,
        frame: &frame::NewConnectionId,
        peer_cid_is_empty: bool,
    ) -> Result<(), TransportError> {
        if peer_cid_is_empty {
            return Err(TransportError::PROTOCOL_VIOLATION
                .reason("NEW_CONNECTION_ID from a zero-length cid peer")
                .frame(frame::Type::NEW_CONNECTION_ID));
        }
        if frame.id.is_empty() {
            return Err(TransportError::FRAME_ENCODING_ERROR
                .reason("zero-length cid in NEW_CONNECTION_ID")
                .frame(frame::Type::NEW_CONNECTION_ID));
        }
        if frame.retire_prior_to > frame.sequence {
            return Err(TransportError::FRAME_ENCODING_ERROR
                .reason("retire_prior_to exceeds sequence")
                .frame(frame::Type::NEW_CONNECTION_ID));
        }
        if let Some((existing, _)) = self.entries.get(&frame.sequence) {
            if *existing != frame.id {
                return Err(TransportError::PROTOCOL_VIOLATION
                    .reason("NEW_CONNECTION_ID sequence reused for a different cid")
                    .frame(frame::Type::NEW_CONNECTION_ID));
            }
        }
        // Retire everything below the new floor
        if frame.retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = frame.retire_prior_to;
            let retire: Vec<u64> = self
                .entries
                .range(..frame.retire_prior_to)
                .map(|(&seq, _)| seq)
                .collect();
            for seq in retire {
                self.entries.remove(&seq);
                self.pending_retire.push((seq, None));
            }
        }
        if frame.sequence < self.retire_prior_to {
            // Already retired by a prior update
            self.pending_retire.push((frame.sequence, None));
            return Ok(());
        }
        self.entries
            .insert(frame.sequence, (frame.id, Some(frame.reset_token)));
        if self.entries.len() as u64 > self.limit {
            return Err(TransportError::CONNECTION_ID_LIMIT_ERROR
                .reason("peer exceeded our active_connection_id_limit")
                .frame(frame::Type::NEW_CONNECTION_ID));
        }
        if self.current < self.retire_prior_to {
            self.current = *self.entries.keys().next().expect("entries nonempty");
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.pending_retire
            .iter()
            .any(|(_, h)| h.as_ref().map_or(true, |h| h.is_lost()))
    }

    pub fn write_pending(
        &mut self,
        max_size: usize,
        buf: &mut Vec<u8>,
        waiters: &mut Vec<AckHandle>,
    ) {
        for (seq, slot) in self.pending_retire.iter_mut() {
            let due = slot.as_ref().map_or(true, |h| h.is_lost());
            if !due || buf.len() + 9 > max_size {
                continue;
            }
            frame::Type::RETIRE_CONNECTION_ID.encode(buf);
            crate::coding::write_var(buf, *seq);
            let handle = match slot {
                Some(h) => {
                    h.rearm();
                    h.clone()
                }
                None => {
                    let h = AckHandle::new();
                    *slot = Some(h.clone());
                    h
                }
            };
            waiters.push(handle);
        }
        // Acked retirements are settled
        self.pending_retire
            .retain(|(_, h)| !h.as_ref().map_or(false, |h| h.is_acked()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn issue_up_to_limit_and_replace_retired() {
        let initial = ConnectionId::new(&[1; 8]);
        let mut local = LocalCids::new(8, initial, [0; RESET_TOKEN_SIZE]);
        local.set_limit(4);
        local.replenish(&mut thread_rng(), None);
        assert_eq!(local.active.len(), 4);
        assert_eq!(local.issued.len(), 3);
        // Peer retires sequence 1 (not the one it's sending to)
        let rx_dcid = initial;
        local.on_retire(1, &rx_dcid).unwrap();
        assert_eq!(local.retired.len(), 1);
        local.replenish(&mut thread_rng(), None);
        assert_eq!(local.active.len(), 4);
        // Sequence numbers strictly increase
        assert_eq!(local.next_seq, 5);
    }

    #[test]
    fn retire_own_cid_rejected() {
        let initial = ConnectionId::new(&[1; 8]);
        let mut local = LocalCids::new(8, initial, [0; RESET_TOKEN_SIZE]);
        let err = local.on_retire(0, &initial).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::PROTOCOL_VIOLATION);
        // Unissued sequence
        let err = local.on_retire(9, &ConnectionId::new(&[2; 8])).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::PROTOCOL_VIOLATION);
    }

    #[test]
    fn announce_and_retransmit() {
        let mut local = LocalCids::new(8, ConnectionId::new(&[1; 8]), [0; RESET_TOKEN_SIZE]);
        local.set_limit(2);
        local.replenish(&mut thread_rng(), None);
        assert!(local.has_pending());
        let mut buf = Vec::new();
        let mut waiters = Vec::new();
        local.write_pending(1200, &mut buf, &mut waiters);
        assert_eq!(waiters.len(), 1);
        assert!(!local.has_pending());
        waiters[0].mark_lost();
        assert!(local.has_pending());
        let mut buf2 = Vec::new();
        local.write_pending(1200, &mut buf2, &mut waiters);
        assert!(!buf2.is_empty());
        waiters[1].mark_acked();
        assert!(!local.has_pending());
    }

    #[test]
    fn acceptor_retires_below_floor() {
        let mut remote = RemoteCids::new(ConnectionId::new(&[9; 8]), 4);
        for seq in 1..4 {
            remote
                .on_new_cid(
                    &frame::NewConnectionId {
                        sequence: seq,
                        retire_prior_to: 0,
                        id: ConnectionId::new(&[seq as u8; 8]),
                        reset_token: [seq as u8; RESET_TOKEN_SIZE],
                    },
                    false,
                )
                .unwrap();
        }
        assert_eq!(remote.pick(), ConnectionId::new(&[9; 8]));
        // Floor moves to 2: sequences 0 and 1 retire, pick advances
        remote
            .on_new_cid(
                &frame::NewConnectionId {
                    sequence: 4,
                    retire_prior_to: 2,
                    id: ConnectionId::new(&[4; 8]),
                    reset_token: [4; RESET_TOKEN_SIZE],
                },
                false,
            )
            .unwrap();
        assert_eq!(remote.pick(), ConnectionId::new(&[2; 8]));
        assert!(remote.has_pending());
        let mut buf = Vec::new();
        let mut waiters = Vec::new();
        remote.write_pending(1200, &mut buf, &mut waiters);
        assert_eq!(waiters.len(), 2);
    }

    #[test]
    fn acceptor_limit_enforced() {
        let mut remote = RemoteCids::new(ConnectionId::new(&[9; 8]), 2);
        remote
            .on_new_cid(
                &frame::NewConnectionId {
                    sequence: 1,
                    retire_prior_to: 0,
                    id: ConnectionId::new(&[1; 8]),
                    reset_token: [1; RESET_TOKEN_SIZE],
                },
                false,
            )
            .unwrap();
        let err = remote
            .on_new_cid(
                &frame::NewConnectionId {
                    sequence: 2,
                    retire_prior_to: 0,
                    id: ConnectionId::new(&[2; 8]),
                    reset_token: [2; RESET_TOKEN_SIZE],
                },
                false,
            )
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::CONNECTION_ID_LIMIT_ERROR);
    }

    #[test]
    fn duplicate_sequence_must_match() {
        let mut remote = RemoteCids::new(ConnectionId::new(&[9; 8]), 4);
        let frame_a = frame::NewConnectionId {
            sequence: 1,
            retire_prior_to: 0,
            id: ConnectionId::new(&[1; 8]),
            reset_token: [1; RESET_TOKEN_SIZE],
        };
        remote.on_new_cid(&frame_a, false).unwrap();
        remote.on_new_cid(&frame_a, false).unwrap();
        let frame_b = frame::NewConnectionId {
            id: ConnectionId::new(&[7; 8]),
            ..frame_a
        };
        let err = remote.on_new_cid(&frame_b, false).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::PROTOCOL_VIOLATION);
    }

    #[test]
    fn reset_token_lookup() {
        let mut remote = RemoteCids::new(ConnectionId::new(&[9; 8]), 4);
        assert!(!remote.is_reset_token(&[0x5a; RESET_TOKEN_SIZE]));
        remote.set_initial_token([0x5a; RESET_TOKEN_SIZE]);
        assert!(remote.is_reset_token(&[0x5a; RESET_TOKEN_SIZE]));
    }
}
