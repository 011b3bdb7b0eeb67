use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::range_set::RangeSet;
use crate::{StreamId, TIMER_GRANULARITY};

/// Default RTT before any sample is taken (RFC 9002 §6.2.2), μs
pub const INITIAL_RTT: u64 = 333_000;

/// Packet threshold for reordering-based loss detection
pub const PACKET_THRESHOLD: u64 = 3;

/// The three packet number spaces
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpaceId {
    Initial = 0,
    Handshake = 1,
    /// 0-RTT and 1-RTT
    Data = 2,
}

impl SpaceId {
    pub fn iter() -> impl DoubleEndedIterator<Item = SpaceId> {
        [SpaceId::Initial, SpaceId::Handshake, SpaceId::Data]
            .iter()
            .cloned()
    }
}

const STATE_WAIT: u8 = 0;
const STATE_ACKED: u8 = 1;
const STATE_LOST: u8 = 2;

/// Shared fate cell for data carried in a packet
///
/// The sender of retransmittable content holds one reference and the sent-packet ledger holds
/// another; only the ledger writes. ACKED is terminal, but LOST may be superseded by ACKED when
/// a loss turns out to be spurious.
#[derive(Debug, Clone)]
pub struct AckHandle(Arc<AtomicU8>);

impl AckHandle {
    pub fn new() -> Self {
        AckHandle(Arc::new(AtomicU8::new(STATE_WAIT)))
    }

    pub fn is_waiting(&self) -> bool {
        self.0.load(Ordering::Relaxed) == STATE_WAIT
    }

    pub fn is_acked(&self) -> bool {
        self.0.load(Ordering::Relaxed) == STATE_ACKED
    }

    pub fn is_lost(&self) -> bool {
        self.0.load(Ordering::Relaxed) == STATE_LOST
    }

    pub fn mark_acked(&self) {
        self.0.store(STATE_ACKED, Ordering::Relaxed);
    }

    /// Never downgrades an ACKED handle
    pub fn mark_lost(&self) {
        let _ = self.0.compare_exchange(
            STATE_WAIT,
            STATE_LOST,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Return a LOST handle to WAIT after its content is queued again
    pub fn rearm(&self) {
        let _ = self.0.compare_exchange(
            STATE_LOST,
            STATE_WAIT,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }
}

impl Default for AckHandle {
    fn default() -> Self {
        AckHandle::new()
    }
}

/// Ledger entry for a transmitted (or deliberately skipped) packet number
#[derive(Debug)]
pub struct SentPacket {
    pub time_sent: u64,
    /// Zero for packets that don't count toward bytes in flight
    pub size: u16,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    /// Reserved but never transmitted; acknowledgment is a protocol violation
    pub skipped: bool,
    pub mtu_probe: bool,
    /// ACK ranges this packet carried, to retire them once it's acknowledged
    pub acks: RangeSet,
    /// Fate cells for every piece of retransmittable content aboard
    pub waiters: Vec<AckHandle>,
    /// Streams whose fragments rode in this packet, re-examined on ack or loss
    pub streams: Vec<StreamId>,
}

impl SentPacket {
    fn skip_marker(time_sent: u64) -> Self {
        SentPacket {
            time_sent,
            size: 0,
            ack_eliciting: false,
            in_flight: false,
            skipped: true,
            mtu_probe: false,
            acks: RangeSet::new(),
            waiters: Vec::new(),
            streams: Vec::new(),
        }
    }
}

/// Per-space send and receive ledgers
pub struct PacketSpace {
    //
    // Send state
    //
    next_pn: u64,
    /// When `next_pn` reaches this, one number is skipped to detect opportunistic ACKs
    skip_at: Option<u64>,
    pub largest_acked: Option<u64>,
    pub sent: BTreeMap<u64, SentPacket>,
    pub loss_time: Option<u64>,
    pub time_of_last_ack_eliciting: Option<u64>,
    /// Bytes in flight attributed to this space
    pub in_flight: u64,
    pub ack_eliciting_in_flight: u64,
    /// Probe packets to send forced by a PTO expiry
    pub probes_pending: u32,

    //
    // Receive state
    //
    /// Received packet numbers not yet retired by an acknowledged ACK of ours
    pub pending_acks: RangeSet,
    /// Everything ever received, for duplicate rejection
    dedup: RangeSet,
    pub largest_rx: Option<u64>,
    pub largest_rx_time: u64,
    /// Ack-eliciting packets received since the last ACK we sent
    pub unacked_eliciting: u32,
    /// Deadline for flushing a delayed ACK
    pub ack_at: Option<u64>,
    /// Set when we've received a non-ACK frame since our last ack-only packet
    pub permit_ack_only: bool,

    pub discarded: bool,
}

impl PacketSpace {
    pub fn new(skip_pns: bool) -> Self {
        PacketSpace {
            next_pn: 0,
            skip_at: if skip_pns { Some(1) } else { None },
            largest_acked: None,
            sent: BTreeMap::new(),
            loss_time: None,
            time_of_last_ack_eliciting: None,
            in_flight: 0,
            ack_eliciting_in_flight: 0,
            probes_pending: 0,
            pending_acks: RangeSet::new(),
            dedup: RangeSet::new(),
            largest_rx: None,
            largest_rx_time: 0,
            unacked_eliciting: 0,
            ack_at: None,
            permit_ack_only: false,
            discarded: false,
        }
    }

    pub fn next_pn(&self) -> u64 {
        self.next_pn
    }

    /// Allocate the next packet number, occasionally burning one as an ACK honeypot
    pub fn take_pn<R: Rng>(&mut self, rng: &mut R, now: u64) -> u64 {
        if let Some(at) = self.skip_at {
            if self.next_pn >= at {
                self.sent
                    .insert(self.next_pn, SentPacket::skip_marker(now));
                self.next_pn += 1;
                self.skip_at = Some(self.next_pn + rng.gen_range(16..256));
            }
        }
        let pn = self.next_pn;
        self.next_pn += 1;
        debug_assert!(pn < 1 << 62);
        pn
    }

    pub fn on_packet_sent(&mut self, pn: u64, packet: SentPacket) {
        if packet.in_flight {
            self.in_flight += u64::from(packet.size);
            if packet.ack_eliciting {
                self.ack_eliciting_in_flight += 1;
                self.time_of_last_ack_eliciting = Some(packet.time_sent);
            }
        }
        let old = self.sent.insert(pn, packet);
        debug_assert!(old.is_none(), "packet number reused");
    }

    /// Record receipt of an authenticated packet; false if it was a duplicate
    pub fn record_received(&mut self, now: u64, pn: u64, ack_eliciting: bool) -> bool {
        if !self.dedup.insert_one(pn) {
            return false;
        }
        self.pending_acks.insert_one(pn);
        if self.largest_rx.map_or(true, |x| pn > x) {
            self.largest_rx = Some(pn);
            self.largest_rx_time = now;
        }
        if ack_eliciting {
            self.unacked_eliciting += 1;
        }
        true
    }

    /// Remove a ledger entry, updating in-flight accounting
    pub fn take_sent(&mut self, pn: u64) -> Option<SentPacket> {
        let packet = self.sent.remove(&pn)?;
        if packet.in_flight {
            self.in_flight -= u64::from(packet.size);
            if packet.ack_eliciting {
                self.ack_eliciting_in_flight -= 1;
            }
        }
        Some(packet)
    }

    /// Drop the whole space; everything unacknowledged counts as lost so senders clean up
    pub fn discard(&mut self) -> u64 {
        let freed = self.in_flight;
        for (_, packet) in std::mem::replace(&mut self.sent, BTreeMap::new()) {
            for handle in &packet.waiters {
                handle.mark_lost();
            }
        }
        self.in_flight = 0;
        self.ack_eliciting_in_flight = 0;
        self.loss_time = None;
        self.time_of_last_ack_eliciting = None;
        self.probes_pending = 0;
        self.pending_acks = RangeSet::new();
        self.ack_at = None;
        self.unacked_eliciting = 0;
        self.discarded = true;
        freed
    }
}

/// RFC 9002 §5 round-trip estimator; all values μs
pub struct RttEstimator {
    pub latest: u64,
    smoothed: Option<u64>,
    pub var: u64,
    pub min: u64,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            latest: 0,
            smoothed: None,
            var: INITIAL_RTT / 2,
            min: u64::max_value(),
        }
    }

    pub fn on_sample(&mut self, latest: u64, ack_delay: u64) {
        self.latest = latest;
        self.min = self.min.min(latest);
        match self.smoothed {
            None => {
                self.smoothed = Some(latest);
                self.var = latest / 2;
            }
            Some(smoothed) => {
                // Only credit the peer's ack delay when it doesn't take us below min_rtt
                let adjusted = if latest >= self.min + ack_delay {
                    latest - ack_delay
                } else {
                    latest
                };
                let var_sample = (smoothed as i64 - adjusted as i64).abs() as u64;
                self.var = (3 * self.var + var_sample) / 4;
                self.smoothed = Some((7 * smoothed + adjusted) / 8);
            }
        }
    }

    pub fn smoothed(&self) -> u64 {
        self.smoothed.unwrap_or(INITIAL_RTT)
    }

    pub fn has_sample(&self) -> bool {
        self.smoothed.is_some()
    }

    /// Base probe timeout, before ack-delay and backoff adjustments
    pub fn pto_base(&self) -> u64 {
        self.smoothed() + (4 * self.var).max(TIMER_GRANULARITY)
    }

    /// Time after which an older packet is declared lost (RFC 9002 §6.1.2)
    pub fn loss_delay(&self) -> u64 {
        (self.smoothed().max(self.latest) * 9 / 8).max(TIMER_GRANULARITY)
    }
}
